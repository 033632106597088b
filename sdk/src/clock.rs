//! Information about the network's clock, ticks, slots, etc.

use serde_derive::{Deserialize, Serialize};

/// The unit of time given to a leader for encoding a block.
pub type Slot = u64;

/// An approximate measure of real-world time, expressed as Unix time
pub type UnixTimestamp = i64;

/// The unit of time a given leader schedule is honored.
pub type Epoch = u64;

/// Initial value of an account's rent epoch
pub const INITIAL_RENT_EPOCH: Epoch = 0;

/// A representation of network time.
///
/// All members of `Clock` start from 0 upon network boot.
#[repr(C)]
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct Clock {
    /// The current `Slot`.
    pub slot: Slot,
    /// The timestamp of the first `Slot` in this `Epoch`.
    pub epoch_start_timestamp: UnixTimestamp,
    /// The current `Epoch`.
    pub epoch: Epoch,
    /// The future `Epoch` for which the leader schedule has
    /// most recently been calculated.
    pub leader_schedule_epoch: Epoch,
    /// The approximate real world time of the current slot.
    pub unix_timestamp: UnixTimestamp,
}
