//! Access to special accounts with dynamically-updated data.

use {
    crate::{clock::Clock, pubkey::Pubkey, rent::Rent},
    serde::{de::DeserializeOwned, Serialize},
};

crate::declare_id!([
    6, 167, 213, 23, 24, 117, 247, 41, 199, 61, 147, 64, 143, 33, 97, 32, 6, 126, 216, 140, 118,
    224, 140, 40, 127, 193, 148, 96, 0, 0, 0, 0,
]);

/// A type that holds sysvar data and has an associated sysvar `Pubkey`.
pub trait SysvarId {
    /// The `Pubkey` of the sysvar.
    fn id() -> Pubkey;

    /// Returns `true` if the given pubkey is the program ID.
    fn check_id(pubkey: &Pubkey) -> bool;
}

/// A type that holds sysvar data.
pub trait Sysvar: SysvarId + Default + Sized + Serialize + DeserializeOwned {
    /// The size in bytes of the sysvar as serialized account data.
    fn size_of() -> usize {
        bincode::serialized_size(&Self::default()).unwrap_or_default() as usize
    }
}

pub mod clock {
    crate::declare_id!([
        6, 167, 213, 23, 24, 199, 116, 201, 40, 86, 99, 152, 105, 29, 94, 182, 139, 94, 184, 163,
        155, 75, 109, 92, 115, 85, 91, 33, 0, 0, 0, 0,
    ]);
}

pub mod rent {
    crate::declare_id!([
        6, 167, 213, 23, 25, 44, 92, 81, 33, 140, 201, 76, 61, 74, 241, 127, 88, 218, 238, 8, 155,
        161, 253, 68, 227, 219, 217, 138, 0, 0, 0, 0,
    ]);
}

impl SysvarId for Clock {
    fn id() -> Pubkey {
        clock::id()
    }
    fn check_id(pubkey: &Pubkey) -> bool {
        clock::check_id(pubkey)
    }
}

impl Sysvar for Clock {}

impl SysvarId for Rent {
    fn id() -> Pubkey {
        rent::id()
    }
    fn check_id(pubkey: &Pubkey) -> bool {
        rent::check_id(pubkey)
    }
}

impl Sysvar for Rent {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysvar_ids() {
        assert_eq!(
            id().to_string(),
            "Sysvar1111111111111111111111111111111111111"
        );
        assert_eq!(
            <Clock as SysvarId>::id().to_string(),
            "SysvarC1ock11111111111111111111111111111111"
        );
        assert_eq!(
            <Rent as SysvarId>::id().to_string(),
            "SysvarRent111111111111111111111111111111111"
        );
        assert_eq!(Clock::size_of(), 40);
        assert_eq!(Rent::size_of(), 17);
    }
}
