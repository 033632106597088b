//! Account, instruction and sysvar types shared by the upgradeable loader, the
//! program runtime and the builtin programs that the loader invokes.

#![deny(clippy::arithmetic_side_effects)]

pub mod account;
pub mod bpf_loader_upgradeable;
pub mod clock;
pub mod entrypoint;
pub mod feature_set;
pub mod instruction;
pub mod loader_upgradeable_instruction;
pub mod loader_v4;
pub mod program_error;
pub mod program_utils;
pub mod pubkey;
pub mod rent;
pub mod system_instruction;
pub mod sysvar;
pub mod transaction_context;

/// Convenience macro to declare a static public key and functions to interact with it
///
/// The key is given as its raw bytes; the base58 form of every id declared in
/// this crate is checked by the tests of the declaring module.
#[macro_export]
macro_rules! declare_id {
    ($bytes:expr) => {
        /// The static program ID
        pub const ID: $crate::pubkey::Pubkey = $crate::pubkey::Pubkey::new_from_array($bytes);

        /// Confirms that a given pubkey is equivalent to the program ID
        pub fn check_id(id: &$crate::pubkey::Pubkey) -> bool {
            id == &ID
        }

        /// Returns the program ID
        pub const fn id() -> $crate::pubkey::Pubkey {
            ID
        }
    };
}

/// Convenience macro for `AddAssign` with saturating arithmetic.
/// Replace by `std::num::Saturating` once stable
#[macro_export]
macro_rules! saturating_add_assign {
    ($i:expr, $v:expr) => {{
        $i = $i.saturating_add($v)
    }};
}

pub mod native_loader {
    crate::declare_id!([
        5, 135, 132, 191, 20, 139, 164, 40, 47, 176, 18, 87, 72, 136, 169, 241, 83, 160, 125,
        173, 247, 101, 192, 69, 92, 154, 151, 3, 128, 0, 0, 0,
    ]);
}

pub mod bpf_loader {
    crate::declare_id!([
        2, 168, 246, 145, 78, 136, 161, 110, 57, 90, 225, 40, 148, 143, 250, 105, 86, 147, 55,
        104, 24, 221, 71, 67, 82, 33, 243, 198, 0, 0, 0, 0,
    ]);
}

pub mod bpf_loader_deprecated {
    crate::declare_id!([
        2, 168, 246, 145, 78, 136, 161, 107, 189, 35, 149, 133, 95, 100, 4, 217, 180, 244, 86,
        183, 130, 27, 176, 20, 87, 73, 66, 140, 0, 0, 0, 0,
    ]);
}

pub mod system_program {
    crate::declare_id!([0; 32]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_ids() {
        assert_eq!(
            native_loader::id().to_string(),
            "NativeLoader1111111111111111111111111111111"
        );
        assert_eq!(
            bpf_loader::id().to_string(),
            "BPFLoader2111111111111111111111111111111111"
        );
        assert_eq!(
            bpf_loader_deprecated::id().to_string(),
            "BPFLoader1111111111111111111111111111111111"
        );
        assert_eq!(
            system_program::id().to_string(),
            "11111111111111111111111111111111"
        );
        assert!(bpf_loader::check_id(&bpf_loader::ID));
        assert!(!bpf_loader::check_id(&bpf_loader_deprecated::ID));
    }
}
