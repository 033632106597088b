//! Instructions of the system program that the loader invokes to create and
//! fund accounts.

use {
    crate::{
        instruction::{AccountMeta, Instruction, InstructionError},
        pubkey::Pubkey,
        system_program,
    },
    serde_derive::{Deserialize, Serialize},
    thiserror::Error,
};

#[derive(Error, Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum SystemError {
    #[error("an account with the same address already exists")]
    AccountAlreadyInUse,
    #[error("account does not have enough SOL to perform the operation")]
    ResultWithNegativeLamports,
    #[error("cannot assign account to this program id")]
    InvalidProgramId,
    #[error("cannot allocate account data of this length")]
    InvalidAccountDataLength,
}

impl From<SystemError> for InstructionError {
    fn from(error: SystemError) -> Self {
        Self::Custom(error as u32)
    }
}

/// Maximum permitted size of account data (10 MiB).
///
// SBF program entrypoint assumes that the max account data length
// will fit inside a u32. If this constant no longer fits in a u32,
// the entrypoint deserialization code in the SDK must be updated.
pub const MAX_PERMITTED_DATA_LENGTH: u64 = 10 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum SystemInstruction {
    /// Create a new account
    ///
    /// # Account references
    ///   0. `[WRITE, SIGNER]` Funding account
    ///   1. `[WRITE, SIGNER]` New account
    CreateAccount {
        /// Number of lamports to transfer to the new account
        lamports: u64,

        /// Number of bytes of memory to allocate
        space: u64,

        /// Address of program that will own the new account
        owner: Pubkey,
    },

    /// Assign account to a program
    ///
    /// # Account references
    ///   0. `[WRITE, SIGNER]` Assigned account public key
    Assign {
        /// Owner program account
        owner: Pubkey,
    },

    /// Transfer lamports
    ///
    /// # Account references
    ///   0. `[WRITE, SIGNER]` Funding account
    ///   1. `[WRITE]` Recipient account
    Transfer { lamports: u64 },
}

pub fn create_account(
    from_pubkey: &Pubkey,
    to_pubkey: &Pubkey,
    lamports: u64,
    space: u64,
    owner: &Pubkey,
) -> Instruction {
    let account_metas = vec![
        AccountMeta::new(*from_pubkey, true),
        AccountMeta::new(*to_pubkey, true),
    ];
    Instruction::new_with_bincode(
        system_program::id(),
        &SystemInstruction::CreateAccount {
            lamports,
            space,
            owner: *owner,
        },
        account_metas,
    )
}

pub fn assign(pubkey: &Pubkey, owner: &Pubkey) -> Instruction {
    let account_metas = vec![AccountMeta::new(*pubkey, true)];
    Instruction::new_with_bincode(
        system_program::id(),
        &SystemInstruction::Assign { owner: *owner },
        account_metas,
    )
}

pub fn transfer(from_pubkey: &Pubkey, to_pubkey: &Pubkey, lamports: u64) -> Instruction {
    let account_metas = vec![
        AccountMeta::new(*from_pubkey, true),
        AccountMeta::new(*to_pubkey, false),
    ];
    Instruction::new_with_bincode(
        system_program::id(),
        &SystemInstruction::Transfer { lamports },
        account_metas,
    )
}

#[cfg(test)]
mod tests {
    use {super::*, crate::program_utils::limited_deserialize};

    #[test]
    fn test_wire_tags() {
        let instruction = transfer(&Pubkey::new_unique(), &Pubkey::new_unique(), 42);
        assert_eq!(&instruction.data[..4], &[2, 0, 0, 0]);
        assert_eq!(
            limited_deserialize::<SystemInstruction>(&instruction.data),
            Ok(SystemInstruction::Transfer { lamports: 42 })
        );
        let owner = Pubkey::new_unique();
        let instruction = assign(&Pubkey::new_unique(), &owner);
        assert_eq!(&instruction.data[..4], &[1, 0, 0, 0]);
        let instruction = create_account(&Pubkey::new_unique(), &owner, 1, 2, &owner);
        assert_eq!(&instruction.data[..4], &[0, 0, 0, 0]);
        assert!(instruction.accounts.iter().all(|meta| meta.is_signer));
    }

    #[test]
    fn test_system_error_codes() {
        assert_eq!(
            InstructionError::from(SystemError::ResultWithNegativeLamports),
            InstructionError::Custom(1)
        );
    }
}
