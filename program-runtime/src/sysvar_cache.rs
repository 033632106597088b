use {
    crate::invoke_context::InvokeContext,
    solana_loader_sdk::{
        account::{AccountSharedData, ReadableAccount},
        clock::Clock,
        instruction::InstructionError,
        pubkey::Pubkey,
        rent::Rent,
        sysvar::Sysvar,
        transaction_context::{IndexOfAccount, InstructionContext, TransactionContext},
    },
    std::sync::Arc,
};

#[derive(Default, Clone, Debug)]
pub struct SysvarCache {
    clock: Option<Arc<Clock>>,
    rent: Option<Arc<Rent>>,
}

impl SysvarCache {
    pub fn get_clock(&self) -> Result<Arc<Clock>, InstructionError> {
        self.clock
            .clone()
            .ok_or(InstructionError::UnsupportedSysvar)
    }

    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = Some(Arc::new(clock));
    }

    pub fn get_rent(&self) -> Result<Arc<Rent>, InstructionError> {
        self.rent.clone().ok_or(InstructionError::UnsupportedSysvar)
    }

    pub fn set_rent(&mut self, rent: Rent) {
        self.rent = Some(Arc::new(rent));
    }

    /// Fills the sysvars that are not cached yet from the accounts returned by `load_sysvar_account`
    pub fn fill_missing_entries<F: FnMut(&Pubkey) -> Option<AccountSharedData>>(
        &mut self,
        mut load_sysvar_account: F,
    ) {
        if self.clock.is_none() {
            self.clock = load_sysvar::<Clock, _>(&mut load_sysvar_account);
        }
        if self.rent.is_none() {
            self.rent = load_sysvar::<Rent, _>(&mut load_sysvar_account);
        }
    }

    pub fn reset(&mut self) {
        *self = SysvarCache::default();
    }
}

fn load_sysvar<S: Sysvar, F: FnMut(&Pubkey) -> Option<AccountSharedData>>(
    load_sysvar_account: &mut F,
) -> Option<Arc<S>> {
    load_sysvar_account(&S::id())
        .and_then(|account| bincode::deserialize::<S>(account.data()).ok())
        .map(Arc::new)
}

/// These methods facilitate a transition from fetching sysvars from keyed
/// accounts to fetching from the sysvar cache without breaking consensus. In
/// order to keep consistent behavior, they continue to enforce the same checks
/// as `solana_loader_sdk::account::from_keyed_account` despite dynamically
/// loading them instead of deserializing from account data.
pub mod get_sysvar_with_account_check {
    use super::*;

    fn check_sysvar_account<S: Sysvar>(
        transaction_context: &TransactionContext,
        instruction_context: &InstructionContext,
        instruction_account_index: IndexOfAccount,
    ) -> Result<(), InstructionError> {
        let index_in_transaction = instruction_context
            .get_index_of_instruction_account_in_transaction(instruction_account_index)?;
        if !S::check_id(transaction_context.get_key_of_account_at_index(index_in_transaction)?) {
            return Err(InstructionError::InvalidArgument);
        }
        Ok(())
    }

    pub fn clock(
        invoke_context: &InvokeContext,
        instruction_context: &InstructionContext,
        instruction_account_index: IndexOfAccount,
    ) -> Result<Arc<Clock>, InstructionError> {
        check_sysvar_account::<Clock>(
            invoke_context.transaction_context,
            instruction_context,
            instruction_account_index,
        )?;
        invoke_context.get_sysvar_cache().get_clock()
    }

    pub fn rent(
        invoke_context: &InvokeContext,
        instruction_context: &InstructionContext,
        instruction_account_index: IndexOfAccount,
    ) -> Result<Arc<Rent>, InstructionError> {
        check_sysvar_account::<Rent>(
            invoke_context.transaction_context,
            instruction_context,
            instruction_account_index,
        )?;
        invoke_context.get_sysvar_cache().get_rent()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*, solana_loader_sdk::account::create_account_shared_data_for_test,
        solana_loader_sdk::sysvar,
    };

    #[test]
    fn test_fill_missing_entries() {
        let clock = Clock {
            slot: 42,
            ..Clock::default()
        };
        let clock_account = create_account_shared_data_for_test(&clock);
        let mut sysvar_cache = SysvarCache::default();
        assert_eq!(
            sysvar_cache.get_clock(),
            Err(InstructionError::UnsupportedSysvar)
        );

        sysvar_cache.fill_missing_entries(|pubkey| {
            (pubkey == &sysvar::clock::id()).then(|| clock_account.clone())
        });
        assert_eq!(sysvar_cache.get_clock().unwrap().slot, 42);
        assert_eq!(
            sysvar_cache.get_rent(),
            Err(InstructionError::UnsupportedSysvar)
        );

        // Case: cached entries are not overwritten
        sysvar_cache.fill_missing_entries(|_pubkey| {
            Some(create_account_shared_data_for_test(&Clock::default()))
        });
        assert_eq!(sysvar_cache.get_clock().unwrap().slot, 42);

        sysvar_cache.reset();
        assert!(sysvar_cache.get_clock().is_err());
    }
}
