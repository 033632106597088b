use {
    crate::{
        arena::TransactionArena,
        compute_budget::ComputeBudget,
        ic_msg,
        loaded_programs::LoadedProgramsForTxBatch,
        log_collector::LogCollector,
        runtime_config::RuntimeConfig,
        stable_log,
        sysvar_cache::SysvarCache,
        timings::ExecuteDetailsTimings,
        vm::ProgramRuntimeEnvironment,
    },
    solana_loader_sdk::{
        account::ReadableAccount,
        bpf_loader_upgradeable::{self, UpgradeableLoaderState},
        feature_set::FeatureSet,
        instruction::{Instruction, InstructionError},
        native_loader,
        pubkey::Pubkey,
        saturating_add_assign,
        transaction_context::{IndexOfAccount, InstructionAccount, TransactionContext},
    },
    log::debug,
    solana_measure::measure::Measure,
    std::{borrow::Cow, cell::RefCell, rc::Rc, sync::Arc},
};
#[cfg(any(test, feature = "dev-context-only-utils"))]
use {
    crate::{arena::DEFAULT_TRANSACTION_ARENA_SIZE, mock_vm::MockEnvironment},
    solana_loader_sdk::{
        account::AccountSharedData,
        clock::Clock,
        instruction::AccountMeta,
        rent::Rent,
        transaction_context::TransactionAccount,
    },
};

pub type ProcessInstructionWithContext = fn(&mut InvokeContext) -> Result<(), InstructionError>;

#[derive(Clone)]
pub struct BuiltinProgram {
    pub program_id: Pubkey,
    pub process_instruction: ProcessInstructionWithContext,
}

impl std::fmt::Debug for BuiltinProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // These are just type aliases for work around of Debug-ing above pointers
        type ErasedProcessInstructionWithContext =
            fn(&'static mut InvokeContext<'static>) -> Result<(), InstructionError>;

        // rustc doesn't compile due to bug without this work around
        // https://github.com/rust-lang/rust/issues/50280
        // https://users.rust-lang.org/t/display-function-pointer/17073/2
        let erased_instruction: ErasedProcessInstructionWithContext = self.process_instruction;
        write!(f, "{}: {:p}", self.program_id, erased_instruction)
    }
}

/// Compute meter
#[derive(Debug)]
pub struct ComputeMeter {
    remaining: u64,
}
impl ComputeMeter {
    /// Consume compute units
    pub fn consume(&mut self, amount: u64) -> Result<(), InstructionError> {
        let exceeded = self.remaining < amount;
        self.remaining = self.remaining.saturating_sub(amount);
        if exceeded {
            return Err(InstructionError::ComputationalBudgetExceeded);
        }
        Ok(())
    }
    /// Get the number of remaining compute units
    pub fn get_remaining(&self) -> u64 {
        self.remaining
    }
    /// Set compute units
    ///
    /// Only use for tests and benchmarks
    pub fn mock_set_remaining(&mut self, remaining: u64) {
        self.remaining = remaining;
    }
    /// Construct a new one with the given remaining units
    pub fn new_ref(remaining: u64) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self { remaining }))
    }
}

pub struct InvokeContext<'a> {
    pub transaction_context: &'a mut TransactionContext,
    builtin_programs: &'a [BuiltinProgram],
    sysvar_cache: Cow<'a, SysvarCache>,
    log_collector: Option<Rc<RefCell<LogCollector>>>,
    compute_budget: ComputeBudget,
    compute_meter: Rc<RefCell<ComputeMeter>>,
    feature_set: Arc<FeatureSet>,
    environment: Arc<dyn ProgramRuntimeEnvironment>,
    /// Transaction scoped scratch memory of the deployment pipeline
    pub arena: TransactionArena,
    /// Programs visible to the transaction
    pub programs_loaded_for_tx_batch: LoadedProgramsForTxBatch,
    /// Programs (re)deployed or closed by the transaction
    pub programs_modified_by_tx: LoadedProgramsForTxBatch,
    pub timings: ExecuteDetailsTimings,
}

impl<'a> InvokeContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transaction_context: &'a mut TransactionContext,
        builtin_programs: &'a [BuiltinProgram],
        sysvar_cache: Cow<'a, SysvarCache>,
        log_collector: Option<Rc<RefCell<LogCollector>>>,
        compute_budget: ComputeBudget,
        feature_set: Arc<FeatureSet>,
        environment: Arc<dyn ProgramRuntimeEnvironment>,
        arena: TransactionArena,
        programs_loaded_for_tx_batch: LoadedProgramsForTxBatch,
    ) -> Self {
        transaction_context.set_remove_accounts_executable_flag_checks(
            feature_set.remove_accounts_executable_flag_checks,
        );
        let programs_modified_by_tx =
            LoadedProgramsForTxBatch::new(programs_loaded_for_tx_batch.slot());
        Self {
            transaction_context,
            builtin_programs,
            sysvar_cache,
            log_collector,
            compute_budget,
            compute_meter: ComputeMeter::new_ref(compute_budget.compute_unit_limit),
            feature_set,
            environment,
            arena,
            programs_loaded_for_tx_batch,
            programs_modified_by_tx,
            timings: ExecuteDetailsTimings::default(),
        }
    }

    /// Builds the invoke context for one transaction from the runtime config:
    /// its compute budget, feature set, log limit and arena size.
    pub fn new_with_config(
        transaction_context: &'a mut TransactionContext,
        builtin_programs: &'a [BuiltinProgram],
        sysvar_cache: Cow<'a, SysvarCache>,
        runtime_config: &RuntimeConfig,
        environment: Arc<dyn ProgramRuntimeEnvironment>,
        programs_loaded_for_tx_batch: LoadedProgramsForTxBatch,
    ) -> Self {
        Self::new(
            transaction_context,
            builtin_programs,
            sysvar_cache,
            Some(LogCollector::new_ref_with_limit(
                runtime_config.log_messages_bytes_limit,
            )),
            runtime_config.compute_budget,
            Arc::new(runtime_config.feature_set.clone()),
            environment,
            TransactionArena::new(runtime_config.transaction_arena_size),
            programs_loaded_for_tx_batch,
        )
    }

    /// An invoke context over the given accounts with the mock program runtime
    /// environment, no features active and the clock and rent sysvars taken
    /// from the accounts (or their defaults)
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn new_mock(
        transaction_context: &'a mut TransactionContext,
        builtin_programs: &'a [BuiltinProgram],
    ) -> Self {
        let mut sysvar_cache = SysvarCache::default();
        sysvar_cache.fill_missing_entries(|pubkey| {
            transaction_context
                .find_index_of_account(pubkey)
                .and_then(|index| transaction_context.get_account_at_index(index).ok())
                .map(|account| account.borrow().clone())
        });
        if sysvar_cache.get_clock().is_err() {
            sysvar_cache.set_clock(Clock::default());
        }
        if sysvar_cache.get_rent().is_err() {
            sysvar_cache.set_rent(Rent::default());
        }
        let slot = sysvar_cache
            .get_clock()
            .map(|clock| clock.slot)
            .unwrap_or_default();
        Self::new(
            transaction_context,
            builtin_programs,
            Cow::Owned(sysvar_cache),
            Some(LogCollector::new_ref()),
            ComputeBudget::default(),
            Arc::new(FeatureSet::default()),
            Arc::new(MockEnvironment::default()),
            TransactionArena::new(DEFAULT_TRANSACTION_ARENA_SIZE / 16),
            LoadedProgramsForTxBatch::new(slot),
        )
    }

    /// Push a stack frame onto the invocation stack
    pub fn push(&mut self) -> Result<(), InstructionError> {
        let instruction_context = self
            .transaction_context
            .get_instruction_context_at_index_in_trace(
                self.transaction_context.get_instruction_trace_length(),
            )?;
        let program_id = instruction_context
            .get_last_program_key(self.transaction_context)
            .map_err(|_| InstructionError::UnsupportedProgramId)?;
        if self
            .transaction_context
            .get_instruction_context_stack_height()
            != 0
        {
            let contains = (0..self
                .transaction_context
                .get_instruction_context_stack_height())
                .any(|level| {
                    self.transaction_context
                        .get_instruction_context_at_nesting_level(level)
                        .and_then(|instruction_context| {
                            instruction_context.get_last_program_key(self.transaction_context)
                        })
                        .map(|level_program_id| level_program_id == program_id)
                        .unwrap_or(false)
                });
            let is_last = self
                .transaction_context
                .get_current_instruction_context()
                .and_then(|instruction_context| {
                    instruction_context.get_last_program_key(self.transaction_context)
                })
                .map(|last_program_id| last_program_id == program_id)
                .unwrap_or(false);
            if contains && !is_last {
                // Reentrancy not allowed unless caller is calling itself
                return Err(InstructionError::ReentrancyNotAllowed);
            }
        }

        self.transaction_context.push()
    }

    /// Pop a stack frame from the invocation stack
    pub fn pop(&mut self) -> Result<(), InstructionError> {
        self.transaction_context.pop()
    }

    /// Current height of the invocation stack, top level instructions are height
    /// `solana_loader_sdk::instruction::TRANSACTION_LEVEL_STACK_HEIGHT`
    pub fn get_stack_height(&self) -> usize {
        self.transaction_context
            .get_instruction_context_stack_height()
    }

    /// Entrypoint for a cross-program invocation from a builtin program
    pub fn native_invoke(
        &mut self,
        instruction: Instruction,
        signers: &[Pubkey],
    ) -> Result<(), InstructionError> {
        let (instruction_accounts, program_indices) =
            self.prepare_instruction(&instruction, signers)?;
        let mut compute_units_consumed = 0;
        let mut timings = ExecuteDetailsTimings::default();
        let result = self.process_instruction(
            &instruction.data,
            &instruction_accounts,
            &program_indices,
            &mut compute_units_consumed,
            &mut timings,
        );
        self.timings.accumulate(&timings);
        result
    }

    /// Helper to prepare for process_instruction()
    #[allow(clippy::type_complexity)]
    pub fn prepare_instruction(
        &mut self,
        instruction: &Instruction,
        signers: &[Pubkey],
    ) -> Result<(Vec<InstructionAccount>, Vec<IndexOfAccount>), InstructionError> {
        // Finds the index of each account in the instruction by its pubkey.
        // Then normalizes / unifies the privileges of duplicate accounts.
        // Note: This is an O(n^2) algorithm,
        // but performed on a very small slice and requires no heap allocations.
        let instruction_context = self.transaction_context.get_current_instruction_context()?;
        let mut deduplicated_instruction_accounts: Vec<InstructionAccount> = Vec::new();
        let mut duplicate_indicies = Vec::with_capacity(instruction.accounts.len());
        for (instruction_account_index, account_meta) in instruction.accounts.iter().enumerate() {
            let index_in_transaction = self
                .transaction_context
                .find_index_of_account(&account_meta.pubkey)
                .ok_or_else(|| {
                    ic_msg!(
                        self,
                        "Instruction references an unknown account {}",
                        account_meta.pubkey,
                    );
                    InstructionError::MissingAccount
                })?;
            if let Some(duplicate_index) =
                deduplicated_instruction_accounts
                    .iter()
                    .position(|instruction_account| {
                        instruction_account.index_in_transaction == index_in_transaction
                    })
            {
                duplicate_indicies.push(duplicate_index);
                let instruction_account = deduplicated_instruction_accounts
                    .get_mut(duplicate_index)
                    .ok_or(InstructionError::NotEnoughAccountKeys)?;
                instruction_account.is_signer |= account_meta.is_signer;
                instruction_account.is_writable |= account_meta.is_writable;
            } else {
                let index_in_caller = instruction_context
                    .find_index_of_instruction_account(
                        self.transaction_context,
                        &account_meta.pubkey,
                    )
                    .ok_or_else(|| {
                        ic_msg!(
                            self,
                            "Instruction references an unknown account {}",
                            account_meta.pubkey,
                        );
                        InstructionError::MissingAccount
                    })?;
                duplicate_indicies.push(deduplicated_instruction_accounts.len());
                deduplicated_instruction_accounts.push(InstructionAccount {
                    index_in_transaction,
                    index_in_caller,
                    index_in_callee: instruction_account_index as IndexOfAccount,
                    is_signer: account_meta.is_signer,
                    is_writable: account_meta.is_writable,
                });
            }
        }
        for instruction_account in deduplicated_instruction_accounts.iter() {
            let borrowed_account = instruction_context.try_borrow_instruction_account(
                self.transaction_context,
                instruction_account.index_in_caller,
            )?;

            // Readonly in caller cannot become writable in callee
            if instruction_account.is_writable && !borrowed_account.is_writable() {
                ic_msg!(
                    self,
                    "{}'s writable privilege escalated",
                    borrowed_account.get_key(),
                );
                return Err(InstructionError::PrivilegeEscalation);
            }

            // To be signed in the callee,
            // it must be either signed in the caller or by the program
            if instruction_account.is_signer
                && !(borrowed_account.is_signer() || signers.contains(borrowed_account.get_key()))
            {
                ic_msg!(
                    self,
                    "{}'s signer privilege escalated",
                    borrowed_account.get_key()
                );
                return Err(InstructionError::PrivilegeEscalation);
            }
        }
        let instruction_accounts = duplicate_indicies
            .into_iter()
            .map(|duplicate_index| {
                Ok(deduplicated_instruction_accounts
                    .get(duplicate_index)
                    .ok_or(InstructionError::NotEnoughAccountKeys)?
                    .clone())
            })
            .collect::<Result<Vec<InstructionAccount>, InstructionError>>()?;

        // Find and validate executables / program accounts
        let callee_program_id = instruction.program_id;
        let program_account_index = self
            .transaction_context
            .find_index_of_program_account(&callee_program_id)
            .ok_or_else(|| {
                ic_msg!(self, "Unknown program {}", callee_program_id);
                InstructionError::MissingAccount
            })?;
        let program_account = self
            .transaction_context
            .accounts()
            .try_borrow(program_account_index)?;
        if !self.feature_set.remove_accounts_executable_flag_checks
            && !program_account.executable()
        {
            ic_msg!(self, "Account {} is not executable", callee_program_id);
            return Err(InstructionError::AccountNotExecutable);
        }
        let mut program_indices = vec![];
        if bpf_loader_upgradeable::check_id(program_account.owner()) {
            if let Ok(UpgradeableLoaderState::Program {
                programdata_address,
            }) = program_account.deserialize_data()
            {
                if let Some(programdata_account_index) = self
                    .transaction_context
                    .find_index_of_program_account(&programdata_address)
                {
                    program_indices.push(programdata_account_index);
                } else {
                    ic_msg!(
                        self,
                        "Unknown upgradeable programdata account {}",
                        programdata_address,
                    );
                    return Err(InstructionError::MissingAccount);
                }
            } else {
                ic_msg!(
                    self,
                    "Invalid upgradeable program account {}",
                    callee_program_id,
                );
                return Err(InstructionError::MissingAccount);
            }
        }
        program_indices.push(program_account_index);

        Ok((instruction_accounts, program_indices))
    }

    /// Processes an instruction and returns how many compute units were used
    pub fn process_instruction(
        &mut self,
        instruction_data: &[u8],
        instruction_accounts: &[InstructionAccount],
        program_indices: &[IndexOfAccount],
        compute_units_consumed: &mut u64,
        timings: &mut ExecuteDetailsTimings,
    ) -> Result<(), InstructionError> {
        *compute_units_consumed = 0;
        // A failed top level instruction leaves no trace in the accounts or
        // in the programs it (re)deployed
        let rollback = if self.get_stack_height() == 0 {
            Some((
                self.transaction_context.snapshot_accounts()?,
                self.programs_modified_by_tx.clone(),
            ))
        } else {
            None
        };
        self.transaction_context
            .get_next_instruction_context()?
            .configure(program_indices, instruction_accounts, instruction_data);
        self.push()?;
        let result = self
            .process_executable_chain(compute_units_consumed, timings)
            // MUST pop if and only if `push` succeeded, independent of `result`.
            // Thus, the `.and()` instead of an `.and_then()`.
            .and(self.pop());
        if let Some((accounts, programs_modified_by_tx)) = rollback {
            if result.is_err() {
                self.transaction_context.rollback_accounts(accounts)?;
                self.programs_modified_by_tx = programs_modified_by_tx;
            }
            debug!(
                "transaction arena high water mark: {} of {} bytes",
                self.arena.high_water_mark(),
                self.arena.capacity()
            );
            self.arena.reset();
        }
        result
    }

    /// Calls the instruction's program entrypoint method
    fn process_executable_chain(
        &mut self,
        compute_units_consumed: &mut u64,
        timings: &mut ExecuteDetailsTimings,
    ) -> Result<(), InstructionError> {
        let instruction_context = self.transaction_context.get_current_instruction_context()?;
        let mut process_executable_chain_time = Measure::start("process_executable_chain_time");

        let builtin_id = {
            let borrowed_root_account = instruction_context
                .try_borrow_program_account(self.transaction_context, 0)
                .map_err(|_| InstructionError::UnsupportedProgramId)?;
            let owner_id = borrowed_root_account.get_owner();
            if native_loader::check_id(owner_id) {
                *borrowed_root_account.get_key()
            } else {
                *owner_id
            }
        };
        let program_id = *instruction_context.get_last_program_key(self.transaction_context)?;
        let process_instruction = self
            .builtin_programs
            .iter()
            .find(|entry| entry.program_id == builtin_id)
            .map(|entry| entry.process_instruction)
            .ok_or(InstructionError::UnsupportedProgramId)?;

        self.transaction_context
            .set_return_data(program_id, Vec::new())?;
        let logger = self.get_log_collector();
        stable_log::program_invoke(&logger, &program_id, self.get_stack_height());
        let pre_remaining_units = self.get_remaining();
        let result = process_instruction(self);
        let post_remaining_units = self.get_remaining();
        *compute_units_consumed = pre_remaining_units.saturating_sub(post_remaining_units);
        match &result {
            Ok(()) => stable_log::program_success(&logger, &program_id),
            Err(err) => stable_log::program_failure(&logger, &program_id, err),
        }
        process_executable_chain_time.stop();

        saturating_add_assign!(
            timings.process_executable_chain_us,
            process_executable_chain_time.as_us()
        );
        timings.accumulate_program(
            &program_id,
            process_executable_chain_time.as_us(),
            *compute_units_consumed,
            result.is_err(),
        );
        result
    }

    /// Get this invocation's LogCollector
    pub fn get_log_collector(&self) -> Option<Rc<RefCell<LogCollector>>> {
        self.log_collector.clone()
    }

    /// Get this invocation's compute meter
    pub fn get_compute_meter(&self) -> Rc<RefCell<ComputeMeter>> {
        self.compute_meter.clone()
    }

    /// Consume compute units, saturating at zero
    pub fn consume(&self, amount: u64) {
        let _ = self.compute_meter.borrow_mut().consume(amount);
    }

    /// Consume compute units, failing once the meter is exhausted
    pub fn consume_checked(&self, amount: u64) -> Result<(), InstructionError> {
        self.compute_meter.borrow_mut().consume(amount)
    }

    /// Get the number of remaining compute units
    pub fn get_remaining(&self) -> u64 {
        self.compute_meter.borrow().get_remaining()
    }

    /// Set compute units
    ///
    /// Only use for tests and benchmarks
    pub fn mock_set_remaining(&self, remaining: u64) {
        self.compute_meter.borrow_mut().mock_set_remaining(remaining);
    }

    /// Replace the active features
    ///
    /// Only use for tests and benchmarks
    pub fn mock_set_feature_set(&mut self, feature_set: Arc<FeatureSet>) {
        self.transaction_context.set_remove_accounts_executable_flag_checks(
            feature_set.remove_accounts_executable_flag_checks,
        );
        self.feature_set = feature_set;
    }

    /// Replace the program runtime environment
    ///
    /// Only use for tests and benchmarks
    pub fn mock_set_environment(&mut self, environment: Arc<dyn ProgramRuntimeEnvironment>) {
        self.environment = environment;
    }

    /// Replace the compute budget, the compute meter is left as it is
    ///
    /// Only use for tests and benchmarks
    pub fn mock_set_compute_budget(&mut self, compute_budget: ComputeBudget) {
        self.compute_budget = compute_budget;
    }

    /// Get this invocation's compute budget
    pub fn get_compute_budget(&self) -> &ComputeBudget {
        &self.compute_budget
    }

    /// Get the active features
    pub fn get_feature_set(&self) -> &Arc<FeatureSet> {
        &self.feature_set
    }

    /// Get the environment programs are loaded and run in
    pub fn get_environment(&self) -> &Arc<dyn ProgramRuntimeEnvironment> {
        &self.environment
    }

    /// Get cached sysvars
    pub fn get_sysvar_cache(&self) -> &SysvarCache {
        &self.sysvar_cache
    }
}

/// Runs `callback` with an invoke context that has one instruction on the
/// stack: `loader_id` executing a program over one readonly account of
/// `account_size` bytes.
#[cfg(any(test, feature = "dev-context-only-utils"))]
pub fn with_mock_invoke_context<R, F: FnMut(&mut InvokeContext) -> R>(
    loader_id: Pubkey,
    account_size: usize,
    mut callback: F,
) -> R {
    let program_indices = vec![0, 1];
    let transaction_accounts = vec![
        (
            loader_id,
            AccountSharedData::new(0, 0, &native_loader::id()),
        ),
        (
            Pubkey::new_unique(),
            AccountSharedData::new(1, 0, &loader_id),
        ),
        (
            Pubkey::new_unique(),
            AccountSharedData::new(2, account_size, &Pubkey::new_unique()),
        ),
    ];
    let instruction_accounts = vec![InstructionAccount {
        index_in_transaction: 2,
        index_in_caller: 2,
        index_in_callee: 0,
        is_signer: false,
        is_writable: false,
    }];
    let compute_budget = ComputeBudget::default();
    let mut transaction_context = TransactionContext::new(
        transaction_accounts,
        Rent::default(),
        compute_budget.max_invoke_stack_height,
        compute_budget.max_instruction_trace_length,
    );
    let mut invoke_context = InvokeContext::new_mock(&mut transaction_context, &[]);
    invoke_context
        .transaction_context
        .get_next_instruction_context()
        .unwrap()
        .configure(&program_indices, &instruction_accounts, &[]);
    invoke_context.push().unwrap();
    callback(&mut invoke_context)
}

/// Runs `process_instruction` as the builtin of `loader_id` through the full
/// invocation path and asserts its result.
///
/// The loader is appended to the transaction accounts as a native program and
/// becomes the first program account; `program_indices` follow it. The
/// accounts are returned without the loader.
#[cfg(any(test, feature = "dev-context-only-utils"))]
#[allow(clippy::too_many_arguments)]
pub fn mock_process_instruction<
    F: FnMut(&mut InvokeContext),
    G: FnMut(&mut InvokeContext),
>(
    loader_id: &Pubkey,
    mut program_indices: Vec<IndexOfAccount>,
    instruction_data: &[u8],
    mut transaction_accounts: Vec<TransactionAccount>,
    instruction_account_metas: Vec<AccountMeta>,
    expected_result: Result<(), InstructionError>,
    process_instruction: ProcessInstructionWithContext,
    other_builtin_programs: &[BuiltinProgram],
    mut pre_adjustments: F,
    mut post_adjustments: G,
) -> Vec<AccountSharedData> {
    let mut instruction_accounts: Vec<InstructionAccount> =
        Vec::with_capacity(instruction_account_metas.len());
    for (instruction_account_index, account_meta) in instruction_account_metas.iter().enumerate() {
        let index_in_transaction = transaction_accounts
            .iter()
            .position(|(key, _account)| *key == account_meta.pubkey)
            .unwrap_or(transaction_accounts.len())
            as IndexOfAccount;
        let index_in_callee = instruction_accounts
            .iter()
            .position(|instruction_account| {
                instruction_account.index_in_transaction == index_in_transaction
            })
            .unwrap_or(instruction_account_index) as IndexOfAccount;
        instruction_accounts.push(InstructionAccount {
            index_in_transaction,
            index_in_caller: index_in_transaction,
            index_in_callee,
            is_signer: account_meta.is_signer,
            is_writable: account_meta.is_writable,
        });
    }
    program_indices.insert(0, transaction_accounts.len() as IndexOfAccount);
    let processor_account = AccountSharedData::new(0, 0, &native_loader::id());
    transaction_accounts.push((*loader_id, processor_account));
    let mut builtin_programs = vec![BuiltinProgram {
        program_id: *loader_id,
        process_instruction,
    }];
    builtin_programs.extend_from_slice(other_builtin_programs);
    let compute_budget = ComputeBudget::default();
    let mut transaction_context = TransactionContext::new(
        transaction_accounts,
        Rent::default(),
        compute_budget.max_invoke_stack_height,
        compute_budget.max_instruction_trace_length,
    );
    let mut invoke_context = InvokeContext::new_mock(&mut transaction_context, &builtin_programs);
    pre_adjustments(&mut invoke_context);
    let result = invoke_context.process_instruction(
        instruction_data,
        &instruction_accounts,
        &program_indices,
        &mut 0,
        &mut ExecuteDetailsTimings::default(),
    );
    assert_eq!(result, expected_result);
    post_adjustments(&mut invoke_context);
    drop(invoke_context);
    let mut transaction_accounts = transaction_context.deconstruct_without_keys().unwrap();
    transaction_accounts.pop();
    transaction_accounts
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            ic_logger_msg,
            loaded_programs::{LoadedProgram, LoadedProgramType},
        },
        assert_matches::assert_matches,
        serde_derive::{Deserialize, Serialize},
        solana_loader_sdk::account::WritableAccount,
    };

    #[derive(Debug, Serialize, Deserialize)]
    enum MockInstruction {
        NoopSuccess,
        NoopFail,
        ModifyOwned,
        ModifyNotOwned,
        ModifyReadonly,
        ModifyOwnedAndFail,
        ConsumeComputeUnits {
            compute_units_to_consume: u64,
            desired_result: Result<(), InstructionError>,
        },
        Resize {
            new_len: u64,
        },
    }

    fn mock_process_instruction_entry(
        invoke_context: &mut InvokeContext,
    ) -> Result<(), InstructionError> {
        let transaction_context = &invoke_context.transaction_context;
        let instruction_context = transaction_context.get_current_instruction_context()?;
        let instruction_data = instruction_context.get_instruction_data();
        if let Ok(instruction) = bincode::deserialize(instruction_data) {
            match instruction {
                MockInstruction::NoopSuccess => (),
                MockInstruction::NoopFail => return Err(InstructionError::GenericError),
                MockInstruction::ModifyOwned => instruction_context
                    .try_borrow_instruction_account(transaction_context, 0)?
                    .set_data_from_slice(&[1])?,
                MockInstruction::ModifyNotOwned => instruction_context
                    .try_borrow_instruction_account(transaction_context, 1)?
                    .set_data_from_slice(&[1])?,
                MockInstruction::ModifyReadonly => instruction_context
                    .try_borrow_instruction_account(transaction_context, 2)?
                    .set_data_from_slice(&[1])?,
                MockInstruction::ModifyOwnedAndFail => {
                    let mut account =
                        instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
                    account.set_data_from_slice(&[1])?;
                    account.checked_sub_lamports(2)?;
                    drop(account);
                    instruction_context
                        .try_borrow_instruction_account(transaction_context, 1)?
                        .checked_add_lamports(2)?;
                    return Err(InstructionError::GenericError);
                }
                MockInstruction::ConsumeComputeUnits {
                    compute_units_to_consume,
                    desired_result,
                } => {
                    invoke_context.consume_checked(compute_units_to_consume)?;
                    return desired_result;
                }
                MockInstruction::Resize { new_len } => instruction_context
                    .try_borrow_instruction_account(transaction_context, 0)?
                    .set_data_length(new_len as usize)?,
            }
        } else {
            return Err(InstructionError::InvalidInstructionData);
        }
        Ok(())
    }

    fn mock_builtin_entry(invoke_context: &mut InvokeContext) -> Result<(), InstructionError> {
        let transaction_context = &invoke_context.transaction_context;
        let instruction_context = transaction_context.get_current_instruction_context()?;
        let instruction_data = instruction_context.get_instruction_data();
        match instruction_data.first() {
            // Transfer one lamport from the first account to the second
            Some(0) => {
                instruction_context
                    .try_borrow_instruction_account(transaction_context, 0)?
                    .checked_sub_lamports(1)?;
                instruction_context
                    .try_borrow_instruction_account(transaction_context, 1)?
                    .checked_add_lamports(1)?;
                Ok(())
            }
            // Leave one lamport unaccounted for
            Some(1) => instruction_context
                .try_borrow_instruction_account(transaction_context, 0)?
                .checked_sub_lamports(1),
            _ => Err(InstructionError::InvalidInstructionData),
        }
    }

    fn cpi_entry(invoke_context: &mut InvokeContext) -> Result<(), InstructionError> {
        let transaction_context = &invoke_context.transaction_context;
        let instruction_context = transaction_context.get_current_instruction_context()?;
        let callee_program_id = Pubkey::new_from_array([9; 32]);
        let metas = (0..instruction_context.get_number_of_instruction_accounts())
            .map(|index| {
                let borrowed_account =
                    instruction_context.try_borrow_instruction_account(transaction_context, index)?;
                Ok(AccountMeta {
                    pubkey: *borrowed_account.get_key(),
                    is_signer: borrowed_account.is_signer(),
                    is_writable: borrowed_account.is_writable(),
                })
            })
            .collect::<Result<Vec<_>, InstructionError>>()?;
        let mut instruction = Instruction::new_with_bytes(
            callee_program_id,
            instruction_context.get_instruction_data(),
            metas,
        );
        match instruction.data.first() {
            // Escalate the privileges of the second account
            Some(2) => {
                instruction.data = vec![0];
                if let Some(meta) = instruction.accounts.get_mut(1) {
                    meta.is_writable = true;
                }
            }
            Some(3) => {
                instruction.data = vec![0];
                if let Some(meta) = instruction.accounts.get_mut(1) {
                    meta.is_signer = true;
                }
            }
            _ => {}
        }
        invoke_context.native_invoke(instruction, &[])
    }

    #[test]
    fn test_process_instruction_logs() {
        solana_logger::setup();
        let loader_id = Pubkey::new_unique();
        let owned_account = Pubkey::new_unique();
        let not_owned_account = Pubkey::new_unique();
        let readonly_account = Pubkey::new_unique();
        let transaction_accounts = vec![
            (owned_account, AccountSharedData::new(42, 1, &loader_id)),
            (
                not_owned_account,
                AccountSharedData::new(84, 1, &Pubkey::new_unique()),
            ),
            (readonly_account, AccountSharedData::new(168, 1, &loader_id)),
        ];
        let metas = vec![
            AccountMeta::new(owned_account, false),
            AccountMeta::new(not_owned_account, false),
            AccountMeta::new_readonly(readonly_account, false),
        ];

        // Case: success
        let accounts = mock_process_instruction(
            &loader_id,
            vec![],
            &bincode::serialize(&MockInstruction::ModifyOwned).unwrap(),
            transaction_accounts.clone(),
            metas.clone(),
            Ok(()),
            mock_process_instruction_entry,
            &[],
            |_invoke_context| {},
            |invoke_context| {
                let logs = invoke_context
                    .get_log_collector()
                    .unwrap()
                    .borrow()
                    .get_recorded_content()
                    .to_vec();
                assert_eq!(
                    logs,
                    vec![
                        format!("Program {loader_id} invoke [1]"),
                        format!("Program {loader_id} success"),
                    ]
                );
            },
        );
        assert_eq!(accounts[0].data(), &[1]);
        assert_eq!(accounts.len(), 3);

        // Case: modifying data not owned fails
        mock_process_instruction(
            &loader_id,
            vec![],
            &bincode::serialize(&MockInstruction::ModifyNotOwned).unwrap(),
            transaction_accounts.clone(),
            metas.clone(),
            Err(InstructionError::ExternalAccountDataModified),
            mock_process_instruction_entry,
            &[],
            |_invoke_context| {},
            |invoke_context| {
                let logs = invoke_context
                    .get_log_collector()
                    .unwrap()
                    .borrow()
                    .get_recorded_content()
                    .to_vec();
                assert_eq!(
                    logs.last().unwrap(),
                    &format!(
                        "Program {loader_id} failed: instruction modified data of an account it does not own"
                    )
                );
            },
        );

        // Case: readonly
        mock_process_instruction(
            &loader_id,
            vec![],
            &bincode::serialize(&MockInstruction::ModifyReadonly).unwrap(),
            transaction_accounts.clone(),
            metas.clone(),
            Err(InstructionError::ReadonlyDataModified),
            mock_process_instruction_entry,
            &[],
            |_invoke_context| {},
            |_invoke_context| {},
        );

        // Case: failure from the program
        mock_process_instruction(
            &loader_id,
            vec![],
            &bincode::serialize(&MockInstruction::NoopFail).unwrap(),
            transaction_accounts.clone(),
            metas.clone(),
            Err(InstructionError::GenericError),
            mock_process_instruction_entry,
            &[],
            |_invoke_context| {},
            |_invoke_context| {},
        );

        // Case: malformed instruction data
        mock_process_instruction(
            &loader_id,
            vec![],
            &[0xff; 3],
            transaction_accounts,
            metas,
            Err(InstructionError::InvalidInstructionData),
            mock_process_instruction_entry,
            &[],
            |_invoke_context| {},
            |_invoke_context| {},
        );
    }

    #[test]
    fn test_failed_instruction_rolls_back() {
        let loader_id = Pubkey::new_unique();
        let owned_account = Pubkey::new_unique();
        let other_account = Pubkey::new_unique();
        let transaction_accounts = vec![
            (owned_account, AccountSharedData::new(42, 1, &loader_id)),
            (
                other_account,
                AccountSharedData::new(84, 1, &Pubkey::new_unique()),
            ),
        ];
        let metas = vec![
            AccountMeta::new(owned_account, false),
            AccountMeta::new(other_account, false),
        ];
        let accounts = mock_process_instruction(
            &loader_id,
            vec![],
            &bincode::serialize(&MockInstruction::ModifyOwnedAndFail).unwrap(),
            transaction_accounts.clone(),
            metas,
            Err(InstructionError::GenericError),
            mock_process_instruction_entry,
            &[],
            |invoke_context| {
                invoke_context.programs_modified_by_tx.replenish(
                    other_account,
                    Arc::new(LoadedProgram::new_tombstone(0, LoadedProgramType::Closed)),
                );
                invoke_context.arena.push_frame();
                assert!(invoke_context.arena.alloc(8, 64).is_some());
            },
            |invoke_context| {
                assert_eq!(invoke_context.programs_modified_by_tx.len(), 1);
                // Case: scratch memory does not outlive the top level instruction
                assert_eq!(invoke_context.arena.frame_depth(), 0);
                assert_eq!(invoke_context.arena.used(), 0);
                assert_eq!(invoke_context.arena.high_water_mark(), 64);
            },
        );
        assert_eq!(accounts[0], transaction_accounts[0].1);
        assert_eq!(accounts[1], transaction_accounts[1].1);
        assert_eq!(accounts[0].data(), &[0]);
        assert_eq!(accounts[1].lamports(), 84);
    }

    #[test]
    fn test_compute_units() {
        let loader_id = Pubkey::new_unique();
        let owned_account = Pubkey::new_unique();
        let transaction_accounts = vec![
            (owned_account, AccountSharedData::new(42, 1, &loader_id)),
            (
                Pubkey::new_unique(),
                AccountSharedData::new(84, 1, &Pubkey::new_unique()),
            ),
        ];
        let metas = vec![
            AccountMeta::new(owned_account, false),
            AccountMeta::new(transaction_accounts[1].0, false),
        ];
        for (compute_units_to_consume, remaining, expected_result) in [
            (100, 1_000, Ok(())),
            (1_000, 1_000, Ok(())),
            (
                1_001,
                1_000,
                Err(InstructionError::ComputationalBudgetExceeded),
            ),
        ] {
            let mut consumed = 0;
            mock_process_instruction(
                &loader_id,
                vec![],
                &bincode::serialize(&MockInstruction::ConsumeComputeUnits {
                    compute_units_to_consume,
                    desired_result: Ok(()),
                })
                .unwrap(),
                transaction_accounts.clone(),
                metas.clone(),
                expected_result,
                mock_process_instruction_entry,
                &[],
                |invoke_context| invoke_context.mock_set_remaining(remaining),
                |invoke_context| {
                    consumed = remaining.saturating_sub(invoke_context.get_remaining());
                },
            );
            assert_eq!(consumed, compute_units_to_consume.min(remaining));
        }
    }

    #[test]
    fn test_native_invoke() {
        let caller_program_id = Pubkey::new_unique();
        let callee_program_id = Pubkey::new_from_array([9; 32]);
        let from = Pubkey::new_unique();
        let to = Pubkey::new_unique();
        let mut callee_account = AccountSharedData::new(1, 0, &native_loader::id());
        callee_account.set_executable(true);
        let transaction_accounts = vec![
            (from, AccountSharedData::new(10, 0, &callee_program_id)),
            (to, AccountSharedData::new(10, 0, &callee_program_id)),
            (callee_program_id, callee_account.clone()),
        ];
        let metas = vec![AccountMeta::new(from, false), AccountMeta::new(to, false)];
        let callee = BuiltinProgram {
            program_id: callee_program_id,
            process_instruction: mock_builtin_entry,
        };

        // Case: lamports move through the callee
        let accounts = mock_process_instruction(
            &caller_program_id,
            vec![],
            &[0],
            transaction_accounts.clone(),
            metas.clone(),
            Ok(()),
            cpi_entry,
            &[callee.clone()],
            |_invoke_context| {},
            |invoke_context| {
                let logs = invoke_context
                    .get_log_collector()
                    .unwrap()
                    .borrow()
                    .get_recorded_content()
                    .to_vec();
                assert_eq!(
                    logs,
                    vec![
                        format!("Program {caller_program_id} invoke [1]"),
                        format!("Program {callee_program_id} invoke [2]"),
                        format!("Program {callee_program_id} success"),
                        format!("Program {caller_program_id} success"),
                    ]
                );
                assert!(invoke_context
                    .timings
                    .per_program_timings
                    .contains_key(&callee_program_id));
            },
        );
        assert_eq!(accounts[0].lamports(), 9);
        assert_eq!(accounts[1].lamports(), 11);

        // Case: unbalanced callee
        mock_process_instruction(
            &caller_program_id,
            vec![],
            &[1],
            transaction_accounts.clone(),
            metas.clone(),
            Err(InstructionError::UnbalancedInstruction),
            cpi_entry,
            &[callee.clone()],
            |_invoke_context| {},
            |_invoke_context| {},
        );

        // Case: privilege escalation
        let readonly_metas = vec![
            AccountMeta::new(from, false),
            AccountMeta::new_readonly(to, false),
        ];
        mock_process_instruction(
            &caller_program_id,
            vec![],
            &[2],
            transaction_accounts.clone(),
            readonly_metas,
            Err(InstructionError::PrivilegeEscalation),
            cpi_entry,
            &[callee.clone()],
            |_invoke_context| {},
            |invoke_context| {
                let logs = invoke_context
                    .get_log_collector()
                    .unwrap()
                    .borrow()
                    .get_recorded_content()
                    .to_vec();
                assert!(logs.contains(&format!("{to}'s writable privilege escalated")));
            },
        );
        mock_process_instruction(
            &caller_program_id,
            vec![],
            &[3],
            transaction_accounts.clone(),
            metas.clone(),
            Err(InstructionError::PrivilegeEscalation),
            cpi_entry,
            &[callee.clone()],
            |_invoke_context| {},
            |invoke_context| {
                let logs = invoke_context
                    .get_log_collector()
                    .unwrap()
                    .borrow()
                    .get_recorded_content()
                    .to_vec();
                assert!(logs.contains(&format!("{to}'s signer privilege escalated")));
            },
        );

        // Case: callee is not executable
        let mut not_executable_transaction_accounts = transaction_accounts.clone();
        not_executable_transaction_accounts[2].1 = AccountSharedData::new(1, 0, &native_loader::id());
        mock_process_instruction(
            &caller_program_id,
            vec![],
            &[0],
            not_executable_transaction_accounts.clone(),
            metas.clone(),
            Err(InstructionError::AccountNotExecutable),
            cpi_entry,
            &[callee.clone()],
            |_invoke_context| {},
            |_invoke_context| {},
        );

        // Case: the executable check is lifted
        mock_process_instruction(
            &caller_program_id,
            vec![],
            &[0],
            not_executable_transaction_accounts,
            metas.clone(),
            Ok(()),
            cpi_entry,
            &[callee],
            |invoke_context| {
                invoke_context.mock_set_feature_set(Arc::new(FeatureSet {
                    remove_accounts_executable_flag_checks: true,
                    ..FeatureSet::default()
                }))
            },
            |_invoke_context| {},
        );

        // Case: unknown callee
        mock_process_instruction(
            &caller_program_id,
            vec![],
            &[0],
            transaction_accounts[..2].to_vec(),
            metas,
            Err(InstructionError::MissingAccount),
            cpi_entry,
            &[],
            |_invoke_context| {},
            |_invoke_context| {},
        );
    }

    #[test]
    fn test_dispatch_to_owning_loader() {
        let loader_id = Pubkey::new_unique();
        let program_id = Pubkey::new_unique();
        let transaction_accounts = vec![(program_id, AccountSharedData::new(1, 0, &loader_id))];
        mock_process_instruction(
            &loader_id,
            vec![0],
            &[],
            transaction_accounts.clone(),
            vec![],
            Ok(()),
            |_invoke_context| Ok(()),
            &[],
            |_invoke_context| {},
            |invoke_context| {
                let logs = invoke_context
                    .get_log_collector()
                    .unwrap()
                    .borrow()
                    .get_recorded_content()
                    .to_vec();
                assert_eq!(
                    logs,
                    vec![
                        format!("Program {program_id} invoke [1]"),
                        format!("Program {program_id} success"),
                    ]
                );
            },
        );

        // Case: no builtin for the root program account
        let mut transaction_context = TransactionContext::new(
            transaction_accounts,
            Rent::default(),
            1,
            1,
        );
        let mut invoke_context = InvokeContext::new_mock(&mut transaction_context, &[]);
        assert_eq!(
            invoke_context.process_instruction(
                &[],
                &[],
                &[0],
                &mut 0,
                &mut ExecuteDetailsTimings::default()
            ),
            Err(InstructionError::UnsupportedProgramId)
        );

        // Case: the trace is full
        assert_eq!(
            invoke_context.process_instruction(
                &[],
                &[],
                &[0],
                &mut 0,
                &mut ExecuteDetailsTimings::default()
            ),
            Err(InstructionError::MaxInstructionTraceLengthExceeded)
        );
    }

    #[test]
    fn test_new_with_config() {
        let runtime_config = RuntimeConfig::from_yaml_str(
            r#"
compute_budget:
  compute_unit_limit: 1000
feature_set:
  remove_accounts_executable_flag_checks: true
log_messages_bytes_limit: 8
transaction_arena_size: 4096
"#,
        )
        .unwrap();
        let mut transaction_context =
            TransactionContext::new(Vec::new(), Rent::default(), 1, 1);
        let invoke_context = InvokeContext::new_with_config(
            &mut transaction_context,
            &[],
            Cow::Owned(SysvarCache::default()),
            &runtime_config,
            Arc::new(MockEnvironment::default()),
            LoadedProgramsForTxBatch::new(7),
        );
        assert_eq!(invoke_context.get_remaining(), 1000);
        assert!(invoke_context.get_feature_set().remove_accounts_executable_flag_checks);
        assert_eq!(invoke_context.arena.capacity(), 4096);
        assert_eq!(invoke_context.programs_modified_by_tx.slot(), 7);

        // Case: the log byte limit comes from the config
        ic_logger_msg!(invoke_context.get_log_collector(), "0123456789");
        assert_eq!(
            invoke_context
                .get_log_collector()
                .unwrap()
                .borrow()
                .get_recorded_content(),
            &["Log truncated".to_string()]
        );
    }

    #[test]
    fn test_with_mock_invoke_context() {
        let loader_id = Pubkey::new_unique();
        with_mock_invoke_context(loader_id, 10, |invoke_context| {
            assert_eq!(invoke_context.get_stack_height(), 1);
            let transaction_context = &invoke_context.transaction_context;
            let instruction_context = transaction_context
                .get_current_instruction_context()
                .unwrap();
            assert_eq!(instruction_context.get_number_of_program_accounts(), 2);
            assert_eq!(
                instruction_context
                    .try_borrow_instruction_account(transaction_context, 0)
                    .unwrap()
                    .get_data()
                    .len(),
                10
            );
            assert_eq!(invoke_context.get_sysvar_cache().get_clock().unwrap().slot, 0);
            assert_eq!(
                invoke_context.get_remaining(),
                invoke_context.get_compute_budget().compute_unit_limit
            );
            assert_matches!(
                invoke_context.consume_checked(u64::MAX),
                Err(InstructionError::ComputationalBudgetExceeded)
            );
            assert_eq!(invoke_context.get_remaining(), 0);
            ic_logger_msg!(invoke_context.get_log_collector(), "hello");
        });
    }
}
