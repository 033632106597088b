#![deny(clippy::arithmetic_side_effects)]
#![deny(clippy::indexing_slicing)]

pub mod serialization;

use {
    log::trace,
    solana_loader_program_runtime::{
        arena::TransactionArena,
        compute_budget::ComputeBudget,
        ic_logger_msg, ic_msg,
        invoke_context::{BuiltinProgram, InvokeContext},
        loaded_programs::{
            LoadProgramMetrics, LoadedProgram, LoadedProgramType, DELAY_VISIBILITY_SLOT_OFFSET,
        },
        log_collector::LogCollector,
        stable_log,
        sysvar_cache::get_sysvar_with_account_check,
        vm::{
            self, region_index, AccessType, Config, EbpfError, Executable, MemoryMapping,
            MemoryRegion, ProgramRuntimeEnvironment, SBPFVersion, SyscallError, Vm,
            INPUT_REGION_INDEX,
        },
    },
    solana_loader_sdk::{
        account::ReadableAccount,
        bpf_loader, bpf_loader_deprecated,
        bpf_loader_upgradeable::{self, migration_authority, UpgradeableLoaderState},
        clock::Slot,
        entrypoint::{MAX_PERMITTED_DATA_INCREASE, SUCCESS},
        feature_set::FeatureSet,
        instruction::{AccountMeta, InstructionError},
        loader_upgradeable_instruction::UpgradeableLoaderInstruction,
        loader_v4, native_loader,
        pubkey::{Pubkey, PubkeyError},
        saturating_add_assign,
        system_instruction::{self, MAX_PERMITTED_DATA_LENGTH},
        transaction_context::{IndexOfAccount, InstructionContext, TransactionContext},
    },
    solana_measure::measure::Measure,
    std::{
        cell::RefCell,
        ops::{Range, RangeInclusive},
        rc::Rc,
        sync::{atomic::Ordering, Arc},
    },
};

pub const DEFAULT_LOADER_COMPUTE_UNITS: u64 = 570;
pub const DEPRECATED_LOADER_COMPUTE_UNITS: u64 = 1_140;
pub const UPGRADEABLE_LOADER_COMPUTE_UNITS: u64 = 2_370;

/// Compute units charged for a heap of `heap_size` bytes, per started 32 KiB
/// page beyond the first one
pub fn calculate_heap_cost(heap_size: u32, heap_cost: u64) -> u64 {
    const KIBIBYTE: u64 = 1024;
    const PAGE_SIZE_KB: u64 = 32;
    let page_size_bytes = KIBIBYTE.saturating_mul(PAGE_SIZE_KB);
    u64::from(heap_size)
        .saturating_add(page_size_bytes.saturating_sub(1))
        .checked_div(page_size_bytes)
        .unwrap_or_default()
        .saturating_sub(1)
        .saturating_mul(heap_cost)
}

/// The SBF versions programs may be deployed and executed with
fn sbpf_version_range(feature_set: &FeatureSet) -> RangeInclusive<SBPFVersion> {
    let min_sbpf_version =
        if feature_set.disable_sbpf_v0_execution && !feature_set.reenable_sbpf_v0_execution {
            SBPFVersion::V3
        } else {
            SBPFVersion::V0
        };
    let max_sbpf_version = if feature_set.enable_sbpf_v3_deployment_and_execution {
        SBPFVersion::V3
    } else if feature_set.enable_sbpf_v2_deployment_and_execution {
        SBPFVersion::V2
    } else if feature_set.enable_sbpf_v1_deployment_and_execution {
        SBPFVersion::V1
    } else {
        SBPFVersion::V0
    };
    min_sbpf_version..=max_sbpf_version
}

fn find_program_in_cache(invoke_context: &InvokeContext, key: &Pubkey) -> Option<Arc<LoadedProgram>> {
    invoke_context
        .programs_modified_by_tx
        .find(key)
        .or_else(|| invoke_context.programs_loaded_for_tx_batch.find(key))
}

/// Parses, loads and verifies a program image.
///
/// The read-only data of the image is staged in a frame of `arena` which is
/// released again before returning, whatever the outcome.
///
/// # Panics
///
/// When the transaction arena cannot hold the read-only data of the image.
#[allow(clippy::too_many_arguments)]
pub fn load_program_from_bytes(
    delay_visibility_of_program_deployment: bool,
    log_collector: Option<Rc<RefCell<LogCollector>>>,
    load_program_metrics: &mut LoadProgramMetrics,
    programdata: &[u8],
    loader_key: &Pubkey,
    account_size: usize,
    deployment_slot: Slot,
    environment: &dyn ProgramRuntimeEnvironment,
    config: Config,
    sbpf_versions: RangeInclusive<SBPFVersion>,
    arena: &mut TransactionArena,
) -> Result<LoadedProgram, InstructionError> {
    let effective_slot = if delay_visibility_of_program_deployment {
        deployment_slot.saturating_add(DELAY_VISIBILITY_SLOT_OFFSET)
    } else {
        deployment_slot
    };
    arena.push_frame();
    let executable = load_and_verify(
        &log_collector,
        load_program_metrics,
        programdata,
        environment,
        config,
        sbpf_versions,
        arena,
    );
    let popped = arena.pop_frame();
    debug_assert!(popped);
    LoadedProgram::new(
        loader_key,
        executable?,
        deployment_slot,
        effective_slot,
        account_size,
    )
}

fn load_and_verify(
    log_collector: &Option<Rc<RefCell<LogCollector>>>,
    load_program_metrics: &mut LoadProgramMetrics,
    programdata: &[u8],
    environment: &dyn ProgramRuntimeEnvironment,
    config: Config,
    sbpf_versions: RangeInclusive<SBPFVersion>,
    arena: &mut TransactionArena,
) -> Result<Arc<dyn Executable>, InstructionError> {
    let elf_info = environment
        .peek(programdata, *sbpf_versions.start(), *sbpf_versions.end())
        .map_err(|err| {
            ic_logger_msg!(log_collector, "{}", err);
            InstructionError::InvalidAccountData
        })?;

    let mut load_elf_time = Measure::start("load_elf_time");
    let Some(loaded) = vm::load_with_arena(environment, arena, programdata, &elf_info) else {
        panic!(
            "transaction arena exhausted staging {} bytes of read-only data",
            elf_info.rodata_footprint
        );
    };
    let executable = loaded.map_err(|err| {
        ic_logger_msg!(log_collector, "{}", err);
        InstructionError::InvalidAccountData
    })?;
    load_elf_time.stop();
    load_program_metrics.load_elf_us = load_elf_time.as_us();

    let mut verify_code_time = Measure::start("verify_code_time");
    {
        let vm = executable
            .create_vm(config, MemoryMapping::empty())
            .map_err(|err| {
                ic_logger_msg!(log_collector, "Failed to create SBF VM: {}", err);
                InstructionError::ProgramEnvironmentSetupFailure
            })?;
        vm.validate().map_err(|err| {
            ic_logger_msg!(log_collector, "{}", err);
            InstructionError::InvalidAccountData
        })?;
    }
    verify_code_time.stop();
    load_program_metrics.verify_code_us = verify_code_time.as_us();
    Ok(executable)
}

/// Verifies `$new_programdata` and stores the result in the programs modified
/// by the transaction. `$drop` releases the account borrows the program data
/// was read through.
macro_rules! deploy_program {
    ($invoke_context:expr, $program_id:expr, $loader_key:expr,
     $account_size:expr, $slot:expr, $drop:expr, $new_programdata:expr $(,)?) => {{
        let log_collector = $invoke_context.get_log_collector();
        let feature_set = $invoke_context.get_feature_set().clone();
        let environment = $invoke_context.get_environment().clone();
        let compute_budget = *$invoke_context.get_compute_budget();
        let mut load_program_metrics = LoadProgramMetrics::default();
        let mut register_syscalls_time = Measure::start("register_syscalls_time");
        environment
            .register_syscalls(&feature_set, &compute_budget)
            .map_err(|err| {
                ic_logger_msg!(log_collector, "Failed to register syscalls: {}", err);
                InstructionError::ProgramEnvironmentSetupFailure
            })?;
        register_syscalls_time.stop();
        load_program_metrics.register_syscalls_us = register_syscalls_time.as_us();
        let executor = load_program_from_bytes(
            feature_set.delay_visibility_of_program_deployment,
            log_collector,
            &mut load_program_metrics,
            $new_programdata,
            $loader_key,
            $account_size,
            $slot,
            environment.as_ref(),
            Config::new(&compute_budget, &feature_set),
            sbpf_version_range(&feature_set),
            &mut $invoke_context.arena,
        )?;
        if let Some(old_entry) = find_program_in_cache($invoke_context, &$program_id) {
            executor.ix_usage_counter.store(
                old_entry.ix_usage_counter.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
        }
        $drop
        load_program_metrics.program_id = $program_id.to_string();
        load_program_metrics.submit_datapoint(&mut $invoke_context.timings);
        $invoke_context
            .programs_modified_by_tx
            .replenish($program_id, Arc::new(executor));
    }};
}

fn write_program_data(
    program_data_offset: usize,
    bytes: &[u8],
    invoke_context: &InvokeContext,
) -> Result<(), InstructionError> {
    let transaction_context = &invoke_context.transaction_context;
    let instruction_context = transaction_context.get_current_instruction_context()?;
    let mut program = instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
    let data = program.get_data_mut()?;
    let write_offset = program_data_offset.saturating_add(bytes.len());
    if data.len() < write_offset {
        ic_msg!(
            invoke_context,
            "Write overflow: {} < {}",
            data.len(),
            write_offset,
        );
        return Err(InstructionError::AccountDataTooSmall);
    }
    data.get_mut(program_data_offset..write_offset)
        .ok_or(InstructionError::AccountDataTooSmall)?
        .copy_from_slice(bytes);
    Ok(())
}

/// The loader registered under each of the BPF loader ids
pub fn builtin_programs() -> Vec<BuiltinProgram> {
    [
        bpf_loader_upgradeable::id(),
        bpf_loader::id(),
        bpf_loader_deprecated::id(),
    ]
    .into_iter()
    .map(|program_id| BuiltinProgram {
        program_id,
        process_instruction,
    })
    .collect()
}

/// Whether an upgradeable program account points at program data which was
/// deployed before `current_slot`
fn is_upgradeable_program_deployed(
    transaction_context: &TransactionContext,
    program_state: Option<UpgradeableLoaderState>,
    current_slot: Slot,
) -> bool {
    let Some(UpgradeableLoaderState::Program {
        programdata_address,
    }) = program_state
    else {
        return false;
    };
    let Some(programdata) = transaction_context
        .find_index_of_account(&programdata_address)
        .and_then(|index| transaction_context.accounts().try_borrow(index).ok())
    else {
        return false;
    };
    if programdata.data().len() < UpgradeableLoaderState::size_of_programdata_metadata() {
        return false;
    }
    matches!(
        programdata.deserialize_data::<UpgradeableLoaderState>(),
        Ok(UpgradeableLoaderState::ProgramData { slot, .. }) if slot < current_slot
    )
}

pub fn process_instruction(invoke_context: &mut InvokeContext) -> Result<(), InstructionError> {
    let log_collector = invoke_context.get_log_collector();
    let remove_executable_checks = invoke_context
        .get_feature_set()
        .remove_accounts_executable_flag_checks;
    let not_deployed = if remove_executable_checks {
        InstructionError::UnsupportedProgramId
    } else {
        InstructionError::InvalidAccountData
    };
    let transaction_context = &invoke_context.transaction_context;
    let instruction_context = transaction_context.get_current_instruction_context()?;
    let program_account =
        instruction_context.try_borrow_last_program_account(transaction_context)?;

    // Program Management Instruction
    if native_loader::check_id(program_account.get_owner()) {
        let program_id = *program_account.get_key();
        drop(program_account);
        return if bpf_loader_upgradeable::check_id(&program_id) {
            invoke_context.consume_checked(UPGRADEABLE_LOADER_COMPUTE_UNITS)?;
            process_loader_upgradeable_instruction(invoke_context)
        } else if bpf_loader::check_id(&program_id) {
            invoke_context.consume_checked(DEFAULT_LOADER_COMPUTE_UNITS)?;
            ic_logger_msg!(
                log_collector,
                "BPF loader management instructions are no longer supported",
            );
            Err(InstructionError::UnsupportedProgramId)
        } else if bpf_loader_deprecated::check_id(&program_id) {
            invoke_context.consume_checked(DEPRECATED_LOADER_COMPUTE_UNITS)?;
            ic_logger_msg!(log_collector, "Deprecated loader is no longer supported");
            Err(InstructionError::UnsupportedProgramId)
        } else {
            ic_logger_msg!(log_collector, "Invalid BPF loader id");
            Err(if remove_executable_checks {
                InstructionError::UnsupportedProgramId
            } else {
                InstructionError::IncorrectProgramId
            })
        };
    }

    // Program Invocation
    if !remove_executable_checks && !program_account.is_executable() {
        ic_logger_msg!(log_collector, "Program is not executable");
        return Err(InstructionError::IncorrectProgramId);
    }
    if bpf_loader_upgradeable::check_id(program_account.get_owner()) {
        let current_slot = invoke_context.get_sysvar_cache().get_clock()?.slot;
        if !is_upgradeable_program_deployed(
            transaction_context,
            program_account.get_state().ok(),
            current_slot,
        ) {
            ic_logger_msg!(log_collector, "Program is not deployed");
            return Err(not_deployed);
        }
    }
    let program_id = *program_account.get_key();
    drop(program_account);

    let mut get_or_create_executor_time = Measure::start("get_or_create_executor_time");
    let executor = find_program_in_cache(invoke_context, &program_id).ok_or_else(|| {
        ic_logger_msg!(log_collector, "Program is not cached");
        not_deployed.clone()
    })?;
    get_or_create_executor_time.stop();
    saturating_add_assign!(
        invoke_context.timings.get_or_create_executor_us,
        get_or_create_executor_time.as_us()
    );

    let Some(executable) = executor.executable() else {
        ic_logger_msg!(log_collector, "Program is not deployed");
        return Err(not_deployed);
    };
    executor.ix_usage_counter.fetch_add(1, Ordering::Relaxed);
    execute(executable.as_ref(), invoke_context)
}

fn process_loader_upgradeable_instruction(
    invoke_context: &mut InvokeContext,
) -> Result<(), InstructionError> {
    let log_collector = invoke_context.get_log_collector();
    let transaction_context = &invoke_context.transaction_context;
    let instruction_context = transaction_context.get_current_instruction_context()?;
    let instruction_data = instruction_context.get_instruction_data();
    let program_id = *instruction_context.get_last_program_key(transaction_context)?;

    match UpgradeableLoaderInstruction::decode(instruction_data)? {
        UpgradeableLoaderInstruction::InitializeBuffer => {
            instruction_context.check_number_of_instruction_accounts(2)?;
            let mut buffer =
                instruction_context.try_borrow_instruction_account(transaction_context, 0)?;

            if UpgradeableLoaderState::Uninitialized != buffer.get_state()? {
                ic_logger_msg!(log_collector, "Buffer account already initialized");
                return Err(InstructionError::AccountAlreadyInitialized);
            }

            let authority_key = Some(*transaction_context.get_key_of_account_at_index(
                instruction_context.get_index_of_instruction_account_in_transaction(1)?,
            )?);

            buffer.set_state(&UpgradeableLoaderState::Buffer {
                authority_address: authority_key,
            })?;
        }
        UpgradeableLoaderInstruction::Write { offset, bytes } => {
            instruction_context.check_number_of_instruction_accounts(2)?;
            let buffer =
                instruction_context.try_borrow_instruction_account(transaction_context, 0)?;

            if let UpgradeableLoaderState::Buffer { authority_address } = buffer.get_state()? {
                if authority_address.is_none() {
                    ic_logger_msg!(log_collector, "Buffer is immutable");
                    return Err(InstructionError::Immutable);
                }
                let authority_key = Some(*transaction_context.get_key_of_account_at_index(
                    instruction_context.get_index_of_instruction_account_in_transaction(1)?,
                )?);
                if authority_address != authority_key {
                    ic_logger_msg!(log_collector, "Incorrect buffer authority provided");
                    return Err(InstructionError::IncorrectAuthority);
                }
                if !instruction_context.is_instruction_account_signer(1)? {
                    ic_logger_msg!(log_collector, "Buffer authority did not sign");
                    return Err(InstructionError::MissingRequiredSignature);
                }
            } else {
                ic_logger_msg!(log_collector, "Invalid Buffer account");
                return Err(InstructionError::InvalidAccountData);
            }
            drop(buffer);
            write_program_data(
                UpgradeableLoaderState::size_of_buffer_metadata().saturating_add(offset as usize),
                &bytes,
                invoke_context,
            )?;
        }
        UpgradeableLoaderInstruction::DeployWithMaxDataLen { max_data_len } => {
            instruction_context.check_number_of_instruction_accounts(4)?;
            let payer_key = *transaction_context.get_key_of_account_at_index(
                instruction_context.get_index_of_instruction_account_in_transaction(0)?,
            )?;
            let programdata_key = *transaction_context.get_key_of_account_at_index(
                instruction_context.get_index_of_instruction_account_in_transaction(1)?,
            )?;
            let rent = get_sysvar_with_account_check::rent(invoke_context, instruction_context, 4)?;
            let clock =
                get_sysvar_with_account_check::clock(invoke_context, instruction_context, 5)?;
            instruction_context.check_number_of_instruction_accounts(8)?;
            let authority_key = Some(*transaction_context.get_key_of_account_at_index(
                instruction_context.get_index_of_instruction_account_in_transaction(7)?,
            )?);

            // Verify Program account

            let program =
                instruction_context.try_borrow_instruction_account(transaction_context, 2)?;
            if UpgradeableLoaderState::Uninitialized != program.get_state()? {
                ic_logger_msg!(log_collector, "Program account already initialized");
                return Err(InstructionError::AccountAlreadyInitialized);
            }
            if program.get_data().len() < UpgradeableLoaderState::size_of_program() {
                ic_logger_msg!(log_collector, "Program account too small");
                return Err(InstructionError::AccountDataTooSmall);
            }
            if program.get_lamports() < rent.minimum_balance(program.get_data().len()) {
                ic_logger_msg!(log_collector, "Program account not rent-exempt");
                return Err(InstructionError::ExecutableAccountNotRentExempt);
            }
            let new_program_id = *program.get_key();
            drop(program);

            // Verify Buffer account

            let buffer =
                instruction_context.try_borrow_instruction_account(transaction_context, 3)?;
            if let UpgradeableLoaderState::Buffer { authority_address } = buffer.get_state()? {
                if authority_address != authority_key {
                    ic_logger_msg!(log_collector, "Buffer and upgrade authority don't match");
                    return Err(InstructionError::IncorrectAuthority);
                }
                if !instruction_context.is_instruction_account_signer(7)? {
                    ic_logger_msg!(log_collector, "Upgrade authority did not sign");
                    return Err(InstructionError::MissingRequiredSignature);
                }
            } else {
                ic_logger_msg!(log_collector, "Invalid Buffer account");
                return Err(InstructionError::InvalidArgument);
            }
            let buffer_key = *buffer.get_key();
            let buffer_data_offset = UpgradeableLoaderState::size_of_buffer_metadata();
            let buffer_data_len = buffer.get_data().len().saturating_sub(buffer_data_offset);
            let programdata_data_offset = UpgradeableLoaderState::size_of_programdata_metadata();
            let programdata_len = UpgradeableLoaderState::size_of_programdata(max_data_len);
            if buffer.get_data().len() < UpgradeableLoaderState::size_of_buffer_metadata()
                || buffer_data_len == 0
            {
                ic_logger_msg!(log_collector, "Buffer account too small");
                return Err(InstructionError::InvalidAccountData);
            }
            drop(buffer);
            if max_data_len < buffer_data_len {
                ic_logger_msg!(
                    log_collector,
                    "Max data length is too small to hold Buffer data"
                );
                return Err(InstructionError::AccountDataTooSmall);
            }
            if programdata_len > MAX_PERMITTED_DATA_LENGTH as usize {
                ic_logger_msg!(log_collector, "Max data length is too large");
                return Err(InstructionError::InvalidArgument);
            }

            // Create ProgramData account
            let (derived_address, bump_seed) =
                Pubkey::find_program_address(&[new_program_id.as_ref()], &program_id);
            if derived_address != programdata_key {
                ic_logger_msg!(log_collector, "ProgramData address is not derived");
                return Err(InstructionError::InvalidArgument);
            }

            // Drain the Buffer account to payer before paying for programdata account
            {
                let mut buffer =
                    instruction_context.try_borrow_instruction_account(transaction_context, 3)?;
                let mut payer =
                    instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
                payer.checked_add_lamports(buffer.get_lamports())?;
                buffer.set_lamports(0)?;
            }

            let mut instruction = system_instruction::create_account(
                &payer_key,
                &programdata_key,
                1.max(rent.minimum_balance(programdata_len)),
                programdata_len as u64,
                &program_id,
            );

            // pass an extra account to avoid the overly strict UnbalancedInstruction error
            instruction
                .accounts
                .push(AccountMeta::new(buffer_key, false));

            let signers = [[new_program_id.as_ref(), &[bump_seed]]]
                .iter()
                .map(|seeds| Pubkey::create_program_address(seeds, &program_id))
                .collect::<Result<Vec<Pubkey>, PubkeyError>>()?;
            invoke_context.native_invoke(instruction, signers.as_slice())?;

            // Load and verify the program bits
            let transaction_context = &invoke_context.transaction_context;
            let instruction_context = transaction_context.get_current_instruction_context()?;
            let buffer =
                instruction_context.try_borrow_instruction_account(transaction_context, 3)?;
            deploy_program!(
                invoke_context,
                new_program_id,
                &program_id,
                UpgradeableLoaderState::size_of_program().saturating_add(programdata_len),
                clock.slot,
                {
                    drop(buffer);
                },
                buffer
                    .get_data()
                    .get(buffer_data_offset..)
                    .ok_or(InstructionError::AccountDataTooSmall)?,
            );

            let transaction_context = &invoke_context.transaction_context;
            let instruction_context = transaction_context.get_current_instruction_context()?;

            // Update the ProgramData account and record the program bits
            {
                let mut programdata =
                    instruction_context.try_borrow_instruction_account(transaction_context, 1)?;
                programdata.set_state(&UpgradeableLoaderState::ProgramData {
                    slot: clock.slot,
                    upgrade_authority_address: authority_key,
                })?;
                let dst_slice = programdata
                    .get_data_mut()?
                    .get_mut(
                        programdata_data_offset
                            ..programdata_data_offset.saturating_add(buffer_data_len),
                    )
                    .ok_or(InstructionError::AccountDataTooSmall)?;
                let mut buffer =
                    instruction_context.try_borrow_instruction_account(transaction_context, 3)?;
                let src_slice = buffer
                    .get_data()
                    .get(buffer_data_offset..)
                    .ok_or(InstructionError::AccountDataTooSmall)?;
                dst_slice.copy_from_slice(src_slice);
                buffer.set_data_length(UpgradeableLoaderState::size_of_buffer(0))?;
            }

            // Update the Program account
            let mut program =
                instruction_context.try_borrow_instruction_account(transaction_context, 2)?;
            program.set_state(&UpgradeableLoaderState::Program {
                programdata_address: programdata_key,
            })?;
            program.set_executable(true)?;
            drop(program);

            ic_logger_msg!(log_collector, "Deployed program {:?}", new_program_id);
        }
        UpgradeableLoaderInstruction::Upgrade => {
            instruction_context.check_number_of_instruction_accounts(3)?;
            let programdata_key = *transaction_context.get_key_of_account_at_index(
                instruction_context.get_index_of_instruction_account_in_transaction(0)?,
            )?;
            let rent = get_sysvar_with_account_check::rent(invoke_context, instruction_context, 4)?;
            let clock =
                get_sysvar_with_account_check::clock(invoke_context, instruction_context, 5)?;
            instruction_context.check_number_of_instruction_accounts(7)?;
            let authority_key = Some(*transaction_context.get_key_of_account_at_index(
                instruction_context.get_index_of_instruction_account_in_transaction(6)?,
            )?);

            // Verify Program account

            let program =
                instruction_context.try_borrow_instruction_account(transaction_context, 1)?;
            if !invoke_context
                .get_feature_set()
                .remove_accounts_executable_flag_checks
                && !program.is_executable()
            {
                ic_logger_msg!(log_collector, "Program account not executable");
                return Err(InstructionError::AccountNotExecutable);
            }
            if !program.is_writable() {
                ic_logger_msg!(log_collector, "Program account not writeable");
                return Err(InstructionError::InvalidArgument);
            }
            if program.get_owner() != &program_id {
                ic_logger_msg!(log_collector, "Program account not owned by loader");
                return Err(InstructionError::IncorrectProgramId);
            }
            if let UpgradeableLoaderState::Program {
                programdata_address,
            } = program.get_state()?
            {
                if programdata_address != programdata_key {
                    ic_logger_msg!(log_collector, "Program and ProgramData account mismatch");
                    return Err(InstructionError::InvalidArgument);
                }
            } else {
                ic_logger_msg!(log_collector, "Invalid Program account");
                return Err(InstructionError::InvalidAccountData);
            }
            let new_program_id = *program.get_key();
            drop(program);

            // Verify Buffer account

            let buffer =
                instruction_context.try_borrow_instruction_account(transaction_context, 2)?;
            if let UpgradeableLoaderState::Buffer { authority_address } = buffer.get_state()? {
                if authority_address != authority_key {
                    ic_logger_msg!(log_collector, "Buffer and upgrade authority don't match");
                    return Err(InstructionError::IncorrectAuthority);
                }
                if !instruction_context.is_instruction_account_signer(6)? {
                    ic_logger_msg!(log_collector, "Upgrade authority did not sign");
                    return Err(InstructionError::MissingRequiredSignature);
                }
            } else {
                ic_logger_msg!(log_collector, "Invalid Buffer account");
                return Err(InstructionError::InvalidArgument);
            }
            let buffer_lamports = buffer.get_lamports();
            let buffer_data_offset = UpgradeableLoaderState::size_of_buffer_metadata();
            let buffer_data_len = buffer.get_data().len().saturating_sub(buffer_data_offset);
            if buffer.get_data().len() < UpgradeableLoaderState::size_of_buffer_metadata()
                || buffer_data_len == 0
            {
                ic_logger_msg!(log_collector, "Buffer account too small");
                return Err(InstructionError::InvalidAccountData);
            }
            drop(buffer);

            // Verify ProgramData account

            let programdata =
                instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
            let programdata_data_offset = UpgradeableLoaderState::size_of_programdata_metadata();
            let programdata_balance_required =
                1.max(rent.minimum_balance(programdata.get_data().len()));
            if programdata.get_data().len()
                < UpgradeableLoaderState::size_of_programdata(buffer_data_len)
            {
                ic_logger_msg!(log_collector, "ProgramData account not large enough");
                return Err(InstructionError::AccountDataTooSmall);
            }
            if programdata.get_lamports().saturating_add(buffer_lamports)
                < programdata_balance_required
            {
                ic_logger_msg!(
                    log_collector,
                    "Buffer account balance too low to fund upgrade"
                );
                return Err(InstructionError::InsufficientFunds);
            }
            if let UpgradeableLoaderState::ProgramData {
                slot,
                upgrade_authority_address,
            } = programdata.get_state()?
            {
                if clock.slot == slot {
                    ic_logger_msg!(log_collector, "Program was deployed in this block already");
                    return Err(InstructionError::InvalidArgument);
                }
                if upgrade_authority_address.is_none() {
                    ic_logger_msg!(log_collector, "Program not upgradeable");
                    return Err(InstructionError::Immutable);
                }
                if upgrade_authority_address != authority_key {
                    ic_logger_msg!(log_collector, "Incorrect upgrade authority provided");
                    return Err(InstructionError::IncorrectAuthority);
                }
                if !instruction_context.is_instruction_account_signer(6)? {
                    ic_logger_msg!(log_collector, "Upgrade authority did not sign");
                    return Err(InstructionError::MissingRequiredSignature);
                }
            } else {
                ic_logger_msg!(log_collector, "Invalid ProgramData account");
                return Err(InstructionError::InvalidAccountData);
            };
            let programdata_len = programdata.get_data().len();
            drop(programdata);

            // Load and verify the program bits
            let buffer =
                instruction_context.try_borrow_instruction_account(transaction_context, 2)?;
            deploy_program!(
                invoke_context,
                new_program_id,
                &program_id,
                UpgradeableLoaderState::size_of_program().saturating_add(programdata_len),
                clock.slot,
                {
                    drop(buffer);
                },
                buffer
                    .get_data()
                    .get(buffer_data_offset..)
                    .ok_or(InstructionError::AccountDataTooSmall)?,
            );

            let transaction_context = &invoke_context.transaction_context;
            let instruction_context = transaction_context.get_current_instruction_context()?;

            // Update the ProgramData account, record the upgraded data, and zero
            // the rest
            let mut programdata =
                instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
            {
                programdata.set_state(&UpgradeableLoaderState::ProgramData {
                    slot: clock.slot,
                    upgrade_authority_address: authority_key,
                })?;
                let dst_slice = programdata
                    .get_data_mut()?
                    .get_mut(
                        programdata_data_offset
                            ..programdata_data_offset.saturating_add(buffer_data_len),
                    )
                    .ok_or(InstructionError::AccountDataTooSmall)?;
                let buffer =
                    instruction_context.try_borrow_instruction_account(transaction_context, 2)?;
                let src_slice = buffer
                    .get_data()
                    .get(buffer_data_offset..)
                    .ok_or(InstructionError::AccountDataTooSmall)?;
                dst_slice.copy_from_slice(src_slice);
            }
            programdata
                .get_data_mut()?
                .get_mut(programdata_data_offset.saturating_add(buffer_data_len)..)
                .ok_or(InstructionError::AccountDataTooSmall)?
                .fill(0);

            // Fund ProgramData to rent-exemption, spill the rest
            let mut buffer =
                instruction_context.try_borrow_instruction_account(transaction_context, 2)?;
            let mut spill =
                instruction_context.try_borrow_instruction_account(transaction_context, 3)?;
            spill.checked_add_lamports(
                programdata
                    .get_lamports()
                    .saturating_add(buffer_lamports)
                    .saturating_sub(programdata_balance_required),
            )?;
            buffer.set_lamports(0)?;
            programdata.set_lamports(programdata_balance_required)?;
            buffer.set_data_length(UpgradeableLoaderState::size_of_buffer(0))?;

            ic_logger_msg!(log_collector, "Upgraded program {:?}", new_program_id);
        }
        UpgradeableLoaderInstruction::SetAuthority => {
            instruction_context.check_number_of_instruction_accounts(2)?;
            let mut account =
                instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
            let present_authority_key = transaction_context.get_key_of_account_at_index(
                instruction_context.get_index_of_instruction_account_in_transaction(1)?,
            )?;
            let new_authority = instruction_context
                .get_index_of_instruction_account_in_transaction(2)
                .and_then(|index_in_transaction| {
                    transaction_context.get_key_of_account_at_index(index_in_transaction)
                })
                .ok();

            match account.get_state()? {
                UpgradeableLoaderState::Buffer { authority_address } => {
                    if new_authority.is_none() {
                        ic_logger_msg!(log_collector, "Buffer authority is not optional");
                        return Err(InstructionError::IncorrectAuthority);
                    }
                    if authority_address.is_none() {
                        ic_logger_msg!(log_collector, "Buffer is immutable");
                        return Err(InstructionError::Immutable);
                    }
                    if authority_address != Some(*present_authority_key) {
                        ic_logger_msg!(log_collector, "Incorrect buffer authority provided");
                        return Err(InstructionError::IncorrectAuthority);
                    }
                    if !instruction_context.is_instruction_account_signer(1)? {
                        ic_logger_msg!(log_collector, "Buffer authority did not sign");
                        return Err(InstructionError::MissingRequiredSignature);
                    }
                    account.set_state(&UpgradeableLoaderState::Buffer {
                        authority_address: new_authority.cloned(),
                    })?;
                }
                UpgradeableLoaderState::ProgramData {
                    slot,
                    upgrade_authority_address,
                } => {
                    if upgrade_authority_address.is_none() {
                        ic_logger_msg!(log_collector, "Program not upgradeable");
                        return Err(InstructionError::Immutable);
                    }
                    if upgrade_authority_address != Some(*present_authority_key) {
                        ic_logger_msg!(log_collector, "Incorrect upgrade authority provided");
                        return Err(InstructionError::IncorrectAuthority);
                    }
                    if !instruction_context.is_instruction_account_signer(1)? {
                        ic_logger_msg!(log_collector, "Upgrade authority did not sign");
                        return Err(InstructionError::MissingRequiredSignature);
                    }
                    account.set_state(&UpgradeableLoaderState::ProgramData {
                        slot,
                        upgrade_authority_address: new_authority.cloned(),
                    })?;
                }
                _ => {
                    ic_logger_msg!(log_collector, "Account does not support authorities");
                    return Err(InstructionError::InvalidArgument);
                }
            }

            ic_logger_msg!(log_collector, "New authority {:?}", new_authority);
        }
        UpgradeableLoaderInstruction::SetAuthorityChecked => {
            if !invoke_context
                .get_feature_set()
                .enable_bpf_loader_set_authority_checked_ix
            {
                return Err(InstructionError::InvalidInstructionData);
            }

            instruction_context.check_number_of_instruction_accounts(3)?;
            let mut account =
                instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
            let present_authority_key = transaction_context.get_key_of_account_at_index(
                instruction_context.get_index_of_instruction_account_in_transaction(1)?,
            )?;
            let new_authority_key = transaction_context.get_key_of_account_at_index(
                instruction_context.get_index_of_instruction_account_in_transaction(2)?,
            )?;

            match account.get_state()? {
                UpgradeableLoaderState::Buffer { authority_address } => {
                    if authority_address.is_none() {
                        ic_logger_msg!(log_collector, "Buffer is immutable");
                        return Err(InstructionError::Immutable);
                    }
                    if authority_address != Some(*present_authority_key) {
                        ic_logger_msg!(log_collector, "Incorrect buffer authority provided");
                        return Err(InstructionError::IncorrectAuthority);
                    }
                    if !instruction_context.is_instruction_account_signer(1)? {
                        ic_logger_msg!(log_collector, "Buffer authority did not sign");
                        return Err(InstructionError::MissingRequiredSignature);
                    }
                    if !instruction_context.is_instruction_account_signer(2)? {
                        ic_logger_msg!(log_collector, "New authority did not sign");
                        return Err(InstructionError::MissingRequiredSignature);
                    }
                    account.set_state(&UpgradeableLoaderState::Buffer {
                        authority_address: Some(*new_authority_key),
                    })?;
                }
                UpgradeableLoaderState::ProgramData {
                    slot,
                    upgrade_authority_address,
                } => {
                    if upgrade_authority_address.is_none() {
                        ic_logger_msg!(log_collector, "Program not upgradeable");
                        return Err(InstructionError::Immutable);
                    }
                    if upgrade_authority_address != Some(*present_authority_key) {
                        ic_logger_msg!(log_collector, "Incorrect upgrade authority provided");
                        return Err(InstructionError::IncorrectAuthority);
                    }
                    if !instruction_context.is_instruction_account_signer(1)? {
                        ic_logger_msg!(log_collector, "Upgrade authority did not sign");
                        return Err(InstructionError::MissingRequiredSignature);
                    }
                    if !instruction_context.is_instruction_account_signer(2)? {
                        ic_logger_msg!(log_collector, "New authority did not sign");
                        return Err(InstructionError::MissingRequiredSignature);
                    }
                    account.set_state(&UpgradeableLoaderState::ProgramData {
                        slot,
                        upgrade_authority_address: Some(*new_authority_key),
                    })?;
                }
                _ => {
                    ic_logger_msg!(log_collector, "Account does not support authorities");
                    return Err(InstructionError::InvalidArgument);
                }
            }

            ic_logger_msg!(log_collector, "New authority {:?}", new_authority_key);
        }
        UpgradeableLoaderInstruction::Close => {
            instruction_context.check_number_of_instruction_accounts(2)?;
            if instruction_context.get_index_of_instruction_account_in_transaction(0)?
                == instruction_context.get_index_of_instruction_account_in_transaction(1)?
            {
                ic_logger_msg!(
                    log_collector,
                    "Recipient is the same as the account being closed"
                );
                return Err(InstructionError::InvalidArgument);
            }
            let mut close_account =
                instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
            let close_key = *close_account.get_key();
            let close_account_state = close_account.get_state()?;
            close_account.set_data_length(UpgradeableLoaderState::size_of_uninitialized())?;
            match close_account_state {
                UpgradeableLoaderState::Uninitialized => {
                    let mut recipient_account = instruction_context
                        .try_borrow_instruction_account(transaction_context, 1)?;
                    recipient_account.checked_add_lamports(close_account.get_lamports())?;
                    close_account.set_lamports(0)?;

                    ic_logger_msg!(log_collector, "Closed Uninitialized {}", close_key);
                }
                UpgradeableLoaderState::Buffer { authority_address } => {
                    instruction_context.check_number_of_instruction_accounts(3)?;
                    drop(close_account);
                    common_close_account(
                        &authority_address,
                        transaction_context,
                        instruction_context,
                        &log_collector,
                    )?;

                    ic_logger_msg!(log_collector, "Closed Buffer {}", close_key);
                }
                UpgradeableLoaderState::ProgramData {
                    slot,
                    upgrade_authority_address: authority_address,
                } => {
                    instruction_context.check_number_of_instruction_accounts(4)?;
                    drop(close_account);
                    let program_account = instruction_context
                        .try_borrow_instruction_account(transaction_context, 3)?;
                    let program_key = *program_account.get_key();

                    if !program_account.is_writable() {
                        ic_logger_msg!(log_collector, "Program account is not writable");
                        return Err(InstructionError::InvalidArgument);
                    }
                    if program_account.get_owner() != &program_id {
                        ic_logger_msg!(log_collector, "Program account not owned by loader");
                        return Err(InstructionError::IncorrectProgramId);
                    }
                    let clock = invoke_context.get_sysvar_cache().get_clock()?;
                    if clock.slot == slot {
                        ic_logger_msg!(log_collector, "Program was deployed in this block already");
                        return Err(InstructionError::InvalidArgument);
                    }

                    match program_account.get_state()? {
                        UpgradeableLoaderState::Program {
                            programdata_address,
                        } => {
                            if programdata_address != close_key {
                                ic_logger_msg!(
                                    log_collector,
                                    "ProgramData account does not match ProgramData account"
                                );
                                return Err(InstructionError::InvalidArgument);
                            }

                            drop(program_account);
                            common_close_account(
                                &authority_address,
                                transaction_context,
                                instruction_context,
                                &log_collector,
                            )?;
                            invoke_context.programs_modified_by_tx.replenish(
                                program_key,
                                Arc::new(LoadedProgram::new_tombstone(
                                    clock.slot,
                                    LoadedProgramType::Closed,
                                )),
                            );
                        }
                        _ => {
                            ic_logger_msg!(log_collector, "Invalid Program account");
                            return Err(InstructionError::InvalidArgument);
                        }
                    }

                    ic_logger_msg!(log_collector, "Closed Program {}", program_key);
                }
                _ => {
                    ic_logger_msg!(log_collector, "Account does not support closing");
                    return Err(InstructionError::InvalidArgument);
                }
            }
        }
        UpgradeableLoaderInstruction::ExtendProgram { additional_bytes } => {
            if invoke_context
                .get_feature_set()
                .enable_extend_program_checked
            {
                ic_logger_msg!(
                    log_collector,
                    "ExtendProgram was superseded by ExtendProgramChecked"
                );
                return Err(InstructionError::InvalidInstructionData);
            }
            common_extend_program(invoke_context, additional_bytes, false)?;
        }
        UpgradeableLoaderInstruction::ExtendProgramChecked { additional_bytes } => {
            if !invoke_context
                .get_feature_set()
                .enable_extend_program_checked
            {
                return Err(InstructionError::InvalidInstructionData);
            }
            common_extend_program(invoke_context, additional_bytes, true)?;
        }
        UpgradeableLoaderInstruction::Migrate => {
            if !invoke_context.get_feature_set().enable_loader_v4 {
                return Err(InstructionError::InvalidInstructionData);
            }
            migrate_program(invoke_context)?;
        }
    }

    Ok(())
}

fn common_extend_program(
    invoke_context: &mut InvokeContext,
    additional_bytes: u32,
    check_authority: bool,
) -> Result<(), InstructionError> {
    let log_collector = invoke_context.get_log_collector();
    let transaction_context = &invoke_context.transaction_context;
    let instruction_context = transaction_context.get_current_instruction_context()?;
    let program_id = *instruction_context.get_last_program_key(transaction_context)?;

    const PROGRAM_DATA_ACCOUNT_INDEX: IndexOfAccount = 0;
    const PROGRAM_ACCOUNT_INDEX: IndexOfAccount = 1;
    const AUTHORITY_ACCOUNT_INDEX: IndexOfAccount = 2;
    // The system program is only required when a CPI is performed
    let optional_payer_account_index: IndexOfAccount = if check_authority { 4 } else { 3 };

    if additional_bytes == 0 {
        ic_logger_msg!(log_collector, "Additional bytes must be greater than 0");
        return Err(InstructionError::InvalidInstructionData);
    }

    let programdata_account = instruction_context
        .try_borrow_instruction_account(transaction_context, PROGRAM_DATA_ACCOUNT_INDEX)?;
    let programdata_key = *programdata_account.get_key();

    if &program_id != programdata_account.get_owner() {
        ic_logger_msg!(log_collector, "ProgramData owner is invalid");
        return Err(InstructionError::InvalidAccountOwner);
    }
    if !programdata_account.is_writable() {
        ic_logger_msg!(log_collector, "ProgramData is not writable");
        return Err(InstructionError::InvalidArgument);
    }

    let program_account = instruction_context
        .try_borrow_instruction_account(transaction_context, PROGRAM_ACCOUNT_INDEX)?;
    if !program_account.is_writable() {
        ic_logger_msg!(log_collector, "Program account is not writable");
        return Err(InstructionError::InvalidArgument);
    }
    if program_account.get_owner() != &program_id {
        ic_logger_msg!(log_collector, "Program account not owned by loader");
        return Err(InstructionError::InvalidAccountOwner);
    }
    let program_key = *program_account.get_key();
    match program_account.get_state()? {
        UpgradeableLoaderState::Program {
            programdata_address,
        } => {
            if programdata_address != programdata_key {
                ic_logger_msg!(
                    log_collector,
                    "Program account does not match ProgramData account"
                );
                return Err(InstructionError::InvalidArgument);
            }
        }
        _ => {
            ic_logger_msg!(log_collector, "Invalid Program account");
            return Err(InstructionError::InvalidAccountData);
        }
    }
    drop(program_account);

    let old_len = programdata_account.get_data().len();
    let new_len = old_len.saturating_add(additional_bytes as usize);
    if new_len > MAX_PERMITTED_DATA_LENGTH as usize {
        ic_logger_msg!(
            log_collector,
            "Extended ProgramData length of {} bytes exceeds max account data length of {} bytes",
            new_len,
            MAX_PERMITTED_DATA_LENGTH
        );
        return Err(InstructionError::InvalidRealloc);
    }

    let clock_slot = invoke_context
        .get_sysvar_cache()
        .get_clock()
        .map(|clock| clock.slot)?;

    let upgrade_authority_address = if let UpgradeableLoaderState::ProgramData {
        slot,
        upgrade_authority_address,
    } = programdata_account.get_state()?
    {
        if clock_slot == slot {
            ic_logger_msg!(log_collector, "Program was extended in this block already");
            return Err(InstructionError::InvalidArgument);
        }

        if upgrade_authority_address.is_none() {
            ic_logger_msg!(
                log_collector,
                "Cannot extend ProgramData accounts that are not upgradeable"
            );
            return Err(InstructionError::Immutable);
        }

        if check_authority {
            let authority_key = Some(*transaction_context.get_key_of_account_at_index(
                instruction_context
                    .get_index_of_instruction_account_in_transaction(AUTHORITY_ACCOUNT_INDEX)?,
            )?);
            if upgrade_authority_address != authority_key {
                ic_logger_msg!(log_collector, "Incorrect upgrade authority provided");
                return Err(InstructionError::IncorrectAuthority);
            }
            if !instruction_context.is_instruction_account_signer(AUTHORITY_ACCOUNT_INDEX)? {
                ic_logger_msg!(log_collector, "Upgrade authority did not sign");
                return Err(InstructionError::MissingRequiredSignature);
            }
        }
        upgrade_authority_address
    } else {
        ic_logger_msg!(log_collector, "ProgramData state is invalid");
        return Err(InstructionError::InvalidAccountData);
    };

    let required_payment = {
        let balance = programdata_account.get_lamports();
        let rent = invoke_context.get_sysvar_cache().get_rent()?;
        let min_balance = rent.minimum_balance(new_len).max(1);
        min_balance.saturating_sub(balance)
    };

    // Borrowed accounts need to be dropped before native_invoke
    drop(programdata_account);

    if required_payment > 0 {
        let payer_key = *transaction_context.get_key_of_account_at_index(
            instruction_context
                .get_index_of_instruction_account_in_transaction(optional_payer_account_index)?,
        )?;

        invoke_context.native_invoke(
            system_instruction::transfer(&payer_key, &programdata_key, required_payment),
            &[],
        )?;
    }

    let transaction_context = &invoke_context.transaction_context;
    let instruction_context = transaction_context.get_current_instruction_context()?;
    let mut programdata_account = instruction_context
        .try_borrow_instruction_account(transaction_context, PROGRAM_DATA_ACCOUNT_INDEX)?;
    programdata_account.set_data_length(new_len)?;

    let programdata_data_offset = UpgradeableLoaderState::size_of_programdata_metadata();

    deploy_program!(
        invoke_context,
        program_key,
        &program_id,
        UpgradeableLoaderState::size_of_program().saturating_add(new_len),
        clock_slot,
        {
            drop(programdata_account);
        },
        programdata_account
            .get_data()
            .get(programdata_data_offset..)
            .ok_or(InstructionError::AccountDataTooSmall)?,
    );

    let mut programdata_account = instruction_context
        .try_borrow_instruction_account(transaction_context, PROGRAM_DATA_ACCOUNT_INDEX)?;
    programdata_account.set_state(&UpgradeableLoaderState::ProgramData {
        slot: clock_slot,
        upgrade_authority_address,
    })?;

    ic_logger_msg!(
        log_collector,
        "Extended ProgramData account by {} bytes",
        additional_bytes
    );

    Ok(())
}

/// Hands a program over to loader v4: the program account is emptied and
/// reassigned, the program data is copied into it through loader v4 and the
/// ProgramData account is emptied.
fn migrate_program(invoke_context: &mut InvokeContext) -> Result<(), InstructionError> {
    let log_collector = invoke_context.get_log_collector();
    let transaction_context = &invoke_context.transaction_context;
    let instruction_context = transaction_context.get_current_instruction_context()?;
    let program_id = *instruction_context.get_last_program_key(transaction_context)?;

    instruction_context.check_number_of_instruction_accounts(3)?;
    let programdata_address = *transaction_context.get_key_of_account_at_index(
        instruction_context.get_index_of_instruction_account_in_transaction(0)?,
    )?;
    let program_address = *transaction_context.get_key_of_account_at_index(
        instruction_context.get_index_of_instruction_account_in_transaction(1)?,
    )?;
    let provided_authority_address = *transaction_context.get_key_of_account_at_index(
        instruction_context.get_index_of_instruction_account_in_transaction(2)?,
    )?;
    let clock_slot = invoke_context
        .get_sysvar_cache()
        .get_clock()
        .map(|clock| clock.slot)?;

    // Verify ProgramData account
    let programdata = instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
    if !programdata.is_writable() {
        ic_logger_msg!(log_collector, "ProgramData account not writeable");
        return Err(InstructionError::InvalidArgument);
    }
    let (program_len, upgrade_authority_address) =
        if let Ok(UpgradeableLoaderState::ProgramData {
            slot,
            upgrade_authority_address,
        }) = programdata.get_state()
        {
            if clock_slot == slot {
                ic_logger_msg!(log_collector, "Program was deployed in this block already");
                return Err(InstructionError::InvalidArgument);
            }
            (
                programdata
                    .get_data()
                    .len()
                    .saturating_sub(UpgradeableLoaderState::size_of_programdata_metadata()),
                upgrade_authority_address,
            )
        } else {
            (0, None)
        };
    let programdata_funds = programdata.get_lamports();
    drop(programdata);

    // Verify authority signature
    if !migration_authority::check_id(&provided_authority_address)
        && provided_authority_address != upgrade_authority_address.unwrap_or(program_address)
    {
        ic_logger_msg!(log_collector, "Incorrect migration authority provided");
        return Err(InstructionError::IncorrectAuthority);
    }
    if !instruction_context.is_instruction_account_signer(2)? {
        ic_logger_msg!(log_collector, "Migration authority did not sign");
        return Err(InstructionError::MissingRequiredSignature);
    }

    // Verify Program account
    let mut program = instruction_context.try_borrow_instruction_account(transaction_context, 1)?;
    if !program.is_writable() {
        ic_logger_msg!(log_collector, "Program account not writeable");
        return Err(InstructionError::InvalidArgument);
    }
    if program.get_owner() != &program_id {
        ic_logger_msg!(log_collector, "Program account not owned by loader");
        return Err(InstructionError::IncorrectProgramId);
    }
    if let UpgradeableLoaderState::Program {
        programdata_address: stored_programdata_address,
    } = program.get_state()?
    {
        if programdata_address != stored_programdata_address {
            ic_logger_msg!(log_collector, "Program and ProgramData account mismatch");
            return Err(InstructionError::InvalidArgument);
        }
    } else {
        ic_logger_msg!(log_collector, "Invalid Program account");
        return Err(InstructionError::InvalidAccountData);
    }
    program.set_data_from_slice(&[])?;
    program.checked_add_lamports(programdata_funds)?;
    program.set_owner(loader_v4::id().as_ref())?;
    drop(program);

    let mut programdata =
        instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
    programdata.set_lamports(0)?;
    drop(programdata);

    if program_len > 0 {
        let program_len = program_len as u32;
        invoke_context.native_invoke(
            loader_v4::set_program_length(
                &program_address,
                &provided_authority_address,
                program_len,
                &program_address,
            ),
            &[],
        )?;
        invoke_context.native_invoke(
            loader_v4::copy(
                &program_address,
                &provided_authority_address,
                &programdata_address,
                0,
                0,
                program_len,
            ),
            &[],
        )?;
        invoke_context.native_invoke(
            loader_v4::deploy(&program_address, &provided_authority_address),
            &[],
        )?;
        match upgrade_authority_address {
            None => invoke_context.native_invoke(
                loader_v4::finalize(
                    &program_address,
                    &provided_authority_address,
                    &program_address,
                ),
                &[],
            )?,
            Some(upgrade_authority_address)
                if migration_authority::check_id(&provided_authority_address) =>
            {
                invoke_context.native_invoke(
                    loader_v4::transfer_authority(
                        &program_address,
                        &provided_authority_address,
                        &upgrade_authority_address,
                    ),
                    &[],
                )?
            }
            Some(_) => {}
        }
    }

    let transaction_context = &invoke_context.transaction_context;
    let instruction_context = transaction_context.get_current_instruction_context()?;
    let mut programdata =
        instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
    programdata.set_data_from_slice(&[])?;
    drop(programdata);

    ic_logger_msg!(log_collector, "Migrated program {:?}", program_address);
    Ok(())
}

fn common_close_account(
    authority_address: &Option<Pubkey>,
    transaction_context: &TransactionContext,
    instruction_context: &InstructionContext,
    log_collector: &Option<Rc<RefCell<LogCollector>>>,
) -> Result<(), InstructionError> {
    if authority_address.is_none() {
        ic_logger_msg!(log_collector, "Account is immutable");
        return Err(InstructionError::Immutable);
    }
    if *authority_address
        != Some(*transaction_context.get_key_of_account_at_index(
            instruction_context.get_index_of_instruction_account_in_transaction(2)?,
        )?)
    {
        ic_logger_msg!(log_collector, "Incorrect authority provided");
        return Err(InstructionError::IncorrectAuthority);
    }
    if !instruction_context.is_instruction_account_signer(2)? {
        ic_logger_msg!(log_collector, "Authority did not sign");
        return Err(InstructionError::MissingRequiredSignature);
    }

    let mut close_account =
        instruction_context.try_borrow_instruction_account(transaction_context, 0)?;
    let mut recipient_account =
        instruction_context.try_borrow_instruction_account(transaction_context, 1)?;
    recipient_account.checked_add_lamports(close_account.get_lamports())?;
    close_account.set_lamports(0)?;
    close_account.set_state(&UpgradeableLoaderState::Uninitialized)?;
    Ok(())
}

fn create_vm<'a>(
    executable: &'a dyn Executable,
    parameter_bytes: &'a mut [u8],
    regions: Vec<MemoryRegion>,
    compute_budget: &ComputeBudget,
    feature_set: &FeatureSet,
    invoke_context: &InvokeContext,
) -> Result<Box<dyn Vm + 'a>, Box<dyn std::error::Error>> {
    invoke_context.consume_checked(calculate_heap_cost(
        compute_budget.heap_size,
        compute_budget.heap_cost,
    ))?;
    let memory_mapping = MemoryMapping::new(parameter_bytes, regions)?;
    Ok(executable.create_vm(Config::new(compute_budget, feature_set), memory_mapping)?)
}

/// Maps a vm fault to the instruction error reported for it. A store into the
/// data of an account is reported by why the account could not be written.
fn instruction_error_from_vm_fault(
    invoke_context: &InvokeContext,
    error: EbpfError,
    direct_mapping: bool,
    account_region_addrs: &[Range<u64>],
) -> InstructionError {
    if direct_mapping {
        if let EbpfError::AccessViolation(AccessType::Store, address, _size, _region_name) = error {
            if region_index(address) == INPUT_REGION_INDEX {
                if let Some(instruction_account_index) = account_region_addrs
                    .iter()
                    .position(|vm_region| vm_region.contains(&address))
                {
                    let transaction_context = &invoke_context.transaction_context;
                    let reclassified = transaction_context
                        .get_current_instruction_context()
                        .and_then(|instruction_context| {
                            let account = instruction_context.try_borrow_instruction_account(
                                transaction_context,
                                instruction_account_index as IndexOfAccount,
                            )?;
                            Ok(
                                if !transaction_context.remove_accounts_executable_flag_checks()
                                    && account.is_executable()
                                {
                                    InstructionError::ExecutableDataModified
                                } else if account.is_writable() {
                                    InstructionError::ExternalAccountDataModified
                                } else {
                                    InstructionError::ReadonlyDataModified
                                },
                            )
                        });
                    return match reclassified {
                        Ok(err) | Err(err) => err,
                    };
                }
            }
        }
    }
    match error {
        EbpfError::SyscallError(SyscallError::InstructionError(err)) => err,
        _ => InstructionError::ProgramFailedToComplete,
    }
}

fn execute(
    executable: &dyn Executable,
    invoke_context: &mut InvokeContext,
) -> Result<(), InstructionError> {
    let log_collector = invoke_context.get_log_collector();
    let feature_set = invoke_context.get_feature_set().clone();
    let compute_budget = *invoke_context.get_compute_budget();
    let direct_mapping = feature_set.bpf_account_data_direct_mapping;
    let transaction_context = &invoke_context.transaction_context;
    let instruction_context = transaction_context.get_current_instruction_context()?;
    let (program_id, is_loader_deprecated) = {
        let program_account =
            instruction_context.try_borrow_last_program_account(transaction_context)?;
        (
            *program_account.get_key(),
            bpf_loader_deprecated::check_id(program_account.get_owner()),
        )
    };

    let mut serialize_time = Measure::start("serialize");
    let (mut parameter_bytes, regions, accounts_metadata) = serialization::serialize_parameters(
        transaction_context,
        instruction_context,
        direct_mapping,
        feature_set.mask_out_rent_epoch_in_vm_serialization,
    )?;
    serialize_time.stop();

    // save the account addresses so in case we hit an AccessViolation error we
    // can map to a more specific error
    let account_region_addrs = accounts_metadata
        .iter()
        .map(|metadata| {
            let vm_end = metadata
                .vm_data_addr
                .saturating_add(metadata.original_data_len as u64)
                .saturating_add(if !is_loader_deprecated {
                    MAX_PERMITTED_DATA_INCREASE as u64
                } else {
                    0
                });
            metadata.vm_data_addr..vm_end
        })
        .collect::<Vec<_>>();

    let mut create_vm_time = Measure::start("create_vm");
    let compute_meter_prev = invoke_context.get_remaining();
    let mut vm = match create_vm(
        executable,
        parameter_bytes.as_slice_mut(),
        regions,
        &compute_budget,
        &feature_set,
        invoke_context,
    ) {
        Ok(vm) => vm,
        Err(err) => {
            ic_logger_msg!(log_collector, "Failed to create SBF VM: {}", err);
            return Err(InstructionError::ProgramEnvironmentSetupFailure);
        }
    };
    create_vm_time.stop();

    let mut execute_time = Measure::start("execute");
    let (compute_units_consumed, result) = vm.execute(invoke_context);
    drop(vm);
    stable_log::program_consumed(
        &log_collector,
        &program_id,
        compute_units_consumed,
        compute_meter_prev,
    );
    let (_returned_from_program_id, return_data) =
        invoke_context.transaction_context.get_return_data();
    if !return_data.is_empty() {
        stable_log::program_return(&log_collector, &program_id, return_data);
    }
    let execution_result = match result {
        Ok(status) if status != SUCCESS => Err(InstructionError::from(status)),
        Ok(_) => Ok(()),
        Err(error) => {
            if feature_set.deplete_cu_meter_on_vm_failure
                && !matches!(error, EbpfError::SyscallError(_))
            {
                invoke_context.consume(invoke_context.get_remaining());
            }
            Err(instruction_error_from_vm_fault(
                invoke_context,
                error,
                direct_mapping,
                &account_region_addrs,
            ))
        }
    };
    execute_time.stop();

    let mut deserialize_time = Measure::start("deserialize");
    let execute_or_deserialize_result = execution_result.and_then(|_| {
        let transaction_context = &invoke_context.transaction_context;
        serialization::deserialize_parameters(
            transaction_context,
            transaction_context.get_current_instruction_context()?,
            parameter_bytes.as_slice(),
            &accounts_metadata,
        )
    });
    deserialize_time.stop();

    // Update the timings
    let timings = &mut invoke_context.timings;
    saturating_add_assign!(timings.serialize_us, serialize_time.as_us());
    saturating_add_assign!(timings.create_vm_us, create_vm_time.as_us());
    saturating_add_assign!(timings.execute_us, execute_time.as_us());
    saturating_add_assign!(timings.deserialize_us, deserialize_time.as_us());
    trace!(
        "execute program_id={} serialize_us={} create_vm_us={} execute_us={} deserialize_us={} consumed={}",
        program_id,
        serialize_time.as_us(),
        create_vm_time.as_us(),
        execute_time.as_us(),
        deserialize_time.as_us(),
        compute_units_consumed,
    );

    execute_or_deserialize_result
}

#[cfg(any(test, feature = "dev-context-only-utils"))]
pub mod test_utils {
    use {super::*, solana_loader_sdk::account::AccountSharedData};

    /// Loads every program owned by one of the BPF loaders among the
    /// transaction accounts into the programs of the batch. Accounts which do
    /// not hold a valid program are skipped.
    pub fn load_all_invoked_programs(invoke_context: &mut InvokeContext) {
        let feature_set = invoke_context.get_feature_set().clone();
        let environment = invoke_context.get_environment().clone();
        let compute_budget = *invoke_context.get_compute_budget();
        let num_accounts = invoke_context.transaction_context.get_number_of_accounts();
        for index in 0..num_accounts {
            let Some((program_id, owner, programdata, deployment_slot, account_size)) =
                invoked_program(&invoke_context.transaction_context, index)
            else {
                continue;
            };
            let mut load_program_metrics = LoadProgramMetrics::default();
            if let Ok(loaded_program) = load_program_from_bytes(
                false,
                None,
                &mut load_program_metrics,
                &programdata,
                &owner,
                account_size,
                deployment_slot,
                environment.as_ref(),
                Config::new(&compute_budget, &feature_set),
                sbpf_version_range(&feature_set),
                &mut invoke_context.arena,
            ) {
                invoke_context
                    .programs_loaded_for_tx_batch
                    .replenish(program_id, Arc::new(loaded_program));
            }
        }
    }

    fn invoked_program(
        transaction_context: &TransactionContext,
        index: IndexOfAccount,
    ) -> Option<(Pubkey, Pubkey, Vec<u8>, Slot, usize)> {
        let program_id = *transaction_context.get_key_of_account_at_index(index).ok()?;
        let account: AccountSharedData = transaction_context.accounts().try_borrow(index).ok()?.clone();
        let owner = *account.owner();
        if bpf_loader::check_id(&owner) || bpf_loader_deprecated::check_id(&owner) {
            return Some((program_id, owner, account.data().to_vec(), 0, account.data().len()));
        }
        if !bpf_loader_upgradeable::check_id(&owner) {
            return None;
        }
        let UpgradeableLoaderState::Program {
            programdata_address,
        } = account.deserialize_data::<UpgradeableLoaderState>().ok()?
        else {
            return None;
        };
        let programdata = transaction_context
            .accounts()
            .try_borrow(transaction_context.find_index_of_account(&programdata_address)?)
            .ok()?;
        let UpgradeableLoaderState::ProgramData { slot, .. } =
            programdata.deserialize_data::<UpgradeableLoaderState>().ok()?
        else {
            return None;
        };
        let elf = programdata
            .data()
            .get(UpgradeableLoaderState::size_of_programdata_metadata()..)?
            .to_vec();
        Some((
            program_id,
            owner,
            elf,
            slot,
            account.data().len().saturating_add(programdata.data().len()),
        ))
    }
}
