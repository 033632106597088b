use {
    crate::{timings::ExecuteDetailsTimings, vm::Executable},
    solana_loader_sdk::{
        bpf_loader, bpf_loader_deprecated, bpf_loader_upgradeable, clock::Slot,
        instruction::InstructionError, pubkey::Pubkey, saturating_add_assign,
    },
    std::{
        collections::HashMap,
        fmt::{Debug, Formatter},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
};

/// Number of slots between a (re)deployment and the program becoming invocable
pub const DELAY_VISIBILITY_SLOT_OFFSET: Slot = 1;

#[derive(Default)]
pub enum LoadedProgramType {
    /// Tombstone for undeployed or unloadable programs
    #[default]
    FailedVerification,
    Closed,
    DelayVisibility,
    LegacyV0(Arc<dyn Executable>),
    LegacyV1(Arc<dyn Executable>),
}

impl Debug for LoadedProgramType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadedProgramType::FailedVerification => {
                write!(f, "LoadedProgramType::FailedVerification")
            }
            LoadedProgramType::Closed => write!(f, "LoadedProgramType::Closed"),
            LoadedProgramType::DelayVisibility => write!(f, "LoadedProgramType::DelayVisibility"),
            LoadedProgramType::LegacyV0(_) => write!(f, "LoadedProgramType::LegacyV0"),
            LoadedProgramType::LegacyV1(_) => write!(f, "LoadedProgramType::LegacyV1"),
        }
    }
}

#[derive(Debug, Default)]
pub struct LoadedProgram {
    /// The program of this entry
    pub program: LoadedProgramType,
    /// Size of account that stores the program and program data
    pub account_size: usize,
    /// Slot in which the program was (re)deployed
    pub deployment_slot: Slot,
    /// Slot in which this entry will become active (can be in the future)
    pub effective_slot: Slot,
    /// How often this entry was used by an instruction
    pub ix_usage_counter: AtomicU64,
}

#[derive(Debug, Default)]
pub struct LoadProgramMetrics {
    pub program_id: String,
    pub register_syscalls_us: u64,
    pub load_elf_us: u64,
    pub verify_code_us: u64,
}

impl LoadProgramMetrics {
    pub fn submit_datapoint(&self, timings: &mut ExecuteDetailsTimings) {
        saturating_add_assign!(
            timings.create_executor_register_syscalls_us,
            self.register_syscalls_us
        );
        saturating_add_assign!(timings.create_executor_load_elf_us, self.load_elf_us);
        saturating_add_assign!(timings.create_executor_verify_code_us, self.verify_code_us);
        log::trace!(
            "create_executor_trace program_id={} register_syscalls_us={} load_elf_us={} verify_code_us={}",
            self.program_id,
            self.register_syscalls_us,
            self.load_elf_us,
            self.verify_code_us,
        );
    }
}

impl PartialEq for LoadedProgram {
    fn eq(&self, other: &Self) -> bool {
        self.effective_slot == other.effective_slot
            && self.deployment_slot == other.deployment_slot
            && self.is_tombstone() == other.is_tombstone()
    }
}

impl LoadedProgram {
    /// Wraps a verified executable of a user program
    pub fn new(
        loader_key: &Pubkey,
        executable: Arc<dyn Executable>,
        deployment_slot: Slot,
        effective_slot: Slot,
        account_size: usize,
    ) -> Result<Self, InstructionError> {
        let program = if bpf_loader_deprecated::check_id(loader_key) {
            LoadedProgramType::LegacyV0(executable)
        } else if bpf_loader::check_id(loader_key) || bpf_loader_upgradeable::check_id(loader_key)
        {
            LoadedProgramType::LegacyV1(executable)
        } else {
            return Err(InstructionError::IncorrectProgramId);
        };
        Ok(Self {
            deployment_slot,
            account_size,
            effective_slot,
            ix_usage_counter: AtomicU64::new(0),
            program,
        })
    }

    pub fn new_tombstone(slot: Slot, reason: LoadedProgramType) -> Self {
        let tombstone = Self {
            program: reason,
            account_size: 0,
            deployment_slot: slot,
            effective_slot: slot,
            ix_usage_counter: AtomicU64::default(),
        };
        debug_assert!(tombstone.is_tombstone());
        tombstone
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(
            self.program,
            LoadedProgramType::FailedVerification
                | LoadedProgramType::Closed
                | LoadedProgramType::DelayVisibility
        )
    }

    /// The executable, unless this entry is a tombstone
    pub fn executable(&self) -> Option<&Arc<dyn Executable>> {
        match &self.program {
            LoadedProgramType::LegacyV0(executable) | LoadedProgramType::LegacyV1(executable) => {
                Some(executable)
            }
            _ => None,
        }
    }

    fn is_implicit_delay_visibility_tombstone(&self, slot: Slot) -> bool {
        self.effective_slot.saturating_sub(self.deployment_slot) == DELAY_VISIBILITY_SLOT_OFFSET
            && slot >= self.deployment_slot
            && slot < self.effective_slot
    }
}

/// The programs visible to one transaction batch, plus the ones a transaction
/// (re)deployed or closed.
#[derive(Clone, Debug, Default)]
pub struct LoadedProgramsForTxBatch {
    /// Pubkey is the address of a program
    entries: HashMap<Pubkey, Arc<LoadedProgram>>,
    slot: Slot,
}

impl LoadedProgramsForTxBatch {
    pub fn new(slot: Slot) -> Self {
        Self {
            entries: HashMap::new(),
            slot,
        }
    }

    /// Refill the cache with a single entry. Returns whether an entry was
    /// replaced, along with the stored entry.
    pub fn replenish(
        &mut self,
        key: Pubkey,
        entry: Arc<LoadedProgram>,
    ) -> (bool, Arc<LoadedProgram>) {
        (self.entries.insert(key, entry.clone()).is_some(), entry)
    }

    /// Looks up the entry of a program.
    ///
    /// An entry that was deployed in this batch's slot or earlier but is not
    /// effective yet is reported as a `DelayVisibility` tombstone.
    pub fn find(&self, key: &Pubkey) -> Option<Arc<LoadedProgram>> {
        self.entries.get(key).map(|entry| {
            if entry.is_implicit_delay_visibility_tombstone(self.slot) {
                Arc::new(LoadedProgram::new_tombstone(
                    entry.deployment_slot,
                    LoadedProgramType::DelayVisibility,
                ))
            } else {
                entry.clone()
            }
        })
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn set_slot_for_tests(&mut self, slot: Slot) {
        self.slot = slot;
    }

    /// Moves every entry of `other` into this cache, replacing existing ones
    pub fn merge(&mut self, other: &Self) {
        other.entries.iter().for_each(|(key, entry)| {
            self.replenish(*key, entry.clone());
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counts one more use of the entry of `key` by an instruction
    pub fn increment_usage(&self, key: &Pubkey) {
        if let Some(entry) = self.entries.get(key) {
            entry.ix_usage_counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}
