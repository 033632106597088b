//! What the loaders need from a virtual machine.
//!
//! A `ProgramRuntimeEnvironment` parses and loads program images into
//! `Executable`s, an `Executable` instantiates a `Vm` over a `MemoryMapping`
//! and the `Vm` validates or runs it.

use {
    crate::{arena::TransactionArena, compute_budget::ComputeBudget, invoke_context::InvokeContext},
    solana_loader_sdk::{feature_set::FeatureSet, instruction::InstructionError},
    std::{fmt::Debug, ops::Range, sync::Arc},
    thiserror::Error,
};

/// Start of the program (text and rodata) region
pub const MM_PROGRAM_START: u64 = 0x1_0000_0000;
/// Start of the stack region
pub const MM_STACK_START: u64 = 0x2_0000_0000;
/// Start of the heap region
pub const MM_HEAP_START: u64 = 0x3_0000_0000;
/// Start of the input region, holding the serialized instruction accounts
pub const MM_INPUT_START: u64 = 0x4_0000_0000;

/// Number of low bits of a vm address that address bytes inside a region
pub const VIRTUAL_ADDRESS_BITS: u32 = 32;

/// Index of the region a vm address belongs to
pub const fn region_index(vm_addr: u64) -> u64 {
    vm_addr >> VIRTUAL_ADDRESS_BITS
}

/// Index of the input region
pub const INPUT_REGION_INDEX: u64 = region_index(MM_INPUT_START);

fn region_name(vm_addr: u64) -> &'static str {
    match region_index(vm_addr) {
        1 => "program",
        2 => "stack",
        3 => "heap",
        4 => "input",
        _ => "unknown",
    }
}

/// Versions of the SBF instruction set and ELF layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SBPFVersion {
    V0,
    V1,
    V2,
    V3,
}

impl SBPFVersion {
    pub fn from_u8(version: u8) -> Option<Self> {
        match version {
            0 => Some(Self::V0),
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            _ => None,
        }
    }
}

/// What a cheap look at a program image reveals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfInfo {
    pub sbpf_version: SBPFVersion,
    /// Bytes the loaded read-only data needs
    pub rodata_footprint: usize,
    /// Number of instructions in the text section
    pub text_cnt: usize,
    /// Instruction index execution starts at
    pub entry_pc: usize,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ElfError {
    #[error("Failed to parse ELF file: {0}")]
    FailedToParse(String),
    #[error("Invalid ELF magic")]
    InvalidMagic,
    #[error("Unsupported SBF version {0}")]
    UnsupportedSBPFVersion(u8),
    #[error("SBF version {0:?} is outside of the enabled range")]
    SBPFVersionOutOfRange(SBPFVersion),
    #[error("Entrypoint out of bounds")]
    EntrypointOutOfBounds,
    #[error("Unresolved symbol ({0:#x})")]
    UnresolvedSymbol(u64),
    #[error("Symbol hash collision {0:#x}")]
    SymbolHashCollision(u32),
    #[error("Value out of bounds")]
    ValueOutOfBounds,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum VerifierError {
    #[error("No program")]
    NoProgram,
    #[error("Invalid last instruction")]
    InvalidLastInstruction,
    #[error("Unknown opcode {0:#04x} at instruction {1}")]
    UnknownOpCode(u8, usize),
    #[error("Jump out of code to {1} at instruction {0}")]
    JumpOutOfCode(usize, u64),
    #[error("Division by zero at instruction {0}")]
    DivisionByZero(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Load,
    Store,
}

/// Errors a syscall can end the execution with
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum SyscallError {
    #[error("{0}")]
    InstructionError(InstructionError),
    #[error("Program aborted")]
    Abort,
    #[error("Program panicked: {0}")]
    Panic(String),
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum EbpfError {
    #[error("Access violation in {3} section at address {1:#x} of size {2}")]
    AccessViolation(AccessType, u64, u64, &'static str),
    #[error("Compute units exceeded")]
    ExceededMaxInstructions,
    #[error("Call depth exceeded")]
    CallDepthExceeded,
    #[error("Divide by zero")]
    DivideByZero,
    #[error("Attempted to execute past the end of the text segment")]
    ExecutionOverrun,
    #[error("Invalid memory region at index {0}")]
    InvalidMemoryRegion(usize),
    #[error("Invalid heap size {0}")]
    InvalidHeapSize(u32),
    #[error("Syscall error: {0}")]
    SyscallError(SyscallError),
}

/// Value of `r0` on return or the fault that ended the execution
pub type ProgramResult = Result<u64, EbpfError>;

/// Part of the input buffer that is mapped into the vm address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub vm_addr: u64,
    pub host_offset: usize,
    pub len: u64,
    pub writable: bool,
}

impl MemoryRegion {
    pub fn new(host_offset: usize, len: u64, vm_addr: u64, writable: bool) -> Self {
        Self {
            vm_addr,
            host_offset,
            len,
            writable,
        }
    }

    pub fn vm_addr_range(&self) -> Range<u64> {
        self.vm_addr..self.vm_addr.saturating_add(self.len)
    }
}

/// Translates vm addresses into the input buffer
#[derive(Debug)]
pub struct MemoryMapping<'a> {
    input: &'a mut [u8],
    regions: Vec<MemoryRegion>,
}

impl<'a> MemoryMapping<'a> {
    pub fn new(input: &'a mut [u8], regions: Vec<MemoryRegion>) -> Result<Self, EbpfError> {
        for (index, region) in regions.iter().enumerate() {
            let host_end = usize::try_from(region.len)
                .ok()
                .and_then(|len| region.host_offset.checked_add(len));
            if !matches!(host_end, Some(end) if end <= input.len())
                || region_index(region.vm_addr) != INPUT_REGION_INDEX
            {
                return Err(EbpfError::InvalidMemoryRegion(index));
            }
        }
        Ok(Self { input, regions })
    }

    /// A mapping with nothing mapped
    pub fn empty() -> MemoryMapping<'static> {
        MemoryMapping {
            input: &mut [],
            regions: Vec::new(),
        }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    fn map(&self, access_type: AccessType, vm_addr: u64, len: u64) -> Result<Range<usize>, EbpfError> {
        let access_violation = || {
            EbpfError::AccessViolation(access_type, vm_addr, len, region_name(vm_addr))
        };
        let end = vm_addr.checked_add(len).ok_or_else(access_violation)?;
        let region = self
            .regions
            .iter()
            .find(|region| region.vm_addr <= vm_addr && end <= region.vm_addr_range().end)
            .filter(|region| access_type == AccessType::Load || region.writable)
            .ok_or_else(access_violation)?;
        let start = usize::try_from(vm_addr.saturating_sub(region.vm_addr))
            .ok()
            .and_then(|offset| region.host_offset.checked_add(offset))
            .ok_or_else(access_violation)?;
        let host_end = usize::try_from(len)
            .ok()
            .and_then(|len| start.checked_add(len))
            .ok_or_else(access_violation)?;
        Ok(start..host_end)
    }

    pub fn load(&self, vm_addr: u64, len: u64) -> Result<&[u8], EbpfError> {
        let range = self.map(AccessType::Load, vm_addr, len)?;
        self.input.get(range).ok_or(EbpfError::AccessViolation(
            AccessType::Load,
            vm_addr,
            len,
            region_name(vm_addr),
        ))
    }

    pub fn store(&mut self, vm_addr: u64, bytes: &[u8]) -> Result<(), EbpfError> {
        let len = bytes.len() as u64;
        let range = self.map(AccessType::Store, vm_addr, len)?;
        self.input
            .get_mut(range)
            .ok_or(EbpfError::AccessViolation(
                AccessType::Store,
                vm_addr,
                len,
                region_name(vm_addr),
            ))?
            .copy_from_slice(bytes);
        Ok(())
    }
}

/// Parameters a vm is instantiated with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub max_call_depth: usize,
    pub stack_frame_size: usize,
    pub heap_size: u32,
    /// Account data is mapped with the writability of the account
    pub direct_mapping: bool,
}

impl Config {
    pub fn new(compute_budget: &ComputeBudget, feature_set: &FeatureSet) -> Self {
        Self {
            max_call_depth: compute_budget.max_call_depth,
            stack_frame_size: compute_budget.stack_frame_size,
            heap_size: compute_budget.heap_size,
            direct_mapping: feature_set.bpf_account_data_direct_mapping,
        }
    }
}

/// Parses, registers syscalls for and loads program images
pub trait ProgramRuntimeEnvironment: Debug {
    /// Registers the syscalls available under the given features
    fn register_syscalls(
        &self,
        feature_set: &FeatureSet,
        compute_budget: &ComputeBudget,
    ) -> Result<(), ElfError>;

    /// Reads the header of a program image, rejecting versions outside of `min..=max`
    fn peek(
        &self,
        elf_bytes: &[u8],
        min_sbpf_version: SBPFVersion,
        max_sbpf_version: SBPFVersion,
    ) -> Result<ElfInfo, ElfError>;

    /// Loads and links a program image whose header was peeked as `elf_info`.
    ///
    /// The read-only data is staged in `rodata`, which is
    /// `elf_info.rodata_footprint` bytes of transaction arena.
    fn load(
        &self,
        elf_bytes: &[u8],
        elf_info: &ElfInfo,
        rodata: &mut [u8],
    ) -> Result<Arc<dyn Executable>, ElfError>;
}

/// A loaded program
pub trait Executable: Debug + Send + Sync {
    fn get_sbpf_version(&self) -> SBPFVersion;

    /// Size of the loaded text and read-only data
    fn get_footprint(&self) -> usize;

    /// Instantiates a vm over `memory_mapping`
    fn create_vm<'a>(
        &'a self,
        config: Config,
        memory_mapping: MemoryMapping<'a>,
    ) -> Result<Box<dyn Vm + 'a>, EbpfError>;
}

/// An instantiated program
pub trait Vm {
    /// Static control flow and bounds checks, nothing is executed
    fn validate(&self) -> Result<(), VerifierError>;

    /// Runs the program to completion.
    ///
    /// Compute units are charged to `invoke_context`. Returns the number of
    /// instructions executed along with the result.
    fn execute(&mut self, invoke_context: &mut InvokeContext) -> (u64, ProgramResult);
}

/// Stages the read-only data of a program in the arena and loads it
pub fn load_with_arena(
    environment: &dyn ProgramRuntimeEnvironment,
    arena: &mut TransactionArena,
    elf_bytes: &[u8],
    elf_info: &ElfInfo,
) -> Option<Result<Arc<dyn Executable>, ElfError>> {
    const RODATA_ALIGN: usize = 8;
    let rodata = arena.alloc(RODATA_ALIGN, elf_info.rodata_footprint)?;
    Some(environment.load(elf_bytes, elf_info, rodata))
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn test_region_index() {
        assert_eq!(region_index(MM_PROGRAM_START), 1);
        assert_eq!(region_index(MM_INPUT_START + 0xffff_ffff), 4);
        assert_eq!(region_index(0x1234), 0);
        assert_eq!(INPUT_REGION_INDEX, 4);
    }

    #[test]
    fn test_memory_mapping() {
        let mut input = vec![0u8; 32];
        let mut memory_mapping = MemoryMapping::new(
            &mut input,
            vec![
                MemoryRegion::new(0, 16, MM_INPUT_START, true),
                MemoryRegion::new(16, 16, MM_INPUT_START + 16, false),
            ],
        )
        .unwrap();

        memory_mapping.store(MM_INPUT_START + 15, &[7]).unwrap();
        assert_eq!(memory_mapping.load(MM_INPUT_START + 15, 1).unwrap(), &[7]);
        assert_eq!(memory_mapping.load(MM_INPUT_START + 16, 16).unwrap(), &[0; 16]);

        // Case: store into a readonly region
        assert_matches!(
            memory_mapping.store(MM_INPUT_START + 20, &[1]),
            Err(EbpfError::AccessViolation(AccessType::Store, addr, 1, "input")) if addr == MM_INPUT_START + 20
        );

        // Case: access straddling two regions
        assert_matches!(
            memory_mapping.load(MM_INPUT_START + 15, 2),
            Err(EbpfError::AccessViolation(AccessType::Load, _, 2, "input"))
        );

        // Case: unmapped regions
        assert_matches!(
            memory_mapping.store(MM_HEAP_START, &[1]),
            Err(EbpfError::AccessViolation(AccessType::Store, _, 1, "heap"))
        );
        assert_matches!(
            memory_mapping.load(8, 1),
            Err(EbpfError::AccessViolation(AccessType::Load, 8, 1, "unknown"))
        );
        assert_matches!(
            memory_mapping.load(u64::MAX, 2),
            Err(EbpfError::AccessViolation(AccessType::Load, u64::MAX, 2, _))
        );
        drop(memory_mapping);
        assert_eq!(input[15], 7);
    }

    #[test]
    fn test_invalid_memory_region() {
        let mut input = vec![0u8; 8];
        assert_matches!(
            MemoryMapping::new(&mut input, vec![MemoryRegion::new(4, 8, MM_INPUT_START, true)]),
            Err(EbpfError::InvalidMemoryRegion(0))
        );
        assert_matches!(
            MemoryMapping::new(
                &mut input,
                vec![
                    MemoryRegion::new(0, 4, MM_INPUT_START, true),
                    MemoryRegion::new(4, 4, MM_HEAP_START, true),
                ]
            ),
            Err(EbpfError::InvalidMemoryRegion(1))
        );
    }
}
