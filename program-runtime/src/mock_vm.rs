//! A small deterministic program format and interpreter implementing the VM
//! contract, for testing the loaders without a real SBF toolchain.
//!
//! An image is a 16 byte header followed by the read-only data and the text:
//!
//! ```notrust
//! 0..4    b"\x7fELF"
//! 4       SBF version
//! 5..8    zero
//! 8..12   read-only data length (u32 LE)
//! 12..16  entrypoint instruction index (u32 LE)
//! ```
//!
//! Every instruction is 16 bytes: an opcode, 7 zero bytes and a u64 LE operand.
//! The only register is `r0`, which is the return value on `EXIT`.

use {
    crate::{
        compute_budget::ComputeBudget,
        invoke_context::InvokeContext,
        stable_log,
        vm::{
            Config, EbpfError, ElfError, ElfInfo, Executable, MemoryMapping, ProgramResult,
            ProgramRuntimeEnvironment, SBPFVersion, SyscallError, VerifierError, Vm,
        },
    },
    solana_loader_sdk::{feature_set::FeatureSet, instruction::InstructionError},
    std::sync::Arc,
};

pub const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
pub const HEADER_SIZE: usize = 16;
pub const INSN_SIZE: usize = 16;

pub mod ebpf {
    /// r0 = operand
    pub const MOV64_IMM: u8 = 0xb7;
    /// r0 += operand, wrapping
    pub const ADD64_IMM: u8 = 0x07;
    /// r0 /= operand
    pub const DIV64_IMM: u8 = 0x37;
    /// r0 = the byte at vm address operand
    pub const LD_B_REG: u8 = 0x71;
    /// The byte at vm address operand = r0
    pub const ST_B_REG: u8 = 0x73;
    /// Jump to the instruction index operand
    pub const JA: u8 = 0x05;
    /// Syscall number operand
    pub const CALL_IMM: u8 = 0x85;
    pub const EXIT: u8 = 0x95;
}

pub mod syscalls {
    pub const ABORT: u64 = 1;
    /// Logs r0 as "Program log: r0 = <value>"
    pub const LOG_R0: u64 = 2;
    /// Sets the return data to r0 in little endian
    pub const SET_RETURN_DATA: u64 = 3;
    /// Fails with the instruction error whose program error code is r0
    pub const INSTRUCTION_ERROR: u64 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub opc: u8,
    pub imm: u64,
}

impl Insn {
    pub const fn new(opc: u8, imm: u64) -> Self {
        Self { opc, imm }
    }
}

/// Builds a program image
pub fn assemble(
    sbpf_version: SBPFVersion,
    rodata: &[u8],
    entry_pc: u32,
    text: &[Insn],
) -> Vec<u8> {
    let mut elf_bytes = Vec::with_capacity(
        HEADER_SIZE
            .saturating_add(rodata.len())
            .saturating_add(text.len().saturating_mul(INSN_SIZE)),
    );
    elf_bytes.extend_from_slice(ELF_MAGIC);
    elf_bytes.extend_from_slice(&[sbpf_version as u8, 0, 0, 0]);
    elf_bytes.extend_from_slice(&(rodata.len() as u32).to_le_bytes());
    elf_bytes.extend_from_slice(&entry_pc.to_le_bytes());
    elf_bytes.extend_from_slice(rodata);
    for insn in text {
        elf_bytes.push(insn.opc);
        elf_bytes.extend_from_slice(&[0; 7]);
        elf_bytes.extend_from_slice(&insn.imm.to_le_bytes());
    }
    elf_bytes
}

/// `r0 = return_value; exit`
pub fn assemble_returning(sbpf_version: SBPFVersion, return_value: u64) -> Vec<u8> {
    assemble(
        sbpf_version,
        &[],
        0,
        &[
            Insn::new(ebpf::MOV64_IMM, return_value),
            Insn::new(ebpf::EXIT, 0),
        ],
    )
}

fn read_u32(elf_bytes: &[u8], offset: usize) -> Result<u32, ElfError> {
    elf_bytes
        .get(offset..offset.saturating_add(4))
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(ElfError::ValueOutOfBounds)
}

/// Trailing zero bytes are the padding of the account holding the image.
fn text_section(elf_bytes: &[u8], rodata_len: usize) -> Result<&[u8], ElfError> {
    let text = HEADER_SIZE
        .checked_add(rodata_len)
        .and_then(|text_start| elf_bytes.get(text_start..))
        .ok_or(ElfError::ValueOutOfBounds)?;
    let used = text
        .iter()
        .rposition(|byte| *byte != 0)
        .map_or(0, |last| last.saturating_add(1));
    text.get(..used.div_ceil(INSN_SIZE).saturating_mul(INSN_SIZE))
        .ok_or_else(|| {
            ElfError::FailedToParse(format!(
                "text section of {} bytes is not a whole number of instructions",
                text.len()
            ))
        })
}

#[derive(Debug, Default)]
pub struct MockEnvironment {
    pub fail_syscall_registration: bool,
}

impl ProgramRuntimeEnvironment for MockEnvironment {
    fn register_syscalls(
        &self,
        _feature_set: &FeatureSet,
        _compute_budget: &ComputeBudget,
    ) -> Result<(), ElfError> {
        if self.fail_syscall_registration {
            return Err(ElfError::SymbolHashCollision(0x7b3c_44e6));
        }
        Ok(())
    }

    fn peek(
        &self,
        elf_bytes: &[u8],
        min_sbpf_version: SBPFVersion,
        max_sbpf_version: SBPFVersion,
    ) -> Result<ElfInfo, ElfError> {
        let header = elf_bytes
            .get(..HEADER_SIZE)
            .ok_or_else(|| ElfError::FailedToParse("file is shorter than its header".into()))?;
        if header.get(..4) != Some(ELF_MAGIC.as_slice()) {
            return Err(ElfError::InvalidMagic);
        }
        let raw_version = header.get(4).copied().unwrap_or_default();
        let sbpf_version =
            SBPFVersion::from_u8(raw_version).ok_or(ElfError::UnsupportedSBPFVersion(raw_version))?;
        if sbpf_version < min_sbpf_version || sbpf_version > max_sbpf_version {
            return Err(ElfError::SBPFVersionOutOfRange(sbpf_version));
        }
        let rodata_footprint = read_u32(elf_bytes, 8)? as usize;
        let entry_pc = read_u32(elf_bytes, 12)? as usize;
        let text_cnt = text_section(elf_bytes, rodata_footprint)?.len() / INSN_SIZE;
        if entry_pc > 0 && entry_pc >= text_cnt {
            return Err(ElfError::EntrypointOutOfBounds);
        }
        Ok(ElfInfo {
            sbpf_version,
            rodata_footprint,
            text_cnt,
            entry_pc,
        })
    }

    fn load(
        &self,
        elf_bytes: &[u8],
        elf_info: &ElfInfo,
        rodata: &mut [u8],
    ) -> Result<Arc<dyn Executable>, ElfError> {
        let rodata_start = HEADER_SIZE;
        let rodata_end = rodata_start.saturating_add(elf_info.rodata_footprint);
        if rodata.len() != elf_info.rodata_footprint {
            return Err(ElfError::ValueOutOfBounds);
        }
        rodata.copy_from_slice(
            elf_bytes
                .get(rodata_start..rodata_end)
                .ok_or(ElfError::ValueOutOfBounds)?,
        );
        let text = text_section(elf_bytes, elf_info.rodata_footprint)?
            .chunks_exact(INSN_SIZE)
            .map(|chunk| {
                let (opc, rest) = chunk.split_first().ok_or(ElfError::ValueOutOfBounds)?;
                let imm = rest
                    .get(7..)
                    .and_then(|bytes| bytes.try_into().ok())
                    .map(u64::from_le_bytes)
                    .ok_or(ElfError::ValueOutOfBounds)?;
                if *opc == ebpf::CALL_IMM
                    && !matches!(
                        imm,
                        syscalls::ABORT
                            | syscalls::LOG_R0
                            | syscalls::SET_RETURN_DATA
                            | syscalls::INSTRUCTION_ERROR
                    )
                {
                    return Err(ElfError::UnresolvedSymbol(imm));
                }
                Ok(Insn::new(*opc, imm))
            })
            .collect::<Result<Vec<_>, ElfError>>()?;
        Ok(Arc::new(MockExecutable {
            sbpf_version: elf_info.sbpf_version,
            rodata: rodata.to_vec(),
            text,
            entry_pc: elf_info.entry_pc,
        }))
    }
}

#[derive(Debug)]
pub struct MockExecutable {
    sbpf_version: SBPFVersion,
    rodata: Vec<u8>,
    text: Vec<Insn>,
    entry_pc: usize,
}

impl MockExecutable {
    pub fn get_rodata(&self) -> &[u8] {
        &self.rodata
    }
}

impl Executable for MockExecutable {
    fn get_sbpf_version(&self) -> SBPFVersion {
        self.sbpf_version
    }

    fn get_footprint(&self) -> usize {
        self.rodata
            .len()
            .saturating_add(self.text.len().saturating_mul(INSN_SIZE))
    }

    fn create_vm<'a>(
        &'a self,
        config: Config,
        memory_mapping: MemoryMapping<'a>,
    ) -> Result<Box<dyn Vm + 'a>, EbpfError> {
        if !ComputeBudget::is_valid_heap_size(config.heap_size) {
            return Err(EbpfError::InvalidHeapSize(config.heap_size));
        }
        Ok(Box::new(MockVm {
            executable: self,
            memory_mapping,
        }))
    }
}

struct MockVm<'a> {
    executable: &'a MockExecutable,
    memory_mapping: MemoryMapping<'a>,
}

impl<'a> MockVm<'a> {
    fn syscall(invoke_context: &mut InvokeContext, number: u64, r0: u64) -> Result<(), EbpfError> {
        match number {
            syscalls::ABORT => Err(SyscallError::Abort),
            syscalls::LOG_R0 => {
                stable_log::program_log(
                    &invoke_context.get_log_collector(),
                    &format!("r0 = {r0:#x}"),
                );
                Ok(())
            }
            syscalls::SET_RETURN_DATA => {
                let program_id = {
                    let transaction_context = &*invoke_context.transaction_context;
                    transaction_context
                        .get_current_instruction_context()
                        .and_then(|instruction_context| {
                            instruction_context.get_last_program_key(transaction_context)
                        })
                        .copied()
                };
                program_id
                    .and_then(|program_id| {
                        invoke_context
                            .transaction_context
                            .set_return_data(program_id, r0.to_le_bytes().to_vec())
                    })
                    .map_err(SyscallError::InstructionError)
            }
            syscalls::INSTRUCTION_ERROR => Err(SyscallError::InstructionError(
                InstructionError::from(r0),
            )),
            _ => Err(SyscallError::Panic(format!("unknown syscall {number:#x}"))),
        }
        .map_err(EbpfError::SyscallError)
    }
}

impl<'a> Vm for MockVm<'a> {
    fn validate(&self) -> Result<(), VerifierError> {
        let text = &self.executable.text;
        let last = text.last().ok_or(VerifierError::NoProgram)?;
        if !matches!(last.opc, ebpf::EXIT | ebpf::JA) {
            return Err(VerifierError::InvalidLastInstruction);
        }
        for (pc, insn) in text.iter().enumerate() {
            match insn.opc {
                ebpf::MOV64_IMM
                | ebpf::ADD64_IMM
                | ebpf::LD_B_REG
                | ebpf::ST_B_REG
                | ebpf::CALL_IMM
                | ebpf::EXIT => {}
                ebpf::DIV64_IMM if insn.imm == 0 => {
                    return Err(VerifierError::DivisionByZero(pc));
                }
                ebpf::DIV64_IMM => {}
                ebpf::JA if insn.imm >= text.len() as u64 => {
                    return Err(VerifierError::JumpOutOfCode(pc, insn.imm));
                }
                ebpf::JA => {}
                opc => return Err(VerifierError::UnknownOpCode(opc, pc)),
            }
        }
        Ok(())
    }

    fn execute(&mut self, invoke_context: &mut InvokeContext) -> (u64, ProgramResult) {
        let budget = invoke_context.get_remaining();
        let mut instruction_count = 0u64;
        let mut pc = self.executable.entry_pc;
        let mut r0 = 0u64;
        let result = loop {
            if instruction_count >= budget {
                break Err(EbpfError::ExceededMaxInstructions);
            }
            instruction_count = instruction_count.saturating_add(1);
            let Some(insn) = self.executable.text.get(pc).copied() else {
                break Err(EbpfError::ExecutionOverrun);
            };
            pc = pc.saturating_add(1);
            let step = match insn.opc {
                ebpf::MOV64_IMM => {
                    r0 = insn.imm;
                    Ok(())
                }
                ebpf::ADD64_IMM => {
                    r0 = r0.wrapping_add(insn.imm);
                    Ok(())
                }
                ebpf::DIV64_IMM => r0
                    .checked_div(insn.imm)
                    .map(|quotient| r0 = quotient)
                    .ok_or(EbpfError::DivideByZero),
                ebpf::LD_B_REG => self
                    .memory_mapping
                    .load(insn.imm, 1)
                    .map(|bytes| r0 = bytes.first().copied().unwrap_or_default().into()),
                ebpf::ST_B_REG => self.memory_mapping.store(insn.imm, &[r0 as u8]),
                ebpf::JA => {
                    pc = insn.imm as usize;
                    Ok(())
                }
                ebpf::CALL_IMM => Self::syscall(invoke_context, insn.imm, r0),
                ebpf::EXIT => break Ok(r0),
                _ => Err(EbpfError::ExecutionOverrun),
            };
            if let Err(err) = step {
                break Err(err);
            }
        };
        invoke_context.consume(instruction_count);
        (instruction_count, result)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            invoke_context::with_mock_invoke_context,
            vm::{AccessType, MemoryRegion, MM_INPUT_START},
        },
        assert_matches::assert_matches,
        solana_loader_sdk::{bpf_loader, program_error::CUSTOM_ZERO},
    };

    impl std::fmt::Debug for dyn Vm + '_ {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("dyn Vm")
        }
    }

    fn load(elf_bytes: &[u8]) -> Result<Arc<dyn Executable>, ElfError> {
        let environment = MockEnvironment::default();
        let elf_info = environment.peek(elf_bytes, SBPFVersion::V0, SBPFVersion::V3)?;
        let mut rodata = vec![0; elf_info.rodata_footprint];
        environment.load(elf_bytes, &elf_info, &mut rodata)
    }

    fn config() -> Config {
        Config::new(&ComputeBudget::default(), &FeatureSet::default())
    }

    #[test]
    fn test_peek() {
        let environment = MockEnvironment::default();
        let elf_bytes = assemble(
            SBPFVersion::V2,
            &[1, 2, 3],
            1,
            &[Insn::new(ebpf::EXIT, 0), Insn::new(ebpf::EXIT, 0)],
        );
        assert_eq!(
            environment.peek(&elf_bytes, SBPFVersion::V0, SBPFVersion::V3),
            Ok(ElfInfo {
                sbpf_version: SBPFVersion::V2,
                rodata_footprint: 3,
                text_cnt: 2,
                entry_pc: 1,
            })
        );

        // Case: version outside of the window
        assert_matches!(
            environment.peek(&elf_bytes, SBPFVersion::V0, SBPFVersion::V1),
            Err(ElfError::SBPFVersionOutOfRange(SBPFVersion::V2))
        );
        assert_matches!(
            environment.peek(&elf_bytes, SBPFVersion::V3, SBPFVersion::V3),
            Err(ElfError::SBPFVersionOutOfRange(SBPFVersion::V2))
        );

        // Case: bad headers
        assert_matches!(
            environment.peek(&elf_bytes[..10], SBPFVersion::V0, SBPFVersion::V3),
            Err(ElfError::FailedToParse(_))
        );
        let mut bad_magic = elf_bytes.clone();
        bad_magic[1] = b'X';
        assert_matches!(
            environment.peek(&bad_magic, SBPFVersion::V0, SBPFVersion::V3),
            Err(ElfError::InvalidMagic)
        );
        let mut bad_version = elf_bytes.clone();
        bad_version[4] = 9;
        assert_matches!(
            environment.peek(&bad_version, SBPFVersion::V0, SBPFVersion::V3),
            Err(ElfError::UnsupportedSBPFVersion(9))
        );

        // Case: truncated text
        assert_matches!(
            environment.peek(
                &elf_bytes[..elf_bytes.len() - 1],
                SBPFVersion::V0,
                SBPFVersion::V3
            ),
            Err(ElfError::FailedToParse(_))
        );

        // Case: zero padding after the text
        let mut padded = elf_bytes.clone();
        padded.resize(elf_bytes.len() + 40, 0);
        assert_eq!(
            environment.peek(&padded, SBPFVersion::V0, SBPFVersion::V3),
            environment.peek(&elf_bytes, SBPFVersion::V0, SBPFVersion::V3)
        );

        // Case: entrypoint past the text
        let elf_bytes = assemble(SBPFVersion::V0, &[], 2, &[Insn::new(ebpf::EXIT, 0)]);
        assert_matches!(
            environment.peek(&elf_bytes, SBPFVersion::V0, SBPFVersion::V3),
            Err(ElfError::EntrypointOutOfBounds)
        );
    }

    #[test]
    fn test_load_and_validate() {
        let executable = load(&assemble(
            SBPFVersion::V1,
            &[9, 8],
            0,
            &[Insn::new(ebpf::MOV64_IMM, 1), Insn::new(ebpf::EXIT, 0)],
        ))
        .unwrap();
        assert_eq!(executable.get_sbpf_version(), SBPFVersion::V1);
        assert_eq!(executable.get_footprint(), 2 + 2 * INSN_SIZE);
        let vm = executable.create_vm(config(), MemoryMapping::empty()).unwrap();
        assert_eq!(vm.validate(), Ok(()));

        // Case: unresolved syscall
        assert_matches!(
            load(&assemble(
                SBPFVersion::V0,
                &[],
                0,
                &[Insn::new(ebpf::CALL_IMM, 77), Insn::new(ebpf::EXIT, 0)],
            )),
            Err(ElfError::UnresolvedSymbol(77))
        );

        let check = |text: &[Insn]| {
            let executable = load(&assemble(SBPFVersion::V0, &[], 0, text)).unwrap();
            let vm = executable.create_vm(config(), MemoryMapping::empty()).unwrap();
            vm.validate()
        };
        assert_eq!(check(&[]), Err(VerifierError::NoProgram));
        assert_eq!(
            check(&[Insn::new(ebpf::MOV64_IMM, 0)]),
            Err(VerifierError::InvalidLastInstruction)
        );
        assert_eq!(
            check(&[Insn::new(0xff, 0), Insn::new(ebpf::EXIT, 0)]),
            Err(VerifierError::UnknownOpCode(0xff, 0))
        );
        assert_eq!(
            check(&[Insn::new(ebpf::DIV64_IMM, 0), Insn::new(ebpf::EXIT, 0)]),
            Err(VerifierError::DivisionByZero(0))
        );
        assert_eq!(
            check(&[Insn::new(ebpf::EXIT, 0), Insn::new(ebpf::JA, 2)]),
            Err(VerifierError::JumpOutOfCode(1, 2))
        );
    }

    #[test]
    fn test_invalid_heap_size() {
        let executable = load(&assemble_returning(SBPFVersion::V0, 0)).unwrap();
        let mut config = config();
        config.heap_size = 1000;
        assert_matches!(
            executable.create_vm(config, MemoryMapping::empty()),
            Err(EbpfError::InvalidHeapSize(1000))
        );
    }

    #[test]
    fn test_execute() {
        let executable = load(&assemble(
            SBPFVersion::V0,
            &[],
            0,
            &[
                Insn::new(ebpf::MOV64_IMM, 0x41),
                Insn::new(ebpf::ST_B_REG, MM_INPUT_START + 1),
                Insn::new(ebpf::LD_B_REG, MM_INPUT_START + 2),
                Insn::new(ebpf::ADD64_IMM, 10),
                Insn::new(ebpf::DIV64_IMM, 2),
                Insn::new(ebpf::CALL_IMM, syscalls::LOG_R0),
                Insn::new(ebpf::EXIT, 0),
            ],
        ))
        .unwrap();
        let mut input = vec![0, 0, 30, 0];
        with_mock_invoke_context(bpf_loader::id(), 0, |invoke_context| {
            invoke_context.mock_set_remaining(100);
            let memory_mapping = MemoryMapping::new(
                &mut input,
                vec![MemoryRegion::new(0, 4, MM_INPUT_START, true)],
            )
            .unwrap();
            let mut vm = executable.create_vm(config(), memory_mapping).unwrap();
            assert_eq!(vm.execute(invoke_context), (7, Ok(20)));
            assert_eq!(invoke_context.get_remaining(), 93);
            let logs = invoke_context
                .get_log_collector()
                .unwrap()
                .borrow()
                .get_recorded_content()
                .to_vec();
            assert_eq!(logs, vec!["Program log: r0 = 0x14".to_string()]);
        });
        assert_eq!(input, vec![0, 0x41, 30, 0]);
    }

    #[test]
    fn test_execute_faults() {
        let run = |text: &[Insn], remaining: u64| {
            let executable = load(&assemble(SBPFVersion::V0, &[], 0, text)).unwrap();
            let mut input = vec![0u8; 8];
            let mut outcome = None;
            with_mock_invoke_context(bpf_loader::id(), 0, |invoke_context| {
                invoke_context.mock_set_remaining(remaining);
                let memory_mapping = MemoryMapping::new(
                    &mut input,
                    vec![MemoryRegion::new(0, 8, MM_INPUT_START, false)],
                )
                .unwrap();
                let mut vm = executable.create_vm(config(), memory_mapping).unwrap();
                outcome = Some((vm.execute(invoke_context), invoke_context.get_remaining()));
            });
            outcome.unwrap()
        };

        // Case: infinite loop exhausts the meter
        assert_eq!(
            run(&[Insn::new(ebpf::JA, 0)], 50),
            ((50, Err(EbpfError::ExceededMaxInstructions)), 0)
        );

        // Case: readonly input
        assert_eq!(
            run(
                &[
                    Insn::new(ebpf::ST_B_REG, MM_INPUT_START),
                    Insn::new(ebpf::EXIT, 0)
                ],
                50
            ),
            (
                (
                    1,
                    Err(EbpfError::AccessViolation(
                        AccessType::Store,
                        MM_INPUT_START,
                        1,
                        "input"
                    ))
                ),
                49
            )
        );

        // Case: syscalls
        assert_eq!(
            run(
                &[
                    Insn::new(ebpf::CALL_IMM, syscalls::ABORT),
                    Insn::new(ebpf::EXIT, 0)
                ],
                50
            )
            .0,
            (1, Err(EbpfError::SyscallError(SyscallError::Abort)))
        );
        assert_eq!(
            run(
                &[
                    Insn::new(ebpf::MOV64_IMM, CUSTOM_ZERO),
                    Insn::new(ebpf::CALL_IMM, syscalls::INSTRUCTION_ERROR),
                    Insn::new(ebpf::EXIT, 0)
                ],
                50
            )
            .0,
            (
                2,
                Err(EbpfError::SyscallError(SyscallError::InstructionError(
                    InstructionError::Custom(0)
                )))
            )
        );

        // Case: running off the end of the text
        assert_eq!(
            run(&[Insn::new(ebpf::JA, 1), Insn::new(ebpf::MOV64_IMM, 1)], 50).0,
            (3, Err(EbpfError::ExecutionOverrun))
        );
    }
}
