#![allow(clippy::arithmetic_side_effects)]

use {
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    solana_loader_memory_management::{aligned_memory::AlignedMemory, HOST_ALIGN},
    solana_loader_program_runtime::vm::{MemoryRegion, MM_INPUT_START},
    solana_loader_sdk::{
        bpf_loader_deprecated,
        entrypoint::{BPF_ALIGN_OF_U128, MAX_PERMITTED_DATA_INCREASE, NON_DUP_MARKER},
        instruction::InstructionError,
        pubkey::Pubkey,
        system_instruction::MAX_PERMITTED_DATA_LENGTH,
        transaction_context::{
            BorrowedAccount, IndexOfAccount, InstructionContext, TransactionContext,
        },
    },
    std::{io::Write, mem::size_of},
};

/// Where an instruction account landed in the VM input region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedAccountMetadata {
    pub original_data_len: usize,
    pub vm_data_addr: u64,
}

enum SerializeAccount<'a> {
    Account(BorrowedAccount<'a>),
    Duplicate(IndexOfAccount),
}

/// Writes the input region and splits it into memory regions.
///
/// Without direct mapping the whole buffer is one writable region. With it,
/// every account data area (including its realloc space) gets a region of its
/// own that is only writable if the program may change that account's data.
struct Serializer {
    buffer: AlignedMemory<HOST_ALIGN>,
    regions: Vec<MemoryRegion>,
    region_start: usize,
    is_loader_deprecated: bool,
    direct_mapping: bool,
}

impl Serializer {
    fn new(size: usize, is_loader_deprecated: bool, direct_mapping: bool) -> Self {
        Self {
            buffer: AlignedMemory::with_capacity(size),
            regions: Vec::new(),
            region_start: 0,
            is_loader_deprecated,
            direct_mapping,
        }
    }

    fn vm_addr(&self) -> u64 {
        MM_INPUT_START.saturating_add(self.buffer.len() as u64)
    }

    fn write_u8(&mut self, value: u8) -> Result<u64, InstructionError> {
        let vm_addr = self.vm_addr();
        self.buffer
            .write_u8(value)
            .map_err(|_| InstructionError::InvalidArgument)?;
        Ok(vm_addr)
    }

    fn write_u64(&mut self, value: u64) -> Result<u64, InstructionError> {
        let vm_addr = self.vm_addr();
        self.buffer
            .write_u64::<LittleEndian>(value)
            .map_err(|_| InstructionError::InvalidArgument)?;
        Ok(vm_addr)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<u64, InstructionError> {
        let vm_addr = self.vm_addr();
        self.buffer
            .write_all(bytes)
            .map_err(|_| InstructionError::InvalidArgument)?;
        Ok(vm_addr)
    }

    fn fill_write(&mut self, num: usize, value: u8) -> Result<(), InstructionError> {
        self.buffer
            .fill_write(num, value)
            .map_err(|_| InstructionError::InvalidArgument)
    }

    fn write_account(&mut self, account: &BorrowedAccount) -> Result<u64, InstructionError> {
        if self.direct_mapping {
            self.push_region(true);
        }
        let vm_data_addr = self.write_all(account.get_data())?;
        if !self.is_loader_deprecated {
            self.fill_write(MAX_PERMITTED_DATA_INCREASE, 0)?;
        }
        if self.direct_mapping {
            self.push_region(account.can_data_be_changed().is_ok());
        }
        if !self.is_loader_deprecated {
            let align_offset =
                (account.get_data().len() as *const u8).align_offset(BPF_ALIGN_OF_U128);
            self.fill_write(align_offset, 0)?;
        }
        Ok(vm_data_addr)
    }

    fn push_region(&mut self, writable: bool) {
        let len = self.buffer.len().saturating_sub(self.region_start);
        if len > 0 {
            self.regions.push(MemoryRegion::new(
                self.region_start,
                len as u64,
                MM_INPUT_START.saturating_add(self.region_start as u64),
                writable,
            ));
        }
        self.region_start = self.buffer.len();
    }

    fn finish(mut self) -> (AlignedMemory<HOST_ALIGN>, Vec<MemoryRegion>) {
        self.push_region(true);
        (self.buffer, self.regions)
    }
}

fn is_loader_deprecated(
    transaction_context: &TransactionContext,
    instruction_context: &InstructionContext,
) -> Result<bool, InstructionError> {
    Ok(bpf_loader_deprecated::check_id(
        instruction_context
            .try_borrow_last_program_account(transaction_context)?
            .get_owner(),
    ))
}

pub fn serialize_parameters(
    transaction_context: &TransactionContext,
    instruction_context: &InstructionContext,
    direct_mapping: bool,
    mask_out_rent_epoch_in_vm_serialization: bool,
) -> Result<
    (
        AlignedMemory<HOST_ALIGN>,
        Vec<MemoryRegion>,
        Vec<SerializedAccountMetadata>,
    ),
    InstructionError,
> {
    let is_loader_deprecated = is_loader_deprecated(transaction_context, instruction_context)?;
    let program_id = *instruction_context.get_last_program_key(transaction_context)?;
    let accounts = (0..instruction_context.get_number_of_instruction_accounts())
        .map(|instruction_account_index| {
            Ok(
                match instruction_context
                    .is_instruction_account_duplicate(instruction_account_index)?
                {
                    Some(position) => SerializeAccount::Duplicate(position),
                    None => SerializeAccount::Account(
                        instruction_context.try_borrow_instruction_account(
                            transaction_context,
                            instruction_account_index,
                        )?,
                    ),
                },
            )
        })
        .collect::<Result<Vec<_>, InstructionError>>()?;
    if is_loader_deprecated {
        serialize_parameters_unaligned(
            accounts,
            instruction_context.get_instruction_data(),
            &program_id,
            direct_mapping,
            mask_out_rent_epoch_in_vm_serialization,
        )
    } else {
        serialize_parameters_aligned(
            accounts,
            instruction_context.get_instruction_data(),
            &program_id,
            direct_mapping,
            mask_out_rent_epoch_in_vm_serialization,
        )
    }
}

pub fn deserialize_parameters(
    transaction_context: &TransactionContext,
    instruction_context: &InstructionContext,
    buffer: &[u8],
    accounts_metadata: &[SerializedAccountMetadata],
) -> Result<(), InstructionError> {
    let account_lengths = accounts_metadata
        .iter()
        .map(|metadata| metadata.original_data_len);
    if is_loader_deprecated(transaction_context, instruction_context)? {
        deserialize_parameters_unaligned(
            transaction_context,
            instruction_context,
            buffer,
            account_lengths,
        )
    } else {
        deserialize_parameters_aligned(
            transaction_context,
            instruction_context,
            buffer,
            account_lengths,
        )
    }
}

fn rent_epoch_for_vm(account: &BorrowedAccount, mask_out_rent_epoch: bool) -> u64 {
    if mask_out_rent_epoch {
        u64::MAX
    } else {
        account.get_rent_epoch()
    }
}

fn duplicate_metadata(
    accounts_metadata: &[SerializedAccountMetadata],
    position: IndexOfAccount,
) -> Result<SerializedAccountMetadata, InstructionError> {
    accounts_metadata
        .get(position as usize)
        .cloned()
        .ok_or(InstructionError::NotEnoughAccountKeys)
}

fn serialize_parameters_unaligned(
    accounts: Vec<SerializeAccount>,
    instruction_data: &[u8],
    program_id: &Pubkey,
    direct_mapping: bool,
    mask_out_rent_epoch: bool,
) -> Result<
    (
        AlignedMemory<HOST_ALIGN>,
        Vec<MemoryRegion>,
        Vec<SerializedAccountMetadata>,
    ),
    InstructionError,
> {
    // Calculate size in order to alloc once
    let mut size = size_of::<u64>();
    for account in &accounts {
        size += 1; // dup
        if let SerializeAccount::Account(account) = account {
            size += size_of::<u8>() // is_signer
                + size_of::<u8>() // is_writable
                + size_of::<Pubkey>() // key
                + size_of::<u64>()  // lamports
                + size_of::<u64>()  // data len
                + account.get_data().len() // data
                + size_of::<Pubkey>() // owner
                + size_of::<u8>() // executable
                + size_of::<u64>(); // rent_epoch
        }
    }
    size += size_of::<u64>() // instruction data len
         + instruction_data.len() // instruction data
         + size_of::<Pubkey>(); // program id
    let mut s = Serializer::new(size, true, direct_mapping);

    let mut accounts_metadata: Vec<SerializedAccountMetadata> = Vec::with_capacity(accounts.len());
    s.write_u64(accounts.len() as u64)?;
    for account in accounts {
        match account {
            SerializeAccount::Duplicate(position) => {
                accounts_metadata.push(duplicate_metadata(&accounts_metadata, position)?);
                s.write_u8(position as u8)?;
            }
            SerializeAccount::Account(account) => {
                s.write_u8(NON_DUP_MARKER)?;
                s.write_u8(account.is_signer() as u8)?;
                s.write_u8(account.is_writable() as u8)?;
                s.write_all(account.get_key().as_ref())?;
                s.write_u64(account.get_lamports())?;
                s.write_u64(account.get_data().len() as u64)?;
                let vm_data_addr = s.write_account(&account)?;
                s.write_all(account.get_owner().as_ref())?;
                s.write_u8(account.is_executable() as u8)?;
                s.write_u64(rent_epoch_for_vm(&account, mask_out_rent_epoch))?;
                accounts_metadata.push(SerializedAccountMetadata {
                    original_data_len: account.get_data().len(),
                    vm_data_addr,
                });
            }
        }
    }
    s.write_u64(instruction_data.len() as u64)?;
    s.write_all(instruction_data)?;
    s.write_all(program_id.as_ref())?;

    let (buffer, regions) = s.finish();
    Ok((buffer, regions, accounts_metadata))
}

fn serialize_parameters_aligned(
    accounts: Vec<SerializeAccount>,
    instruction_data: &[u8],
    program_id: &Pubkey,
    direct_mapping: bool,
    mask_out_rent_epoch: bool,
) -> Result<
    (
        AlignedMemory<HOST_ALIGN>,
        Vec<MemoryRegion>,
        Vec<SerializedAccountMetadata>,
    ),
    InstructionError,
> {
    // Calculate size in order to alloc once
    let mut size = size_of::<u64>();
    for account in &accounts {
        size += 1; // dup
        match account {
            SerializeAccount::Duplicate(_) => size += 7, // padding to 64-bit aligned
            SerializeAccount::Account(account) => {
                let data_len = account.get_data().len();
                size += size_of::<u8>() // is_signer
                    + size_of::<u8>() // is_writable
                    + size_of::<u8>() // executable
                    + size_of::<u32>() // padding to 128-bit aligned
                    + size_of::<Pubkey>()  // key
                    + size_of::<Pubkey>() // owner
                    + size_of::<u64>()  // lamports
                    + size_of::<u64>()  // data len
                    + data_len
                    + MAX_PERMITTED_DATA_INCREASE
                    + (data_len as *const u8).align_offset(BPF_ALIGN_OF_U128)
                    + size_of::<u64>(); // rent epoch
            }
        }
    }
    size += size_of::<u64>() // data len
        + instruction_data.len()
        + size_of::<Pubkey>(); // program id;
    let mut s = Serializer::new(size, false, direct_mapping);

    // Serialize into the buffer
    let mut accounts_metadata: Vec<SerializedAccountMetadata> = Vec::with_capacity(accounts.len());
    s.write_u64(accounts.len() as u64)?;
    for account in accounts {
        match account {
            SerializeAccount::Duplicate(position) => {
                accounts_metadata.push(duplicate_metadata(&accounts_metadata, position)?);
                s.write_u8(position as u8)?;
                s.write_all(&[0u8, 0, 0, 0, 0, 0, 0])?; // 7 bytes of padding to make 64-bit aligned
            }
            SerializeAccount::Account(account) => {
                s.write_u8(NON_DUP_MARKER)?;
                s.write_u8(account.is_signer() as u8)?;
                s.write_u8(account.is_writable() as u8)?;
                s.write_u8(account.is_executable() as u8)?;
                s.write_all(&[0u8, 0, 0, 0])?; // 4 bytes of padding to make 128-bit aligned
                s.write_all(account.get_key().as_ref())?;
                s.write_all(account.get_owner().as_ref())?;
                s.write_u64(account.get_lamports())?;
                s.write_u64(account.get_data().len() as u64)?;
                let vm_data_addr = s.write_account(&account)?;
                s.write_u64(rent_epoch_for_vm(&account, mask_out_rent_epoch))?;
                accounts_metadata.push(SerializedAccountMetadata {
                    original_data_len: account.get_data().len(),
                    vm_data_addr,
                });
            }
        }
    }
    s.write_u64(instruction_data.len() as u64)?;
    s.write_all(instruction_data)?;
    s.write_all(program_id.as_ref())?;

    let (buffer, regions) = s.finish();
    Ok((buffer, regions, accounts_metadata))
}

fn read_u64(buffer: &[u8], start: usize) -> Result<u64, InstructionError> {
    buffer
        .get(start..start.saturating_add(size_of::<u64>()))
        .map(LittleEndian::read_u64)
        .ok_or(InstructionError::InvalidArgument)
}

fn update_lamports(account: &mut BorrowedAccount, lamports: u64) -> Result<(), InstructionError> {
    if account.get_lamports() != lamports {
        account.set_lamports(lamports)?;
    }
    Ok(())
}

fn update_data(account: &mut BorrowedAccount, data: &[u8]) -> Result<(), InstructionError> {
    match account
        .can_data_be_resized(data.len())
        .and_then(|_| account.can_data_be_changed())
    {
        Ok(()) => account.set_data_from_slice(data),
        Err(err) if account.get_data() != data => Err(err),
        // unchanged data of an account the program may not touch
        Err(_) => Ok(()),
    }
}

fn deserialize_parameters_unaligned<I: IntoIterator<Item = usize>>(
    transaction_context: &TransactionContext,
    instruction_context: &InstructionContext,
    buffer: &[u8],
    account_lengths: I,
) -> Result<(), InstructionError> {
    let mut start = size_of::<u64>(); // number of accounts
    for (instruction_account_index, pre_len) in (0..instruction_context
        .get_number_of_instruction_accounts())
        .zip(account_lengths.into_iter())
    {
        let duplicate =
            instruction_context.is_instruction_account_duplicate(instruction_account_index)?;
        start += 1; // is_dup
        if duplicate.is_none() {
            let mut borrowed_account = instruction_context
                .try_borrow_instruction_account(transaction_context, instruction_account_index)?;
            start += size_of::<u8>(); // is_signer
            start += size_of::<u8>(); // is_writable
            start += size_of::<Pubkey>(); // key
            update_lamports(&mut borrowed_account, read_u64(buffer, start)?)?;
            start += size_of::<u64>() // lamports
                + size_of::<u64>(); // data length
            let data = buffer
                .get(start..start + pre_len)
                .ok_or(InstructionError::InvalidArgument)?;
            update_data(&mut borrowed_account, data)?;
            start += pre_len // data
                + size_of::<Pubkey>() // owner
                + size_of::<u8>() // executable
                + size_of::<u64>(); // rent_epoch
        }
    }
    Ok(())
}

fn deserialize_parameters_aligned<I: IntoIterator<Item = usize>>(
    transaction_context: &TransactionContext,
    instruction_context: &InstructionContext,
    buffer: &[u8],
    account_lengths: I,
) -> Result<(), InstructionError> {
    let mut start = size_of::<u64>(); // number of accounts
    for (instruction_account_index, pre_len) in (0..instruction_context
        .get_number_of_instruction_accounts())
        .zip(account_lengths.into_iter())
    {
        let duplicate =
            instruction_context.is_instruction_account_duplicate(instruction_account_index)?;
        start += size_of::<u8>(); // position
        if duplicate.is_some() {
            start += 7; // padding to 64-bit aligned
        } else {
            let mut borrowed_account = instruction_context
                .try_borrow_instruction_account(transaction_context, instruction_account_index)?;
            start += size_of::<u8>() // is_signer
                + size_of::<u8>() // is_writable
                + size_of::<u8>() // executable
                + size_of::<u32>() // padding
                + size_of::<Pubkey>(); // key
            let owner = buffer
                .get(start..start + size_of::<Pubkey>())
                .ok_or(InstructionError::InvalidArgument)?;
            start += size_of::<Pubkey>(); // owner
            update_lamports(&mut borrowed_account, read_u64(buffer, start)?)?;
            start += size_of::<u64>(); // lamports
            let post_len = read_u64(buffer, start)? as usize;
            start += size_of::<u64>(); // data length
            if post_len.saturating_sub(pre_len) > MAX_PERMITTED_DATA_INCREASE
                || post_len > MAX_PERMITTED_DATA_LENGTH as usize
            {
                return Err(InstructionError::InvalidRealloc);
            }
            let data = buffer
                .get(start..start + post_len)
                .ok_or(InstructionError::InvalidArgument)?;
            update_data(&mut borrowed_account, data)?;
            start += pre_len + MAX_PERMITTED_DATA_INCREASE; // data
            start += (start as *const u8).align_offset(BPF_ALIGN_OF_U128);
            start += size_of::<u64>(); // rent_epoch
            // update as last since this changes the owner
            if borrowed_account.get_owner().as_ref() != owner {
                borrowed_account.set_owner(owner)?;
            }
        }
    }
    Ok(())
}
