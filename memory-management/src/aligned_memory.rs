//! Aligned memory

use std::io;

/// Provides u8 slices at a specified alignment
///
/// The backing `Vec` is over-allocated by up to `ALIGN` bytes and the data
/// starts at the first aligned address inside it. The allocation is made once
/// up front, so the data never moves while `len() <= max_len()`.
#[derive(Debug, PartialEq, Eq)]
pub struct AlignedMemory<const ALIGN: usize> {
    max_len: usize,
    align_offset: usize,
    mem: Vec<u8>,
}

impl<const ALIGN: usize> AlignedMemory<ALIGN> {
    fn allocate(max_len: usize) -> (Vec<u8>, usize) {
        let mut mem: Vec<u8> = Vec::with_capacity(max_len.saturating_add(ALIGN));
        let align_offset = mem.as_ptr().align_offset(ALIGN);
        mem.resize(align_offset, 0);
        (mem, align_offset)
    }

    /// Returns a filled AlignedMemory by copying the given slice
    pub fn from_slice(data: &[u8]) -> Self {
        let mut memory = Self::with_capacity(data.len());
        memory.mem.extend_from_slice(data);
        memory
    }

    /// Returns a new empty AlignedMemory with preallocated memory
    pub fn with_capacity(max_len: usize) -> Self {
        let (mem, align_offset) = Self::allocate(max_len);
        Self {
            max_len,
            align_offset,
            mem,
        }
    }

    /// Returns a new filled AlignedMemory with zero initialized memory
    pub fn zero_filled(max_len: usize) -> Self {
        let mut memory = Self::with_capacity(max_len);
        memory.mem.resize(memory.align_offset.saturating_add(max_len), 0);
        memory
    }

    /// Maximum length the data can grow to without reallocating
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Get the length of the data
    pub fn len(&self) -> usize {
        self.mem.len().saturating_sub(self.align_offset)
    }

    /// Is the memory empty
    pub fn is_empty(&self) -> bool {
        self.mem.len() == self.align_offset
    }

    /// Get an aligned slice
    pub fn as_slice(&self) -> &[u8] {
        self.mem.get(self.align_offset..).unwrap_or_default()
    }

    /// Get an aligned mutable slice
    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        self.mem.get_mut(self.align_offset..).unwrap_or_default()
    }

    /// Host address of the first data byte
    pub fn host_addr(&self) -> u64 {
        self.as_slice().as_ptr() as u64
    }

    /// Shortens the data to `len` bytes, keeping the allocation
    pub fn truncate(&mut self, len: usize) {
        self.mem.truncate(self.align_offset.saturating_add(len));
    }

    fn check_room(&self, additional: usize) -> io::Result<usize> {
        match (
            self.mem.len().checked_add(additional),
            self.align_offset.checked_add(self.max_len),
        ) {
            (Some(new_len), Some(allocation_end)) if new_len <= allocation_end => Ok(new_len),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "aligned memory exhausted",
            )),
        }
    }

    /// Grows memory with `value` repeated `num` times
    pub fn fill_write(&mut self, num: usize, value: u8) -> io::Result<()> {
        let new_len = self.check_room(num)?;
        self.mem.resize(new_len, value);
        Ok(())
    }
}

// Custom Clone impl is needed to ensure alignment. Derived clone would just
// clone self.mem and there would be no guarantee that the clone allocation is
// aligned.
impl<const ALIGN: usize> Clone for AlignedMemory<ALIGN> {
    fn clone(&self) -> Self {
        let mut memory = Self::with_capacity(self.max_len);
        memory.mem.extend_from_slice(self.as_slice());
        memory
    }
}

impl<const ALIGN: usize> io::Write for AlignedMemory<ALIGN> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_room(buf.len())?;
        self.mem.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<const ALIGN: usize, T: AsRef<[u8]>> From<T> for AlignedMemory<ALIGN> {
    fn from(bytes: T) -> Self {
        AlignedMemory::from_slice(bytes.as_ref())
    }
}
