//! Transaction scoped scratch memory.
//!
//! Allocations are bumped out of one host aligned buffer and are never freed
//! individually: a frame gives back everything allocated since it was pushed
//! and `reset` gives back everything at a transaction boundary.

use solana_loader_memory_management::{aligned_memory::AlignedMemory, HOST_ALIGN};

/// Scratch space reserved for one transaction unless configured otherwise
pub const DEFAULT_TRANSACTION_ARENA_SIZE: usize = 16 * 1024 * 1024;

pub struct TransactionArena {
    memory: AlignedMemory<{ HOST_ALIGN }>,
    used: usize,
    frames: Vec<usize>,
    high_water_mark: usize,
}

impl std::fmt::Debug for TransactionArena {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TransactionArena")
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .field("frames", &self.frames.len())
            .finish()
    }
}

impl Default for TransactionArena {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSACTION_ARENA_SIZE)
    }
}

impl TransactionArena {
    pub fn new(size: usize) -> Self {
        Self {
            memory: AlignedMemory::zero_filled(size),
            used: 0,
            frames: Vec::new(),
            high_water_mark: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// The most bytes that were ever in use at the same time
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Number of frames currently pushed
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Bumps a zeroed allocation of `len` bytes aligned to `align`.
    ///
    /// Returns `None` when the arena is exhausted.
    pub fn alloc(&mut self, align: usize, len: usize) -> Option<&mut [u8]> {
        debug_assert!(align.is_power_of_two());
        let host_addr = self.memory.host_addr() as usize;
        let cursor = host_addr.checked_add(self.used)?;
        let padding = cursor.wrapping_neg() & align.saturating_sub(1);
        let start = self.used.checked_add(padding)?;
        let end = start.checked_add(len)?;
        if end > self.capacity() {
            return None;
        }
        self.used = end;
        self.high_water_mark = self.high_water_mark.max(end);
        let allocation = self.memory.as_slice_mut().get_mut(start..end)?;
        allocation.fill(0);
        Some(allocation)
    }

    /// Opens a frame, everything allocated after this is given back by `pop_frame`
    pub fn push_frame(&mut self) {
        self.frames.push(self.used);
    }

    /// Closes the innermost frame, returns false if there was none
    pub fn pop_frame(&mut self) -> bool {
        match self.frames.pop() {
            Some(used) => {
                self.used = used;
                true
            }
            None => false,
        }
    }

    /// Gives back all allocations and frames
    pub fn reset(&mut self) {
        self.used = 0;
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_alignment() {
        let mut arena = TransactionArena::new(256);
        let first = arena.alloc(1, 3).unwrap();
        assert_eq!(first.len(), 3);
        let second = arena.alloc(16, 8).unwrap();
        assert_eq!(second.as_ptr() as usize % 16, 0);
        assert_eq!(arena.used(), 24);
        let third = arena.alloc(8, 0).unwrap();
        assert!(third.is_empty());
        assert_eq!(arena.used(), 24);
    }

    #[test]
    fn test_exhaustion() {
        let mut arena = TransactionArena::new(64);
        assert!(arena.alloc(8, 64).is_some());
        assert!(arena.alloc(1, 1).is_none());
        assert_eq!(arena.used(), 64);
        assert!(arena.alloc(1, usize::MAX).is_none());
    }

    #[test]
    fn test_frames() {
        let mut arena = TransactionArena::new(128);
        arena.alloc(8, 16).unwrap().fill(0xff);
        arena.push_frame();
        arena.alloc(8, 32).unwrap().fill(0xff);
        arena.push_frame();
        arena.alloc(8, 32).unwrap();
        assert_eq!(arena.frame_depth(), 2);
        assert!(arena.pop_frame());
        assert_eq!(arena.used(), 48);
        assert!(arena.pop_frame());
        assert_eq!(arena.used(), 16);
        assert!(!arena.pop_frame());

        // Case: reused memory is handed out zeroed
        assert!(arena.alloc(8, 32).unwrap().iter().all(|byte| *byte == 0));
        assert_eq!(arena.high_water_mark(), 80);

        arena.push_frame();
        arena.reset();
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.frame_depth(), 0);
    }
}
