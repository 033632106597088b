//! Host memory buffers handed to the program runtime.
//!
//! The VM expects its input region and scratch memory at a fixed alignment on
//! the host, independent of what the allocator returns.

pub mod aligned_memory;

/// Alignment of host memory backing VM regions
pub const HOST_ALIGN: usize = 16;
