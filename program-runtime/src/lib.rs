//! Runtime shared by the builtin programs: the invoke context and its
//! compute meter, program logging, the sysvar and program caches, the
//! transaction arena and the contract the loaders expect from a VM.

#![deny(clippy::arithmetic_side_effects)]
#![deny(clippy::indexing_slicing)]

pub use solana_loader_sdk;

pub mod arena;
pub mod compute_budget;
pub mod invoke_context;
pub mod loaded_programs;
pub mod log_collector;
#[cfg(any(test, feature = "dev-context-only-utils"))]
pub mod mock_vm;
pub mod runtime_config;
pub mod stable_log;
pub mod sysvar_cache;
pub mod timings;
pub mod vm;
