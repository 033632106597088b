#![deny(clippy::arithmetic_side_effects)]

pub mod system_processor;

pub use system_processor::{builtin_program, process_instruction};
