use {
    serde_derive::{Deserialize, Serialize},
    solana_loader_sdk::entrypoint::HEAP_LENGTH as MIN_HEAP_FRAME_BYTES,
};

pub const DEFAULT_INSTRUCTION_COMPUTE_UNIT_LIMIT: u32 = 200_000;
pub const MAX_COMPUTE_UNIT_LIMIT: u32 = 1_400_000;
pub const MAX_HEAP_FRAME_BYTES: u32 = 256 * 1024;

/// Max instruction stack depth. This is the maximum nesting of instructions that can happen during
/// a transaction.
pub const MAX_INSTRUCTION_STACK_DEPTH: usize = 5;

/// Max call depth. This is the maximum nesting of SBF to SBF call that can happen within a program.
pub const MAX_CALL_DEPTH: usize = 64;

/// The size of one SBF stack frame.
pub const STACK_FRAME_SIZE: usize = 4096;

/// Roughly 0.5us/page, where page is 32K; given roughly 15CU/us, the
/// default heap page cost = 0.5 * 15 ~= 8CU/page
pub const DEFAULT_HEAP_COST: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeBudget {
    /// Number of compute units that a transaction or individual instruction is
    /// allowed to consume. Compute units are consumed by program execution,
    /// resources they use, etc...
    pub compute_unit_limit: u64,
    /// Maximum program instruction invocation stack height. Invocation stack
    /// height starts at 1 for transaction instructions and the stack height is
    /// incremented each time a program invokes an instruction and decremented
    /// when a program returns.
    pub max_invoke_stack_height: usize,
    /// Maximum cross-program invocation and instructions per transaction
    pub max_instruction_trace_length: usize,
    /// Maximum SBF to BPF call depth
    pub max_call_depth: usize,
    /// Size of a stack frame in bytes, must match the size specified in the LLVM SBF backend
    pub stack_frame_size: usize,
    /// Program heap region size, default: solana_loader_sdk::entrypoint::HEAP_LENGTH
    pub heap_size: u32,
    /// Number of compute units per additional 32k heap above the default (~.5
    /// us per 32k at 15 units/us rounded up)
    pub heap_cost: u64,
}

impl Default for ComputeBudget {
    fn default() -> Self {
        Self::new(MAX_COMPUTE_UNIT_LIMIT as u64)
    }
}

impl ComputeBudget {
    pub fn new(compute_unit_limit: u64) -> Self {
        ComputeBudget {
            compute_unit_limit,
            max_invoke_stack_height: MAX_INSTRUCTION_STACK_DEPTH,
            max_instruction_trace_length: 64,
            max_call_depth: MAX_CALL_DEPTH,
            stack_frame_size: STACK_FRAME_SIZE,
            heap_size: MIN_HEAP_FRAME_BYTES as u32,
            heap_cost: DEFAULT_HEAP_COST,
        }
    }

    /// Whether the requested heap size is one a program may be given.
    ///
    /// It must lie between the default and the maximum heap frame and be a
    /// multiple of 1 KiB.
    pub fn is_valid_heap_size(heap_size: u32) -> bool {
        (MIN_HEAP_FRAME_BYTES as u32..=MAX_HEAP_FRAME_BYTES).contains(&heap_size)
            && heap_size % 1024 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let compute_budget = ComputeBudget::default();
        assert_eq!(compute_budget.compute_unit_limit, 1_400_000);
        assert_eq!(compute_budget.heap_size, 32 * 1024);
        assert_eq!(compute_budget.heap_cost, 8);
        assert_eq!(compute_budget.max_invoke_stack_height, 5);
    }

    #[test]
    fn test_is_valid_heap_size() {
        assert!(ComputeBudget::is_valid_heap_size(32 * 1024));
        assert!(ComputeBudget::is_valid_heap_size(256 * 1024));
        assert!(!ComputeBudget::is_valid_heap_size(31 * 1024));
        assert!(!ComputeBudget::is_valid_heap_size(257 * 1024));
        assert!(!ComputeBudget::is_valid_heap_size(32 * 1024 + 1));
    }
}
