//! Machine configuration.

use crate::heap::MAX_HEAP_SIZE;

/// Machine limits and history tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    /// Maximum number of frames on the call stack
    pub max_call_depth: usize,
    /// Maximum linear memory size (bytes, capped at 1 GiB)
    pub max_heap_size: usize,
    /// Instructions between automatic checkpoints while recording
    pub checkpoint_interval: u64,
    /// Maximum checkpoints kept; the oldest are dropped first
    pub history_limit: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 10_000,
            max_heap_size: MAX_HEAP_SIZE, // 1 GiB
            checkpoint_interval: 10_000,
            history_limit: 1024,
        }
    }
}
