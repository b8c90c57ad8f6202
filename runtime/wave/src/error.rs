//! # Error Types
//!
//! Two classes of failure leave the core:
//!
//! - [`Trap`]: a WebAssembly-defined abnormal termination raised by the guest
//!   program. Traps end the thread and are reported through the machine's
//!   trap query; they are never host-level aborts.
//! - Everything else ([`VmError`], [`CompileError`], [`CodeError`],
//!   [`HistoryError`]) is an invariant violation in the core or a misuse of
//!   its API, and is propagated to the caller.

use alloc::string::String;
use core::fmt;

use crate::WasmType;

/// WebAssembly traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// `unreachable` was executed
    Unreachable,
    /// Integer division or remainder by zero
    DivideByZero,
    /// Signed division overflow or out-of-range float truncation
    IntegerOverflow,
    /// Truncation of NaN or infinity
    InvalidConversion,
    /// Linear-memory access outside the heap
    OutOfBounds,
    /// `call_indirect` callee has the wrong signature
    IndirectCallMismatch,
    /// `call_indirect` index is negative, past the table, or unbound
    UndefinedTableIndex,
    /// Maximum call depth exceeded
    CallStackExhausted,
}

impl Trap {
    /// Human-readable trap reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable executed",
            Self::DivideByZero => "integer divide by zero",
            Self::IntegerOverflow => "integer overflow",
            Self::InvalidConversion => "invalid conversion to integer",
            Self::OutOfBounds => "out of bounds memory access",
            Self::IndirectCallMismatch => "indirect call signature mismatch",
            Self::UndefinedTableIndex => "undefined table index",
            Self::CallStackExhausted => "call stack exhausted",
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Bytecode buffer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeError {
    /// Typed access past the end of the buffer
    OutOfRange { pos: usize, width: usize, len: usize },
    /// Opcode word with no assigned operator
    InvalidOpcode { pos: usize, raw: u16 },
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { pos, width, len } => write!(
                f,
                "bytecode access of {} bytes at {} exceeds length {}",
                width, pos, len
            ),
            Self::InvalidOpcode { pos, raw } => {
                write!(f, "invalid opcode {:#06x} at {}", raw, pos)
            }
        }
    }
}

/// Linear-memory errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// Access outside the current heap size
    OutOfBounds { offset: usize, len: usize, size: usize },
    /// Resize would overflow or leave `[0, max]`
    CantChangeSize { size: usize, requested: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds { offset, len, size } => write!(
                f,
                "out of bounds: {} bytes at {} (heap size {})",
                len, offset, size
            ),
            Self::CantChangeSize { size, requested } => write!(
                f,
                "can't change heap size: {} bytes by {}",
                size, requested
            ),
        }
    }
}

/// Compilation and linking errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Construct the compiler does not support
    Unsupported(&'static str),
    /// Branch depth with no enclosing label
    UnknownBranchTarget { depth: u32 },
    /// Branch value count disagrees with its target label
    BranchArityMismatch { expected: usize, found: usize },
    /// Local index past the function's locals
    UnknownLocal(u32),
    /// Type index past the module's type table
    UnknownType(u32),
    /// Instruction has the wrong number of children
    ChildCount { op: &'static str, expected: usize, found: usize },
    /// Sequence does not produce the value its block type promises
    TypeMismatch { expected: Option<WasmType>, found: Option<WasmType> },
    /// Call or table entry names a function no loaded module defines
    LinkTargetMissing { module: String, name: String },
    /// Call target exists but with another signature
    LinkSignatureMismatch { module: String, name: String },
    /// Two functions share a module and name
    DuplicateFunction { module: String, name: String },
    /// Branch placeholder left without an address
    UnresolvedBranch { node: usize },
    /// Bytecode buffer misuse
    Code(CodeError),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(what) => write!(f, "unsupported: {}", what),
            Self::UnknownBranchTarget { depth } => write!(f, "unknown branch depth {}", depth),
            Self::BranchArityMismatch { expected, found } => write!(
                f,
                "branch carries {} values, label expects {}",
                found, expected
            ),
            Self::UnknownLocal(index) => write!(f, "unknown local {}", index),
            Self::UnknownType(index) => write!(f, "unknown type index {}", index),
            Self::ChildCount { op, expected, found } => write!(
                f,
                "{} takes {} operands, found {}",
                op, expected, found
            ),
            Self::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {:?}, found {:?}", expected, found)
            }
            Self::LinkTargetMissing { module, name } => {
                write!(f, "can't find link target {}.{}", module, name)
            }
            Self::LinkSignatureMismatch { module, name } => {
                write!(f, "link target {}.{} has a different signature", module, name)
            }
            Self::DuplicateFunction { module, name } => {
                write!(f, "duplicate function {}.{}", module, name)
            }
            Self::UnresolvedBranch { node } => {
                write!(f, "branch to instruction {} was never resolved", node)
            }
            Self::Code(e) => write!(f, "{}", e),
        }
    }
}

impl From<CodeError> for CompileError {
    fn from(e: CodeError) -> Self {
        CompileError::Code(e)
    }
}

/// Execution errors that are not guest traps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Thread has no frame to step
    NoActiveFrame,
    /// Thread already finished or trapped
    ThreadFinished,
    /// Function index or name not in the program
    UnknownFunction,
    /// Entry arguments disagree with the function signature
    InvalidCallParameters,
    /// Bytecode popped more values than it pushed
    StackUnderflow,
    /// Branch target height above the current stack
    InvalidStackHeight { height: usize, len: usize },
    /// Local index past the frame's locals
    InvalidLocal(u32),
    /// Call-indirect table id past the program's tables
    InvalidTable(u32),
    /// Breakpoint requested for an instruction the function does not have
    UnknownInstruction { node: usize },
    /// Maximum call depth exceeded while entering a function
    CallStackExhausted,
    /// Initial memory does not fit
    Heap(HeapError),
    /// Bytecode buffer misuse
    Code(CodeError),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoActiveFrame => f.write_str("thread has no active frame"),
            Self::ThreadFinished => f.write_str("thread already finished"),
            Self::UnknownFunction => f.write_str("unknown function"),
            Self::InvalidCallParameters => f.write_str("invalid call parameters"),
            Self::StackUnderflow => f.write_str("value stack underflow"),
            Self::InvalidStackHeight { height, len } => write!(
                f,
                "branch height {} above stack length {}",
                height, len
            ),
            Self::InvalidLocal(index) => write!(f, "invalid local {}", index),
            Self::InvalidTable(index) => write!(f, "invalid table {}", index),
            Self::UnknownInstruction { node } => write!(f, "unknown instruction {}", node),
            Self::CallStackExhausted => f.write_str("call stack exhausted"),
            Self::Heap(e) => write!(f, "{}", e),
            Self::Code(e) => write!(f, "{}", e),
        }
    }
}

impl From<CodeError> for VmError {
    fn from(e: CodeError) -> Self {
        VmError::Code(e)
    }
}

impl From<HeapError> for VmError {
    fn from(e: HeapError) -> Self {
        VmError::Heap(e)
    }
}

/// Reversible-execution errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// History recording was never started
    NotEnabled,
    /// Target lies past the latest executed instruction
    TargetInFuture { target: u64, latest: u64 },
    /// Nothing precedes instruction 0
    AtStart,
    /// Target predates the oldest retained checkpoint
    TargetNotInHistory { target: u64, oldest: u64 },
    /// Thread finished before the target was reached
    CantReachTarget { target: u64, reached: u64 },
    /// Replay hit an execution error
    Vm(VmError),
}

impl fmt::Display for HistoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEnabled => f.write_str("history not enabled"),
            Self::AtStart => f.write_str("already at the first instruction"),
            Self::TargetInFuture { target, latest } => write!(
                f,
                "target in the future: {} (latest {})",
                target, latest
            ),
            Self::TargetNotInHistory { target, oldest } => write!(
                f,
                "target not in history: {} (oldest {})",
                target, oldest
            ),
            Self::CantReachTarget { target, reached } => write!(
                f,
                "can't reach target {}: thread finished at {}",
                target, reached
            ),
            Self::Vm(e) => write!(f, "{}", e),
        }
    }
}

impl From<VmError> for HistoryError {
    fn from(e: VmError) -> Self {
        HistoryError::Vm(e)
    }
}
