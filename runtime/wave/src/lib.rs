//! # S-WAVE VM: Reversible WebAssembly Interpreter Core
//!
//! The execution core behind S-WAVE. Function bodies arrive as instruction
//! trees, are compiled ahead of time into a compact linear bytecode, and are
//! executed one instruction at a time against a call stack and a
//! bounds-checked linear memory. Execution is reversible: the machine can be
//! stepped backward to any instruction it has already executed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   compile    ┌──────────────┐   link    ┌─────────────┐
//! │ Instruction  │ ───────────▶ │  Unlinked    │ ────────▶ │   Program   │
//! │    trees     │  slots+emit  │  functions   │  globally │             │
//! └──────────────┘              └──────────────┘           └─────────────┘
//!                                                                 │
//!                                                                 ▼
//! ┌─────────────────────────────── Machine ──────────────────────────────┐
//! │  Thread ── Frame ── Frame ── Frame (top)        Heap (linear memory) │
//! │     │                                              │                 │
//! │     └──────── frame pops ──────┐    ┌──── writes ──┘                 │
//! │                                ▼    ▼                                │
//! │                               History                                │
//! │                  (checkpoints + reverse deltas)                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let mut linker = Linker::new();
//! linker.add_module(&module)?;
//! let program = linker.link()?;
//!
//! let mut machine = Machine::new(program, MachineConfig::default())?;
//! machine.start("main", "run", &[])?;
//! machine.enable_history();
//! machine.step_until_finished()?;
//! machine.step_back()?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod error;
pub mod frame;
pub mod function;
pub mod heap;
pub mod history;
pub mod machine;
pub mod observer;
pub mod ops;
pub mod thread;

pub use ast::{Function, Instruction, Module, Op};
pub use compiler::{Linker, Program};
pub use config::MachineConfig;
pub use error::{CodeError, CompileError, HeapError, HistoryError, Trap, VmError};
pub use function::{BreakpointHit, CompiledFunction, FunctionIndex};
pub use heap::{Heap, PAGE_SIZE};
pub use history::{History, HistoryState};
pub use machine::{InstructionCounter, Machine, StepResult};
pub use ops::{LoadOp, NumericOp, StoreOp};
pub use thread::{Thread, ThreadStatus};

/// WASM value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WasmType {
    I32,
    I64,
    F32,
    F64,
}

impl WasmType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x7F => Some(Self::I32),
            0x7E => Some(Self::I64),
            0x7D => Some(Self::F32),
            0x7C => Some(Self::F64),
            _ => None,
        }
    }
}

/// WASM runtime values.
#[derive(Debug, Clone, Copy)]
pub enum WasmValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl WasmValue {
    pub fn value_type(&self) -> WasmType {
        match self {
            Self::I32(_) => WasmType::I32,
            Self::I64(_) => WasmType::I64,
            Self::F32(_) => WasmType::F32,
            Self::F64(_) => WasmType::F64,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Raw 64-bit stack cell holding this value.
    ///
    /// 32-bit values occupy the low half, zero-extended; floats are stored
    /// by bit pattern.
    pub fn to_cell(self) -> u64 {
        match self {
            Self::I32(v) => v as u32 as u64,
            Self::I64(v) => v as u64,
            Self::F32(v) => v.to_bits() as u64,
            Self::F64(v) => v.to_bits(),
        }
    }

    /// Reinterprets a raw cell as a value of `ty`.
    pub fn from_cell(ty: WasmType, cell: u64) -> Self {
        match ty {
            WasmType::I32 => Self::I32(cell as u32 as i32),
            WasmType::I64 => Self::I64(cell as i64),
            WasmType::F32 => Self::F32(f32::from_bits(cell as u32)),
            WasmType::F64 => Self::F64(f64::from_bits(cell)),
        }
    }
}

/// Bit-exact equality, so NaN payloads compare as stored.
impl PartialEq for WasmValue {
    fn eq(&self, other: &Self) -> bool {
        self.value_type() == other.value_type() && self.to_cell() == other.to_cell()
    }
}

impl Eq for WasmValue {}

/// Function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSignature {
    pub params: Vec<WasmType>,
    pub results: Vec<WasmType>,
}

impl FunctionSignature {
    /// Creates a signature with at most one result.
    pub fn new(params: &[WasmType], result: Option<WasmType>) -> Self {
        Self {
            params: params.to_vec(),
            results: result.into_iter().collect(),
        }
    }

    /// The single result type, if any.
    pub fn result(&self) -> Option<WasmType> {
        self.results.first().copied()
    }
}
