//! # Bytecode
//!
//! Append/patch-only byte storage for compiled functions, plus the opcode
//! encoding the compiler writes and the frame decodes.
//!
//! ## Layout
//!
//! Every instruction is a 16-bit little-endian opcode word followed by its
//! inline operands:
//!
//! ```text
//! Const32        u32 bits
//! Const64        u64 bits
//! Local*         u32 index
//! Load/Store     u32 static offset
//! Jump*          u32 address
//! Branch*        u32 address, u32 height, u8 arity
//! BranchTable    u32 count, (count + 1) x [u32 address, u32 height, u8 arity]
//! Return/End     u8 arity
//! Call*          u32 callee, u32 parameter count
//! CallIndirect   u32 table, u32 signature, u32 parameter count
//! ```
//!
//! The layout is private to this crate and carries no compatibility promise.

use alloc::vec::Vec;

use crate::error::CodeError;
use crate::ops::{LoadOp, NumericOp, StoreOp};

// =============================================================================
// Operands
// =============================================================================

/// Fixed-width value that can be stored inline in bytecode.
pub trait Operand: Copy {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Little-endian encoding into `out`, which is exactly `WIDTH` bytes.
    fn encode(self, out: &mut [u8]);

    /// Decoding from exactly `WIDTH` bytes.
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! impl_operand {
    ($($ty:ty),+) => {
        $(
            impl Operand for $ty {
                const WIDTH: usize = core::mem::size_of::<$ty>();

                fn encode(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; core::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )+
    };
}

impl_operand!(u8, u16, u32, u64);

// =============================================================================
// Buffer
// =============================================================================

/// Growable bytecode buffer.
///
/// Bytes are only ever appended, or overwritten in place at offsets that
/// already exist. Every typed access is bounds-checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteCode {
    bytes: Vec<u8>,
}

impl ByteCode {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Current length in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Raw contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Appends `value` and returns the offset it was written at.
    pub fn append<T: Operand>(&mut self, value: T) -> usize {
        let offset = self.bytes.len();
        self.bytes.resize(offset + T::WIDTH, 0);
        value.encode(&mut self.bytes[offset..]);
        offset
    }

    /// Appends an opcode word.
    pub fn append_opcode(&mut self, op: Opcode) -> usize {
        self.append(op.encode())
    }

    /// Reads a `T` at `pos`.
    pub fn get<T: Operand>(&self, pos: usize) -> Result<T, CodeError> {
        let range = self.range(pos, T::WIDTH)?;
        Ok(T::decode(&self.bytes[range]))
    }

    /// Reads a `T` at `pos` into `target`.
    pub fn get_into<T: Operand>(&self, pos: usize, target: &mut T) -> Result<(), CodeError> {
        *target = self.get(pos)?;
        Ok(())
    }

    /// Overwrites the `T` at `offset`. Never grows the buffer.
    pub fn write<T: Operand>(&mut self, offset: usize, value: T) -> Result<(), CodeError> {
        let range = self.range(offset, T::WIDTH)?;
        value.encode(&mut self.bytes[range]);
        Ok(())
    }

    /// Decodes the opcode word at `pos`.
    pub fn opcode(&self, pos: usize) -> Result<Opcode, CodeError> {
        let raw: u16 = self.get(pos)?;
        Opcode::decode(raw).ok_or(CodeError::InvalidOpcode { pos, raw })
    }

    fn range(&self, pos: usize, width: usize) -> Result<core::ops::Range<usize>, CodeError> {
        let len = self.bytes.len();
        match pos.checked_add(width) {
            Some(end) if end <= len => Ok(pos..end),
            _ => Err(CodeError::OutOfRange { pos, width, len }),
        }
    }
}

/// Bytecode whose branch and call placeholders have all been resolved.
///
/// Only the linker constructs this, so executable code can never carry an
/// unpatched placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedCode(ByteCode);

impl LinkedCode {
    pub(crate) fn new(code: ByteCode) -> Self {
        Self(code)
    }

    /// Read access to the underlying buffer.
    pub fn code(&self) -> &ByteCode {
        &self.0
    }
}

impl core::ops::Deref for LinkedCode {
    type Target = ByteCode;

    fn deref(&self) -> &ByteCode {
        &self.0
    }
}

// =============================================================================
// Opcodes
// =============================================================================

/// Bytecode operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Trap unconditionally.
    Unreachable,
    /// No operation.
    Nop,
    /// Jump anchor at the head of a loop; no operation.
    Label,
    /// Push a 32-bit constant.
    Const32,
    /// Push a 64-bit constant.
    Const64,
    /// Push a local.
    LocalGet,
    /// Pop into a local.
    LocalSet,
    /// Copy the top of stack into a local.
    LocalTee,
    /// Discard the top of stack.
    Drop,
    /// Pick one of two values.
    Select,
    /// Unconditional jump with no stack adjustment.
    Jump,
    /// Jump when the popped condition is zero.
    JumpIfNot,
    /// Branch to a label.
    Branch,
    /// Branch to a label when the popped condition is non-zero.
    BranchIf,
    /// Indexed branch.
    BranchTable,
    /// Return from the function.
    Return,
    /// Fall off the end of the function.
    End,
    /// Call a function of the same module.
    Call,
    /// Call a function imported from another module.
    CallImport,
    /// Call through a table.
    CallIndirect,
    /// Push the heap size in pages.
    MemorySize,
    /// Grow the heap by a number of pages.
    MemoryGrow,
    /// Load from linear memory.
    Load(LoadOp),
    /// Store to linear memory.
    Store(StoreOp),
    /// Pure numeric operator.
    Numeric(NumericOp),
}

const LOAD_BASE: u16 = 0x0100;
const STORE_BASE: u16 = 0x0140;
const NUMERIC_BASE: u16 = 0x0200;

impl Opcode {
    /// 16-bit encoding.
    pub fn encode(self) -> u16 {
        match self {
            Opcode::Unreachable => 0x00,
            Opcode::Nop => 0x01,
            Opcode::Label => 0x02,
            Opcode::Const32 => 0x10,
            Opcode::Const64 => 0x11,
            Opcode::LocalGet => 0x20,
            Opcode::LocalSet => 0x21,
            Opcode::LocalTee => 0x22,
            Opcode::Drop => 0x30,
            Opcode::Select => 0x31,
            Opcode::Jump => 0x40,
            Opcode::JumpIfNot => 0x41,
            Opcode::Branch => 0x42,
            Opcode::BranchIf => 0x43,
            Opcode::BranchTable => 0x44,
            Opcode::Return => 0x45,
            Opcode::End => 0x46,
            Opcode::Call => 0x50,
            Opcode::CallImport => 0x51,
            Opcode::CallIndirect => 0x52,
            Opcode::MemorySize => 0x60,
            Opcode::MemoryGrow => 0x61,
            Opcode::Load(op) => LOAD_BASE + op.index(),
            Opcode::Store(op) => STORE_BASE + op.index(),
            Opcode::Numeric(op) => NUMERIC_BASE + op.index(),
        }
    }

    /// Decodes a 16-bit opcode word.
    pub fn decode(raw: u16) -> Option<Self> {
        let op = match raw {
            0x00 => Opcode::Unreachable,
            0x01 => Opcode::Nop,
            0x02 => Opcode::Label,
            0x10 => Opcode::Const32,
            0x11 => Opcode::Const64,
            0x20 => Opcode::LocalGet,
            0x21 => Opcode::LocalSet,
            0x22 => Opcode::LocalTee,
            0x30 => Opcode::Drop,
            0x31 => Opcode::Select,
            0x40 => Opcode::Jump,
            0x41 => Opcode::JumpIfNot,
            0x42 => Opcode::Branch,
            0x43 => Opcode::BranchIf,
            0x44 => Opcode::BranchTable,
            0x45 => Opcode::Return,
            0x46 => Opcode::End,
            0x50 => Opcode::Call,
            0x51 => Opcode::CallImport,
            0x52 => Opcode::CallIndirect,
            0x60 => Opcode::MemorySize,
            0x61 => Opcode::MemoryGrow,
            r if (LOAD_BASE..STORE_BASE).contains(&r) => {
                Opcode::Load(LoadOp::from_index(r - LOAD_BASE)?)
            }
            r if (STORE_BASE..NUMERIC_BASE).contains(&r) => {
                Opcode::Store(StoreOp::from_index(r - STORE_BASE)?)
            }
            r if r >= NUMERIC_BASE => Opcode::Numeric(NumericOp::from_index(r - NUMERIC_BASE)?),
            _ => return None,
        };
        Some(op)
    }

    /// Readable name for traces.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Unreachable => "unreachable",
            Opcode::Nop => "nop",
            Opcode::Label => "label",
            Opcode::Const32 => "const32",
            Opcode::Const64 => "const64",
            Opcode::LocalGet => "local.get",
            Opcode::LocalSet => "local.set",
            Opcode::LocalTee => "local.tee",
            Opcode::Drop => "drop",
            Opcode::Select => "select",
            Opcode::Jump => "jump",
            Opcode::JumpIfNot => "jump_if_not",
            Opcode::Branch => "br",
            Opcode::BranchIf => "br_if",
            Opcode::BranchTable => "br_table",
            Opcode::Return => "return",
            Opcode::End => "end",
            Opcode::Call => "call",
            Opcode::CallImport => "call_import",
            Opcode::CallIndirect => "call_indirect",
            Opcode::MemorySize => "memory.size",
            Opcode::MemoryGrow => "memory.grow",
            Opcode::Load(op) => op.name(),
            Opcode::Store(op) => op.name(),
            Opcode::Numeric(op) => op.name(),
        }
    }
}

/// Width of an opcode word.
pub const OPCODE_WIDTH: usize = 2;

/// Width of an inline branch-table entry.
pub const BRANCH_ENTRY_WIDTH: usize = BranchTarget::WIDTH;

/// Resolved branch operand: where to go and how to reshape the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTarget {
    /// Absolute bytecode address.
    pub address: u32,
    /// Operand-stack height of the target label.
    pub height: u32,
    /// Values carried across the branch (0 or 1).
    pub arity: u8,
}

impl BranchTarget {
    /// Encoded width.
    pub const WIDTH: usize = 9;

    /// Decodes a target at `pos`.
    pub fn read(code: &ByteCode, pos: usize) -> Result<Self, CodeError> {
        Ok(Self {
            address: code.get(pos)?,
            height: code.get(pos + 4)?,
            arity: code.get(pos + 8)?,
        })
    }
}
