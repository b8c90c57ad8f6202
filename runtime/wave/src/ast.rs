//! # Instruction Trees
//!
//! The input the compiler consumes: modules of functions whose bodies are
//! trees of instructions, as produced by the S-WAVE module parsers.
//!
//! Operands are children, evaluated left to right before the instruction
//! itself. Structured instructions (`block`, `loop`, `if`) hold their bodies
//! as children as well:
//!
//! - `Block` / `Loop`: children are a statement sequence; the block's value
//!   is the value of its last child.
//! - `If`: `[condition, then]`. `IfElse`: `[condition, then, else]`.
//! - `Branch`: `[value?]`. `BranchIf`: `[value?, condition]`.
//!   `BranchTable`: `[value?, index]`. `Return`: `[value?]`.
//! - `Call*`: one child per argument; `CallIndirect` takes the table index
//!   as its last child.
//! - `Select`: `[first, second, condition]`.
//!
//! Branch targets are relative label depths: `0` is the innermost enclosing
//! `block`, `loop` or `if`.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::ops::{LoadOp, NumericOp, StoreOp};
use crate::{FunctionSignature, WasmType, WasmValue};

/// Result type of a structured instruction.
pub type BlockType = Option<WasmType>;

/// Static memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemArg {
    /// Added to the dynamic base address.
    pub offset: u32,
}

/// Symbolic call target, resolved by the linker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    /// Module defining the callee.
    pub module: String,
    /// Function name within that module.
    pub name: String,
    /// Expected callee signature.
    pub signature: FunctionSignature,
}

impl FunctionRef {
    pub fn new(module: &str, name: &str, signature: FunctionSignature) -> Self {
        Self {
            module: String::from(module),
            name: String::from(name),
            signature,
        }
    }
}

/// Instruction kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Unreachable,
    Nop,
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    IfElse(BlockType),
    Branch { depth: u32 },
    BranchIf { depth: u32 },
    BranchTable { targets: Vec<u32>, default: u32 },
    Return,
    Call(FunctionRef),
    CallImport(FunctionRef),
    /// Index into the module's type table.
    CallIndirect { type_index: u32 },
    Drop,
    Select,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    Load(LoadOp, MemArg),
    Store(StoreOp, MemArg),
    MemorySize,
    MemoryGrow,
    Const(WasmValue),
    Numeric(NumericOp),
}

impl Op {
    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Unreachable => "unreachable",
            Op::Nop => "nop",
            Op::Block(_) => "block",
            Op::Loop(_) => "loop",
            Op::If(_) => "if",
            Op::IfElse(_) => "if_else",
            Op::Branch { .. } => "br",
            Op::BranchIf { .. } => "br_if",
            Op::BranchTable { .. } => "br_table",
            Op::Return => "return",
            Op::Call(_) => "call",
            Op::CallImport(_) => "call_import",
            Op::CallIndirect { .. } => "call_indirect",
            Op::Drop => "drop",
            Op::Select => "select",
            Op::LocalGet(_) => "local.get",
            Op::LocalSet(_) => "local.set",
            Op::LocalTee(_) => "local.tee",
            Op::Load(op, _) => op.name(),
            Op::Store(op, _) => op.name(),
            Op::MemorySize => "memory.size",
            Op::MemoryGrow => "memory.grow",
            Op::Const(_) => "const",
            Op::Numeric(op) => op.name(),
        }
    }
}

/// A node of an instruction tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub children: Vec<Instruction>,
}

impl Instruction {
    pub fn new(op: Op, children: Vec<Instruction>) -> Self {
        Self { op, children }
    }

    /// Instruction without operands.
    pub fn leaf(op: Op) -> Self {
        Self::new(op, Vec::new())
    }

    pub fn i32_const(value: i32) -> Self {
        Self::leaf(Op::Const(WasmValue::I32(value)))
    }

    pub fn i64_const(value: i64) -> Self {
        Self::leaf(Op::Const(WasmValue::I64(value)))
    }

    pub fn f32_const(value: f32) -> Self {
        Self::leaf(Op::Const(WasmValue::F32(value)))
    }

    pub fn f64_const(value: f64) -> Self {
        Self::leaf(Op::Const(WasmValue::F64(value)))
    }

    pub fn local_get(index: u32) -> Self {
        Self::leaf(Op::LocalGet(index))
    }

    pub fn local_set(index: u32, value: Instruction) -> Self {
        Self::new(Op::LocalSet(index), vec![value])
    }

    /// Unary numeric operator.
    pub fn unary(op: NumericOp, operand: Instruction) -> Self {
        Self::new(Op::Numeric(op), vec![operand])
    }

    /// Binary numeric operator.
    pub fn binary(op: NumericOp, lhs: Instruction, rhs: Instruction) -> Self {
        Self::new(Op::Numeric(op), vec![lhs, rhs])
    }

    pub fn load(op: LoadOp, offset: u32, address: Instruction) -> Self {
        Self::new(Op::Load(op, MemArg { offset }), vec![address])
    }

    pub fn store(op: StoreOp, offset: u32, address: Instruction, value: Instruction) -> Self {
        Self::new(Op::Store(op, MemArg { offset }), vec![address, value])
    }

    pub fn block(ty: BlockType, body: Vec<Instruction>) -> Self {
        Self::new(Op::Block(ty), body)
    }

    pub fn looped(ty: BlockType, body: Vec<Instruction>) -> Self {
        Self::new(Op::Loop(ty), body)
    }

    /// Number of nodes in this tree, itself included.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Instruction::node_count).sum::<usize>()
    }
}

/// A function definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub signature: FunctionSignature,
    /// Locals beyond the parameters.
    pub locals: Vec<WasmType>,
    /// Statement sequence; the last statement yields the function result.
    pub body: Vec<Instruction>,
}

impl Function {
    pub fn new(
        name: &str,
        signature: FunctionSignature,
        locals: Vec<WasmType>,
        body: Vec<Instruction>,
    ) -> Self {
        Self {
            name: String::from(name),
            signature,
            locals,
            body,
        }
    }

    /// Type of a local, parameters first.
    pub fn local_type(&self, index: u32) -> Option<WasmType> {
        let index = index as usize;
        let params = self.signature.params.len();
        if index < params {
            Some(self.signature.params[index])
        } else {
            self.locals.get(index - params).copied()
        }
    }

    /// Parameters plus pure locals.
    pub fn local_count(&self) -> usize {
        self.signature.params.len() + self.locals.len()
    }
}

/// Linear memory declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub min_pages: u32,
    pub max_pages: Option<u32>,
}

/// Bytes copied into linear memory at instantiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// A parsed module.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Module {
    pub name: String,
    /// Type section, referenced by `call_indirect`.
    pub types: Vec<FunctionSignature>,
    pub functions: Vec<Function>,
    /// Function table; entries name functions of this module.
    pub table: Vec<Option<String>>,
    pub memory: Option<MemoryLimits>,
    pub data: Vec<DataSegment>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            ..Self::default()
        }
    }

    /// Builder-style function append.
    pub fn with_function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_types() {
        let f = Function::new(
            "f",
            FunctionSignature::new(&[WasmType::I32, WasmType::F64], None),
            vec![WasmType::I64],
            Vec::new(),
        );
        assert_eq!(f.local_type(0), Some(WasmType::I32));
        assert_eq!(f.local_type(1), Some(WasmType::F64));
        assert_eq!(f.local_type(2), Some(WasmType::I64));
        assert_eq!(f.local_type(3), None);
        assert_eq!(f.local_count(), 3);
    }

    #[test]
    fn test_node_count() {
        let tree = Instruction::binary(
            NumericOp::I32Add,
            Instruction::i32_const(2),
            Instruction::unary(NumericOp::I32Clz, Instruction::i32_const(3)),
        );
        assert_eq!(tree.node_count(), 4);
    }
}
