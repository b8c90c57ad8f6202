//! # Compiler
//!
//! Turns one function's instruction tree into linear stack bytecode.
//!
//! ## Pipeline
//!
//! 1. [`slots`] gives every node a stack slot and checks types.
//! 2. The emitter walks the tree post-order: operands first, then the
//!    node's own opcode and inline operands. Structured instructions emit
//!    no code of their own except the `label` anchor at a loop head.
//! 3. Branch operands are emitted as placeholders and queued in one of two
//!    backlogs, "needs start" (loop heads, `else` arms) and "needs end"
//!    (block exits). [`link_locally`](Emitter::link_locally) patches them
//!    once every node's start and end address is known.
//! 4. Call sites and `call_indirect` signatures are left for the
//!    [`Linker`], which resolves them across all loaded modules.

mod linker;
mod slots;

pub use linker::{Linker, MemoryPlan, Program};

use alloc::vec::Vec;

use log::debug;

use crate::ast::{FunctionRef, Function, Instruction, Op};
use crate::bytecode::{ByteCode, Opcode};
use crate::error::CompileError;
use crate::{FunctionSignature, WasmValue};

use slots::{NodeInfo, Slots};

/// Call placeholder awaiting a function index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CallSite {
    pub offset: usize,
    pub target: FunctionRef,
}

/// `call_indirect` placeholder awaiting an interned signature id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignatureSite {
    pub offset: usize,
    pub signature: FunctionSignature,
}

/// Bytecode whose branches are resolved but whose calls are not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UnlinkedFunction {
    pub code: ByteCode,
    /// Start address of each node, pre-order.
    pub anchors: Vec<u32>,
    pub calls: Vec<CallSite>,
    pub signatures: Vec<SignatureSite>,
}

#[derive(Debug, Clone, Copy)]
struct Label {
    node: usize,
    is_loop: bool,
    height: u32,
    arity: u8,
}

struct Emitter<'a> {
    slots: &'a Slots,
    types: &'a [FunctionSignature],
    /// Table operand of every `call_indirect` in this module.
    table: u32,
    result_arity: u8,
    code: ByteCode,
    next_node: usize,
    labels: Vec<Label>,
    starts: Vec<Option<u32>>,
    ends: Vec<Option<u32>>,
    needs_start: Vec<(usize, usize)>,
    needs_end: Vec<(usize, usize)>,
    calls: Vec<CallSite>,
    signatures: Vec<SignatureSite>,
}

/// Compiles `function` of a module whose type section is `types` and whose
/// function table has id `table`.
pub(crate) fn compile_function(
    function: &Function,
    types: &[FunctionSignature],
    table: u32,
) -> Result<UnlinkedFunction, CompileError> {
    let slots = slots::allocate(function, types)?;
    let count = slots.nodes.len();
    let mut emitter = Emitter {
        slots: &slots,
        types,
        table,
        result_arity: function.signature.result().is_some() as u8,
        code: ByteCode::new(),
        next_node: 0,
        labels: Vec::new(),
        // one extra entry for the function body itself
        starts: alloc::vec![None; count + 1],
        ends: alloc::vec![None; count + 1],
        needs_start: Vec::new(),
        needs_end: Vec::new(),
        calls: Vec::new(),
        signatures: Vec::new(),
    };

    emitter.body(&function.body, count)?;
    emitter.link_locally()?;

    let anchors = emitter.starts[..count].iter().map(|s| s.unwrap_or(0)).collect();
    debug!(
        "compiled {}: {} nodes, {} bytes, max stack {}",
        function.name,
        count,
        emitter.code.size(),
        slots.max_height
    );
    Ok(UnlinkedFunction {
        code: emitter.code,
        anchors,
        calls: emitter.calls,
        signatures: emitter.signatures,
    })
}

impl Emitter<'_> {
    fn info(&self, node: usize) -> Result<NodeInfo, CompileError> {
        self.slots
            .nodes
            .get(node)
            .copied()
            .ok_or(CompileError::Unsupported("tree changed between passes"))
    }

    fn here(&self) -> u32 {
        self.code.size() as u32
    }

    /// The function body is the outermost label; its end is the final `end`.
    fn body(&mut self, body: &[Instruction], node: usize) -> Result<(), CompileError> {
        self.starts[node] = Some(self.here());
        self.labels.push(Label { node, is_loop: false, height: 0, arity: self.result_arity });
        self.sequence(body, self.result_arity == 0)?;
        self.labels.pop();
        self.ends[node] = Some(self.here());
        self.code.append_opcode(Opcode::End);
        self.code.append(self.result_arity);
        Ok(())
    }

    /// Emits statements, dropping every value the sequence does not keep.
    fn sequence(&mut self, children: &[Instruction], drop_last: bool) -> Result<(), CompileError> {
        for (i, child) in children.iter().enumerate() {
            let keep = i + 1 == children.len() && !drop_last;
            self.statement(child, keep)?;
        }
        Ok(())
    }

    fn statement(&mut self, instr: &Instruction, keep: bool) -> Result<(), CompileError> {
        let node = self.next_node;
        self.emit(instr)?;
        if !keep && self.info(node)?.ty.is_some() {
            self.code.append_opcode(Opcode::Drop);
        }
        Ok(())
    }

    fn operands(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        for child in &instr.children {
            self.emit(child)?;
        }
        Ok(())
    }

    fn label(&self, depth: u32) -> Result<Label, CompileError> {
        self.labels
            .len()
            .checked_sub(1 + depth as usize)
            .and_then(|i| self.labels.get(i).copied())
            .ok_or(CompileError::UnknownBranchTarget { depth })
    }

    /// Appends a branch target placeholder for the label at `depth`.
    fn branch_target(&mut self, depth: u32) -> Result<(), CompileError> {
        let label = self.label(depth)?;
        let offset = self.code.append(0u32);
        if label.is_loop {
            self.needs_start.push((label.node, offset));
        } else {
            self.needs_end.push((label.node, offset));
        }
        self.code.append(label.height);
        self.code.append(label.arity);
        Ok(())
    }

    fn emit(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let node = self.next_node;
        self.next_node += 1;
        let info = self.info(node)?;
        self.starts[node] = Some(self.here());

        match &instr.op {
            Op::Unreachable => {
                self.code.append_opcode(Opcode::Unreachable);
            }
            Op::Nop => {
                self.code.append_opcode(Opcode::Nop);
            }
            Op::Const(value) => match *value {
                WasmValue::I32(v) => {
                    self.code.append_opcode(Opcode::Const32);
                    self.code.append(v as u32);
                }
                WasmValue::F32(v) => {
                    self.code.append_opcode(Opcode::Const32);
                    self.code.append(v.to_bits());
                }
                WasmValue::I64(v) => {
                    self.code.append_opcode(Opcode::Const64);
                    self.code.append(v as u64);
                }
                WasmValue::F64(v) => {
                    self.code.append_opcode(Opcode::Const64);
                    self.code.append(v.to_bits());
                }
            },

            Op::Block(ty) | Op::Loop(ty) => {
                let is_loop = matches!(instr.op, Op::Loop(_));
                if is_loop {
                    self.code.append_opcode(Opcode::Label);
                }
                let arity = if is_loop { 0 } else { ty.is_some() as u8 };
                self.labels.push(Label { node, is_loop, height: info.slot, arity });
                self.sequence(&instr.children, ty.is_none())?;
                self.labels.pop();
            }
            Op::If(_) => {
                self.emit(&instr.children[0])?;
                self.code.append_opcode(Opcode::JumpIfNot);
                let skip = self.code.append(0u32);
                self.needs_end.push((node, skip));

                self.labels.push(Label { node, is_loop: false, height: info.slot, arity: 0 });
                self.statement(&instr.children[1], false)?;
                self.labels.pop();
            }
            Op::IfElse(ty) => {
                let keep = ty.is_some();
                self.emit(&instr.children[0])?;
                self.code.append_opcode(Opcode::JumpIfNot);
                let to_else = self.code.append(0u32);

                self.labels.push(Label { node, is_loop: false, height: info.slot, arity: keep as u8 });
                self.statement(&instr.children[1], keep)?;
                self.code.append_opcode(Opcode::Jump);
                let to_end = self.code.append(0u32);
                self.needs_end.push((node, to_end));

                self.needs_start.push((self.next_node, to_else));
                self.statement(&instr.children[2], keep)?;
                self.labels.pop();
            }

            Op::Branch { depth } => {
                self.operands(instr)?;
                self.code.append_opcode(Opcode::Branch);
                self.branch_target(*depth)?;
            }
            Op::BranchIf { depth } => {
                self.operands(instr)?;
                self.code.append_opcode(Opcode::BranchIf);
                self.branch_target(*depth)?;
            }
            Op::BranchTable { targets, default } => {
                self.operands(instr)?;
                self.code.append_opcode(Opcode::BranchTable);
                self.code.append(targets.len() as u32);
                for depth in targets {
                    self.branch_target(*depth)?;
                }
                self.branch_target(*default)?;
            }
            Op::Return => {
                self.operands(instr)?;
                self.code.append_opcode(Opcode::Return);
                self.code.append(self.result_arity);
            }

            Op::Call(target) | Op::CallImport(target) => {
                self.operands(instr)?;
                let opcode = match instr.op {
                    Op::Call(_) => Opcode::Call,
                    _ => Opcode::CallImport,
                };
                self.code.append_opcode(opcode);
                let offset = self.code.append(0u32);
                self.code.append(target.signature.params.len() as u32);
                self.calls.push(CallSite { offset, target: target.clone() });
            }
            Op::CallIndirect { type_index } => {
                let signature = self
                    .types
                    .get(*type_index as usize)
                    .cloned()
                    .ok_or(CompileError::UnknownType(*type_index))?;
                self.operands(instr)?;
                self.code.append_opcode(Opcode::CallIndirect);
                self.code.append(self.table);
                let offset = self.code.append(0u32);
                self.code.append(signature.params.len() as u32);
                self.signatures.push(SignatureSite { offset, signature });
            }

            Op::Drop => {
                self.operands(instr)?;
                self.code.append_opcode(Opcode::Drop);
            }
            Op::Select => {
                self.operands(instr)?;
                self.code.append_opcode(Opcode::Select);
            }

            Op::LocalGet(index) | Op::LocalSet(index) | Op::LocalTee(index) => {
                self.operands(instr)?;
                let opcode = match instr.op {
                    Op::LocalGet(_) => Opcode::LocalGet,
                    Op::LocalSet(_) => Opcode::LocalSet,
                    _ => Opcode::LocalTee,
                };
                self.code.append_opcode(opcode);
                self.code.append(*index);
            }

            Op::Load(op, memarg) => {
                self.operands(instr)?;
                self.code.append_opcode(Opcode::Load(*op));
                self.code.append(memarg.offset);
            }
            Op::Store(op, memarg) => {
                self.operands(instr)?;
                self.code.append_opcode(Opcode::Store(*op));
                self.code.append(memarg.offset);
            }
            Op::MemorySize => {
                self.code.append_opcode(Opcode::MemorySize);
            }
            Op::MemoryGrow => {
                self.operands(instr)?;
                self.code.append_opcode(Opcode::MemoryGrow);
            }

            Op::Numeric(op) => {
                self.operands(instr)?;
                self.code.append_opcode(Opcode::Numeric(*op));
            }
        }

        self.ends[node] = Some(self.here());
        Ok(())
    }

    /// Resolves every branch placeholder against the recorded addresses.
    fn link_locally(&mut self) -> Result<(), CompileError> {
        for (node, offset) in core::mem::take(&mut self.needs_start) {
            let address = self
                .starts
                .get(node)
                .copied()
                .flatten()
                .ok_or(CompileError::UnresolvedBranch { node })?;
            self.code.write(offset, address)?;
        }
        for (node, offset) in core::mem::take(&mut self.needs_end) {
            let address = self
                .ends
                .get(node)
                .copied()
                .flatten()
                .ok_or(CompileError::UnresolvedBranch { node })?;
            self.code.write(offset, address)?;
        }
        Ok(())
    }
}
