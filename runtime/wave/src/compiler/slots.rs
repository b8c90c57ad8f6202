//! Slot and type pass.
//!
//! Walks a function tree in pre-order before any code is emitted and gives
//! every node a slot: the operand-stack height at which its value lands.
//! Statements of a sequence all start at the sequence's slot (leftover
//! values are dropped), the `j`-th operand of an instruction sits at
//! `slot + j`, and both arms of an `if` start at the `if`'s slot once the
//! condition is popped. Branch heights come straight from these slots.
//!
//! The same walk checks operand counts and types, local and type indices,
//! and branch depths, so the emitter can assume a well-formed tree.

use alloc::vec::Vec;

use crate::ast::{Function, Instruction, Op};
use crate::error::CompileError;
use crate::{FunctionSignature, WasmType};

/// Result of the pass for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeInfo {
    /// Operand-stack height where the node's value lands.
    pub slot: u32,
    /// Value the node leaves on the stack.
    pub ty: Option<WasmType>,
    /// Control never falls through the node.
    pub diverges: bool,
}

/// Per-node slots of a function, indexed by pre-order position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Slots {
    pub nodes: Vec<NodeInfo>,
    /// Deepest operand stack the function can build.
    pub max_height: u32,
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    ty: Option<WasmType>,
    diverges: bool,
}

impl Outcome {
    const NONE: Outcome = Outcome { ty: None, diverges: false };
    const NEVER: Outcome = Outcome { ty: None, diverges: true };

    fn of(ty: Option<WasmType>, diverges: bool) -> Self {
        Self { ty, diverges }
    }

    /// Checks that the node left a `ty`, or never completes.
    fn expect(self, ty: WasmType) -> Result<(), CompileError> {
        if self.diverges || self.ty == Some(ty) {
            Ok(())
        } else {
            Err(CompileError::TypeMismatch { expected: Some(ty), found: self.ty })
        }
    }
}

struct Allocator<'a> {
    function: &'a Function,
    types: &'a [FunctionSignature],
    /// Value type a branch to each enclosing label carries, innermost last.
    labels: Vec<Option<WasmType>>,
    nodes: Vec<NodeInfo>,
    max_height: u32,
}

/// Runs the pass over `function`, resolving `call_indirect` types in `types`.
pub(crate) fn allocate(
    function: &Function,
    types: &[FunctionSignature],
) -> Result<Slots, CompileError> {
    let result = function.signature.result();
    let mut allocator = Allocator {
        function,
        types,
        labels: alloc::vec![result],
        nodes: Vec::new(),
        max_height: 0,
    };
    allocator.sequence(&function.body, 0, result)?;
    Ok(Slots {
        nodes: allocator.nodes,
        max_height: allocator.max_height,
    })
}

impl Allocator<'_> {
    fn label(&self, depth: u32) -> Result<Option<WasmType>, CompileError> {
        self.labels
            .len()
            .checked_sub(1 + depth as usize)
            .and_then(|i| self.labels.get(i).copied())
            .ok_or(CompileError::UnknownBranchTarget { depth })
    }

    fn local(&self, index: u32) -> Result<WasmType, CompileError> {
        self.function.local_type(index).ok_or(CompileError::UnknownLocal(index))
    }

    /// Statements at `height`; only the last may leave an `expected` value.
    fn sequence(
        &mut self,
        children: &[Instruction],
        height: u32,
        expected: Option<WasmType>,
    ) -> Result<Outcome, CompileError> {
        let mut diverged = false;
        let mut last = Outcome::NONE;
        for child in children {
            last = self.node(child, height)?;
            diverged |= last.diverges;
        }
        if let Some(ty) = expected {
            if !diverged && last.ty != Some(ty) {
                return Err(CompileError::TypeMismatch { expected, found: last.ty });
            }
        }
        Ok(Outcome::of(expected, diverged))
    }

    /// Operands of `instr` with the given types, stacked from `height`.
    fn operands(
        &mut self,
        instr: &Instruction,
        height: u32,
        expected: &[WasmType],
    ) -> Result<bool, CompileError> {
        arity(instr, expected.len())?;
        let mut diverged = false;
        for (j, (child, &ty)) in instr.children.iter().zip(expected).enumerate() {
            let out = self.node(child, height + j as u32)?;
            out.expect(ty)?;
            diverged |= out.diverges;
        }
        Ok(diverged)
    }

    /// Value carried to a label, plus anything stacked on top of it.
    fn branch_operands(
        &mut self,
        instr: &Instruction,
        height: u32,
        carried: Option<WasmType>,
        extra: &[WasmType],
    ) -> Result<bool, CompileError> {
        let arity = carried.is_some() as usize;
        let found = instr.children.len().saturating_sub(extra.len());
        if found != arity {
            return Err(CompileError::BranchArityMismatch { expected: arity, found });
        }
        let mut expected: Vec<WasmType> = carried.into_iter().collect();
        expected.extend_from_slice(extra);
        self.operands(instr, height, &expected)
    }

    fn node(&mut self, instr: &Instruction, height: u32) -> Result<Outcome, CompileError> {
        let id = self.nodes.len();
        self.nodes.push(NodeInfo { slot: height, ty: None, diverges: false });

        let out = match &instr.op {
            Op::Unreachable => {
                self.operands(instr, height, &[])?;
                Outcome::NEVER
            }
            Op::Nop => Outcome::of(None, self.operands(instr, height, &[])?),
            Op::Const(value) => {
                Outcome::of(Some(value.value_type()), self.operands(instr, height, &[])?)
            }

            Op::LocalGet(index) => {
                let ty = self.local(*index)?;
                Outcome::of(Some(ty), self.operands(instr, height, &[])?)
            }
            Op::LocalSet(index) => {
                let ty = self.local(*index)?;
                Outcome::of(None, self.operands(instr, height, &[ty])?)
            }
            Op::LocalTee(index) => {
                let ty = self.local(*index)?;
                Outcome::of(Some(ty), self.operands(instr, height, &[ty])?)
            }

            Op::Drop => {
                arity(instr, 1)?;
                let value = self.node(&instr.children[0], height)?;
                if value.ty.is_none() && !value.diverges {
                    return Err(CompileError::Unsupported("drop of an instruction without a value"));
                }
                Outcome::of(None, value.diverges)
            }
            Op::Select => {
                arity(instr, 3)?;
                let first = self.node(&instr.children[0], height)?;
                let second = self.node(&instr.children[1], height + 1)?;
                self.node(&instr.children[2], height + 2)?.expect(WasmType::I32)?;
                let ty = if first.diverges { second.ty } else { first.ty };
                let ty = ty.ok_or(CompileError::TypeMismatch { expected: None, found: None })?;
                first.expect(ty)?;
                second.expect(ty)?;
                Outcome::of(Some(ty), first.diverges || second.diverges)
            }

            Op::Numeric(op) => {
                let shape = op.shape();
                Outcome::of(Some(shape.result), self.operands(instr, height, shape.operands)?)
            }
            Op::Load(op, _) => Outcome::of(
                Some(op.result_type()),
                self.operands(instr, height, &[WasmType::I32])?,
            ),
            Op::Store(op, _) => Outcome::of(
                None,
                self.operands(instr, height, &[WasmType::I32, op.value_type()])?,
            ),
            Op::MemorySize => Outcome::of(Some(WasmType::I32), self.operands(instr, height, &[])?),
            Op::MemoryGrow => Outcome::of(
                Some(WasmType::I32),
                self.operands(instr, height, &[WasmType::I32])?,
            ),

            Op::Block(ty) => {
                self.labels.push(*ty);
                self.sequence(&instr.children, height, *ty)?;
                self.labels.pop();
                Outcome::of(*ty, false)
            }
            Op::Loop(ty) => {
                // branching to a loop restarts it and carries nothing
                self.labels.push(None);
                self.sequence(&instr.children, height, *ty)?;
                self.labels.pop();
                Outcome::of(*ty, false)
            }
            Op::If(ty) => {
                if ty.is_some() {
                    return Err(CompileError::Unsupported("if with a result needs an else arm"));
                }
                arity(instr, 2)?;
                self.node(&instr.children[0], height)?.expect(WasmType::I32)?;
                self.labels.push(None);
                self.node(&instr.children[1], height)?;
                self.labels.pop();
                Outcome::NONE
            }
            Op::IfElse(ty) => {
                arity(instr, 3)?;
                self.node(&instr.children[0], height)?.expect(WasmType::I32)?;
                self.labels.push(*ty);
                for arm in &instr.children[1..] {
                    let out = self.node(arm, height)?;
                    if let Some(ty) = ty {
                        out.expect(*ty)?;
                    }
                }
                self.labels.pop();
                Outcome::of(*ty, false)
            }

            Op::Branch { depth } => {
                let carried = self.label(*depth)?;
                self.branch_operands(instr, height, carried, &[])?;
                Outcome::NEVER
            }
            Op::BranchIf { depth } => {
                let carried = self.label(*depth)?;
                let diverged = self.branch_operands(instr, height, carried, &[WasmType::I32])?;
                Outcome::of(carried, diverged)
            }
            Op::BranchTable { targets, default } => {
                let carried = self.label(*default)?;
                for depth in targets {
                    let other = self.label(*depth)?;
                    if other.is_some() != carried.is_some() {
                        return Err(CompileError::BranchArityMismatch {
                            expected: carried.is_some() as usize,
                            found: other.is_some() as usize,
                        });
                    }
                    if other != carried {
                        return Err(CompileError::TypeMismatch { expected: carried, found: other });
                    }
                }
                self.branch_operands(instr, height, carried, &[WasmType::I32])?;
                Outcome::NEVER
            }
            Op::Return => {
                let carried = self.function.signature.result();
                self.branch_operands(instr, height, carried, &[])?;
                Outcome::NEVER
            }

            Op::Call(target) | Op::CallImport(target) => {
                let diverged = self.operands(instr, height, &target.signature.params)?;
                Outcome::of(target.signature.result(), diverged)
            }
            Op::CallIndirect { type_index } => {
                let signature = self
                    .types
                    .get(*type_index as usize)
                    .ok_or(CompileError::UnknownType(*type_index))?;
                let mut expected = signature.params.clone();
                expected.push(WasmType::I32);
                let result = signature.result();
                Outcome::of(result, self.operands(instr, height, &expected)?)
            }
        };

        if let Some(info) = self.nodes.get_mut(id) {
            info.ty = out.ty;
            info.diverges = out.diverges;
        }
        self.max_height = self.max_height.max(height + out.ty.is_some() as u32);
        Ok(out)
    }
}

fn arity(instr: &Instruction, expected: usize) -> Result<(), CompileError> {
    if instr.children.len() != expected {
        return Err(CompileError::ChildCount {
            op: instr.op.name(),
            expected,
            found: instr.children.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Instruction as I;
    use crate::ops::NumericOp;
    use alloc::vec;

    fn function(result: Option<WasmType>, body: Vec<Instruction>) -> Function {
        Function::new("f", FunctionSignature::new(&[WasmType::I32], result), vec![WasmType::I64], body)
    }

    #[test]
    fn test_operand_slots() {
        // (i32.add (local.get 0) (i32.mul (i32.const 2) (i32.const 3)))
        let f = function(
            Some(WasmType::I32),
            vec![I::binary(
                NumericOp::I32Add,
                I::local_get(0),
                I::binary(NumericOp::I32Mul, I::i32_const(2), I::i32_const(3)),
            )],
        );
        let slots = allocate(&f, &[]).unwrap();
        let heights: Vec<u32> = slots.nodes.iter().map(|n| n.slot).collect();
        assert_eq!(heights, vec![0, 0, 1, 1, 2]);
        assert_eq!(slots.max_height, 3);
        assert!(slots.nodes.iter().all(|n| n.ty == Some(WasmType::I32)));
    }

    #[test]
    fn test_sequence_statements_share_slot() {
        let f = function(
            None,
            vec![I::block(
                None,
                vec![I::i32_const(1), I::local_set(1, I::i64_const(2)), I::i32_const(3)],
            )],
        );
        let slots = allocate(&f, &[]).unwrap();
        let heights: Vec<u32> = slots.nodes.iter().map(|n| n.slot).collect();
        assert_eq!(heights, vec![0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_type_errors() {
        let f = function(Some(WasmType::I32), vec![I::i64_const(1)]);
        assert_eq!(
            allocate(&f, &[]),
            Err(CompileError::TypeMismatch {
                expected: Some(WasmType::I32),
                found: Some(WasmType::I64)
            })
        );

        let f = function(None, vec![I::local_get(7)]);
        assert_eq!(allocate(&f, &[]), Err(CompileError::UnknownLocal(7)));

        let f = function(None, vec![I::unary(NumericOp::I32Add, I::i32_const(1))]);
        assert_eq!(
            allocate(&f, &[]),
            Err(CompileError::ChildCount { op: "i32.add", expected: 2, found: 1 })
        );

        let f = function(None, vec![I::new(Op::CallIndirect { type_index: 3 }, vec![I::i32_const(0)])]);
        assert_eq!(allocate(&f, &[]), Err(CompileError::UnknownType(3)));
    }

    #[test]
    fn test_branch_checks() {
        let f = function(None, vec![I::leaf(Op::Branch { depth: 1 })]);
        assert_eq!(allocate(&f, &[]), Err(CompileError::UnknownBranchTarget { depth: 1 }));

        // br 0 out of an i32 block without a value
        let f = function(
            Some(WasmType::I32),
            vec![I::block(Some(WasmType::I32), vec![I::leaf(Op::Branch { depth: 0 })])],
        );
        assert_eq!(
            allocate(&f, &[]),
            Err(CompileError::BranchArityMismatch { expected: 1, found: 0 })
        );

        // a diverging last statement satisfies the block type
        let f = function(
            Some(WasmType::I32),
            vec![I::block(
                Some(WasmType::I32),
                vec![I::new(Op::Branch { depth: 0 }, vec![I::i32_const(1)])],
            )],
        );
        let slots = allocate(&f, &[]).unwrap();
        assert!(slots.nodes[1].diverges);
        assert!(!slots.nodes[0].diverges);
    }

    #[test]
    fn test_loop_label_carries_nothing() {
        let f = function(
            Some(WasmType::I32),
            vec![I::looped(
                Some(WasmType::I32),
                vec![
                    I::new(Op::BranchIf { depth: 0 }, vec![I::local_get(0)]),
                    I::i32_const(1),
                ],
            )],
        );
        let slots = allocate(&f, &[]).unwrap();
        assert_eq!(slots.nodes[1].ty, None);
    }
}
