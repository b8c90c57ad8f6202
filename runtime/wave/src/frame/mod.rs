//! # Execution Frames
//!
//! One activation record per call: an instruction pointer into the callee's
//! bytecode, its local cells, and its operand stack.
//!
//! [`Frame::step`] decodes exactly one instruction, moves the instruction
//! pointer past it (or to the branch target), and performs it. Anything
//! that changes the call stack is reported back to the thread as an
//! [`Action`] instead of being done here.

mod float;
mod memory;
mod numeric;
mod stack;

pub use stack::{Cell, ValueStack};

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::bytecode::{
    BranchTarget, ByteCode, Opcode, Operand, BRANCH_ENTRY_WIDTH, OPCODE_WIDTH,
};
use crate::error::{CodeError, Trap, VmError};
use crate::function::{CompiledFunction, FunctionIndex};
use crate::heap::{Heap, PAGE_SIZE};
use crate::observer::Observer;

/// What the thread has to do after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    /// Keep stepping this frame.
    Continue,
    /// Push a frame for `callee` with `params` as its leading locals.
    Call { callee: FunctionIndex, params: Vec<u64> },
    /// Pop this frame, handing `Option<cell>` to the caller.
    Return(Option<u64>),
}

/// Why a step did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StepError {
    /// Guest-visible trap; ends the thread.
    Trap(Trap),
    /// Core invariant violated; propagated to the caller.
    Fatal(VmError),
}

impl From<Trap> for StepError {
    fn from(trap: Trap) -> Self {
        StepError::Trap(trap)
    }
}

impl From<VmError> for StepError {
    fn from(e: VmError) -> Self {
        StepError::Fatal(e)
    }
}

impl From<CodeError> for StepError {
    fn from(e: CodeError) -> Self {
        StepError::Fatal(VmError::Code(e))
    }
}

/// Machine state a frame may touch while stepping.
pub(crate) struct StepContext<'a> {
    pub functions: &'a [Arc<CompiledFunction>],
    pub tables: &'a [Vec<Option<FunctionIndex>>],
    pub heap: &'a mut Heap,
    pub observer: &'a mut dyn Observer,
}

/// Sequential reader over inline operands.
struct Operands<'a> {
    code: &'a ByteCode,
    pos: usize,
}

impl Operands<'_> {
    fn read<T: Operand>(&mut self) -> Result<T, CodeError> {
        let value = self.code.get(self.pos)?;
        self.pos += T::WIDTH;
        Ok(value)
    }

    fn target(&mut self) -> Result<BranchTarget, CodeError> {
        let target = BranchTarget::read(self.code, self.pos)?;
        self.pos += BranchTarget::WIDTH;
        Ok(target)
    }
}

/// A function activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    function: FunctionIndex,
    ip: usize,
    locals: Vec<u64>,
    stack: ValueStack,
}

impl Frame {
    /// Creates a frame at the start of `function` with `params` copied into
    /// its leading locals and the rest zeroed.
    pub fn new(function: FunctionIndex, local_count: usize, params: &[u64]) -> Self {
        let mut locals = alloc::vec![0u64; local_count.max(params.len())];
        locals[..params.len()].copy_from_slice(params);
        Self {
            function,
            ip: 0,
            locals,
            stack: ValueStack::new(),
        }
    }

    pub fn function(&self) -> FunctionIndex {
        self.function
    }

    /// Bytecode address of the next instruction.
    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn locals(&self) -> &[u64] {
        &self.locals
    }

    pub fn stack(&self) -> &ValueStack {
        &self.stack
    }

    /// Receives a callee's result.
    pub(crate) fn push_result(&mut self, cell: u64) {
        self.stack.push(cell);
    }

    fn local(&mut self, index: u32) -> Result<&mut u64, VmError> {
        self.locals.get_mut(index as usize).ok_or(VmError::InvalidLocal(index))
    }

    /// Moves the carried value (if any) down to the label's height.
    fn branch(&mut self, target: BranchTarget) -> Result<usize, VmError> {
        let carried = match target.arity {
            0 => None,
            _ => Some(self.stack.pop::<u64>()?),
        };
        self.stack.truncate(target.height as usize)?;
        if let Some(value) = carried {
            self.stack.push(value);
        }
        Ok(target.address as usize)
    }

    /// Executes the instruction at the instruction pointer.
    pub(crate) fn step(
        &mut self,
        function: &CompiledFunction,
        ctx: &mut StepContext<'_>,
    ) -> Result<Action, StepError> {
        let code = function.code().code();
        let pos = self.ip;
        let opcode = code.opcode(pos)?;

        #[cfg(feature = "debug")]
        log::trace!(
            "{}@{:#06x}: {} (stack {})",
            function.name(),
            pos,
            opcode.name(),
            self.stack.len()
        );

        let mut operands = Operands { code, pos: pos + OPCODE_WIDTH };
        let mut jump = None;

        let action = match opcode {
            Opcode::Unreachable => return Err(Trap::Unreachable.into()),
            Opcode::Nop | Opcode::Label => Action::Continue,

            Opcode::Const32 => {
                let bits: u32 = operands.read()?;
                self.stack.push(bits);
                Action::Continue
            }
            Opcode::Const64 => {
                let bits: u64 = operands.read()?;
                self.stack.push(bits);
                Action::Continue
            }

            Opcode::LocalGet => {
                let value = *self.local(operands.read()?)?;
                self.stack.push(value);
                Action::Continue
            }
            Opcode::LocalSet => {
                let index = operands.read()?;
                let value = self.stack.pop::<u64>()?;
                *self.local(index)? = value;
                Action::Continue
            }
            Opcode::LocalTee => {
                let index = operands.read()?;
                let value = self.stack.peek::<u64>()?;
                *self.local(index)? = value;
                Action::Continue
            }

            Opcode::Drop => {
                self.stack.pop::<u64>()?;
                Action::Continue
            }
            Opcode::Select => {
                let condition = self.stack.pop::<bool>()?;
                let second = self.stack.pop::<u64>()?;
                let first = self.stack.pop::<u64>()?;
                self.stack.push(if condition { first } else { second });
                Action::Continue
            }

            Opcode::Jump => {
                let address: u32 = operands.read()?;
                jump = Some(address as usize);
                Action::Continue
            }
            Opcode::JumpIfNot => {
                let address: u32 = operands.read()?;
                if !self.stack.pop::<bool>()? {
                    jump = Some(address as usize);
                }
                Action::Continue
            }
            Opcode::Branch => {
                let target = operands.target()?;
                jump = Some(self.branch(target)?);
                Action::Continue
            }
            Opcode::BranchIf => {
                let target = operands.target()?;
                if self.stack.pop::<bool>()? {
                    jump = Some(self.branch(target)?);
                }
                Action::Continue
            }
            Opcode::BranchTable => {
                let count: u32 = operands.read()?;
                let index = self.stack.pop::<u32>()?;
                // the entry after the last case is the default
                let entry = operands.pos + index.min(count) as usize * BRANCH_ENTRY_WIDTH;
                let target = BranchTarget::read(code, entry)?;
                jump = Some(self.branch(target)?);
                Action::Continue
            }

            Opcode::Return | Opcode::End => {
                let arity: u8 = operands.read()?;
                let result = match arity {
                    0 => None,
                    _ => Some(self.stack.pop::<u64>()?),
                };
                Action::Return(result)
            }

            Opcode::Call | Opcode::CallImport => {
                let callee: u32 = operands.read()?;
                let count: u32 = operands.read()?;
                let params = self.stack.pop_n(count as usize)?;
                Action::Call { callee: FunctionIndex(callee), params }
            }
            Opcode::CallIndirect => {
                let table: u32 = operands.read()?;
                let signature: u32 = operands.read()?;
                let count: u32 = operands.read()?;
                let index = self.stack.pop::<i32>()?;

                let entries = ctx.tables.get(table as usize).ok_or(VmError::InvalidTable(table))?;
                let callee = usize::try_from(index)
                    .ok()
                    .and_then(|i| entries.get(i).copied().flatten())
                    .ok_or(Trap::UndefinedTableIndex)?;
                let target = ctx.functions.get(callee.as_usize()).ok_or(VmError::UnknownFunction)?;
                if target.signature_id() != signature {
                    return Err(Trap::IndirectCallMismatch.into());
                }

                let params = self.stack.pop_n(count as usize)?;
                Action::Call { callee, params }
            }

            Opcode::MemorySize => {
                self.stack.push(ctx.heap.pages());
                Action::Continue
            }
            Opcode::MemoryGrow => {
                let delta = self.stack.pop::<u32>()?;
                let old = ctx.heap.pages();
                let result = match (delta as usize).checked_mul(PAGE_SIZE) {
                    Some(bytes) if ctx.heap.grow(bytes, &mut *ctx.observer).is_ok() => old as i32,
                    _ => -1,
                };
                self.stack.push(result);
                Action::Continue
            }

            Opcode::Load(op) => {
                let offset: u32 = operands.read()?;
                let base = self.stack.pop::<u32>()?;
                let address = effective_address(base, offset)?;
                let cell = memory::load(op, ctx.heap, address)?;
                self.stack.push(cell);
                Action::Continue
            }
            Opcode::Store(op) => {
                let offset: u32 = operands.read()?;
                let value = self.stack.pop::<u64>()?;
                let base = self.stack.pop::<u32>()?;
                let address = effective_address(base, offset)?;
                memory::store(op, ctx.heap, address, value, &mut *ctx.observer)?;
                Action::Continue
            }

            Opcode::Numeric(op) => {
                numeric::execute(op, &mut self.stack)?;
                Action::Continue
            }
        };

        self.ip = jump.unwrap_or(operands.pos);
        Ok(action)
    }
}

/// `base + offset` without 32-bit wraparound.
fn effective_address(base: u32, offset: u32) -> Result<usize, Trap> {
    usize::try_from(base as u64 + offset as u64).map_err(|_| Trap::OutOfBounds)
}
