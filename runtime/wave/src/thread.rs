//! # Threads
//!
//! A call stack of [`Frame`]s plus completion state. The thread steps its
//! top frame and carries out the calls and returns the frame asks for.
//! Frames are only ever discarded through [`Thread::finish_frame`] and
//! [`Thread::trap`], both of which announce each pop to the observer first.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;

use crate::error::{Trap, VmError};
use crate::frame::{Action, Frame, StepContext, StepError};
use crate::function::{CompiledFunction, FunctionIndex};
use crate::heap::Heap;
use crate::observer::Observer;
use crate::{WasmType, WasmValue};

/// Completion state of a thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadStatus {
    pub finished: bool,
    pub trap: Option<Trap>,
    /// Empty unless the thread trapped.
    pub trap_reason: String,
    /// Raw result cell of the entry function.
    pub result: Option<u64>,
    /// Declared result type of the entry function.
    pub result_type: Option<WasmType>,
}

/// Result of stepping a thread once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// More instructions remain.
    Running,
    /// The entry function returned.
    Finished,
    /// The step trapped; the call stack is gone.
    Trapped(Trap),
}

/// Call stack of one guest thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    frames: Vec<Frame>,
    status: ThreadStatus,
    max_depth: usize,
}

impl Thread {
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::new(),
            status: ThreadStatus::default(),
            max_depth,
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn top_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn status(&self) -> &ThreadStatus {
        &self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status.finished
    }

    pub fn got_trap(&self) -> bool {
        self.status.trap.is_some()
    }

    pub fn trap_reason(&self) -> &str {
        &self.status.trap_reason
    }

    /// Program result, typed by the entry function's signature.
    pub fn result(&self) -> Option<WasmValue> {
        match (self.status.result, self.status.result_type) {
            (Some(cell), Some(ty)) => Some(WasmValue::from_cell(ty, cell)),
            _ => None,
        }
    }

    /// Resets the thread and enters `index` with `params`.
    pub fn enter_function(
        &mut self,
        functions: &[Arc<CompiledFunction>],
        index: FunctionIndex,
        params: &[WasmValue],
    ) -> Result<(), VmError> {
        let function = functions.get(index.as_usize()).ok_or(VmError::UnknownFunction)?;
        let signature = function.signature();
        let matches = signature.params.len() == params.len()
            && signature.params.iter().zip(params).all(|(ty, value)| value.value_type() == *ty);
        if !matches {
            return Err(VmError::InvalidCallParameters);
        }

        debug!("entering {}.{} with {} params", function.module(), function.name(), params.len());

        let cells: Vec<u64> = params.iter().map(|value| value.to_cell()).collect();
        self.frames.clear();
        self.status = ThreadStatus {
            result_type: signature.result(),
            ..ThreadStatus::default()
        };
        self.push_frame(Frame::new(index, function.local_count(), &cells))
            .map_err(|_| VmError::CallStackExhausted)
    }

    /// Pushes a callee frame, refusing past the maximum call depth.
    pub fn push_frame(&mut self, frame: Frame) -> Result<(), Trap> {
        if self.frames.len() >= self.max_depth {
            return Err(Trap::CallStackExhausted);
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pops the top frame and delivers `result` to the caller, or finishes
    /// the thread if there is none.
    pub fn finish_frame(
        &mut self,
        result: Option<u64>,
        observer: &mut dyn Observer,
    ) -> Result<(), VmError> {
        if self.frames.is_empty() {
            return Err(VmError::NoActiveFrame);
        }
        observer.before_frame_pop(&self.frames);
        self.frames.pop();

        match self.frames.last_mut() {
            Some(caller) => {
                if let Some(cell) = result {
                    caller.push_result(cell);
                }
            }
            None => {
                debug!("thread finished");
                self.status.finished = true;
                self.status.result = result;
            }
        }
        Ok(())
    }

    /// Unwinds every frame and records `trap` as the reason for finishing.
    pub fn trap(&mut self, trap: Trap, observer: &mut dyn Observer) {
        debug!("trap at depth {}: {}", self.frames.len(), trap);
        while !self.frames.is_empty() {
            observer.before_frame_pop(&self.frames);
            self.frames.pop();
        }
        self.status.finished = true;
        self.status.trap = Some(trap);
        self.status.trap_reason = trap.to_string();
    }

    /// Executes one instruction of the top frame.
    pub fn step(
        &mut self,
        functions: &[Arc<CompiledFunction>],
        tables: &[Vec<Option<FunctionIndex>>],
        heap: &mut Heap,
        observer: &mut dyn Observer,
    ) -> Result<StepOutcome, VmError> {
        if self.status.finished {
            return Err(VmError::ThreadFinished);
        }
        let frame = self.frames.last_mut().ok_or(VmError::NoActiveFrame)?;
        let function = functions.get(frame.function().as_usize()).ok_or(VmError::UnknownFunction)?;

        let mut ctx = StepContext {
            functions,
            tables,
            heap,
            observer: &mut *observer,
        };
        let action = match frame.step(function, &mut ctx) {
            Ok(action) => action,
            Err(StepError::Trap(trap)) => {
                self.trap(trap, observer);
                return Ok(StepOutcome::Trapped(trap));
            }
            Err(StepError::Fatal(e)) => return Err(e),
        };

        match action {
            Action::Continue => {}
            Action::Call { callee, params } => {
                let target = functions.get(callee.as_usize()).ok_or(VmError::UnknownFunction)?;
                let frame = Frame::new(callee, target.local_count(), &params);
                if let Err(trap) = self.push_frame(frame) {
                    self.trap(trap, observer);
                    return Ok(StepOutcome::Trapped(trap));
                }
            }
            Action::Return(result) => self.finish_frame(result, observer)?,
        }

        Ok(if self.status.finished {
            StepOutcome::Finished
        } else {
            StepOutcome::Running
        })
    }

    /// Puts back the frames at and above `base_depth` and the status;
    /// used by history rollback.
    pub(crate) fn restore(&mut self, base_depth: usize, frames: &[Frame], status: &ThreadStatus) {
        self.frames.truncate(base_depth);
        self.frames.extend_from_slice(frames);
        self.status = status.clone();
    }
}
