//! # Reversible Execution
//!
//! History keeps an ordered map from [`InstructionCounter`] to
//! [`MachinePatch`]. A patch starts as a minimal checkpoint (the top frame
//! and the thread status) and then accumulates reverse deltas: pre-images
//! of heap chunks on their first write and frames about to be exposed by a
//! pop. Applying the patches from newest to oldest walks the machine back
//! checkpoint by checkpoint; ordinary forward stepping covers the rest.
//!
//! ## States
//!
//! ```text
//! Disabled ──add_checkpoint──▶ Recording ◀──────────┐
//!                                  │                 │ replay done
//!                                  └── set_to_state ─▶ Reconstructing
//! ```
//!
//! Observer callbacks only record while `Recording`; applying a patch must
//! never record into another one.

mod patch;

pub use patch::{HeapPatch, MachinePatch, ThreadPatch, CHUNK_SIZE};

use alloc::collections::BTreeMap;

use log::debug;

use crate::config::MachineConfig;
use crate::error::HistoryError;
use crate::frame::Frame;
use crate::heap::Heap;
use crate::machine::{Engine, InstructionCounter};
use crate::observer::Observer;

/// Recording state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryState {
    Disabled,
    Recording,
    Reconstructing,
}

/// Checkpoints and reverse deltas of one machine.
#[derive(Debug, Clone)]
pub struct History {
    state: HistoryState,
    patches: BTreeMap<InstructionCounter, MachinePatch>,
    /// Furthest point executed since recording started.
    latest: InstructionCounter,
    interval: u64,
    limit: usize,
}

impl History {
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            state: HistoryState::Disabled,
            patches: BTreeMap::new(),
            latest: InstructionCounter::default(),
            interval: config.checkpoint_interval,
            limit: config.history_limit.max(1),
        }
    }

    pub fn state(&self) -> HistoryState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == HistoryState::Recording
    }

    pub fn checkpoint_count(&self) -> usize {
        self.patches.len()
    }

    /// Earliest point that can still be reached.
    pub fn oldest(&self) -> Option<InstructionCounter> {
        self.patches.keys().next().copied()
    }

    pub fn latest(&self) -> InstructionCounter {
        self.latest
    }

    pub fn patch(&self, counter: InstructionCounter) -> Option<&MachinePatch> {
        self.patches.get(&counter)
    }

    /// Forgets everything and stops recording.
    pub(crate) fn clear(&mut self) {
        self.state = HistoryState::Disabled;
        self.patches.clear();
        self.latest = InstructionCounter::default();
    }

    /// Starts a new patch at the engine's current counter and enables
    /// recording.
    pub(crate) fn add_checkpoint(&mut self, engine: &Engine) {
        self.patches.insert(engine.counter, MachinePatch::capture(&engine.thread));
        self.state = HistoryState::Recording;
        self.latest = self.latest.max(engine.counter);
        while self.patches.len() > self.limit {
            self.patches.pop_first();
        }
        debug!("checkpoint at {} ({} kept)", engine.counter.0, self.patches.len());
    }

    /// Bookkeeping after every recorded step: advances `latest` and adds
    /// the periodic checkpoint.
    pub(crate) fn after_step(&mut self, engine: &Engine) {
        if self.state != HistoryState::Recording {
            return;
        }
        self.latest = self.latest.max(engine.counter);
        let due = match self.patches.keys().next_back() {
            Some(last) => self.interval > 0 && engine.counter.0 - last.0 >= self.interval,
            None => true,
        };
        if due {
            self.add_checkpoint(engine);
        }
    }

    /// Moves the engine to exactly `target`.
    ///
    /// Backward targets apply patches down to the nearest checkpoint at or
    /// before `target` and replay forward from there; replay is recorded
    /// again, so the rewound timeline can be revisited.
    pub(crate) fn set_to_state(
        &mut self,
        target: InstructionCounter,
        engine: &mut Engine,
    ) -> Result<(), HistoryError> {
        if self.state == HistoryState::Disabled {
            return Err(HistoryError::NotEnabled);
        }
        if target == engine.counter {
            return Ok(());
        }
        if target > self.latest {
            return Err(HistoryError::TargetInFuture { target: target.0, latest: self.latest.0 });
        }

        if target < engine.counter {
            let oldest = self.oldest().ok_or(HistoryError::NotEnabled)?;
            if target < oldest {
                return Err(HistoryError::TargetNotInHistory { target: target.0, oldest: oldest.0 });
            }

            self.state = HistoryState::Reconstructing;
            let from = engine.counter;
            while let Some((counter, patch)) = self.patches.pop_last() {
                patch.apply(&mut engine.heap, &mut engine.thread);
                engine.counter = counter;
                if counter <= target {
                    break;
                }
            }
            self.state = HistoryState::Recording;
            self.add_checkpoint(engine);
            debug!("rolled back from {} to checkpoint {}", from.0, engine.counter.0);
        }

        while engine.counter < target {
            if engine.thread.is_finished() {
                return Err(HistoryError::CantReachTarget {
                    target: target.0,
                    reached: engine.counter.0,
                });
            }
            engine.step(self)?;
            self.after_step(engine);
        }
        Ok(())
    }

    fn recording_patch(&mut self) -> Option<&mut MachinePatch> {
        if self.state != HistoryState::Recording {
            return None;
        }
        self.patches.values_mut().next_back()
    }
}

impl Observer for History {
    fn before_heap_write(&mut self, heap: &Heap, offset: usize, len: usize) {
        if let Some(patch) = self.recording_patch() {
            patch.heap.record_write(heap, offset, len);
        }
    }

    fn before_heap_resize(&mut self, heap: &Heap, new_size: usize) {
        if let Some(patch) = self.recording_patch() {
            patch.heap.record_resize(heap, new_size);
        }
    }

    fn before_frame_pop(&mut self, frames: &[Frame]) {
        if let Some(patch) = self.recording_patch() {
            patch.thread.record_pop(frames);
        }
    }
}
