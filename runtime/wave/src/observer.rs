//! # Mutation Observation
//!
//! The heap and the thread announce destructive changes before they happen,
//! so that [`History`](crate::history::History) can capture the pre-image.
//! The observer is passed down the call chain explicitly; nothing is stored
//! in global or thread-local state.

use crate::frame::Frame;
use crate::heap::Heap;

/// Receives notifications ahead of destructive mutations.
pub trait Observer {
    /// `len` bytes at `offset` are about to be overwritten.
    fn before_heap_write(&mut self, _heap: &Heap, _offset: usize, _len: usize) {}

    /// The heap is about to change size to `new_size`.
    fn before_heap_resize(&mut self, _heap: &Heap, _new_size: usize) {}

    /// The last frame of `frames` is about to be discarded.
    fn before_frame_pop(&mut self, _frames: &[Frame]) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unobserved;

impl Observer for Unobserved {}
