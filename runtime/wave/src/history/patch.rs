//! Reverse deltas collected between two checkpoints.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::frame::Frame;
use crate::heap::Heap;
use crate::thread::{Thread, ThreadStatus};

/// Granularity of heap pre-images.
pub const CHUNK_SIZE: usize = 64;

/// Heap contents as they were at the checkpoint, for every chunk written
/// since.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapPatch {
    /// Heap size at the checkpoint, once the heap has been resized.
    original_size: Option<usize>,
    /// First pre-image of each touched chunk, keyed by chunk offset.
    chunks: BTreeMap<usize, Vec<u8>>,
}

impl HeapPatch {
    /// Saves the chunks covering `[offset, offset + len)` that have no
    /// pre-image yet.
    pub(crate) fn record_write(&mut self, heap: &Heap, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        let first = offset / CHUNK_SIZE;
        let last = offset.saturating_add(len - 1) / CHUNK_SIZE;
        for chunk in first..=last {
            let start = chunk * CHUNK_SIZE;
            if self.chunks.contains_key(&start) {
                continue;
            }
            let end = (start + CHUNK_SIZE).min(heap.size());
            if let Some(bytes) = heap.as_bytes().get(start..end) {
                self.chunks.insert(start, bytes.to_vec());
            }
        }
    }

    /// Saves the size, and the tail a shrink is about to cut off.
    pub(crate) fn record_resize(&mut self, heap: &Heap, new_size: usize) {
        self.original_size.get_or_insert(heap.size());
        if new_size < heap.size() {
            self.record_write(heap, new_size, heap.size() - new_size);
        }
    }

    /// Puts the size back first, then the saved bytes.
    pub(crate) fn apply(&self, heap: &mut Heap) {
        if let Some(size) = self.original_size {
            heap.restore_size(size);
        }
        for (&offset, bytes) in &self.chunks {
            heap.restore_bytes(offset, bytes);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.original_size.is_none() && self.chunks.is_empty()
    }

    /// Bytes of pre-image held.
    pub fn recorded_bytes(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }
}

/// The part of the call stack that changed since the checkpoint.
///
/// Frames below `base_depth` are untouched. Only the top frame can change,
/// so a frame is saved just before it first becomes the top: at the
/// checkpoint, or when the frame above it is popped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPatch {
    base_depth: usize,
    frames: Vec<Frame>,
    status: ThreadStatus,
}

impl ThreadPatch {
    pub(crate) fn capture(thread: &Thread) -> Self {
        let base_depth = thread.depth().saturating_sub(1);
        Self {
            base_depth,
            frames: thread.frames()[base_depth..].to_vec(),
            status: thread.status().clone(),
        }
    }

    /// `frames` is the stack right before its last frame is popped.
    pub(crate) fn record_pop(&mut self, frames: &[Frame]) {
        let Some(new_top) = frames.len().checked_sub(2) else {
            return;
        };
        if new_top < self.base_depth {
            if let Some(frame) = frames.get(new_top) {
                self.frames.insert(0, frame.clone());
                self.base_depth = new_top;
            }
        }
    }

    pub(crate) fn apply(&self, thread: &mut Thread) {
        thread.restore(self.base_depth, &self.frames, &self.status);
    }

    /// Depth below which the stack is known unchanged.
    pub fn base_depth(&self) -> usize {
        self.base_depth
    }

    pub fn saved_frames(&self) -> usize {
        self.frames.len()
    }
}

/// Everything needed to rewind the machine to one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachinePatch {
    pub heap: HeapPatch,
    pub thread: ThreadPatch,
}

impl MachinePatch {
    pub(crate) fn capture(thread: &Thread) -> Self {
        Self {
            heap: HeapPatch::default(),
            thread: ThreadPatch::capture(thread),
        }
    }

    pub(crate) fn apply(&self, heap: &mut Heap, thread: &mut Thread) {
        self.heap.apply(heap);
        self.thread.apply(thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionIndex;
    use crate::observer::Unobserved;
    use crate::Trap;

    #[test]
    fn test_heap_patch_keeps_first_pre_image() {
        let mut heap = Heap::new(256, 512).unwrap();
        heap.set_bytes(0, &[1; 256], &mut Unobserved).unwrap();
        let original = heap.clone();

        let mut patch = HeapPatch::default();
        patch.record_write(&heap, 60, 8);
        heap.set_bytes(60, &[2; 8], &mut Unobserved).unwrap();
        patch.record_write(&heap, 62, 2);
        heap.set_bytes(62, &[3; 2], &mut Unobserved).unwrap();
        assert_eq!(patch.recorded_bytes(), 128);

        patch.apply(&mut heap);
        assert_eq!(heap, original);
    }

    #[test]
    fn test_heap_patch_undoes_resizes() {
        let mut heap = Heap::new(128, 512).unwrap();
        heap.set_bytes(100, &[7; 28], &mut Unobserved).unwrap();
        let original = heap.clone();

        let mut patch = HeapPatch::default();
        patch.record_resize(&heap, 64);
        heap.shrink(64, &mut Unobserved).unwrap();
        patch.record_resize(&heap, 320);
        heap.grow(256, &mut Unobserved).unwrap();
        patch.record_write(&heap, 200, 4);
        heap.set_bytes(200, &[9; 4], &mut Unobserved).unwrap();

        patch.apply(&mut heap);
        assert_eq!(heap, original);
    }

    #[test]
    fn test_thread_patch_saves_frames_as_they_surface() {
        let mut thread = Thread::new(8);
        for i in 0..3 {
            thread.push_frame(Frame::new(FunctionIndex(i), 1, &[i as u64])).unwrap();
        }
        let original = thread.clone();
        let mut patch = ThreadPatch::capture(&thread);
        assert_eq!((patch.base_depth(), patch.saved_frames()), (2, 1));

        patch.record_pop(thread.frames());
        thread.finish_frame(Some(5), &mut Unobserved).unwrap();
        patch.record_pop(thread.frames());
        thread.trap(Trap::Unreachable, &mut Unobserved);
        assert_eq!((patch.base_depth(), patch.saved_frames()), (0, 3));

        patch.apply(&mut thread);
        assert_eq!(thread, original);
    }
}
