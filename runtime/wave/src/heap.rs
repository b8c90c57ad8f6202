//! # Linear Memory
//!
//! One contiguous, zero-initialized byte buffer with a hard 1 GiB ceiling.
//! Every access checks `offset + len` for overflow and against the current
//! size before touching memory.

use alloc::vec::Vec;

use crate::error::HeapError;
use crate::observer::Observer;

/// WASM page size (64 KiB).
pub const PAGE_SIZE: usize = 64 * 1024;

/// Hard upper bound for any heap (1 GiB).
pub const MAX_HEAP_SIZE: usize = 1024 * 1024 * 1024;

/// Growable, bounds-checked linear memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heap {
    bytes: Vec<u8>,
    max_size: usize,
}

impl Heap {
    /// Creates a zeroed heap of `size` bytes that may grow up to `max_size`
    /// (clamped to [`MAX_HEAP_SIZE`]).
    pub fn new(size: usize, max_size: usize) -> Result<Self, HeapError> {
        let max_size = max_size.min(MAX_HEAP_SIZE);
        if size > max_size {
            return Err(HeapError::CantChangeSize { size: 0, requested: size });
        }
        Ok(Self {
            bytes: alloc::vec![0u8; size],
            max_size,
        })
    }

    /// Creates a heap of `pages` WASM pages.
    pub fn with_pages(pages: u32, max_size: usize) -> Result<Self, HeapError> {
        let size = (pages as usize)
            .checked_mul(PAGE_SIZE)
            .ok_or(HeapError::CantChangeSize { size: 0, requested: usize::MAX })?;
        Self::new(size, max_size)
    }

    /// Current size in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Current size in whole pages.
    pub fn pages(&self) -> u32 {
        (self.bytes.len() / PAGE_SIZE) as u32
    }

    /// Maximum size in bytes.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Whole contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Extends the heap by `n` zero bytes.
    pub fn grow(&mut self, n: usize, observer: &mut dyn Observer) -> Result<(), HeapError> {
        let new_size = self
            .bytes
            .len()
            .checked_add(n)
            .filter(|&s| s <= self.max_size)
            .ok_or(HeapError::CantChangeSize { size: self.bytes.len(), requested: n })?;
        observer.before_heap_resize(self, new_size);
        self.bytes.resize(new_size, 0);
        Ok(())
    }

    /// Removes the last `n` bytes.
    pub fn shrink(&mut self, n: usize, observer: &mut dyn Observer) -> Result<(), HeapError> {
        let new_size = self
            .bytes
            .len()
            .checked_sub(n)
            .ok_or(HeapError::CantChangeSize { size: self.bytes.len(), requested: n })?;
        observer.before_heap_resize(self, new_size);
        self.bytes.truncate(new_size);
        Ok(())
    }

    /// Reads `len` bytes at `offset`.
    pub fn get_bytes(&self, offset: usize, len: usize) -> Result<&[u8], HeapError> {
        let end = self.check(offset, len)?;
        Ok(&self.bytes[offset..end])
    }

    /// Reads exactly `N` bytes at `offset`.
    pub fn read<const N: usize>(&self, offset: usize) -> Result<[u8; N], HeapError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get_bytes(offset, N)?);
        Ok(out)
    }

    /// Writes `data` at `offset`, announcing the write first.
    pub fn set_bytes(
        &mut self,
        offset: usize,
        data: &[u8],
        observer: &mut dyn Observer,
    ) -> Result<(), HeapError> {
        let end = self.check(offset, data.len())?;
        observer.before_heap_write(self, offset, data.len());
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Resets the size without notifying anyone; used by history rollback.
    pub(crate) fn restore_size(&mut self, size: usize) {
        self.bytes.resize(size, 0);
    }

    /// Writes back a pre-image without notifying anyone, clipped to the
    /// current size; used by history rollback.
    pub(crate) fn restore_bytes(&mut self, offset: usize, data: &[u8]) {
        if offset >= self.bytes.len() {
            return;
        }
        let len = data.len().min(self.bytes.len() - offset);
        self.bytes[offset..offset + len].copy_from_slice(&data[..len]);
    }

    fn check(&self, offset: usize, len: usize) -> Result<usize, HeapError> {
        let size = self.bytes.len();
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(end),
            _ => Err(HeapError::OutOfBounds { offset, len, size }),
        }
    }
}
