//! Operand stack of untyped 64-bit cells.

use alloc::vec::Vec;

use crate::error::VmError;

/// A value that lives in one stack cell.
///
/// 32-bit values occupy the low half of the cell; floats travel by bit
/// pattern so NaN payloads survive untouched.
pub trait Cell: Copy {
    fn from_cell(cell: u64) -> Self;
    fn into_cell(self) -> u64;
}

impl Cell for u64 {
    fn from_cell(cell: u64) -> Self {
        cell
    }

    fn into_cell(self) -> u64 {
        self
    }
}

impl Cell for i64 {
    fn from_cell(cell: u64) -> Self {
        cell as i64
    }

    fn into_cell(self) -> u64 {
        self as u64
    }
}

impl Cell for u32 {
    fn from_cell(cell: u64) -> Self {
        cell as u32
    }

    fn into_cell(self) -> u64 {
        self as u64
    }
}

impl Cell for i32 {
    fn from_cell(cell: u64) -> Self {
        cell as u32 as i32
    }

    fn into_cell(self) -> u64 {
        self as u32 as u64
    }
}

impl Cell for f32 {
    fn from_cell(cell: u64) -> Self {
        f32::from_bits(cell as u32)
    }

    fn into_cell(self) -> u64 {
        self.to_bits() as u64
    }
}

impl Cell for f64 {
    fn from_cell(cell: u64) -> Self {
        f64::from_bits(cell)
    }

    fn into_cell(self) -> u64 {
        self.to_bits()
    }
}

impl Cell for bool {
    fn from_cell(cell: u64) -> Self {
        cell as u32 != 0
    }

    fn into_cell(self) -> u64 {
        self as u64
    }
}

/// LIFO stack of raw cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueStack {
    cells: Vec<u64>,
}

impl ValueStack {
    pub fn new() -> Self {
        Self { cells: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[u64] {
        &self.cells
    }

    pub fn push<T: Cell>(&mut self, value: T) {
        self.cells.push(value.into_cell());
    }

    pub fn pop<T: Cell>(&mut self) -> Result<T, VmError> {
        self.cells.pop().map(T::from_cell).ok_or(VmError::StackUnderflow)
    }

    pub fn peek<T: Cell>(&self) -> Result<T, VmError> {
        self.cells.last().copied().map(T::from_cell).ok_or(VmError::StackUnderflow)
    }

    /// Removes the top `count` cells, preserving their order.
    pub fn pop_n(&mut self, count: usize) -> Result<Vec<u64>, VmError> {
        let start = self.cells.len().checked_sub(count).ok_or(VmError::StackUnderflow)?;
        Ok(self.cells.split_off(start))
    }

    /// Cuts the stack down to `height` cells.
    pub fn truncate(&mut self, height: usize) -> Result<(), VmError> {
        if height > self.cells.len() {
            return Err(VmError::InvalidStackHeight { height, len: self.cells.len() });
        }
        self.cells.truncate(height);
        Ok(())
    }
}
