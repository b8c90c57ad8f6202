//! Linear-memory loads and stores.

use crate::error::Trap;
use crate::heap::Heap;
use crate::observer::Observer;
use crate::ops::{LoadOp, StoreOp};

/// Reads the value `op` loads from `address`, extended to a full cell.
pub(crate) fn load(op: LoadOp, heap: &Heap, address: usize) -> Result<u64, Trap> {
    let cell = match op {
        LoadOp::I32Load | LoadOp::F32Load | LoadOp::I64Load32U => {
            u32::from_le_bytes(read(heap, address)?) as u64
        }
        LoadOp::I64Load | LoadOp::F64Load => u64::from_le_bytes(read(heap, address)?),
        LoadOp::I32Load8S => i8::from_le_bytes(read(heap, address)?) as i32 as u32 as u64,
        LoadOp::I32Load8U | LoadOp::I64Load8U => u8::from_le_bytes(read(heap, address)?) as u64,
        LoadOp::I32Load16S => i16::from_le_bytes(read(heap, address)?) as i32 as u32 as u64,
        LoadOp::I32Load16U | LoadOp::I64Load16U => {
            u16::from_le_bytes(read(heap, address)?) as u64
        }
        LoadOp::I64Load8S => i8::from_le_bytes(read(heap, address)?) as i64 as u64,
        LoadOp::I64Load16S => i16::from_le_bytes(read(heap, address)?) as i64 as u64,
        LoadOp::I64Load32S => i32::from_le_bytes(read(heap, address)?) as i64 as u64,
    };
    Ok(cell)
}

/// Writes the low `op.width()` bytes of `cell` at `address`.
pub(crate) fn store(
    op: StoreOp,
    heap: &mut Heap,
    address: usize,
    cell: u64,
    observer: &mut dyn Observer,
) -> Result<(), Trap> {
    let bytes = cell.to_le_bytes();
    heap.set_bytes(address, &bytes[..op.width()], observer)
        .map_err(|_| Trap::OutOfBounds)
}

fn read<const N: usize>(heap: &Heap, address: usize) -> Result<[u8; N], Trap> {
    heap.read::<N>(address).map_err(|_| Trap::OutOfBounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::Unobserved;

    #[test]
    fn test_narrow_loads_extend() {
        let mut heap = Heap::new(16, 16).unwrap();
        heap.set_bytes(0, &[0x80, 0xFF, 0xFF, 0xFF], &mut Unobserved).unwrap();

        assert_eq!(load(LoadOp::I32Load8S, &heap, 0), Ok(0xFFFF_FF80));
        assert_eq!(load(LoadOp::I32Load8U, &heap, 0), Ok(0x80));
        assert_eq!(load(LoadOp::I32Load16S, &heap, 0), Ok(0xFFFF_FF80));
        assert_eq!(load(LoadOp::I64Load8S, &heap, 0), Ok(0xFFFF_FFFF_FFFF_FF80));
        assert_eq!(load(LoadOp::I64Load16U, &heap, 0), Ok(0xFF80));
        assert_eq!(load(LoadOp::I64Load32S, &heap, 0), Ok(0xFFFF_FFFF_FFFF_FF80));
        assert_eq!(load(LoadOp::I64Load32U, &heap, 0), Ok(0xFFFF_FF80));
    }

    #[test]
    fn test_store_writes_only_its_width() {
        let mut heap = Heap::new(8, 8).unwrap();
        store(StoreOp::I64Store16, &mut heap, 2, 0x1234_5678, &mut Unobserved).unwrap();
        assert_eq!(heap.as_bytes(), &[0, 0, 0x78, 0x56, 0, 0, 0, 0]);
        store(StoreOp::F64Store, &mut heap, 0, 1.5f64.to_bits(), &mut Unobserved).unwrap();
        assert_eq!(load(LoadOp::F64Load, &heap, 0), Ok(1.5f64.to_bits()));
    }

    #[test]
    fn test_out_of_bounds() {
        let mut heap = Heap::new(8, 8).unwrap();
        assert_eq!(load(LoadOp::I64Load, &heap, 1), Err(Trap::OutOfBounds));
        assert_eq!(load(LoadOp::I32Load8U, &heap, 8), Err(Trap::OutOfBounds));
        assert_eq!(
            store(StoreOp::I32Store, &mut heap, 5, 0, &mut Unobserved),
            Err(Trap::OutOfBounds)
        );
        assert_eq!(heap.as_bytes(), &[0; 8]);
    }
}
