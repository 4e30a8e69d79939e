//! Conversion between transfer-buffer cells and managed values
//!
//! A thunk stores each incoming slot into its 8-byte cell using the slot's
//! machine type, so the value bytes always start at the cell's first byte
//! (both supported architectures are little-endian). Composites are
//! reassembled from their slots into a `Segment`; memory-passed composites
//! are copied out of the address stored in their cell.

use crate::abi::{ArgumentBinding, CallingSequence, Passing, ReturnBinding, Slot};
use crate::layout::{MemoryLayout, ScalarKind};
use crate::target::TargetError;
use crate::value::{Segment, Value};
use std::ptr;

/// Convert every argument of `sequence` from the transfer buffer at `args`
///
/// # Safety
///
/// `args` must point to a transfer buffer of at least
/// `sequence.argument_area()` bytes filled by a thunk generated for
/// `sequence`. Cells of memory-passed composites must hold valid addresses.
pub unsafe fn read_arguments(
    sequence: &CallingSequence,
    args: *const u8,
) -> Result<Vec<Value>, TargetError> {
    sequence
        .arguments()
        .iter()
        .map(|binding| read_argument(binding, args))
        .collect()
}

/// Convert one argument from the transfer buffer
///
/// # Safety
///
/// See [`read_arguments`].
pub unsafe fn read_argument(binding: &ArgumentBinding, args: *const u8) -> Result<Value, TargetError> {
    let layout = &binding.layout;
    match (&binding.passing, layout) {
        (Passing::Value(slots), MemoryLayout::Scalar(kind)) => {
            let slot = single(slots)?;
            read_scalar(*kind, args.add(slot.cell))
        }
        (Passing::Value(slots), _) => {
            let mut segment = Segment::zeroed(layout.size());
            for slot in slots {
                let bytes = segment
                    .as_bytes_mut()
                    .get_mut(slot.value_offset..slot.value_offset + slot.size)
                    .ok_or_else(|| out_of_range(slot, layout))?;
                ptr::copy_nonoverlapping(args.add(slot.cell), bytes.as_mut_ptr(), bytes.len());
            }
            Ok(Value::Segment(segment))
        }
        (Passing::Memory { slot, .. }, _) => {
            let address = args.add(slot.cell).cast::<usize>().read_unaligned() as *const u8;
            if address.is_null() {
                return Err(TargetError::Marshal(format!(
                    "argument {} ({}) arrived as a null address",
                    binding.index, layout
                )));
            }
            match layout {
                MemoryLayout::Scalar(kind) => read_scalar(*kind, address),
                _ => {
                    let mut segment = Segment::zeroed(layout.size());
                    ptr::copy_nonoverlapping(address, segment.as_bytes_mut().as_mut_ptr(), layout.size());
                    Ok(Value::Segment(segment))
                }
            }
        }
        (Passing::Empty, _) => Ok(Value::Segment(Segment::zeroed(0))),
    }
}

/// Store `value` where the return binding expects it
///
/// For register returns, `result` is the result area and every cell is
/// zeroed before the value is written. For buffer returns, `result` is the
/// caller-supplied return buffer.
///
/// # Safety
///
/// `result` must be writable for `sequence.result_area()` bytes (register
/// returns) or for the return layout's size (buffer returns).
pub unsafe fn write_return(
    sequence: &CallingSequence,
    value: &Value,
    result: *mut u8,
) -> Result<(), TargetError> {
    match sequence.ret() {
        ReturnBinding::Void => match value {
            Value::Void => Ok(()),
            other => Err(TargetError::Marshal(format!(
                "void upcall returned a {} value",
                other.value_type()
            ))),
        },
        ReturnBinding::Value { layout, slots } => {
            ptr::write_bytes(result, 0, sequence.result_area());
            match layout {
                MemoryLayout::Scalar(kind) => {
                    let slot = single(slots)?;
                    write_scalar(*kind, value, result.add(slot.cell))
                }
                _ => {
                    let segment = expect_segment(layout, value)?;
                    for slot in slots {
                        let bytes = segment
                            .as_bytes()
                            .get(slot.value_offset..slot.value_offset + slot.size)
                            .ok_or_else(|| out_of_range(slot, layout))?;
                        ptr::copy_nonoverlapping(bytes.as_ptr(), result.add(slot.cell), bytes.len());
                    }
                    Ok(())
                }
            }
        }
        ReturnBinding::Buffer { layout, .. } => match layout {
            MemoryLayout::Scalar(kind) => write_scalar(*kind, value, result),
            _ => {
                let segment = expect_segment(layout, value)?;
                ptr::copy_nonoverlapping(segment.as_bytes().as_ptr(), result, segment.len());
                Ok(())
            }
        },
    }
}

/// Bytes the failure sentinel has to clear at `result`
pub fn sentinel_len(sequence: &CallingSequence) -> usize {
    match sequence.ret() {
        ReturnBinding::Buffer { layout, .. } => layout.size(),
        _ => sequence.result_area(),
    }
}

fn single(slots: &[Slot]) -> Result<&Slot, TargetError> {
    match slots {
        [slot] => Ok(slot),
        _ => Err(TargetError::Marshal(format!(
            "scalar bound to {} slots",
            slots.len()
        ))),
    }
}

fn out_of_range(slot: &Slot, layout: &MemoryLayout) -> TargetError {
    TargetError::Marshal(format!(
        "slot bytes {}..{} fall outside `{}`",
        slot.value_offset,
        slot.value_offset + slot.size,
        layout
    ))
}

fn expect_segment<'v>(layout: &MemoryLayout, value: &'v Value) -> Result<&'v Segment, TargetError> {
    match value {
        Value::Segment(segment) if segment.len() == layout.size() => Ok(segment),
        Value::Segment(segment) => Err(TargetError::Marshal(format!(
            "returned segment has {} bytes, `{}` needs {}",
            segment.len(),
            layout,
            layout.size()
        ))),
        other => Err(TargetError::Marshal(format!(
            "expected a segment for `{}`, got {}",
            layout,
            other.value_type()
        ))),
    }
}

unsafe fn read_scalar(kind: ScalarKind, src: *const u8) -> Result<Value, TargetError> {
    let value = match kind {
        ScalarKind::Bool => Value::Bool(src.read() != 0),
        ScalarKind::I8 => Value::I8(src.cast::<i8>().read_unaligned()),
        ScalarKind::I16 => Value::I16(src.cast::<i16>().read_unaligned()),
        ScalarKind::I32 => Value::I32(src.cast::<i32>().read_unaligned()),
        ScalarKind::I64 => Value::I64(src.cast::<i64>().read_unaligned()),
        ScalarKind::F32 => Value::F32(src.cast::<f32>().read_unaligned()),
        ScalarKind::F64 => Value::F64(src.cast::<f64>().read_unaligned()),
        ScalarKind::Address => Value::Address(src.cast::<usize>().read_unaligned()),
        ScalarKind::LongDouble => {
            return Err(TargetError::Marshal("long_double has no managed form".into()));
        }
    };
    Ok(value)
}

unsafe fn write_scalar(kind: ScalarKind, value: &Value, dst: *mut u8) -> Result<(), TargetError> {
    match (kind, value) {
        (ScalarKind::Bool, Value::Bool(v)) => dst.write(u8::from(*v)),
        (ScalarKind::I8, Value::I8(v)) => dst.cast::<i8>().write_unaligned(*v),
        (ScalarKind::I16, Value::I16(v)) => dst.cast::<i16>().write_unaligned(*v),
        (ScalarKind::I32, Value::I32(v)) => dst.cast::<i32>().write_unaligned(*v),
        (ScalarKind::I64, Value::I64(v)) => dst.cast::<i64>().write_unaligned(*v),
        (ScalarKind::F32, Value::F32(v)) => dst.cast::<f32>().write_unaligned(*v),
        (ScalarKind::F64, Value::F64(v)) => dst.cast::<f64>().write_unaligned(*v),
        (ScalarKind::Address, Value::Address(v)) => dst.cast::<usize>().write_unaligned(*v),
        (kind, value) => {
            return Err(TargetError::Marshal(format!(
                "cannot return {} as {}",
                value.value_type(),
                kind.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{AbiDescriptor, CallingSequenceBuilder};
    use crate::layout::FunctionDescriptor;
    use pretty_assertions::assert_eq;

    fn put<T: Copy>(buffer: &mut [u8], offset: usize, value: T) {
        assert!(offset + std::mem::size_of::<T>() <= buffer.len());
        unsafe { buffer.as_mut_ptr().add(offset).cast::<T>().write_unaligned(value) }
    }

    #[test]
    fn test_reads_scalars_from_cells() {
        let descriptor = FunctionDescriptor::of_void(vec![
            MemoryLayout::I32,
            MemoryLayout::F64,
            MemoryLayout::BOOL,
        ]);
        let sequence = CallingSequenceBuilder::build(&descriptor, &AbiDescriptor::sysv_x86_64()).unwrap();
        let mut buffer = vec![0u8; sequence.argument_area()];
        put(&mut buffer, 0, -5i32);
        put(&mut buffer, 8, 1.5f64);
        put(&mut buffer, 16, 1u8);

        let values = unsafe { read_arguments(&sequence, buffer.as_ptr()) }.unwrap();
        assert_eq!(values, vec![Value::I32(-5), Value::F64(1.5), Value::Bool(true)]);
    }

    #[test]
    fn test_reassembles_register_composite() {
        // struct { double; int; } -> xmm piece, then integer piece carrying 4 bytes
        let layout = MemoryLayout::structure(vec![MemoryLayout::F64, MemoryLayout::I32]);
        let descriptor = FunctionDescriptor::of_void(vec![layout]);
        let sequence = CallingSequenceBuilder::build(&descriptor, &AbiDescriptor::sysv_x86_64()).unwrap();
        let mut buffer = vec![0u8; sequence.argument_area()];
        put(&mut buffer, 0, 3.25f64);
        put(&mut buffer, 8, 0x1122_3344_5566_7788u64);

        let values = unsafe { read_arguments(&sequence, buffer.as_ptr()) }.unwrap();
        let segment = values[0].as_segment().unwrap();
        assert_eq!(segment.len(), 16);
        assert_eq!(segment.get_f64(0), Some(3.25));
        assert_eq!(segment.get_i32(8), Some(0x5566_7788));
        // the integer eightbyte also carries the trailing padding
        assert_eq!(segment.get_i32(12), Some(0x1122_3344));
    }

    #[test]
    fn test_reads_memory_composite_through_address() {
        let layout = MemoryLayout::structure(vec![MemoryLayout::I64; 3]);
        let descriptor = FunctionDescriptor::of_void(vec![layout]);
        let sequence = CallingSequenceBuilder::build(&descriptor, &AbiDescriptor::sysv_x86_64()).unwrap();

        let native: [i64; 3] = [7, 8, 9];
        let mut buffer = vec![0u8; sequence.argument_area()];
        put(&mut buffer, 0, native.as_ptr() as usize);

        let values = unsafe { read_arguments(&sequence, buffer.as_ptr()) }.unwrap();
        let segment = values[0].as_segment().unwrap();
        assert_eq!(segment.get_i64(16), Some(9));
    }

    #[test]
    fn test_null_address_is_a_marshal_error() {
        let layout = MemoryLayout::structure(vec![MemoryLayout::I64; 3]);
        let descriptor = FunctionDescriptor::of_void(vec![layout]);
        let sequence = CallingSequenceBuilder::build(&descriptor, &AbiDescriptor::sysv_x86_64()).unwrap();
        let buffer = vec![0u8; sequence.argument_area()];
        let err = unsafe { read_arguments(&sequence, buffer.as_ptr()) }.unwrap_err();
        assert!(matches!(err, TargetError::Marshal(_)));
    }

    #[test]
    fn test_writes_scalar_return_and_clears_area() {
        let descriptor = FunctionDescriptor::of(MemoryLayout::I32, vec![]);
        let sequence = CallingSequenceBuilder::build(&descriptor, &AbiDescriptor::sysv_x86_64()).unwrap();
        let mut area = [0xffu8; 16];
        unsafe { write_return(&sequence, &Value::I32(42), area.as_mut_ptr()) }.unwrap();
        assert_eq!(i64::from_ne_bytes(area[..8].try_into().unwrap()), 42);
        assert_eq!(&area[8..], &[0u8; 8]);
    }

    #[test]
    fn test_writes_split_composite_return() {
        let layout = MemoryLayout::structure(vec![MemoryLayout::I32, MemoryLayout::F32, MemoryLayout::F64]);
        let descriptor = FunctionDescriptor::of(layout, vec![]);
        let sequence = CallingSequenceBuilder::build(&descriptor, &AbiDescriptor::sysv_x86_64()).unwrap();

        let mut segment = Segment::zeroed(16);
        segment.set_i32(0, 5);
        segment.set_f32(4, 0.5);
        segment.set_f64(8, -2.0);
        let mut area = [0u8; 16];
        unsafe { write_return(&sequence, &Value::Segment(segment), area.as_mut_ptr()) }.unwrap();

        assert_eq!(i32::from_ne_bytes(area[0..4].try_into().unwrap()), 5);
        assert_eq!(f32::from_ne_bytes(area[4..8].try_into().unwrap()), 0.5);
        assert_eq!(f64::from_ne_bytes(area[8..16].try_into().unwrap()), -2.0);
    }

    #[test]
    fn test_buffer_return_copies_whole_segment() {
        let layout = MemoryLayout::structure(vec![MemoryLayout::I64; 3]);
        let descriptor = FunctionDescriptor::of(layout, vec![]);
        let sequence = CallingSequenceBuilder::build(&descriptor, &AbiDescriptor::sysv_x86_64()).unwrap();
        assert_eq!(sentinel_len(&sequence), 24);

        let mut segment = Segment::zeroed(24);
        segment.set_i64(16, 99);
        let mut out = [0i64; 3];
        unsafe { write_return(&sequence, &Value::Segment(segment), out.as_mut_ptr().cast()) }.unwrap();
        assert_eq!(out, [0, 0, 99]);
    }

    #[test]
    fn test_return_type_mismatches_are_rejected() {
        let descriptor = FunctionDescriptor::of(MemoryLayout::I32, vec![]);
        let sequence = CallingSequenceBuilder::build(&descriptor, &AbiDescriptor::sysv_x86_64()).unwrap();
        let mut area = [0u8; 16];
        let err = unsafe { write_return(&sequence, &Value::F64(1.0), area.as_mut_ptr()) }.unwrap_err();
        assert_eq!(err, TargetError::Marshal("cannot return f64 as i32".into()));

        let layout = MemoryLayout::structure(vec![MemoryLayout::I64; 2]);
        let descriptor = FunctionDescriptor::of(layout, vec![]);
        let sequence = CallingSequenceBuilder::build(&descriptor, &AbiDescriptor::sysv_x86_64()).unwrap();
        let short = Value::Segment(Segment::zeroed(8));
        assert!(unsafe { write_return(&sequence, &short, area.as_mut_ptr()) }.is_err());
    }
}
