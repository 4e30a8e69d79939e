//! Layout classification
//!
//! Maps one layout to the register pieces it needs under an ABI, or tells
//! the builder it has to travel in memory. Placement (which register, which
//! stack offset) is the builder's job.

use super::{AbiDescriptor, CompositeClassifier, RegClass, SlotType};
use crate::layout::{MemoryLayout, ScalarKind};

/// A register-sized part of a composite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Piece {
    pub class: RegClass,
    pub ty: SlotType,
    /// Byte offset of the piece within the composite
    pub offset: usize,
    /// Bytes of the composite the piece covers
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Classification {
    Scalar(Piece),
    /// Zero-sized composite
    Empty,
    /// Composite that may travel in registers
    Pieces(Vec<Piece>),
    /// Composite above the ABI's register threshold
    Memory,
}

/// Classify `layout` for `abi`; `Err` carries the reason it has no mapping
pub(crate) fn classify(layout: &MemoryLayout, abi: &AbiDescriptor) -> Result<Classification, String> {
    if let MemoryLayout::Scalar(kind) = layout {
        return scalar_piece(*kind).map(Classification::Scalar);
    }

    let Some(size) = layout.checked_size() else {
        return Err("size overflows the address space".to_string());
    };
    if let Some(offset) = layout.offset_of(ScalarKind::LongDouble) {
        return Err(format!(
            "member `{}` at offset {} has no register class",
            ScalarKind::LongDouble.name(),
            offset
        ));
    }
    if size == 0 {
        return Ok(Classification::Empty);
    }

    // Only composites that could travel in registers are flattened
    let register_bound = abi
        .max_register_composite()
        .max(abi.max_float_aggregate() * ScalarKind::F64.size());
    if size > register_bound {
        return Ok(Classification::Memory);
    }
    let scalars = layout.scalars();

    let classification = match abi.classifier() {
        CompositeClassifier::SysV => {
            if size > abi.max_register_composite() {
                Classification::Memory
            } else {
                Classification::Pieces(eightbytes(&scalars, size))
            }
        }
        CompositeClassifier::Aapcs64 => {
            if let Some(pieces) = float_aggregate(&scalars, size, abi.max_float_aggregate()) {
                Classification::Pieces(pieces)
            } else if size > abi.max_register_composite() {
                Classification::Memory
            } else {
                Classification::Pieces(doublewords(size))
            }
        }
        CompositeClassifier::Win64 => {
            if size <= abi.max_register_composite() && size.is_power_of_two() {
                Classification::Pieces(vec![Piece {
                    class: RegClass::Integer,
                    ty: SlotType::I64,
                    offset: 0,
                    size,
                }])
            } else {
                Classification::Memory
            }
        }
    };
    Ok(classification)
}

pub(crate) fn scalar_piece(kind: ScalarKind) -> Result<Piece, String> {
    let (class, ty) = match kind {
        ScalarKind::Bool | ScalarKind::I8 => (RegClass::Integer, SlotType::I8),
        ScalarKind::I16 => (RegClass::Integer, SlotType::I16),
        ScalarKind::I32 => (RegClass::Integer, SlotType::I32),
        ScalarKind::I64 => (RegClass::Integer, SlotType::I64),
        ScalarKind::Address => (RegClass::Integer, SlotType::Address),
        ScalarKind::F32 => (RegClass::Float, SlotType::F32),
        ScalarKind::F64 => (RegClass::Float, SlotType::F64),
        ScalarKind::LongDouble => {
            return Err("`long_double` has no register class".to_string());
        }
    };
    Ok(Piece {
        class,
        ty,
        offset: 0,
        size: kind.size(),
    })
}

/// SysV eightbyte classification: an eightbyte is INTEGER if any scalar in it is, SSE otherwise
fn eightbytes(scalars: &[(usize, ScalarKind)], size: usize) -> Vec<Piece> {
    let count = size.div_ceil(8);
    let mut classes: Vec<Option<RegClass>> = vec![None; count];
    for (offset, kind) in scalars {
        let class = if kind.is_float() {
            RegClass::Float
        } else {
            RegClass::Integer
        };
        let entry = &mut classes[offset / 8];
        *entry = match (*entry, class) {
            (Some(RegClass::Integer), _) | (_, RegClass::Integer) => Some(RegClass::Integer),
            _ => Some(RegClass::Float),
        };
    }

    classes
        .into_iter()
        .enumerate()
        .map(|(i, class)| {
            let offset = i * 8;
            let piece_size = (size - offset).min(8);
            // Padding-only eightbytes travel as INTEGER
            let class = class.unwrap_or(RegClass::Integer);
            let ty = match class {
                RegClass::Integer => SlotType::I64,
                RegClass::Float if piece_size <= 4 => SlotType::F32,
                RegClass::Float => SlotType::F64,
            };
            Piece {
                class,
                ty,
                offset,
                size: piece_size,
            }
        })
        .collect()
}

/// AAPCS64 homogeneous float aggregate: 1..=`max` members of one float kind, densely packed
fn float_aggregate(scalars: &[(usize, ScalarKind)], size: usize, max: usize) -> Option<Vec<Piece>> {
    let (_, first) = scalars.first()?;
    let ty = match first {
        ScalarKind::F32 => SlotType::F32,
        ScalarKind::F64 => SlotType::F64,
        _ => return None,
    };
    let member = first.size();
    if scalars.len() > max || size != scalars.len() * member {
        return None;
    }
    let dense = scalars
        .iter()
        .enumerate()
        .all(|(i, (offset, kind))| kind == first && *offset == i * member);
    if !dense {
        return None;
    }
    Some(
        scalars
            .iter()
            .map(|(offset, _)| Piece {
                class: RegClass::Float,
                ty,
                offset: *offset,
                size: member,
            })
            .collect(),
    )
}

fn doublewords(size: usize) -> Vec<Piece> {
    (0..size.div_ceil(8))
        .map(|i| Piece {
            class: RegClass::Integer,
            ty: SlotType::I64,
            offset: i * 8,
            size: (size - i * 8).min(8),
        })
        .collect()
}
