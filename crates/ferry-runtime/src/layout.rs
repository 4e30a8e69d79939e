//! Memory layouts and function descriptors
//!
//! Defines:
//! - `ScalarKind`: primitive native kinds with fixed size and alignment
//! - `MemoryLayout`: layout tags for parameters and returns (scalars and composites)
//! - `FunctionDescriptor`: an ordered parameter list plus an optional return layout
//!
//! Composite offsets follow C rules: each member is placed at the next offset
//! aligned to its own alignment, and the total size is rounded up to the
//! largest member alignment.

use crate::value::ValueType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primitive native kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    /// C `bool` (one byte, 0 or 1)
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Untyped native pointer
    Address,
    /// x87 / quad `long double`
    LongDouble,
}

impl ScalarKind {
    /// Size in bytes
    pub fn size(self) -> usize {
        match self {
            ScalarKind::Bool | ScalarKind::I8 => 1,
            ScalarKind::I16 => 2,
            ScalarKind::I32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::F64 | ScalarKind::Address => 8,
            ScalarKind::LongDouble => 16,
        }
    }

    /// Natural alignment in bytes
    pub fn align(self) -> usize {
        self.size()
    }

    /// Whether values of this kind travel in floating-point registers
    pub fn is_float(self) -> bool {
        matches!(
            self,
            ScalarKind::F32 | ScalarKind::F64 | ScalarKind::LongDouble
        )
    }

    /// The managed type that carries values of this kind
    pub fn carrier(self) -> ValueType {
        match self {
            ScalarKind::Bool => ValueType::Bool,
            ScalarKind::I8 => ValueType::I8,
            ScalarKind::I16 => ValueType::I16,
            ScalarKind::I32 => ValueType::I32,
            ScalarKind::I64 => ValueType::I64,
            ScalarKind::F32 => ValueType::F32,
            ScalarKind::F64 | ScalarKind::LongDouble => ValueType::F64,
            ScalarKind::Address => ValueType::Address,
        }
    }

    /// Get a display name for this kind
    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::I8 => "i8",
            ScalarKind::I16 => "i16",
            ScalarKind::I32 => "i32",
            ScalarKind::I64 => "i64",
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
            ScalarKind::Address => "address",
            ScalarKind::LongDouble => "long_double",
        }
    }
}

/// Layout tag for one parameter or return value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryLayout {
    /// A single primitive value
    Scalar(ScalarKind),
    /// Members laid out in order with C alignment rules
    Struct(Vec<MemoryLayout>),
    /// Members overlapping at offset zero
    Union(Vec<MemoryLayout>),
    /// `count` consecutive elements (a fixed array inside a composite)
    Sequence {
        element: Box<MemoryLayout>,
        count: usize,
    },
    /// Explicit filler bytes with alignment 1
    Padding(usize),
}

impl MemoryLayout {
    pub const BOOL: MemoryLayout = MemoryLayout::Scalar(ScalarKind::Bool);
    pub const I8: MemoryLayout = MemoryLayout::Scalar(ScalarKind::I8);
    pub const I16: MemoryLayout = MemoryLayout::Scalar(ScalarKind::I16);
    pub const I32: MemoryLayout = MemoryLayout::Scalar(ScalarKind::I32);
    pub const I64: MemoryLayout = MemoryLayout::Scalar(ScalarKind::I64);
    pub const F32: MemoryLayout = MemoryLayout::Scalar(ScalarKind::F32);
    pub const F64: MemoryLayout = MemoryLayout::Scalar(ScalarKind::F64);
    pub const ADDRESS: MemoryLayout = MemoryLayout::Scalar(ScalarKind::Address);
    pub const LONG_DOUBLE: MemoryLayout = MemoryLayout::Scalar(ScalarKind::LongDouble);

    /// Create a struct layout from its members
    pub fn structure(members: Vec<MemoryLayout>) -> Self {
        MemoryLayout::Struct(members)
    }

    /// Create a union layout from its members
    pub fn union_of(members: Vec<MemoryLayout>) -> Self {
        MemoryLayout::Union(members)
    }

    /// Create a fixed-length sequence layout
    pub fn sequence(element: MemoryLayout, count: usize) -> Self {
        MemoryLayout::Sequence {
            element: Box::new(element),
            count,
        }
    }

    /// Whether this layout is a composite (anything but a scalar)
    pub fn is_composite(&self) -> bool {
        !matches!(self, MemoryLayout::Scalar(_))
    }

    /// Alignment in bytes (at least 1)
    pub fn align(&self) -> usize {
        match self {
            MemoryLayout::Scalar(kind) => kind.align(),
            MemoryLayout::Struct(members) | MemoryLayout::Union(members) => {
                members.iter().map(|m| m.align()).max().unwrap_or(1)
            }
            MemoryLayout::Sequence { element, .. } => element.align(),
            MemoryLayout::Padding(_) => 1,
        }
    }

    /// Size in bytes, including trailing padding
    ///
    /// Saturates at `usize::MAX` for layouts whose size does not fit; use
    /// [`checked_size`](Self::checked_size) to detect that case.
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }

    /// Size in bytes, or `None` when it overflows `usize`
    pub fn checked_size(&self) -> Option<usize> {
        match self {
            MemoryLayout::Scalar(kind) => Some(kind.size()),
            MemoryLayout::Struct(members) => {
                let mut end = 0usize;
                for member in members {
                    end = checked_align_up(end, member.align())?.checked_add(member.checked_size()?)?;
                }
                checked_align_up(end, self.align())
            }
            MemoryLayout::Union(members) => {
                let mut widest = 0usize;
                for member in members {
                    widest = widest.max(member.checked_size()?);
                }
                checked_align_up(widest, self.align())
            }
            MemoryLayout::Sequence { element, count } => element.checked_size()?.checked_mul(*count),
            MemoryLayout::Padding(bytes) => Some(*bytes),
        }
    }

    /// Offset of the first scalar of `kind`, without flattening sequences
    pub fn offset_of(&self, kind: ScalarKind) -> Option<usize> {
        match self {
            MemoryLayout::Scalar(k) => (*k == kind).then_some(0),
            MemoryLayout::Struct(members) => struct_offsets(members)
                .into_iter()
                .find_map(|(offset, member)| Some(offset.saturating_add(member.offset_of(kind)?))),
            MemoryLayout::Union(members) => members.iter().find_map(|m| m.offset_of(kind)),
            MemoryLayout::Sequence { element, count } if *count > 0 => element.offset_of(kind),
            MemoryLayout::Sequence { .. } | MemoryLayout::Padding(_) => None,
        }
    }

    /// Byte offsets of the direct members of a struct
    ///
    /// Returns an empty list for non-struct layouts.
    pub fn member_offsets(&self) -> Vec<usize> {
        match self {
            MemoryLayout::Struct(members) => struct_offsets(members)
                .into_iter()
                .map(|(offset, _)| offset)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Flatten into `(offset, kind)` pairs for every scalar reachable from this layout
    ///
    /// Union members all start at the same offset, so their scalars overlap.
    pub fn scalars(&self) -> Vec<(usize, ScalarKind)> {
        let mut out = Vec::new();
        self.collect_scalars(0, &mut out);
        out
    }

    fn collect_scalars(&self, base: usize, out: &mut Vec<(usize, ScalarKind)>) {
        match self {
            MemoryLayout::Scalar(kind) => out.push((base, *kind)),
            MemoryLayout::Struct(members) => {
                for (offset, member) in struct_offsets(members) {
                    member.collect_scalars(base + offset, out);
                }
            }
            MemoryLayout::Union(members) => {
                for member in members {
                    member.collect_scalars(base, out);
                }
            }
            MemoryLayout::Sequence { element, count } => {
                let stride = element.size();
                for i in 0..*count {
                    element.collect_scalars(base + i * stride, out);
                }
            }
            MemoryLayout::Padding(_) => {}
        }
    }

    /// The managed type that carries values of this layout
    pub fn carrier(&self) -> ValueType {
        match self {
            MemoryLayout::Scalar(kind) => kind.carrier(),
            _ => ValueType::Segment,
        }
    }
}

impl fmt::Display for MemoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLayout::Scalar(kind) => write!(f, "{}", kind.name()),
            MemoryLayout::Struct(members) => {
                write!(f, "struct{{")?;
                write_members(f, members)?;
                write!(f, "}}")
            }
            MemoryLayout::Union(members) => {
                write!(f, "union{{")?;
                write_members(f, members)?;
                write!(f, "}}")
            }
            MemoryLayout::Sequence { element, count } => write!(f, "[{}; {}]", element, count),
            MemoryLayout::Padding(bytes) => write!(f, "pad({})", bytes),
        }
    }
}

fn write_members(f: &mut fmt::Formatter<'_>, members: &[MemoryLayout]) -> fmt::Result {
    for (i, member) in members.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", member)?;
    }
    Ok(())
}

fn struct_offsets(members: &[MemoryLayout]) -> Vec<(usize, &MemoryLayout)> {
    let mut offset = 0;
    members
        .iter()
        .map(|member| {
            let at = align_up(offset, member.align());
            offset = at.saturating_add(member.size());
            (at, member)
        })
        .collect()
}

/// Round `value` up to a multiple of `align` (`align` of 0 is treated as 1)
pub fn align_up(value: usize, align: usize) -> usize {
    checked_align_up(value, align).unwrap_or(usize::MAX)
}

fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_next_multiple_of(align.max(1))
}

/// Native signature of an upcall: parameter layouts plus an optional return layout
///
/// # Examples
///
/// ```
/// # use ferry_runtime::layout::{FunctionDescriptor, MemoryLayout};
/// let add = FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I32, MemoryLayout::I32]);
/// assert_eq!(add.arity(), 2);
/// assert_eq!(add.to_string(), "(i32, i32) -> i32");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    params: Vec<MemoryLayout>,
    ret: Option<MemoryLayout>,
    variadic_from: Option<usize>,
}

impl FunctionDescriptor {
    /// Descriptor with a return value
    pub fn of(ret: MemoryLayout, params: Vec<MemoryLayout>) -> Self {
        Self {
            params,
            ret: Some(ret),
            variadic_from: None,
        }
    }

    /// Descriptor for a `void` function
    pub fn of_void(params: Vec<MemoryLayout>) -> Self {
        Self {
            params,
            ret: None,
            variadic_from: None,
        }
    }

    /// Mark parameters from `index` onwards as variadic
    pub fn with_variadic_from(mut self, index: usize) -> Self {
        self.variadic_from = Some(index);
        self
    }

    pub fn params(&self) -> &[MemoryLayout] {
        &self.params
    }

    pub fn ret(&self) -> Option<&MemoryLayout> {
        self.ret.as_ref()
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn variadic_from(&self) -> Option<usize> {
        self.variadic_from
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic_from.is_some()
    }
}

impl fmt::Display for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if self.variadic_from == Some(i) {
                write!(f, "... ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ") -> ")?;
        match &self.ret {
            Some(ret) => write!(f, "{}", ret),
            None => write!(f, "void"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ScalarKind::Bool, 1)]
    #[case(ScalarKind::I16, 2)]
    #[case(ScalarKind::F32, 4)]
    #[case(ScalarKind::Address, 8)]
    #[case(ScalarKind::LongDouble, 16)]
    fn test_scalar_sizes(#[case] kind: ScalarKind, #[case] size: usize) {
        assert_eq!(kind.size(), size);
        assert_eq!(kind.align(), size);
    }

    #[test]
    fn test_struct_padding_follows_c_rules() {
        // struct { char c; double d; int i; } -> 1 + 7 pad + 8 + 4 + 4 pad
        let layout = MemoryLayout::structure(vec![
            MemoryLayout::I8,
            MemoryLayout::F64,
            MemoryLayout::I32,
        ]);
        assert_eq!(layout.member_offsets(), vec![0, 8, 16]);
        assert_eq!(layout.size(), 24);
        assert_eq!(layout.align(), 8);
    }

    #[test]
    fn test_union_size_is_widest_member() {
        let layout = MemoryLayout::union_of(vec![MemoryLayout::I8, MemoryLayout::F64]);
        assert_eq!(layout.size(), 8);
        assert_eq!(
            layout.scalars(),
            vec![(0, ScalarKind::I8), (0, ScalarKind::F64)]
        );
    }

    #[test]
    fn test_sequence_flattens_elements() {
        let layout = MemoryLayout::structure(vec![MemoryLayout::sequence(MemoryLayout::F32, 3)]);
        assert_eq!(layout.size(), 12);
        assert_eq!(
            layout.scalars(),
            vec![
                (0, ScalarKind::F32),
                (4, ScalarKind::F32),
                (8, ScalarKind::F32)
            ]
        );
    }

    #[test]
    fn test_empty_struct_is_zero_sized() {
        let layout = MemoryLayout::structure(vec![]);
        assert_eq!(layout.size(), 0);
        assert_eq!(layout.align(), 1);
        assert!(layout.scalars().is_empty());
    }

    #[test]
    fn test_overflowing_size_is_detected() {
        let huge = MemoryLayout::sequence(MemoryLayout::I64, usize::MAX / 4);
        assert_eq!(huge.checked_size(), None);
        assert_eq!(huge.size(), usize::MAX);

        let half = MemoryLayout::sequence(MemoryLayout::I8, usize::MAX / 2 + 1);
        let pair = MemoryLayout::structure(vec![half.clone(), half]);
        assert_eq!(pair.checked_size(), None);
        assert_eq!(pair.member_offsets().len(), 2);
    }

    #[test]
    fn test_offset_of_does_not_flatten_sequences() {
        let layout = MemoryLayout::structure(vec![
            MemoryLayout::I32,
            MemoryLayout::sequence(MemoryLayout::LONG_DOUBLE, 1 << 40),
        ]);
        assert_eq!(layout.offset_of(ScalarKind::LongDouble), Some(16));
        assert_eq!(layout.offset_of(ScalarKind::F64), None);
    }

    #[test]
    fn test_padding_contributes_size_only() {
        let layout = MemoryLayout::structure(vec![MemoryLayout::I32, MemoryLayout::Padding(4)]);
        assert_eq!(layout.size(), 8);
        assert_eq!(layout.scalars(), vec![(0, ScalarKind::I32)]);
    }

    #[test]
    fn test_carriers() {
        assert_eq!(MemoryLayout::I32.carrier(), ValueType::I32);
        assert_eq!(
            MemoryLayout::structure(vec![MemoryLayout::I32]).carrier(),
            ValueType::Segment
        );
    }

    #[test]
    fn test_descriptor_display() {
        let desc = FunctionDescriptor::of_void(vec![
            MemoryLayout::ADDRESS,
            MemoryLayout::structure(vec![MemoryLayout::F32, MemoryLayout::F32]),
        ]);
        assert_eq!(desc.to_string(), "(address, struct{f32, f32}) -> void");

        let variadic = FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::ADDRESS, MemoryLayout::I32])
            .with_variadic_from(1);
        assert!(variadic.is_variadic());
        assert_eq!(variadic.to_string(), "(address, ... i32) -> i32");
    }

    #[rstest]
    #[case(0, 8, 0)]
    #[case(1, 8, 8)]
    #[case(9, 4, 12)]
    #[case(5, 0, 5)]
    fn test_align_up(#[case] value: usize, #[case] align: usize, #[case] expected: usize) {
        assert_eq!(align_up(value, align), expected);
    }
}
