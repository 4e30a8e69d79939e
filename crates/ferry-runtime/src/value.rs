//! Managed values and method types
//!
//! `Value` is the representation upcall targets see. Scalars map one-to-one
//! onto `ScalarKind`; composites arrive as a `Segment` holding the native
//! bytes of the struct, laid out exactly as the descriptor's layout says.

use std::fmt;

/// Managed type of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Address,
    /// Bytes of a native composite
    Segment,
}

impl ValueType {
    /// Get a display name for this type
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Void => "void",
            ValueType::Bool => "bool",
            ValueType::I8 => "i8",
            ValueType::I16 => "i16",
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::Address => "address",
            ValueType::Segment => "segment",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Owned bytes of a native composite value
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Segment {
    bytes: Vec<u8>,
}

macro_rules! segment_accessors {
    ($($get:ident, $set:ident, $ty:ty);* $(;)?) => {
        $(
            #[doc = concat!("Read a native-endian `", stringify!($ty), "` at `offset`")]
            pub fn $get(&self, offset: usize) -> Option<$ty> {
                const N: usize = std::mem::size_of::<$ty>();
                let bytes = self.bytes.get(offset..offset.checked_add(N)?)?;
                let mut raw = [0u8; N];
                raw.copy_from_slice(bytes);
                Some(<$ty>::from_ne_bytes(raw))
            }

            #[doc = concat!("Write a native-endian `", stringify!($ty), "` at `offset`; false when out of bounds")]
            pub fn $set(&mut self, offset: usize, value: $ty) -> bool {
                const N: usize = std::mem::size_of::<$ty>();
                let Some(end) = offset.checked_add(N) else {
                    return false;
                };
                match self.bytes.get_mut(offset..end) {
                    Some(slot) => {
                        slot.copy_from_slice(&value.to_ne_bytes());
                        true
                    }
                    None => false,
                }
            }
        )*
    };
}

impl Segment {
    /// Zero-filled segment of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    segment_accessors! {
        get_i8, set_i8, i8;
        get_i16, set_i16, i16;
        get_i32, set_i32, i32;
        get_i64, set_i64, i64;
        get_f32, set_f32, f32;
        get_f64, set_f64, f64;
        get_usize, set_usize, usize;
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment({} bytes: ", self.bytes.len())?;
        for byte in &self.bytes {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// A managed value crossing the upcall boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Address(usize),
    Segment(Segment),
}

impl Value {
    /// Get the managed type of this value
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Void => ValueType::Void,
            Value::Bool(_) => ValueType::Bool,
            Value::I8(_) => ValueType::I8,
            Value::I16(_) => ValueType::I16,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::Address(_) => ValueType::Address,
            Value::Segment(_) => ValueType::Segment,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&Segment> {
        match self {
            Value::Segment(s) => Some(s),
            _ => None,
        }
    }
}

/// Logical signature of a managed callable
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodType {
    params: Vec<ValueType>,
    ret: ValueType,
}

impl MethodType {
    pub fn of(ret: ValueType, params: Vec<ValueType>) -> Self {
        Self { params, ret }
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn ret(&self) -> ValueType {
        self.ret
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Drop the first `count` parameters (used when binding leading arguments)
    pub fn drop_leading(&self, count: usize) -> Option<Self> {
        if count > self.params.len() {
            return None;
        }
        Some(Self {
            params: self.params[count..].to_vec(),
            ret: self.ret,
        })
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_accessors_round_trip_fields() {
        let mut seg = Segment::zeroed(16);
        assert!(seg.set_i32(0, -7));
        assert!(seg.set_f64(8, 2.5));
        assert_eq!(seg.get_i32(0), Some(-7));
        assert_eq!(seg.get_f64(8), Some(2.5));
    }

    #[test]
    fn test_segment_accessors_reject_out_of_bounds() {
        let mut seg = Segment::zeroed(4);
        assert!(!seg.set_i64(0, 1));
        assert_eq!(seg.get_i64(0), None);
        assert_eq!(seg.get_i32(usize::MAX), None);
    }

    #[test]
    fn test_value_types() {
        assert_eq!(Value::I32(1).value_type(), ValueType::I32);
        assert_eq!(
            Value::Segment(Segment::zeroed(0)).value_type(),
            ValueType::Segment
        );
        assert_eq!(Value::Void.value_type(), ValueType::Void);
    }

    #[test]
    fn test_method_type_drop_leading() {
        let mt = MethodType::of(ValueType::I32, vec![ValueType::I64, ValueType::I32]);
        let rest = mt.drop_leading(1).unwrap();
        assert_eq!(rest.params(), &[ValueType::I32]);
        assert!(mt.drop_leading(3).is_none());
        assert_eq!(mt.to_string(), "(i64, i32) -> i32");
    }
}
