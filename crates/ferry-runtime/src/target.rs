//! Upcall targets - the managed callables native code calls into
//!
//! A target is a closed set of callable kinds sharing one `invoke`
//! operation. The bridge never looks inside a target beyond its
//! `MethodType`.

use crate::error::{UpcallError, UpcallResult};
use crate::value::{MethodType, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a target during an upcall
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TargetError {
    /// The target returned an error
    #[error("{0}")]
    Raised(String),
    /// The target panicked; the payload message is preserved when it is a string
    #[error("target panicked: {0}")]
    Panicked(String),
    /// A value could not be converted between native and managed form
    #[error("marshal error: {0}")]
    Marshal(String),
}

/// Plain function target
pub type TargetFn = fn(&[Value]) -> Result<Value, TargetError>;

/// Shared closure target
pub type SharedFn = Arc<dyn Fn(&[Value]) -> Result<Value, TargetError> + Send + Sync>;

/// The kinds of callable a target can wrap
#[derive(Clone)]
pub enum TargetKind {
    Function(TargetFn),
    Closure(SharedFn),
    /// `inner` with `leading` arguments already supplied
    Bound {
        inner: Arc<UpcallTarget>,
        leading: Vec<Value>,
    },
    /// Always returns the same value
    Constant(Value),
}

/// A managed callable plus its logical signature
///
/// # Example
///
/// ```
/// # use ferry_runtime::target::UpcallTarget;
/// # use ferry_runtime::value::{MethodType, Value, ValueType};
/// let add = UpcallTarget::closure(
///     MethodType::of(ValueType::I32, vec![ValueType::I32, ValueType::I32]),
///     |args| match args {
///         [Value::I32(a), Value::I32(b)] => Ok(Value::I32(a + b)),
///         _ => unreachable!(),
///     },
/// );
/// assert_eq!(add.invoke(&[Value::I32(3), Value::I32(4)]), Ok(Value::I32(7)));
/// ```
#[derive(Clone)]
pub struct UpcallTarget {
    kind: TargetKind,
    signature: MethodType,
}

impl UpcallTarget {
    /// Wrap a plain function
    pub fn function(signature: MethodType, f: TargetFn) -> Self {
        Self {
            kind: TargetKind::Function(f),
            signature,
        }
    }

    /// Wrap a closure
    pub fn closure<F>(signature: MethodType, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, TargetError> + Send + Sync + 'static,
    {
        Self {
            kind: TargetKind::Closure(Arc::new(f)),
            signature,
        }
    }

    /// A zero-argument target that always returns `value`
    pub fn constant(value: Value) -> Self {
        let signature = MethodType::of(value.value_type(), Vec::new());
        Self {
            kind: TargetKind::Constant(value),
            signature,
        }
    }

    /// Bind `leading` arguments, producing a target over the remaining parameters
    pub fn bind(self, leading: Vec<Value>) -> UpcallResult<Self> {
        let rest = self
            .signature
            .drop_leading(leading.len())
            .ok_or_else(|| self.bind_error(&leading, "more arguments than parameters"))?;
        for (value, expected) in leading.iter().zip(self.signature.params()) {
            if value.value_type() != *expected {
                let reason = format!("bound {} where {} is expected", value.value_type(), expected);
                return Err(self.bind_error(&leading, &reason));
            }
        }
        Ok(Self {
            kind: TargetKind::Bound {
                inner: Arc::new(self),
                leading,
            },
            signature: rest,
        })
    }

    fn bind_error(&self, leading: &[Value], reason: &str) -> UpcallError {
        UpcallError::DescriptorMismatch {
            descriptor: format!("{} bound argument(s)", leading.len()),
            signature: self.signature.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn signature(&self) -> &MethodType {
        &self.signature
    }

    pub fn kind(&self) -> &TargetKind {
        &self.kind
    }

    /// Call the target synchronously
    pub fn invoke(&self, args: &[Value]) -> Result<Value, TargetError> {
        match &self.kind {
            TargetKind::Function(f) => f(args),
            TargetKind::Closure(f) => f(args),
            TargetKind::Bound { inner, leading } => {
                let mut full = Vec::with_capacity(leading.len() + args.len());
                full.extend_from_slice(leading);
                full.extend_from_slice(args);
                inner.invoke(&full)
            }
            TargetKind::Constant(value) => Ok(value.clone()),
        }
    }
}

impl fmt::Debug for UpcallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            TargetKind::Function(_) => "function",
            TargetKind::Closure(_) => "closure",
            TargetKind::Bound { .. } => "bound",
            TargetKind::Constant(_) => "constant",
        };
        f.debug_struct("UpcallTarget")
            .field("kind", &kind)
            .field("signature", &self.signature)
            .finish()
    }
}
