//! Ferry Runtime - the managed half of the upcall bridge
//!
//! This library provides everything an upcall needs that is not machine code:
//! - Memory layouts and function descriptors (`layout`)
//! - Managed values, method types and call targets (`value`, `target`)
//! - Per-platform ABI descriptors and the calling sequence builder (`abi`)
//! - The upcall handler that native thunks call into (`handler`)
//! - Thread attachment and the out-of-band error channel (`context`)
//! - The in-flight invocation gate used for session quiescence (`gate`)
//!
//! Code generation lives in `ferry-jit`, which turns a [`abi::CallingSequence`]
//! into a native thunk that calls [`handler::upcall_entry`].

/// Ferry runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod abi;
pub mod context;
pub mod error;
pub mod gate;
pub mod handler;
pub mod layout;
pub mod marshal;
pub mod target;
pub mod value;

pub use abi::{AbiDescriptor, Architecture, CallingSequence, CallingSequenceBuilder, Convention};
pub use context::{take_last_error, ThreadContext};
pub use error::{UpcallError, UpcallResult};
pub use gate::{InvocationGate, InvocationGuard};
pub use handler::{upcall_entry, FailurePolicy, UpcallContext};
pub use layout::{FunctionDescriptor, MemoryLayout, ScalarKind};
pub use target::{TargetError, TargetKind, UpcallTarget};
pub use value::{MethodType, Segment, Value, ValueType};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke() {
        assert_eq!(VERSION, "0.1.0");
    }
}
