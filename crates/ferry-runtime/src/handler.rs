//! Upcall handler
//!
//! Every generated thunk ends in one call to [`upcall_entry`] with the
//! address of its [`UpcallContext`], its transfer buffer and its result
//! area. The handler converts the arguments, invokes the target and writes
//! the return value back. Nothing here unwinds into the thunk: errors and
//! panics are turned into the failure signal selected by [`FailurePolicy`].

use crate::abi::CallingSequence;
use crate::context;
use crate::error::{UpcallError, UpcallResult};
use crate::gate::InvocationGate;
use crate::marshal;
use crate::target::{TargetError, UpcallTarget};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

/// What a failed upcall does at the native boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Zero the return value and record the error on the calling thread
    #[default]
    Sentinel,
    /// Log and abort the process
    Abort,
}

/// Everything one thunk needs at invocation time
///
/// Owned by the session that created the thunk; its address is baked into
/// the thunk's code and stays valid until the session has closed.
#[derive(Debug)]
pub struct UpcallContext {
    target: UpcallTarget,
    sequence: Arc<CallingSequence>,
    gate: Arc<InvocationGate>,
    policy: FailurePolicy,
    thunk_id: u64,
    session_id: u64,
}

impl UpcallContext {
    pub fn new(
        target: UpcallTarget,
        sequence: Arc<CallingSequence>,
        gate: Arc<InvocationGate>,
        policy: FailurePolicy,
        thunk_id: u64,
        session_id: u64,
    ) -> Self {
        Self {
            target,
            sequence,
            gate,
            policy,
            thunk_id,
            session_id,
        }
    }

    pub fn target(&self) -> &UpcallTarget {
        &self.target
    }

    pub fn sequence(&self) -> &CallingSequence {
        &self.sequence
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn thunk_id(&self) -> u64 {
        self.thunk_id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Run one invocation against native buffers
    ///
    /// Does not pass through the gate; [`upcall_entry`] holds the admission
    /// for the whole call, including the failure path.
    ///
    /// # Safety
    ///
    /// `args` and `result` must satisfy [`marshal::read_arguments`] and
    /// [`marshal::write_return`] for this context's sequence.
    pub unsafe fn invoke(&self, args: *const u8, result: *mut u8) -> UpcallResult<()> {
        let _depth = context::enter();

        let values = marshal::read_arguments(&self.sequence, args)?;
        let value = self.target.invoke(&values)?;
        marshal::write_return(&self.sequence, &value, result)?;
        Ok(())
    }

    unsafe fn fail(&self, error: UpcallError, result: *mut u8) {
        if self.policy == FailurePolicy::Abort {
            tracing::error!(
                thunk = self.thunk_id,
                session = self.session_id,
                error = %error,
                "upcall failed, aborting"
            );
            std::process::abort();
        }

        tracing::warn!(
            thunk = self.thunk_id,
            session = self.session_id,
            kind = error.kind(),
            error = %error,
            "upcall failed, returning sentinel"
        );
        ptr::write_bytes(result, 0, marshal::sentinel_len(&self.sequence));
        context::record_error(error);
    }
}

/// Native entry point every thunk calls
///
/// # Safety
///
/// `ctx` must point to a live [`UpcallContext`]; `args` and `result` must be
/// the buffers the thunk laid out for that context's sequence.
pub unsafe extern "C" fn upcall_entry(ctx: *const UpcallContext, args: *const u8, result: *mut u8) {
    let ctx = &*ctx;
    // Held until the sentinel is written so close() keeps waiting through `fail`
    let admitted = ctx.gate.enter();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        context::attach();
        if admitted.is_none() {
            return Err(UpcallError::Lifecycle {
                session: ctx.session_id,
            });
        }
        ctx.invoke(args, result)
    }));
    let error = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(error)) => error,
        Err(payload) => TargetError::Panicked(panic_message(payload.as_ref())).into(),
    };

    let reported = panic::catch_unwind(AssertUnwindSafe(|| ctx.fail(error, result)));
    if reported.is_err() {
        std::process::abort();
    }
    drop(admitted);
}

/// Address of [`upcall_entry`] for embedding into generated code
pub fn entry_address() -> usize {
    upcall_entry as unsafe extern "C" fn(*const UpcallContext, *const u8, *mut u8) as usize
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{AbiDescriptor, CallingSequenceBuilder};
    use crate::context::take_last_error;
    use crate::layout::{FunctionDescriptor, MemoryLayout};
    use crate::value::{MethodType, Value, ValueType};
    use pretty_assertions::assert_eq;

    fn add_context(target: UpcallTarget, policy: FailurePolicy) -> UpcallContext {
        let descriptor = FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I32; 2]);
        let sequence = CallingSequenceBuilder::build(&descriptor, &AbiDescriptor::sysv_x86_64()).unwrap();
        UpcallContext::new(
            target,
            Arc::new(sequence),
            Arc::new(InvocationGate::new()),
            policy,
            1,
            1,
        )
    }

    fn i32_pair() -> MethodType {
        MethodType::of(ValueType::I32, vec![ValueType::I32, ValueType::I32])
    }

    fn args(a: i32, b: i32) -> [u64; 2] {
        [a as u32 as u64, b as u32 as u64]
    }

    fn call(ctx: &UpcallContext, a: i32, b: i32) -> i32 {
        let buffer = args(a, b);
        let mut result = [0xffu8; 16];
        unsafe { upcall_entry(ctx, buffer.as_ptr().cast(), result.as_mut_ptr()) };
        i32::from_ne_bytes(result[..4].try_into().unwrap())
    }

    #[test]
    fn test_entry_invokes_target() {
        let ctx = add_context(
            UpcallTarget::closure(i32_pair(), |args| match args {
                [Value::I32(a), Value::I32(b)] => Ok(Value::I32(a + b)),
                _ => Err(TargetError::Raised("arity".into())),
            }),
            FailurePolicy::Sentinel,
        );
        assert_eq!(call(&ctx, 3, 4), 7);
        assert_eq!(take_last_error(), None);
    }

    #[test]
    fn test_target_error_yields_sentinel() {
        let ctx = add_context(
            UpcallTarget::closure(i32_pair(), |_| Err(TargetError::Raised("refused".into()))),
            FailurePolicy::Sentinel,
        );
        assert_eq!(call(&ctx, 1, 2), 0);
        assert_eq!(
            take_last_error(),
            Some(UpcallError::NativeTransition(TargetError::Raised("refused".into())))
        );
    }

    #[test]
    fn test_panic_is_contained() {
        let ctx = add_context(
            UpcallTarget::closure(i32_pair(), |_| panic!("target exploded")),
            FailurePolicy::Sentinel,
        );
        assert_eq!(call(&ctx, 1, 2), 0);
        assert_eq!(
            take_last_error(),
            Some(UpcallError::NativeTransition(TargetError::Panicked(
                "target exploded".into()
            )))
        );
    }

    #[test]
    fn test_closed_gate_skips_target() {
        let ctx = add_context(
            UpcallTarget::closure(i32_pair(), |_| panic!("must not run")),
            FailurePolicy::Sentinel,
        );
        ctx.gate.close();
        assert_eq!(call(&ctx, 1, 2), 0);
        assert_eq!(take_last_error(), Some(UpcallError::Lifecycle { session: 1 }));
    }

    #[test]
    fn test_entry_address_is_stable() {
        assert_ne!(entry_address(), 0);
        assert_eq!(entry_address(), entry_address());
    }
}
