//! Upcall stub factory
//!
//! A factory is built once per (descriptor, ABI) pair. Building it computes
//! the calling sequence and checks that the host code generator can realise
//! it; `make` then emits one thunk per (target, session).

use crate::linker::check_signature;
use crate::session::{Session, ThunkHandle};
use ferry_runtime::{
    AbiDescriptor, Architecture, CallingSequence, CallingSequenceBuilder, FailurePolicy,
    FunctionDescriptor, UpcallError, UpcallResult, UpcallTarget,
};
use std::sync::Arc;

/// Reusable thunk generator for one native signature
#[derive(Debug, Clone)]
pub struct UpcallStubFactory {
    descriptor: FunctionDescriptor,
    sequence: Arc<CallingSequence>,
    policy: FailurePolicy,
}

impl UpcallStubFactory {
    /// Build the calling sequence for `descriptor` under `abi`
    ///
    /// Fails with `UnsupportedPlatform` when `abi` is for another
    /// architecture, and with `UnsupportedLayout` when the descriptor has no
    /// mapping or its placement differs from what a native caller using the
    /// same convention would do.
    pub fn new(
        descriptor: FunctionDescriptor,
        abi: &AbiDescriptor,
        policy: FailurePolicy,
    ) -> UpcallResult<Self> {
        let host = Architecture::host();
        if host != Some(abi.arch()) {
            return Err(UpcallError::UnsupportedPlatform {
                abi: abi.name().to_string(),
                arch: abi.arch().name().to_string(),
                host: host
                    .map(Architecture::name)
                    .unwrap_or(std::env::consts::ARCH)
                    .to_string(),
            });
        }

        let sequence = CallingSequenceBuilder::build(&descriptor, abi)?;
        let canonical = AbiDescriptor::for_convention(abi.convention());
        if canonical != *abi {
            let native = CallingSequenceBuilder::build(&descriptor, &canonical)?;
            if !sequence.same_placement(&native) {
                return Err(UpcallError::UnsupportedLayout {
                    layout: descriptor.to_string(),
                    abi: abi.name().to_string(),
                    reason: format!("placement differs from native {} callers", canonical.name()),
                });
            }
        }

        Ok(Self {
            descriptor,
            sequence: Arc::new(sequence),
            policy,
        })
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn sequence(&self) -> &CallingSequence {
        &self.sequence
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Emit a thunk calling `target`, owned by `session`
    ///
    /// The target's signature is checked against the descriptor first; on a
    /// mismatch no code is generated.
    pub fn make(&self, target: UpcallTarget, session: &Session) -> UpcallResult<ThunkHandle> {
        check_signature(&self.descriptor, target.signature())?;
        self.emit(target, session)
    }

    /// Emit without checking `target`; the caller has already validated it
    pub(crate) fn emit(&self, target: UpcallTarget, session: &Session) -> UpcallResult<ThunkHandle> {
        session.emit(target, Arc::clone(&self.sequence), self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_runtime::{Convention, MemoryLayout, Value};

    fn foreign_abi() -> AbiDescriptor {
        if cfg!(target_arch = "aarch64") {
            AbiDescriptor::sysv_x86_64()
        } else {
            AbiDescriptor::aapcs64()
        }
    }

    #[test]
    fn test_foreign_architecture_is_rejected() {
        let descriptor = FunctionDescriptor::of(MemoryLayout::I32, vec![]);
        let err = UpcallStubFactory::new(descriptor, &foreign_abi(), FailurePolicy::Sentinel)
            .unwrap_err();
        assert_eq!(err.kind(), "unsupported_platform");
    }

    #[cfg(all(target_arch = "x86_64", not(windows)))]
    #[test]
    fn test_restricted_abi_that_moves_arguments_is_rejected() {
        let abi = AbiDescriptor::sysv_x86_64().with_integer_registers(1);
        let descriptor = FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I32; 2]);
        let err = UpcallStubFactory::new(descriptor, &abi, FailurePolicy::Sentinel).unwrap_err();
        assert_eq!(err.kind(), "unsupported_layout");
    }

    #[cfg(all(target_arch = "x86_64", not(windows)))]
    #[test]
    fn test_restricted_abi_with_same_placement_is_accepted() {
        let abi = AbiDescriptor::sysv_x86_64().with_integer_registers(2);
        let descriptor = FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I32; 2]);
        let factory = UpcallStubFactory::new(descriptor, &abi, FailurePolicy::Sentinel).unwrap();
        assert_eq!(factory.sequence().abi(), "sysv-x86_64[int=2]");
        assert_eq!(factory.sequence().convention(), Convention::SystemV);
    }

    #[test]
    fn test_make_rejects_mismatched_target() {
        let Some(abi) = AbiDescriptor::host() else {
            return;
        };
        let descriptor = FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I32]);
        let factory = UpcallStubFactory::new(descriptor, &abi, FailurePolicy::Sentinel).unwrap();
        let session = Session::open();
        let err = factory
            .make(UpcallTarget::constant(Value::I64(1)), &session)
            .unwrap_err();
        assert_eq!(err.kind(), "descriptor_mismatch");
        assert_eq!(session.thunk_count(), 0);
    }

    #[test]
    fn test_variadic_descriptor_is_rejected() {
        let Some(abi) = AbiDescriptor::host() else {
            return;
        };
        let descriptor =
            FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I32; 2]).with_variadic_from(1);
        let err = UpcallStubFactory::new(descriptor, &abi, FailurePolicy::Sentinel).unwrap_err();
        assert_eq!(err.kind(), "unsupported_layout");
    }
}
