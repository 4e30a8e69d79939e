//! Upcall linker
//!
//! The public entry point: validate a descriptor against a target, build
//! its calling sequence, and emit a thunk into a session.

use crate::session::{NativeAddress, Session};
use crate::stub::UpcallStubFactory;
use crate::LinkerConfig;
use ferry_runtime::{
    AbiDescriptor, FunctionDescriptor, MethodType, UpcallError, UpcallResult, UpcallTarget,
    ValueType,
};

/// Links managed targets to native-callable addresses
#[derive(Debug, Clone, Default)]
pub struct UpcallLinker {
    config: LinkerConfig,
}

impl UpcallLinker {
    pub fn new(config: LinkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    /// Open a session using this linker's optimisation level
    pub fn open_session(&self) -> Session {
        Session::with_opt_level(self.config.opt_level)
    }

    /// Link `target` as a native function described by `descriptor` under `abi`
    ///
    /// Every call produces a fresh thunk owned by `session`. The target is
    /// checked against `descriptor` before the calling sequence is built.
    pub fn link(
        &self,
        target: UpcallTarget,
        descriptor: &FunctionDescriptor,
        abi: &AbiDescriptor,
        session: &Session,
    ) -> UpcallResult<NativeAddress> {
        check_signature(descriptor, target.signature())?;
        let factory = self.factory(descriptor.clone(), abi)?;
        let handle = factory.emit(target, session)?;
        Ok(handle.address())
    }

    /// [`link`](Self::link) using the configured ABI, or the host's
    pub fn link_default(
        &self,
        target: UpcallTarget,
        descriptor: &FunctionDescriptor,
        session: &Session,
    ) -> UpcallResult<NativeAddress> {
        let abi = self.default_abi()?;
        self.link(target, descriptor, &abi, session)
    }

    /// Build a factory for `descriptor` that can be applied to many targets
    pub fn factory(
        &self,
        descriptor: FunctionDescriptor,
        abi: &AbiDescriptor,
    ) -> UpcallResult<UpcallStubFactory> {
        UpcallStubFactory::new(descriptor, abi, self.config.failure_policy)
    }

    fn default_abi(&self) -> UpcallResult<AbiDescriptor> {
        match &self.config.abi {
            Some(abi) => Ok(abi.clone()),
            None => AbiDescriptor::host().ok_or_else(|| UpcallError::UnsupportedPlatform {
                abi: "host".to_string(),
                arch: std::env::consts::ARCH.to_string(),
                host: std::env::consts::ARCH.to_string(),
            }),
        }
    }
}

/// Check that `descriptor` and `signature` agree on arity and types
pub fn check_signature(descriptor: &FunctionDescriptor, signature: &MethodType) -> UpcallResult<()> {
    let mismatch = |reason: String| UpcallError::DescriptorMismatch {
        descriptor: descriptor.to_string(),
        signature: signature.to_string(),
        reason,
    };

    if descriptor.arity() != signature.arity() {
        return Err(mismatch(format!(
            "{} parameter(s) declared, target takes {}",
            descriptor.arity(),
            signature.arity()
        )));
    }

    for (index, (layout, expected)) in descriptor.params().iter().zip(signature.params()).enumerate() {
        let carrier = layout.carrier();
        if carrier != *expected {
            return Err(mismatch(format!(
                "parameter {} is {} ({}), target expects {}",
                index, layout, carrier, expected
            )));
        }
    }

    let ret = descriptor.ret().map(|l| l.carrier()).unwrap_or(ValueType::Void);
    if ret != signature.ret() {
        return Err(mismatch(format!(
            "returns {}, target returns {}",
            ret,
            signature.ret()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_runtime::{MemoryLayout, Value};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn pair() -> MemoryLayout {
        MemoryLayout::structure(vec![MemoryLayout::I32, MemoryLayout::F32])
    }

    #[rstest]
    #[case(FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I32; 2]),
           MethodType::of(ValueType::I32, vec![ValueType::I32; 2]))]
    #[case(FunctionDescriptor::of_void(vec![]), MethodType::of(ValueType::Void, vec![]))]
    #[case(FunctionDescriptor::of(pair(), vec![pair(), MemoryLayout::ADDRESS]),
           MethodType::of(ValueType::Segment, vec![ValueType::Segment, ValueType::Address]))]
    fn test_matching_signatures(#[case] descriptor: FunctionDescriptor, #[case] signature: MethodType) {
        assert_eq!(check_signature(&descriptor, &signature), Ok(()));
    }

    #[rstest]
    #[case(FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I32]),
           MethodType::of(ValueType::I32, vec![ValueType::I32; 2]))]
    #[case(FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I64]),
           MethodType::of(ValueType::I32, vec![ValueType::I32]))]
    #[case(FunctionDescriptor::of_void(vec![]), MethodType::of(ValueType::I64, vec![]))]
    #[case(FunctionDescriptor::of(MemoryLayout::F64, vec![]), MethodType::of(ValueType::F32, vec![]))]
    fn test_mismatched_signatures(#[case] descriptor: FunctionDescriptor, #[case] signature: MethodType) {
        let err = check_signature(&descriptor, &signature).unwrap_err();
        assert_eq!(err.kind(), "descriptor_mismatch");
    }

    #[test]
    fn test_mismatch_message_names_parameter() {
        let descriptor = FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I32, MemoryLayout::F64]);
        let signature = MethodType::of(ValueType::I32, vec![ValueType::I32, ValueType::I64]);
        match check_signature(&descriptor, &signature) {
            Err(UpcallError::DescriptorMismatch { reason, .. }) => {
                assert_eq!(reason, "parameter 1 is f64 (f64), target expects i64")
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_link_checks_signature_before_building_sequence() {
        let linker = UpcallLinker::default();
        let session = Session::open();
        // Building this sequence would fail on every host
        let descriptor = FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::LONG_DOUBLE]);
        let err = linker
            .link(UpcallTarget::constant(Value::I32(1)), &descriptor, &AbiDescriptor::win64(), &session)
            .unwrap_err();
        assert_eq!(err.kind(), "descriptor_mismatch");
        assert_eq!(session.thunk_count(), 0);
    }

    #[test]
    fn test_default_abi_prefers_config() {
        let linker = UpcallLinker::new(LinkerConfig {
            abi: Some(AbiDescriptor::win64()),
            ..LinkerConfig::default()
        });
        assert_eq!(linker.default_abi().unwrap(), AbiDescriptor::win64());
    }
}
