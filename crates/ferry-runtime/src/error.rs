//! Upcall error kinds
//!
//! Every failure the bridge can report is a variant of [`UpcallError`].
//! Link-time kinds are returned from `link`/`make`/`build`; the
//! `NativeTransition` kind is only ever produced inside an invocation and
//! surfaces through the thread-local error channel.

use crate::target::TargetError;
use thiserror::Error;

/// Upcall bridge errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpcallError {
    #[error("descriptor {descriptor} does not match target signature {signature}: {reason}")]
    DescriptorMismatch {
        descriptor: String,
        signature: String,
        reason: String,
    },

    #[error("layout `{layout}` is not supported by {abi}: {reason}")]
    UnsupportedLayout {
        layout: String,
        abi: String,
        reason: String,
    },

    #[error("session {session} is closed")]
    Lifecycle { session: u64 },

    #[error("code memory unavailable: {0}")]
    Resource(String),

    #[error("upcall target failed: {0}")]
    NativeTransition(#[from] TargetError),

    #[error("ABI `{abi}` targets {arch}, but this host is {host}")]
    UnsupportedPlatform {
        abi: String,
        arch: String,
        host: String,
    },
}

impl UpcallError {
    /// Short kind name, stable across messages
    pub fn kind(&self) -> &'static str {
        match self {
            UpcallError::DescriptorMismatch { .. } => "descriptor_mismatch",
            UpcallError::UnsupportedLayout { .. } => "unsupported_layout",
            UpcallError::Lifecycle { .. } => "lifecycle",
            UpcallError::Resource(_) => "resource",
            UpcallError::NativeTransition(_) => "native_transition",
            UpcallError::UnsupportedPlatform { .. } => "unsupported_platform",
        }
    }
}

/// Result type for upcall operations
pub type UpcallResult<T> = Result<T, UpcallError>;
