//! Ferry JIT - native thunk generation for upcalls
//!
//! Turns a [`CallingSequence`](ferry_runtime::CallingSequence) into machine
//! code with Cranelift. Each generated thunk captures its native arguments
//! into a transfer buffer, calls
//! [`upcall_entry`](ferry_runtime::upcall_entry) once, and places the result
//! where the native caller expects it.
//!
//! # Example
//!
//! ```no_run
//! use ferry_jit::{LinkerConfig, Session, UpcallLinker};
//! use ferry_runtime::{FunctionDescriptor, MemoryLayout, MethodType, UpcallTarget, Value, ValueType};
//!
//! let target = UpcallTarget::closure(
//!     MethodType::of(ValueType::I32, vec![ValueType::I32, ValueType::I32]),
//!     |args| match args {
//!         [Value::I32(a), Value::I32(b)] => Ok(Value::I32(a + b)),
//!         _ => unreachable!(),
//!     },
//! );
//! let descriptor = FunctionDescriptor::of(MemoryLayout::I32, vec![MemoryLayout::I32; 2]);
//!
//! let linker = UpcallLinker::new(LinkerConfig::default());
//! let session = Session::open();
//! let address = linker.link_default(target, &descriptor, &session).unwrap();
//! let add: extern "C" fn(i32, i32) -> i32 = unsafe { address.to_fn() };
//! assert_eq!(add(3, 4), 7);
//! ```

pub mod backend;
pub mod codegen;
pub mod linker;
pub mod session;
pub mod stub;

pub use linker::UpcallLinker;
pub use session::{NativeAddress, Session, ThunkHandle};
pub use stub::UpcallStubFactory;

use ferry_config::FerryConfig;
use ferry_runtime::{AbiDescriptor, FailurePolicy, UpcallError, UpcallResult};

/// Cranelift optimisation level for generated thunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    /// Value of Cranelift's `opt_level` setting
    pub fn as_str(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

impl From<ferry_config::OptLevel> for OptLevel {
    fn from(level: ferry_config::OptLevel) -> Self {
        match level {
            ferry_config::OptLevel::None => OptLevel::None,
            ferry_config::OptLevel::Speed => OptLevel::Speed,
            ferry_config::OptLevel::SpeedAndSize => OptLevel::SpeedAndSize,
        }
    }
}

/// Configuration for the upcall linker
#[derive(Debug, Clone, Default)]
pub struct LinkerConfig {
    /// Optimisation level for sessions opened by the linker
    pub opt_level: OptLevel,
    /// What thunks do when their target fails
    pub failure_policy: FailurePolicy,
    /// ABI used by `link_default`; `None` means the host's
    pub abi: Option<AbiDescriptor>,
}

impl LinkerConfig {
    /// Build a linker configuration from loaded `ferry.toml` settings
    pub fn from_config(config: &FerryConfig) -> UpcallResult<Self> {
        let abi = match config.upcall.abi.as_str() {
            "host" => None,
            name => Some(AbiDescriptor::by_name(name).ok_or_else(|| UpcallError::UnsupportedPlatform {
                abi: name.to_string(),
                arch: "unknown".to_string(),
                host: std::env::consts::ARCH.to_string(),
            })?),
        };
        let failure_policy = match config.upcall.failure_policy {
            ferry_config::FailurePolicy::Sentinel => FailurePolicy::Sentinel,
            ferry_config::FailurePolicy::Abort => FailurePolicy::Abort,
        };
        Ok(Self {
            opt_level: config.codegen.opt_level.into(),
            failure_policy,
            abi,
        })
    }

    /// Config for tests: no optimisation, so IR stays close to what was emitted
    pub fn for_testing() -> Self {
        Self {
            opt_level: OptLevel::None,
            ..Self::default()
        }
    }
}

pub(crate) fn resource_error(context: &str, error: impl std::fmt::Display) -> UpcallError {
    UpcallError::Resource(format!("{}: {}", context, error))
}
