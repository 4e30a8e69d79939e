//! Bridge configuration (ferry.toml)
//!
//! Every section and field is optional; missing values take the defaults
//! documented on each type.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// ABI names accepted by `[upcall] abi`
pub const KNOWN_ABIS: &[&str] = &["host", "sysv-x86_64", "win64", "aapcs64", "aapcs64-apple"];

/// Contents of a ferry.toml file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct FerryConfig {
    #[serde(default)]
    pub codegen: CodegenConfig,

    #[serde(default)]
    pub upcall: UpcallConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[codegen]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct CodegenConfig {
    /// Cranelift optimisation level for generated thunks
    #[serde(default)]
    pub opt_level: OptLevel,
}

/// `[upcall]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UpcallConfig {
    /// What a failed upcall does at the native boundary
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// ABI used by `link_default` (one of [`KNOWN_ABIS`])
    #[serde(default = "default_abi")]
    pub abi: String,
}

impl Default for UpcallConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            abi: default_abi(),
        }
    }
}

fn default_abi() -> String {
    "host".to_string()
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive string
    #[serde(default = "default_filter")]
    pub filter: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
        }
    }
}

fn default_filter() -> String {
    "ferry=info".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Zero the return value and record the error on the calling thread
    #[default]
    Sentinel,
    /// Abort the process
    Abort,
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Compact single-line output
    #[default]
    Compact,
    /// Human-readable multi-line output
    Pretty,
    /// JSON objects for structured logging
    Json,
}

macro_rules! keyword_enum {
    ($ty:ident, $field:literal, { $($name:literal => $variant:ident),* $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)*
                }
            }
        }

        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)*
                    other => Err(ConfigError::InvalidValue {
                        field: $field.to_string(),
                        reason: format!(
                            "unknown value '{}' (expected one of: {})",
                            other,
                            [$($name),*].join(", ")
                        ),
                    }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

keyword_enum!(OptLevel, "codegen.opt_level", {
    "none" => None,
    "speed" => Speed,
    "speed_and_size" => SpeedAndSize,
});

keyword_enum!(FailurePolicy, "upcall.failure_policy", {
    "sentinel" => Sentinel,
    "abort" => Abort,
});

keyword_enum!(LogFormat, "logging.format", {
    "compact" => Compact,
    "pretty" => Pretty,
    "json" => Json,
});

impl FerryConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: FerryConfig =
            toml::from_str(&content).map_err(|error| ConfigError::TomlParseError {
                file: path.to_path_buf(),
                error,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot check on its own
    pub fn validate(&self) -> ConfigResult<()> {
        validate_abi(&self.upcall.abi)?;
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "logging.filter".to_string(),
                reason: "filter directive must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) fn validate_abi(name: &str) -> ConfigResult<()> {
    if KNOWN_ABIS.contains(&name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: "upcall.abi".to_string(),
            reason: format!(
                "unknown ABI '{}' (expected one of: {})",
                name,
                KNOWN_ABIS.join(", ")
            ),
        })
    }
}
