//! Ferry Configuration System
//!
//! Provides configuration management for the upcall bridge:
//! - Code generation settings (Cranelift optimisation level)
//! - Upcall behaviour (failure policy, default ABI)
//! - Logging setup (`tracing-subscriber` filter and format)
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Project config (`ferry.toml`, found by walking up from a directory)
//! 3. Environment variables (`FERRY_*`)
//!
//! # Example
//!
//! ```no_run
//! use ferry_config::ConfigLoader;
//! use std::path::Path;
//!
//! let loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! ferry_config::logging::init_logging(&config.settings.logging).unwrap();
//! ```

pub mod loader;
pub mod logging;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use loader::{Config, ConfigLoader, CONFIG_FILE};
pub use settings::{
    CodegenConfig, FailurePolicy, FerryConfig, LogFormat, LoggingConfig, OptLevel, UpcallConfig,
};
