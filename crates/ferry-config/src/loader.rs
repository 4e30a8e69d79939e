//! Configuration Loader
//!
//! Finds `ferry.toml`, loads it, and applies `FERRY_*` environment overrides.

use crate::settings::{validate_abi, FerryConfig};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Name of the project configuration file
pub const CONFIG_FILE: &str = "ferry.toml";

/// Configuration loader
///
/// Precedence, lowest first:
/// 1. Built-in defaults
/// 2. Project config (`ferry.toml`)
/// 3. Environment variables (`FERRY_*`)
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Skip environment overrides (used by tests and embedders that manage the env themselves)
    ignore_env: bool,
}

/// Merged configuration result
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub settings: FerryConfig,

    /// Directory containing the `ferry.toml` that was loaded
    pub root: Option<PathBuf>,
}

impl Config {
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Whether the settings came from a file rather than defaults alone
    pub fn has_file(&self) -> bool {
        self.root.is_some()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader that ignores `FERRY_*` variables
    pub fn without_env() -> Self {
        Self { ignore_env: true }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find `ferry.toml`. Missing files are not
    /// an error; defaults are used instead.
    pub fn load_from_directory(&self, start_dir: &Path) -> ConfigResult<Config> {
        let (root, settings) = self.find_config(start_dir)?;
        let settings = self.apply_env_overrides(settings)?;
        tracing::debug!(root = ?root, "loaded configuration");
        Ok(Config { settings, root })
    }

    /// Load configuration from a specific file
    pub fn load_from_file(&self, config_path: &Path) -> ConfigResult<Config> {
        let settings = FerryConfig::load_from_file(config_path)?;
        let settings = self.apply_env_overrides(settings)?;
        Ok(Config {
            settings,
            root: config_path.parent().map(|p| p.to_path_buf()),
        })
    }

    fn find_config(&self, start_dir: &Path) -> ConfigResult<(Option<PathBuf>, FerryConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(CONFIG_FILE);

            if config_path.exists() {
                let settings = FerryConfig::load_from_file(&config_path)?;
                return Ok((Some(current), settings));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, FerryConfig::default())),
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Recognised variables: `FERRY_OPT_LEVEL`, `FERRY_FAILURE_POLICY`,
    /// `FERRY_ABI`, `FERRY_LOG` and `FERRY_LOG_FORMAT`.
    fn apply_env_overrides(&self, mut config: FerryConfig) -> ConfigResult<FerryConfig> {
        if self.ignore_env {
            return Ok(config);
        }

        if let Ok(level) = env::var("FERRY_OPT_LEVEL") {
            config.codegen.opt_level = level.parse()?;
        }

        if let Ok(policy) = env::var("FERRY_FAILURE_POLICY") {
            config.upcall.failure_policy = policy.parse()?;
        }

        if let Ok(abi) = env::var("FERRY_ABI") {
            let abi = abi.trim().to_lowercase();
            validate_abi(&abi)?;
            config.upcall.abi = abi;
        }

        if let Ok(filter) = env::var("FERRY_LOG") {
            if filter.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "FERRY_LOG".to_string(),
                    reason: "filter directive must not be empty".to_string(),
                });
            }
            config.logging.filter = filter;
        }

        if let Ok(format) = env::var("FERRY_LOG_FORMAT") {
            config.logging.format = format.parse()?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ConfigLoader::without_env()
            .load_from_directory(dir.path())
            .unwrap();
        // A ferry.toml above the temp dir would be picked up; none is expected there.
        if !config.has_file() {
            assert_eq!(config.settings, FerryConfig::default());
        }
    }

    #[test]
    fn test_walks_up_to_config() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "[codegen]\nopt_level = \"none\"\n",
        )
        .unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let config = ConfigLoader::without_env()
            .load_from_directory(&nested)
            .unwrap();
        assert_eq!(config.root(), Some(dir.path()));
        assert_eq!(
            config.settings.codegen.opt_level,
            crate::settings::OptLevel::None
        );
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = ConfigLoader::without_env().load_from_file(&dir.path().join(CONFIG_FILE));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[codegen\n").unwrap();
        match ConfigLoader::without_env().load_from_file(&path) {
            Err(ConfigError::TomlParseError { file, .. }) => assert_eq!(file, path),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
