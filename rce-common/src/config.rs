//! Configuration loading and resolution
//!
//! Resolution priority for every setting:
//! 1. Environment variable
//! 2. TOML config file
//! 3. Compiled default
//!
//! A missing or unreadable config file is never fatal: a warning is logged and
//! compiled defaults are used.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable holding the manifest signing secret
pub const HMAC_SECRET_ENV: &str = "RCE_VERIFICATION_HMAC_SECRET";
/// Legacy name still honoured for the signing secret
pub const LEGACY_HMAC_SECRET_ENV: &str = "VERIFICATION_HMAC_SECRET";
/// Environment variable overriding the plan archive directory
pub const ARCHIVE_DIR_ENV: &str = "RCE_ARCHIVE_DIR";
/// Environment variable overriding the log level
pub const LOG_LEVEL_ENV: &str = "RCE_LOG_LEVEL";

/// Logging section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Calibration data locations
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalibrationPaths {
    /// JSON document with per-method intrinsic sub-scores
    pub intrinsic_path: Option<PathBuf>,
    /// JSON document with per-layer transform configuration
    pub layer_config_path: Option<PathBuf>,
}

/// Bootstrap parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UncertaintyConfig {
    pub bootstrap_samples: usize,
    pub seed: u64,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            bootstrap_samples: 1000,
            seed: 42,
        }
    }
}

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TomlConfig {
    pub logging: LoggingConfig,
    pub calibration: CalibrationPaths,
    pub uncertainty: UncertaintyConfig,
    /// Plan archive directory
    pub archive_dir: Option<PathBuf>,
    /// Directory receiving phase and verification manifests
    pub artifacts_dir: Option<PathBuf>,
    /// Manifest signing secret (prefer the environment variable)
    pub hmac_secret: Option<String>,
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))
    }

    /// Load configuration, falling back to defaults when the file is missing
    ///
    /// Malformed TOML is an error: silently ignoring a config the user wrote
    /// would hide mistakes.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config = Self::from_toml_str(&text)?;
                info!("Loaded configuration from {:?}", path);
                Ok(config)
            }
            Err(e) => {
                warn!(
                    "Config file {:?} not readable ({}), using compiled defaults",
                    path, e
                );
                Ok(Self::default())
            }
        }
    }
}

/// Default configuration file path (`<config dir>/rce/rce.toml`)
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("rce").join("rce.toml"))
        .unwrap_or_else(|| PathBuf::from("./rce.toml"))
}

/// Default data directory for archived plans
pub fn default_archive_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("rce").join("plans"))
        .unwrap_or_else(|| PathBuf::from("./rce_data/plans"))
}

/// Resolve the manifest signing secret
///
/// **Priority:** ENV → legacy ENV → TOML
///
/// Returns `None` when no non-empty secret is configured; callers must then
/// mark integrity checking as disabled rather than sign with a placeholder.
pub fn resolve_hmac_secret(toml_config: &TomlConfig) -> Option<String> {
    let env_secret = non_empty_env(HMAC_SECRET_ENV);
    let legacy_secret = non_empty_env(LEGACY_HMAC_SECRET_ENV);
    let toml_secret = toml_config
        .hmac_secret
        .as_ref()
        .filter(|s| is_valid_secret(s))
        .cloned();

    let sources: Vec<&str> = [
        env_secret.as_ref().map(|_| "environment"),
        legacy_secret.as_ref().map(|_| "legacy environment"),
        toml_secret.as_ref().map(|_| "TOML"),
    ]
    .into_iter()
    .flatten()
    .collect();

    if sources.len() > 1 {
        warn!(
            "HMAC secret found in multiple sources: {}. Using highest priority.",
            sources.join(", ")
        );
    }

    if let Some(secret) = env_secret {
        info!("HMAC secret loaded from environment variable");
        return Some(secret);
    }
    if let Some(secret) = legacy_secret {
        warn!(
            "HMAC secret loaded from {}; rename to {}",
            LEGACY_HMAC_SECRET_ENV, HMAC_SECRET_ENV
        );
        return Some(secret);
    }
    if let Some(secret) = toml_secret {
        info!("HMAC secret loaded from TOML config");
        return Some(secret);
    }

    warn!("No HMAC secret configured; manifest integrity checking is disabled");
    None
}

/// Resolve the plan archive directory (ENV → TOML → default)
pub fn resolve_archive_dir(toml_config: &TomlConfig) -> PathBuf {
    if let Some(dir) = non_empty_env(ARCHIVE_DIR_ENV) {
        info!("Archive directory from environment: {}", dir);
        return PathBuf::from(dir);
    }
    if let Some(dir) = &toml_config.archive_dir {
        return dir.clone();
    }
    default_archive_dir()
}

/// Resolve the log level (ENV → TOML → default "info")
pub fn resolve_log_level(toml_config: &TomlConfig) -> String {
    non_empty_env(LOG_LEVEL_ENV).unwrap_or_else(|| toml_config.logging.level.clone())
}

/// Secret must be non-empty and not only whitespace
pub fn is_valid_secret(secret: &str) -> bool {
    !secret.trim().is_empty()
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| is_valid_secret(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.uncertainty.bootstrap_samples, 1000);
        assert_eq!(config.uncertainty.seed, 42);
        assert!(config.hmac_secret.is_none());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = TomlConfig::from_toml_str(
            r#"
            archive_dir = "/tmp/plans"

            [uncertainty]
            seed = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.archive_dir, Some(PathBuf::from("/tmp/plans")));
        assert_eq!(config.uncertainty.seed, 7);
        assert_eq!(config.uncertainty.bootstrap_samples, 1000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_malformed_toml_is_error() {
        assert!(TomlConfig::from_toml_str("archive_dir = [").is_err());
    }

    #[test]
    fn test_is_valid_secret() {
        assert!(is_valid_secret("k"));
        assert!(!is_valid_secret(""));
        assert!(!is_valid_secret("   "));
    }
}
