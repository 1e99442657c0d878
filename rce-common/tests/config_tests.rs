//! Configuration resolution tests
//!
//! Uses serial_test to prevent ENV variable races: every test touching
//! RCE_* variables is marked #[serial].

use rce_common::config::{
    resolve_archive_dir, resolve_hmac_secret, resolve_log_level, TomlConfig, ARCHIVE_DIR_ENV,
    HMAC_SECRET_ENV, LEGACY_HMAC_SECRET_ENV, LOG_LEVEL_ENV,
};
use serial_test::serial;
use std::env;
use std::path::PathBuf;

fn clear_env() {
    env::remove_var(HMAC_SECRET_ENV);
    env::remove_var(LEGACY_HMAC_SECRET_ENV);
    env::remove_var(ARCHIVE_DIR_ENV);
    env::remove_var(LOG_LEVEL_ENV);
}

#[test]
#[serial]
fn test_missing_config_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = TomlConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, TomlConfig::default());
}

#[test]
#[serial]
fn test_config_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rce.toml");
    std::fs::write(&path, "hmac_secret = \"from-toml\"\n[logging]\nlevel = \"debug\"\n").unwrap();

    let config = TomlConfig::load_or_default(&path).unwrap();
    assert_eq!(config.hmac_secret.as_deref(), Some("from-toml"));
    assert_eq!(config.logging.level, "debug");
}

#[test]
#[serial]
fn test_secret_env_overrides_toml() {
    clear_env();
    env::set_var(HMAC_SECRET_ENV, "from-env");
    let config = TomlConfig {
        hmac_secret: Some("from-toml".to_string()),
        ..Default::default()
    };

    assert_eq!(resolve_hmac_secret(&config).as_deref(), Some("from-env"));
    clear_env();
}

#[test]
#[serial]
fn test_secret_legacy_env_is_honoured() {
    clear_env();
    env::set_var(LEGACY_HMAC_SECRET_ENV, "legacy");
    assert_eq!(
        resolve_hmac_secret(&TomlConfig::default()).as_deref(),
        Some("legacy")
    );
    clear_env();
}

#[test]
#[serial]
fn test_secret_absent_or_blank_is_none() {
    clear_env();
    assert!(resolve_hmac_secret(&TomlConfig::default()).is_none());

    env::set_var(HMAC_SECRET_ENV, "   ");
    let config = TomlConfig {
        hmac_secret: Some(String::new()),
        ..Default::default()
    };
    assert!(resolve_hmac_secret(&config).is_none());
    clear_env();
}

#[test]
#[serial]
fn test_archive_dir_priority() {
    clear_env();
    let config = TomlConfig {
        archive_dir: Some(PathBuf::from("/toml/plans")),
        ..Default::default()
    };
    assert_eq!(resolve_archive_dir(&config), PathBuf::from("/toml/plans"));

    env::set_var(ARCHIVE_DIR_ENV, "/env/plans");
    assert_eq!(resolve_archive_dir(&config), PathBuf::from("/env/plans"));
    clear_env();
}

#[test]
#[serial]
fn test_log_level_priority() {
    clear_env();
    assert_eq!(resolve_log_level(&TomlConfig::default()), "info");
    env::set_var(LOG_LEVEL_ENV, "trace");
    assert_eq!(resolve_log_level(&TomlConfig::default()), "trace");
    clear_env();
}
