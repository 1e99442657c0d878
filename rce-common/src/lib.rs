//! # RCE Common Library
//!
//! Shared code for the rubric calibration engine:
//! - Error type and result alias
//! - Configuration loading (ENV → TOML → compiled defaults)
//! - Canonical JSON serialization and content hashing
//! - Timestamp helpers
//! - Tracing initialization

pub mod canonical;
pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use canonical::{sha256_hex, to_canonical_json};
pub use error::{Error, Result};
