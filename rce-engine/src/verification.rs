//! Verification manifest
//!
//! A signed summary of one run. Sections are accumulated with a builder and
//! the result is finalized by an HMAC-SHA256 over the canonical JSON of the
//! manifest without its `integrity_hmac` field.
//!
//! Without a secret the manifest is still produced, but it is marked
//! `integrity_mode: "disabled"` with a null signature, and
//! [`verify_manifest`] never accepts it.

use crate::error::ManifestError;
use hmac::{Hmac, Mac};
use rce_common::time::now_iso;
use rce_common::to_canonical_json;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const MANIFEST_VERSION: &str = "1.0.0";
pub const SIGNATURE_FIELD: &str = "integrity_hmac";
pub const INTEGRITY_MODE_FIELD: &str = "integrity_mode";
pub const INTEGRITY_MODE_HMAC: &str = "hmac-sha256";
pub const INTEGRITY_MODE_DISABLED: &str = "disabled";

/// Seeds and identifiers that make a run reproducible
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeterminismInfo {
    pub seed_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_unit_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub seeds_by_component: BTreeMap<String, u64>,
}

/// One phase line of the manifest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseEntry {
    pub phase_id: usize,
    pub phase_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_processed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn hmac_hex(secret: &str, content: &str) -> Result<String, ManifestError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| ManifestError::InvalidKey)?;
    mac.update(content.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn canonical_without_signature(manifest: &Map<String, Value>) -> String {
    let mut unsigned = manifest.clone();
    unsigned.remove(SIGNATURE_FIELD);
    to_canonical_json(&Value::Object(unsigned))
}

// ========================================
// Builder
// ========================================

pub struct VerificationManifestBuilder {
    data: Map<String, Value>,
    secret: Option<String>,
}

impl VerificationManifestBuilder {
    /// Blank secrets count as absent
    pub fn new(secret: Option<String>) -> Self {
        let secret = secret.filter(|s| !s.trim().is_empty());
        if secret.is_none() {
            warn!("No manifest HMAC secret configured; integrity checking disabled");
        }
        let mut data = Map::new();
        data.insert("version".into(), json!(MANIFEST_VERSION));
        data.insert("timestamp".into(), json!(now_iso()));
        data.insert("success".into(), json!(false));
        Self { data, secret }
    }

    pub fn set_success(mut self, success: bool) -> Self {
        self.data.insert("success".into(), json!(success));
        self
    }

    pub fn set_pipeline_hash(mut self, hash: &str) -> Self {
        self.data.insert("pipeline_hash".into(), json!(hash));
        self
    }

    /// Host and build information
    pub fn set_environment(mut self) -> Self {
        let cpu_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        self.data.insert(
            "environment".into(),
            json!({
                "engine_version": env!("CARGO_PKG_VERSION"),
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "cpu_count": cpu_count,
                "timestamp_utc": now_iso(),
            }),
        );
        self
    }

    /// Merge extra attributes into the environment section
    pub fn add_environment_info(mut self, extra: Map<String, Value>) -> Self {
        let section = self
            .data
            .entry("environment")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(env) = section {
            env.extend(extra);
        }
        self
    }

    pub fn set_determinism(mut self, info: &DeterminismInfo) -> Self {
        self.data.insert("determinism".into(), json!(info));
        self
    }

    pub fn set_calibrations(
        mut self,
        version: &str,
        calibration_hash: &str,
        methods_calibrated: usize,
        methods_missing: usize,
    ) -> Self {
        self.data.insert(
            "calibrations".into(),
            json!({
                "version": version,
                "hash": calibration_hash,
                "methods_calibrated": methods_calibrated,
                "methods_missing": methods_missing,
            }),
        );
        self
    }

    pub fn set_ingestion(mut self, method: &str, chunk_count: usize, text_length: usize, sentence_count: usize) -> Self {
        self.data.insert(
            "ingestion".into(),
            json!({
                "method": method,
                "chunk_count": chunk_count,
                "text_length": text_length,
                "sentence_count": sentence_count,
            }),
        );
        self
    }

    pub fn add_phase(mut self, entry: PhaseEntry) -> Self {
        let phases = self.data.entry("phases").or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = phases {
            list.push(json!(entry));
        }
        self
    }

    /// Add one entry per phase of a phase manifest, in execution order
    pub fn add_phases_from_manifest(mut self, phase_manifest: &Value) -> Self {
        let order = phase_manifest["phase_order"].as_array().cloned().unwrap_or_default();
        for (i, name) in order.iter().filter_map(Value::as_str).enumerate() {
            let record = &phase_manifest["phases"][name];
            self = self.add_phase(PhaseEntry {
                phase_id: i,
                phase_name: name.to_string(),
                success: record["status"] == "success",
                duration_ms: record["duration_ms"].as_f64(),
                items_processed: None,
                error: record["error"].as_str().map(String::from),
            });
        }
        self
    }

    pub fn add_artifact(mut self, artifact_id: &str, path: &str, hash: &str, size_bytes: Option<u64>) -> Self {
        let artifacts = self
            .data
            .entry("artifacts")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = artifacts {
            let mut entry = json!({"path": path, "hash": hash});
            if let Some(size) = size_bytes {
                entry["size_bytes"] = json!(size);
            }
            map.insert(artifact_id.to_string(), entry);
        }
        self
    }

    /// Arbitrary extra section (e.g. aggregation summary)
    pub fn set_section(mut self, name: &str, value: Value) -> Self {
        self.data.insert(name.to_string(), value);
        self
    }

    /// Canonicalize and sign
    pub fn build(self) -> Result<VerificationManifest, ManifestError> {
        let mut data = self.data;
        data.remove(SIGNATURE_FIELD);

        let signature = match &self.secret {
            Some(secret) => {
                data.insert(INTEGRITY_MODE_FIELD.into(), json!(INTEGRITY_MODE_HMAC));
                Value::String(hmac_hex(secret, &canonical_without_signature(&data))?)
            }
            None => {
                data.insert(INTEGRITY_MODE_FIELD.into(), json!(INTEGRITY_MODE_DISABLED));
                Value::Null
            }
        };
        data.insert(SIGNATURE_FIELD.into(), signature);

        Ok(VerificationManifest { data })
    }
}

// ========================================
// Finalized manifest
// ========================================

/// Finalized, read-only manifest
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationManifest {
    data: Map<String, Value>,
}

impl VerificationManifest {
    pub fn integrity_hmac(&self) -> Option<&str> {
        self.data.get(SIGNATURE_FIELD).and_then(Value::as_str)
    }

    pub fn is_signed(&self) -> bool {
        self.integrity_hmac().is_some()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.data.clone())
    }

    pub fn to_json_pretty(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(&self.data)?)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ManifestError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_json_pretty()?).await?;
        info!(path = %path.display(), signed = self.is_signed(), "Verification manifest written");
        Ok(())
    }
}

/// Recompute the HMAC over the canonical manifest and compare in constant time
pub fn verify_manifest(manifest: &Value, secret: &str) -> bool {
    let Some(map) = manifest.as_object() else {
        error!("Manifest is not a JSON object");
        return false;
    };
    let Some(provided) = map.get(SIGNATURE_FIELD).and_then(Value::as_str) else {
        error!("Manifest has no integrity_hmac signature");
        return false;
    };
    if secret.is_empty() {
        error!("Cannot verify manifest without a secret");
        return false;
    }
    let Ok(provided) = hex::decode(provided) else {
        error!("Manifest signature is not valid hex");
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(canonical_without_signature(map).as_bytes());
    let valid = mac.verify_slice(&provided).is_ok();
    if !valid {
        error!("HMAC verification failed; manifest may be tampered");
    }
    valid
}
