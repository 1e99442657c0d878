//! Plan archival with an append-only JSONL index
//!
//! Each archived plan is written to its own JSON file and recorded in a
//! one-object-per-line index. Writes follow a three-step protocol:
//! 1. Write the plan file
//! 2. Append the index entry
//! 3. Verify the plan file exists and is non-empty
//!
//! Rollback: if step 2 fails the plan file is deleted; if step 3 fails the
//! index entry is removed. Writers are serialized through an async mutex so
//! index appends are strictly ordered within the process.

use super::{ExecutableTask, ExecutionPlan};
use crate::error::ArchiveError;
use rce_common::time;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Default index file name inside the storage directory
pub const INDEX_FILE_NAME: &str = "plans.jsonl";

const UNKNOWN_CORRELATION: &str = "unknown";

/// One line of the plan index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub plan_id: String,
    pub storage_path: PathBuf,
    pub created_at: String,
    pub task_count: usize,
    pub integrity_hash: String,
    pub correlation_id: String,
}

/// On-disk plan document
#[derive(Debug, Deserialize)]
struct StoredPlan {
    plan_id: String,
    tasks: Vec<ExecutableTask>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    integrity_hash: String,
}

/// Serializes a plan document to the text written in step 1
type PlanRenderer = fn(&Value) -> serde_json::Result<String>;

/// Plan archive rooted at a storage directory
pub struct PlanArchive {
    storage_dir: PathBuf,
    index_path: PathBuf,
    write_lock: Mutex<()>,
    render: PlanRenderer,
}

impl PlanArchive {
    /// Open (and create if needed) an archive using `storage_dir/plans.jsonl` as index
    pub async fn open(storage_dir: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let storage_dir = storage_dir.into();
        let index_path = storage_dir.join(INDEX_FILE_NAME);
        Self::open_with_index(storage_dir, index_path).await
    }

    /// Open an archive with an explicit index file location
    pub async fn open_with_index(
        storage_dir: impl Into<PathBuf>,
        index_path: impl Into<PathBuf>,
    ) -> Result<Self, ArchiveError> {
        let storage_dir = storage_dir.into();
        tokio::fs::create_dir_all(&storage_dir)
            .await
            .map_err(|e| ArchiveError::Storage {
                plan_id: String::new(),
                step: "open",
                message: format!("cannot create {:?}: {}", storage_dir, e),
            })?;

        Ok(Self {
            storage_dir,
            index_path: index_path.into(),
            write_lock: Mutex::new(()),
            render: render_plan,
        })
    }

    /// Replace how plan documents are serialized before they are written
    pub(crate) fn with_renderer(mut self, render: PlanRenderer) -> Self {
        self.render = render;
        self
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Archive a plan following the write / index / verify protocol
    ///
    /// # Returns
    /// * The index entry that was appended
    ///
    /// # Errors
    /// * `ArchiveError::Storage` naming the failed step, after rollback
    pub async fn archive(
        &self,
        plan: &ExecutionPlan,
        correlation_id: Option<&str>,
    ) -> Result<ArchiveEntry, ArchiveError> {
        let _guard = self.write_lock.lock().await;

        let created_at = time::now_iso();
        let correlation_id = correlation_id.unwrap_or(UNKNOWN_CORRELATION).to_string();
        let integrity_hash = plan.compute_integrity_hash();
        let storage_path = self.storage_dir.join(format!(
            "{}_{}.json",
            plan.plan_id(),
            time::colon_safe(&created_at)
        ));

        let entry = ArchiveEntry {
            plan_id: plan.plan_id().to_string(),
            storage_path: storage_path.clone(),
            created_at: created_at.clone(),
            task_count: plan.tasks().len(),
            integrity_hash: integrity_hash.clone(),
            correlation_id: correlation_id.clone(),
        };

        // Step 1: plan file
        let plan_data = json!({
            "plan_id": plan.plan_id(),
            "tasks": plan.tasks_json(),
            "metadata": plan.metadata(),
            "created_at": created_at,
            "integrity_hash": integrity_hash,
            "correlation_id": correlation_id,
        });
        if let Err(e) = write_plan_file(&storage_path, &plan_data, self.render).await {
            error!(
                event = "execution_plan_archive_failed",
                plan_id = %entry.plan_id,
                phase = "plan_file_write",
                correlation_id = %entry.correlation_id,
                error = %e,
                "Failed to write plan file"
            );
            return Err(storage_error(&entry, "plan_file_write", e));
        }

        // Step 2: index append
        if let Err(e) = self.append_index_entry(&entry).await {
            match tokio::fs::remove_file(&storage_path).await {
                Ok(()) => warn!(
                    event = "execution_plan_archive_rollback",
                    plan_id = %entry.plan_id,
                    reason = "index_write_failed",
                    rollback_action = "plan_file_deleted",
                    correlation_id = %entry.correlation_id,
                    "Rolled back plan file"
                ),
                Err(unlink_error) => error!(
                    event = "rollback_failed",
                    plan_id = %entry.plan_id,
                    correlation_id = %entry.correlation_id,
                    error = %unlink_error,
                    "Could not delete plan file during rollback"
                ),
            }
            error!(
                event = "execution_plan_archive_failed",
                plan_id = %entry.plan_id,
                phase = "index_write",
                correlation_id = %entry.correlation_id,
                error = %e,
                "Failed to append index entry"
            );
            return Err(storage_error(&entry, "index_write", e));
        }

        // Step 3: verification
        if let Err(message) = verify_plan_file(&storage_path).await {
            match self.remove_index_entry(&entry).await {
                Ok(()) => warn!(
                    event = "execution_plan_archive_rollback",
                    plan_id = %entry.plan_id,
                    reason = "verification_failed",
                    rollback_action = "index_entry_removed",
                    correlation_id = %entry.correlation_id,
                    "Rolled back index entry"
                ),
                Err(remove_error) => error!(
                    event = "rollback_failed",
                    plan_id = %entry.plan_id,
                    correlation_id = %entry.correlation_id,
                    error = %remove_error,
                    "Could not remove index entry during rollback"
                ),
            }
            error!(
                event = "execution_plan_archive_failed",
                plan_id = %entry.plan_id,
                phase = "verification",
                correlation_id = %entry.correlation_id,
                error = %message,
                "Plan file verification failed"
            );
            return Err(ArchiveError::Storage {
                plan_id: entry.plan_id.clone(),
                step: "verification",
                message,
            });
        }

        info!(
            event = "execution_plan_archived",
            plan_id = %entry.plan_id,
            storage_path = %entry.storage_path.display(),
            task_count = entry.task_count,
            integrity_hash = %entry.integrity_hash,
            correlation_id = %entry.correlation_id,
            "Execution plan archived"
        );

        Ok(entry)
    }

    /// All index entries in append order (malformed lines are skipped with a warning)
    pub async fn list(&self) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let text = match tokio::fs::read_to_string(&self.index_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ArchiveError::Storage {
                    plan_id: String::new(),
                    step: "index_read",
                    message: e.to_string(),
                })
            }
        };

        let mut entries = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ArchiveEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = line_no + 1, error = %e, "Skipping malformed index line"),
            }
        }
        Ok(entries)
    }

    /// Load the most recently archived version of a plan
    ///
    /// The plan is reconstructed through [`ExecutionPlan::new`] and its
    /// integrity hash is checked against the stored one.
    pub async fn load(&self, plan_id: &str) -> Result<ExecutionPlan, ArchiveError> {
        let entry = self
            .list()
            .await?
            .into_iter()
            .rev()
            .find(|e| e.plan_id == plan_id)
            .ok_or_else(|| ArchiveError::NotFound(plan_id.to_string()))?;

        let text = tokio::fs::read_to_string(&entry.storage_path)
            .await
            .map_err(|e| ArchiveError::Corrupt {
                plan_id: plan_id.to_string(),
                message: format!("cannot read {:?}: {}", entry.storage_path, e),
            })?;
        let stored: StoredPlan =
            serde_json::from_str(&text).map_err(|e| ArchiveError::Corrupt {
                plan_id: plan_id.to_string(),
                message: e.to_string(),
            })?;

        let plan = ExecutionPlan::new(stored.plan_id, stored.tasks, stored.metadata)?;
        let computed = plan.compute_integrity_hash();
        if computed != stored.integrity_hash {
            return Err(crate::error::PlanError::IntegrityMismatch {
                plan_id: plan_id.to_string(),
                stored: stored.integrity_hash,
                computed,
            }
            .into());
        }
        Ok(plan)
    }

    async fn append_index_entry(&self, entry: &ArchiveEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.index_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    async fn remove_index_entry(&self, entry: &ArchiveEntry) -> std::io::Result<()> {
        let text = tokio::fs::read_to_string(&self.index_path).await?;
        let kept: String = text
            .lines()
            .filter(|line| match serde_json::from_str::<ArchiveEntry>(line) {
                Ok(e) => !(e.plan_id == entry.plan_id && e.storage_path == entry.storage_path),
                Err(_) => !line.trim().is_empty(),
            })
            .map(|line| format!("{}\n", line))
            .collect();
        tokio::fs::write(&self.index_path, kept).await
    }
}

fn render_plan(data: &Value) -> serde_json::Result<String> {
    serde_json::to_string_pretty(data)
}

async fn write_plan_file(path: &Path, data: &Value, render: PlanRenderer) -> std::io::Result<()> {
    let text = render(data)?;
    tokio::fs::write(path, text).await
}

async fn verify_plan_file(path: &Path) -> Result<(), String> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err(format!("Plan file is empty: {:?}", path)),
        Err(e) => Err(format!("Plan file verification failed: {:?}: {}", path, e)),
    }
}

fn storage_error(entry: &ArchiveEntry, step: &'static str, e: std::io::Error) -> ArchiveError {
    ArchiveError::Storage {
        plan_id: entry.plan_id.clone(),
        step,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::test_support::plan;

    #[tokio::test]
    async fn test_archive_writes_file_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let archive = PlanArchive::open(dir.path()).await.unwrap();
        let plan = plan("plan-a");

        let entry = archive.archive(&plan, Some("corr-1")).await.unwrap();

        assert_eq!(entry.task_count, 300);
        assert_eq!(entry.correlation_id, "corr-1");
        assert_eq!(entry.integrity_hash, plan.compute_integrity_hash());
        assert!(entry.storage_path.exists());
        let file_name = entry.storage_path.file_name().unwrap().to_string_lossy();
        assert!(file_name.starts_with("plan-a_"));
        assert!(!file_name.contains(':'));

        let listed = archive.list().await.unwrap();
        assert_eq!(listed, vec![entry]);
    }

    #[tokio::test]
    async fn test_missing_correlation_defaults_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let archive = PlanArchive::open(dir.path()).await.unwrap();
        let entry = archive.archive(&plan("p"), None).await.unwrap();
        assert_eq!(entry.correlation_id, "unknown");
    }

    #[tokio::test]
    async fn test_load_round_trip_verifies_hash() {
        let dir = tempfile::tempdir().unwrap();
        let archive = PlanArchive::open(dir.path()).await.unwrap();
        let original = plan("plan-b");
        archive.archive(&original, None).await.unwrap();

        let loaded = archive.load("plan-b").await.unwrap();
        assert_eq!(loaded.compute_integrity_hash(), original.compute_integrity_hash());
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_load_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let archive = PlanArchive::open(dir.path()).await.unwrap();
        let entry = archive.archive(&plan("plan-c"), None).await.unwrap();

        let text = std::fs::read_to_string(&entry.storage_path).unwrap();
        std::fs::write(&entry.storage_path, text.replacen("chunk-0", "chunk-X", 1)).unwrap();

        assert!(matches!(
            archive.load("plan-c").await,
            Err(ArchiveError::Plan(crate::error::PlanError::IntegrityMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_index_failure_rolls_back_plan_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for append
        let bad_index = dir.path().join("index_is_a_dir");
        std::fs::create_dir(&bad_index).unwrap();
        let archive = PlanArchive::open_with_index(dir.path(), &bad_index)
            .await
            .unwrap();

        let err = archive.archive(&plan("plan-d"), None).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Storage { step: "index_write", .. }));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("plan-d_"))
            .collect();
        assert!(leftovers.is_empty(), "plan file must be deleted on rollback");
    }

    #[tokio::test]
    async fn test_verification_failure_removes_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = PlanArchive::open(dir.path())
            .await
            .unwrap()
            .with_renderer(|_| Ok(String::new()));
        let kept = PlanArchive::open(dir.path()).await.unwrap();
        let earlier = kept.archive(&plan("plan-e0"), None).await.unwrap();

        let err = archive.archive(&plan("plan-e"), None).await.unwrap_err();
        match err {
            ArchiveError::Storage { plan_id, step, message } => {
                assert_eq!(plan_id, "plan-e");
                assert_eq!(step, "verification");
                assert!(message.contains("empty"));
            }
            other => panic!("expected storage error, got {:?}", other),
        }

        // only the failed plan's line is rolled back
        assert_eq!(archive.list().await.unwrap(), vec![earlier]);
        assert!(matches!(
            archive.load("plan-e").await,
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_index_entry_only_removes_target() {
        let dir = tempfile::tempdir().unwrap();
        let archive = PlanArchive::open(dir.path()).await.unwrap();
        let first = archive.archive(&plan("one"), None).await.unwrap();
        let second = archive.archive(&plan("two"), None).await.unwrap();

        archive.remove_index_entry(&first).await.unwrap();
        assert_eq!(archive.list().await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn test_list_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let archive = PlanArchive::open(dir.path()).await.unwrap();
        let entry = archive.archive(&plan("p"), None).await.unwrap();
        let mut text = std::fs::read_to_string(archive.index_path()).unwrap();
        text.push_str("not json\n");
        std::fs::write(archive.index_path(), text).unwrap();

        assert_eq!(archive.list().await.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn test_load_unknown_plan() {
        let dir = tempfile::tempdir().unwrap();
        let archive = PlanArchive::open(dir.path()).await.unwrap();
        assert!(matches!(
            archive.load("nope").await,
            Err(ArchiveError::NotFound(_))
        ));
    }
}
