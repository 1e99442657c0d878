//! Execution plan data model
//!
//! An execution plan is the immutable list of exactly [`REQUIRED_TASK_COUNT`]
//! analysis tasks for one document run. Construction is the only place the
//! size and uniqueness invariants are checked; a constructed plan cannot be
//! mutated, so they hold for its whole lifetime.
//!
//! The integrity hash is derived on demand from the canonical JSON of the
//! ordered task list and is never stored on the plan itself.

pub mod archive;

pub use archive::{ArchiveEntry, PlanArchive};

use crate::error::PlanError;
use crate::phases::canonical::AnsweredQuestion;
use rce_common::{sha256_hex, to_canonical_json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Number of tasks every execution plan must contain
pub const REQUIRED_TASK_COUNT: usize = 300;

/// A resolved external signal attached to a task (opaque to the engine)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalRecord {
    pub signal_type: String,
    pub content: String,
}

impl SignalRecord {
    pub fn new(signal_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            signal_type: signal_type.into(),
            content: content.into(),
        }
    }
}

/// One analysis task: a micro-question applied to one content chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableTask {
    pub task_id: String,
    /// Micro-question context (question id, dimension, policy area, ...)
    pub micro_question_context: Value,
    /// Content-addressed chunk id
    pub target_chunk: String,
    /// Ordered pattern identifiers
    pub applicable_patterns: Vec<String>,
    /// Resolved signals; a set, serialized in sorted order
    pub resolved_signals: BTreeSet<SignalRecord>,
    pub creation_timestamp: String,
    /// Version tag of the component that produced the task
    pub synchronizer_version: String,
}

impl ExecutableTask {
    /// JSON form used for hashing and archival
    pub fn to_json(&self) -> Value {
        json!({
            "task_id": self.task_id,
            "micro_question_context": self.micro_question_context,
            "target_chunk": self.target_chunk,
            "applicable_patterns": self.applicable_patterns,
            "resolved_signals": self
                .resolved_signals
                .iter()
                .map(|s| json!({"signal_type": s.signal_type, "content": s.content}))
                .collect::<Vec<_>>(),
            "creation_timestamp": self.creation_timestamp,
            "synchronizer_version": self.synchronizer_version,
        })
    }

    fn validate(&self) -> Result<(), PlanError> {
        if self.task_id.trim().is_empty() {
            return Err(PlanError::InvalidTask("task_id must be non-empty".to_string()));
        }
        if self.target_chunk.trim().is_empty() {
            return Err(PlanError::InvalidTask(format!(
                "task {} has an empty target_chunk",
                self.task_id
            )));
        }
        Ok(())
    }
}

/// Immutable plan of exactly [`REQUIRED_TASK_COUNT`] tasks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    plan_id: String,
    tasks: Vec<ExecutableTask>,
    metadata: BTreeMap<String, Value>,
}

impl ExecutionPlan {
    /// Construct a plan, enforcing task count and id uniqueness
    ///
    /// # Errors
    /// * `PlanError::TaskCount` if `tasks.len() != REQUIRED_TASK_COUNT`
    /// * `PlanError::DuplicateTaskIds` listing every duplicated id (sorted)
    /// * `PlanError::InvalidTask` for empty ids or chunk references
    pub fn new(
        plan_id: impl Into<String>,
        tasks: Vec<ExecutableTask>,
        metadata: BTreeMap<String, Value>,
    ) -> Result<Self, PlanError> {
        let plan_id = plan_id.into();
        if plan_id.trim().is_empty() {
            return Err(PlanError::InvalidTask("plan_id must be non-empty".to_string()));
        }

        if tasks.len() != REQUIRED_TASK_COUNT {
            return Err(PlanError::TaskCount {
                expected: REQUIRED_TASK_COUNT,
                actual: tasks.len(),
            });
        }

        for task in &tasks {
            task.validate()?;
        }

        let mut seen = HashSet::new();
        let duplicates: BTreeSet<&str> = tasks
            .iter()
            .filter(|t| !seen.insert(t.task_id.as_str()))
            .map(|t| t.task_id.as_str())
            .collect();
        if !duplicates.is_empty() {
            return Err(PlanError::DuplicateTaskIds(
                duplicates.into_iter().map(String::from).collect(),
            ));
        }

        Ok(Self {
            plan_id,
            tasks,
            metadata,
        })
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn tasks(&self) -> &[ExecutableTask] {
        &self.tasks
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Tasks as JSON, in plan order
    pub fn tasks_json(&self) -> Value {
        Value::Array(self.tasks.iter().map(ExecutableTask::to_json).collect())
    }

    /// SHA-256 over the canonical JSON of the ordered task list
    ///
    /// Recomputed on every call; identical task data always yields the same hash.
    pub fn compute_integrity_hash(&self) -> String {
        sha256_hex(to_canonical_json(&self.tasks_json()).as_bytes())
    }
}

/// Task for an answered micro-question
///
/// Targets the question's first evidence chunk, or `default_chunk` when the
/// answer cites none. Each cited chunk becomes an `evidence_chunk` signal.
pub fn task_for_question(
    answer: &AnsweredQuestion,
    default_chunk: &str,
    synchronizer_version: &str,
) -> ExecutableTask {
    let target_chunk = answer
        .evidence_chunks
        .first()
        .cloned()
        .unwrap_or_else(|| default_chunk.to_string());
    ExecutableTask {
        task_id: format!("MQ-{}", answer.question_id),
        micro_question_context: json!({
            "question_id": answer.question_id,
            "dimension": answer.dimension,
            "policy_area": answer.policy_area,
        }),
        target_chunk,
        applicable_patterns: Vec::new(),
        resolved_signals: answer
            .evidence_chunks
            .iter()
            .map(|c| SignalRecord::new("evidence_chunk", c.clone()))
            .collect(),
        creation_timestamp: rce_common::time::now_iso(),
        synchronizer_version: synchronizer_version.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn task(i: usize) -> ExecutableTask {
        ExecutableTask {
            task_id: format!("T{:04}", i),
            micro_question_context: json!({
                "question_id": format!("Q{:03}", i % 30 + 1),
                "dimension": format!("DIM{:02}", i % 6 + 1),
                "policy_area": format!("PA{:02}", i % 10 + 1),
            }),
            target_chunk: format!("chunk-{:x}", i * 7919),
            applicable_patterns: vec![format!("PAT-{}", i % 5), "PAT-common".to_string()],
            resolved_signals: [SignalRecord::new("keyword", format!("kw{}", i % 3))]
                .into_iter()
                .collect(),
            creation_timestamp: "2025-01-01T00:00:00Z".to_string(),
            synchronizer_version: "1.0.0".to_string(),
        }
    }

    pub fn tasks(n: usize) -> Vec<ExecutableTask> {
        (0..n).map(task).collect()
    }

    pub fn plan(plan_id: &str) -> ExecutionPlan {
        ExecutionPlan::new(plan_id, tasks(REQUIRED_TASK_COUNT), BTreeMap::new())
            .expect("valid plan")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_plan_with_required_count_is_valid() {
        let plan = plan("plan-1");
        assert_eq!(plan.tasks().len(), REQUIRED_TASK_COUNT);
        assert_eq!(plan.plan_id(), "plan-1");
    }

    #[test]
    fn test_wrong_task_count_rejected() {
        for n in [REQUIRED_TASK_COUNT - 1, REQUIRED_TASK_COUNT + 1, 0] {
            let err = ExecutionPlan::new("p", tasks(n), BTreeMap::new()).unwrap_err();
            assert_eq!(
                err,
                PlanError::TaskCount {
                    expected: REQUIRED_TASK_COUNT,
                    actual: n
                }
            );
        }
    }

    #[test]
    fn test_duplicate_ids_reported_sorted() {
        let mut tasks = tasks(REQUIRED_TASK_COUNT);
        tasks[10].task_id = "T0002".to_string();
        tasks[20].task_id = "T0001".to_string();
        tasks[30].task_id = "T0001".to_string();

        let err = ExecutionPlan::new("p", tasks, BTreeMap::new()).unwrap_err();
        assert_eq!(
            err,
            PlanError::DuplicateTaskIds(vec!["T0001".to_string(), "T0002".to_string()])
        );
    }

    #[test]
    fn test_empty_task_id_rejected() {
        let mut tasks = tasks(REQUIRED_TASK_COUNT);
        tasks[0].task_id = " ".to_string();
        assert!(matches!(
            ExecutionPlan::new("p", tasks, BTreeMap::new()),
            Err(PlanError::InvalidTask(_))
        ));
    }

    #[test]
    fn test_integrity_hash_is_pure_function_of_tasks() {
        let a = plan("a");
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), json!("other"));
        let b = ExecutionPlan::new("b", tasks(REQUIRED_TASK_COUNT), metadata).unwrap();

        assert_eq!(a.compute_integrity_hash(), a.compute_integrity_hash());
        assert_eq!(a.compute_integrity_hash(), b.compute_integrity_hash());
        assert_eq!(a.compute_integrity_hash().len(), 64);
    }

    #[test]
    fn test_integrity_hash_changes_with_any_field() {
        let base = plan("p").compute_integrity_hash();

        let mutations: Vec<Box<dyn Fn(&mut ExecutableTask)>> = vec![
            Box::new(|t| t.task_id.push('x')),
            Box::new(|t| t.micro_question_context = json!({"question_id": "Q999"})),
            Box::new(|t| t.target_chunk.push('x')),
            Box::new(|t| t.applicable_patterns.reverse()),
            Box::new(|t| {
                t.resolved_signals.insert(SignalRecord::new("entity", "new"));
            }),
            Box::new(|t| t.creation_timestamp = "2030-01-01T00:00:00Z".to_string()),
            Box::new(|t| t.synchronizer_version = "2.0.0".to_string()),
        ];

        for mutate in mutations {
            let mut tasks = tasks(REQUIRED_TASK_COUNT);
            mutate(&mut tasks[5]);
            let changed = ExecutionPlan::new("p", tasks, BTreeMap::new())
                .unwrap()
                .compute_integrity_hash();
            assert_ne!(base, changed);
        }
    }

    #[test]
    fn test_signal_set_order_does_not_affect_hash() {
        let mut t1 = tasks(REQUIRED_TASK_COUNT);
        let mut t2 = tasks(REQUIRED_TASK_COUNT);
        t1[0].resolved_signals.insert(SignalRecord::new("a", "1"));
        t1[0].resolved_signals.insert(SignalRecord::new("b", "2"));
        t2[0].resolved_signals.insert(SignalRecord::new("b", "2"));
        t2[0].resolved_signals.insert(SignalRecord::new("a", "1"));

        let h1 = ExecutionPlan::new("p", t1, BTreeMap::new()).unwrap();
        let h2 = ExecutionPlan::new("p", t2, BTreeMap::new()).unwrap();
        assert_eq!(h1.compute_integrity_hash(), h2.compute_integrity_hash());
    }

    #[test]
    fn test_task_for_question() {
        let answer = AnsweredQuestion {
            question_id: "Q007".into(),
            dimension: "DIM02".into(),
            policy_area: "PA03".into(),
            score: 0.5,
            evidence_chunks: vec!["c2".into(), "c1".into()],
        };
        let task = task_for_question(&answer, "c0", "1.0.0");
        assert_eq!(task.task_id, "MQ-Q007");
        assert_eq!(task.target_chunk, "c2");
        assert_eq!(task.resolved_signals.len(), 2);
        assert_eq!(task.micro_question_context["policy_area"], "PA03");

        let bare = AnsweredQuestion {
            evidence_chunks: vec![],
            ..answer
        };
        assert_eq!(task_for_question(&bare, "c0", "1.0.0").target_chunk, "c0");
    }
}
