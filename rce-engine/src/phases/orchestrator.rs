//! Phase Orchestrator
//!
//! Runs the canonical phase sequence:
//! `phase0_input_validation → phase1_ingestion → phase1_to_phase2_adapter → phase2_micro_questions`
//!
//! # Error Handling
//! - Stops at the first failing phase; later phases never run
//! - This is the top-level boundary: failures become entries in
//!   [`PipelineResult::errors`] instead of propagating
//! - A manifest is produced for every run, successful or not
//! - Structural post-conditions are checked explicitly after the last phase
//!
//! # Example
//! ```rust,ignore
//! let orchestrator = PhaseOrchestrator::new(config, ingestor, answerer);
//! let result = orchestrator.run_pipeline(input).await;
//! ```

use super::canonical::{
    AdapterPhase, CanonicalInput, DocumentIngestor, IngestedDocument, IngestionPhase,
    InputValidationPhase, MicroQuestionsPhase, PipelineInput, PreprocessedDocument,
    QuestionAnswerer, QuestionsOutput, PHASE2_NAME, QUESTIONS_EMPTY_MESSAGE,
};
use super::contract::{run_phase, PhaseContract, PhaseFailure, PhaseRun};
use super::manifest::PhaseManifestBuilder;
use rce_common::time;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Number of phases in the canonical sequence
pub const CANONICAL_PHASE_COUNT: usize = 4;

/// File name of the saved phase manifest
pub const PHASE_MANIFEST_FILE: &str = "phase_manifest.json";

/// Orchestrator configuration
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// When set, the phase manifest is saved here as `phase_manifest.json`
    pub artifacts_dir: Option<PathBuf>,
}

/// Progress events
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    PhaseStarted {
        phase: String,
        index: usize,
        total: usize,
    },
    PhaseCompleted {
        phase: String,
        duration_ms: f64,
    },
    PhaseFailed {
        phase: String,
        error: String,
    },
    PipelineCompleted {
        run_id: Uuid,
        success: bool,
        duration_ms: f64,
    },
}

/// Validated output of each phase that completed
#[derive(Debug, Clone, Default)]
pub struct PipelineOutputs {
    pub canonical_input: Option<CanonicalInput>,
    pub ingested: Option<IngestedDocument>,
    pub preprocessed: Option<PreprocessedDocument>,
    pub questions: Option<QuestionsOutput>,
}

/// Structured outcome of a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub success: bool,
    pub run_id: Uuid,
    pub outputs: PipelineOutputs,
    pub phases_completed: usize,
    pub phases_failed: usize,
    pub total_duration_ms: f64,
    pub errors: Vec<String>,
    /// Phase manifest as JSON (see [`PhaseManifestBuilder::to_json`])
    pub manifest: Value,
}

/// Drives the canonical phases for one run
pub struct PhaseOrchestrator {
    config: OrchestratorConfig,
    ingestor: Arc<dyn DocumentIngestor>,
    answerer: Arc<dyn QuestionAnswerer>,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

/// Per-run mutable state
struct RunState {
    manifest: PhaseManifestBuilder,
    outputs: PipelineOutputs,
    completed: usize,
}

impl PhaseOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        ingestor: Arc<dyn DocumentIngestor>,
        answerer: Arc<dyn QuestionAnswerer>,
    ) -> Self {
        Self {
            config,
            ingestor,
            answerer,
            event_tx: None,
        }
    }

    /// Create orchestrator with event channel for progress reporting
    pub fn with_events(
        config: OrchestratorConfig,
        ingestor: Arc<dyn DocumentIngestor>,
        answerer: Arc<dyn QuestionAnswerer>,
        event_tx: mpsc::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            event_tx: Some(event_tx),
            ..Self::new(config, ingestor, answerer)
        }
    }

    /// Run every phase in order; never returns an error
    pub async fn run_pipeline(&self, input: PipelineInput) -> PipelineResult {
        let run_id = Uuid::new_v4();
        let started_at = time::now();
        info!(run_id = %run_id, run_label = %input.run_id, "Pipeline started");

        let mut state = RunState {
            manifest: PhaseManifestBuilder::new(),
            outputs: PipelineOutputs::default(),
            completed: 0,
        };
        let mut errors = Vec::new();
        let mut phases_failed = 0;

        match self.run_stages(input, &mut state).await {
            Ok(()) => {
                if let Some(message) = check_structural_invariants(&state.outputs) {
                    error!(run_id = %run_id, "{}", message);
                    state.manifest.mark_failed(PHASE2_NAME, message.clone());
                    state.completed = state.completed.saturating_sub(1);
                    phases_failed += 1;
                    errors.push(message);
                }
            }
            Err(failure) => {
                phases_failed += 1;
                errors.push(format!("Pipeline failed: {}", failure.error));
            }
        }

        let success = errors.is_empty()
            && state.manifest.all_successful()
            && state.completed == CANONICAL_PHASE_COUNT;

        if let Some(dir) = &self.config.artifacts_dir {
            let path = dir.join(PHASE_MANIFEST_FILE);
            match state.manifest.save(&path).await {
                Ok(()) => info!(path = %path.display(), "Phase manifest saved"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to save phase manifest"),
            }
        }

        let total_duration_ms = time::elapsed_ms(&started_at, &time::now());
        self.emit_event(PipelineEvent::PipelineCompleted {
            run_id,
            success,
            duration_ms: total_duration_ms,
        })
        .await;
        info!(
            run_id = %run_id,
            success,
            phases_completed = state.completed,
            phases_failed,
            duration_ms = total_duration_ms,
            "Pipeline finished"
        );

        PipelineResult {
            success,
            run_id,
            manifest: state.manifest.to_json(),
            outputs: state.outputs,
            phases_completed: state.completed,
            phases_failed,
            total_duration_ms,
            errors,
        }
    }

    async fn run_stages(&self, input: PipelineInput, state: &mut RunState) -> Result<(), PhaseFailure> {
        let canonical = self.run_one(&InputValidationPhase, input, 0, state).await?;
        state.outputs.canonical_input = Some(canonical.clone());

        let ingestion = IngestionPhase::new(Arc::clone(&self.ingestor));
        let ingested = self.run_one(&ingestion, canonical, 1, state).await?;
        state.outputs.ingested = Some(ingested.clone());

        let preprocessed = self.run_one(&AdapterPhase, ingested, 2, state).await?;
        state.outputs.preprocessed = Some(preprocessed.clone());

        let questions_phase = MicroQuestionsPhase::new(Arc::clone(&self.answerer));
        let questions = self.run_one(&questions_phase, preprocessed, 3, state).await?;
        state.outputs.questions = Some(questions);

        Ok(())
    }

    async fn run_one<P: PhaseContract>(
        &self,
        phase: &P,
        input: P::Input,
        index: usize,
        state: &mut RunState,
    ) -> Result<P::Output, PhaseFailure> {
        self.emit_event(PipelineEvent::PhaseStarted {
            phase: phase.name().to_string(),
            index,
            total: CANONICAL_PHASE_COUNT,
        })
        .await;

        match run_phase(phase, input).await {
            Ok(PhaseRun { output, report }) => {
                state.manifest.record_phase(&report, phase.artifacts(&output));
                state.completed += 1;
                self.emit_event(PipelineEvent::PhaseCompleted {
                    phase: report.metadata.phase_name.clone(),
                    duration_ms: report.metadata.duration_ms,
                })
                .await;
                Ok(output)
            }
            Err(failure) => {
                state.manifest.record_phase(&failure.report, Vec::new());
                self.emit_event(PipelineEvent::PhaseFailed {
                    phase: failure.report.metadata.phase_name.clone(),
                    error: failure.error.to_string(),
                })
                .await;
                Err(failure)
            }
        }
    }

    async fn emit_event(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            // Receiver may have been dropped; progress reporting is best-effort
            let _ = tx.send(event).await;
        }
    }
}

/// Post-conditions checked on the final outputs regardless of phase invariants
fn check_structural_invariants(outputs: &PipelineOutputs) -> Option<String> {
    match &outputs.questions {
        Some(q) if !q.questions.is_empty() => None,
        _ => Some(QUESTIONS_EMPTY_MESSAGE.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::canonical::{AnsweredQuestion, Chunk, PHASE0_NAME, PHASE1_NAME};
    use async_trait::async_trait;
    use std::path::Path;

    struct FixedIngestor(Vec<Chunk>);

    #[async_trait]
    impl DocumentIngestor for FixedIngestor {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn ingest(&self, _: &Path) -> anyhow::Result<Vec<Chunk>> {
            Ok(self.0.clone())
        }
    }

    struct FixedAnswerer(Vec<AnsweredQuestion>);

    #[async_trait]
    impl QuestionAnswerer for FixedAnswerer {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn answer(
            &self,
            _: &Path,
            _: &PreprocessedDocument,
        ) -> anyhow::Result<Vec<AnsweredQuestion>> {
            Ok(self.0.clone())
        }
    }

    fn chunk(id: &str) -> Chunk {
        Chunk {
            chunk_id: id.to_string(),
            text: format!("text {}", id),
            policy_area: None,
            dimension: None,
        }
    }

    fn answer(id: &str) -> AnsweredQuestion {
        AnsweredQuestion {
            question_id: id.to_string(),
            dimension: "DIM01".to_string(),
            policy_area: "PA01".to_string(),
            score: 0.5,
            evidence_chunks: vec!["c1".to_string()],
        }
    }

    fn input(dir: &Path) -> PipelineInput {
        let document_path = dir.join("doc.txt");
        let questionnaire_path = dir.join("q.json");
        std::fs::write(&document_path, "content").unwrap();
        std::fs::write(&questionnaire_path, "{}").unwrap();
        PipelineInput {
            document_path,
            questionnaire_path,
            run_id: "run".to_string(),
        }
    }

    fn orchestrator(chunks: Vec<Chunk>, answers: Vec<AnsweredQuestion>) -> PhaseOrchestrator {
        PhaseOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(FixedIngestor(chunks)),
            Arc::new(FixedAnswerer(answers)),
        )
    }

    #[tokio::test]
    async fn test_successful_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let result = orchestrator(vec![chunk("c1")], vec![answer("Q001")])
            .run_pipeline(input(dir.path()))
            .await;

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.phases_completed, 4);
        assert_eq!(result.phases_failed, 0);
        assert_eq!(result.manifest["successful_phases"], 4);
        assert_eq!(result.outputs.questions.unwrap().questions.len(), 1);
    }

    #[tokio::test]
    async fn test_manifest_records_input_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let result = orchestrator(vec![chunk("c1")], vec![answer("Q001")])
            .run_pipeline(input(dir.path()))
            .await;

        let phases = &result.manifest["phases"];
        let artifacts = phases[PHASE0_NAME]["artifacts"].as_array().unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0]["name"], "document");
        assert_eq!(artifacts[0]["sha256"], rce_common::sha256_hex(b"content").as_str());
        assert_eq!(artifacts[0]["size_bytes"], 7);
        assert_eq!(artifacts[1]["name"], "questionnaire");
        assert_eq!(artifacts[1]["sha256"], rce_common::sha256_hex(b"{}").as_str());
        assert_eq!(phases[PHASE1_NAME]["artifacts"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_empty_questions_fail_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let result = orchestrator(vec![chunk("c1")], vec![])
            .run_pipeline(input(dir.path()))
            .await;

        assert!(!result.success);
        assert_eq!(result.phases_completed, 3);
        assert_eq!(result.phases_failed, 1);
        assert!(result.errors[0].starts_with("Pipeline failed:"));
        assert!(result.errors[0].contains(QUESTIONS_EMPTY_MESSAGE));
        assert_eq!(result.manifest["phases"][PHASE2_NAME]["status"], "failed");
        assert!(result.outputs.questions.is_none());
    }

    #[tokio::test]
    async fn test_failure_stops_later_phases() {
        let dir = tempfile::tempdir().unwrap();
        let result = orchestrator(vec![], vec![answer("Q001")])
            .run_pipeline(input(dir.path()))
            .await;

        assert!(!result.success);
        assert_eq!(result.phases_completed, 1);
        assert_eq!(result.manifest["total_phases"], 2);
        assert!(result.outputs.ingested.is_none());
        assert!(result.errors[0].contains("chunks_non_empty"));
    }

    #[tokio::test]
    async fn test_events_and_saved_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = dir.path().join("artifacts");
        let (tx, mut rx) = mpsc::channel(32);
        let orchestrator = PhaseOrchestrator::with_events(
            OrchestratorConfig {
                artifacts_dir: Some(artifacts.clone()),
            },
            Arc::new(FixedIngestor(vec![chunk("c1")])),
            Arc::new(FixedAnswerer(vec![answer("Q001")])),
            tx,
        );

        let result = orchestrator.run_pipeline(input(dir.path())).await;
        assert!(result.success);
        assert!(artifacts.join(PHASE_MANIFEST_FILE).exists());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 9);
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::PipelineCompleted { success: true, .. })
        ));
    }
}
