//! Canonical pipeline phases
//!
//! # Architecture
//! - **phase0_input_validation**: checks paths, hashes the document and questionnaire
//! - **phase1_ingestion**: delegates chunking to a [`DocumentIngestor`]
//! - **phase1_to_phase2_adapter**: reshapes ingestion output for question answering
//! - **phase2_micro_questions**: delegates answering to a [`QuestionAnswerer`]
//!
//! Each phase's output type is the next phase's input type, so the ordering
//! is enforced by the compiler as well as by the orchestrator.

use super::contract::{ContractCheck, PhaseContract, PhaseInvariant};
use super::manifest::ArtifactRecord;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rce_common::{sha256_hex, time};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub const PHASE0_NAME: &str = "phase0_input_validation";
pub const PHASE1_NAME: &str = "phase1_ingestion";
pub const ADAPTER_NAME: &str = "phase1_to_phase2_adapter";
pub const PHASE2_NAME: &str = "phase2_micro_questions";

/// Version tag stamped on canonical inputs
pub const PHASE0_VERSION: &str = "1.0.0";

/// Name of the structural invariant of the question-answering phase
pub const QUESTIONS_PRESENT_INVARIANT: &str = "questions_are_present_and_non_empty";
pub const QUESTIONS_EMPTY_MESSAGE: &str =
    "Phase 2 failed structural invariant: questions list is empty or missing.";

const FORBIDDEN_RUN_ID_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

// ========================================
// Data carried between phases
// ========================================

/// Raw pipeline input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInput {
    pub document_path: PathBuf,
    pub questionnaire_path: PathBuf,
    pub run_id: String,
}

/// Validated, hashed input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalInput {
    pub document_id: String,
    pub run_id: String,
    pub document_path: PathBuf,
    pub document_sha256: String,
    pub document_size_bytes: u64,
    pub questionnaire_path: PathBuf,
    pub questionnaire_sha256: String,
    pub questionnaire_size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub phase0_version: String,
}

/// Content chunk produced by ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub text: String,
    pub policy_area: Option<String>,
    pub dimension: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedDocument {
    pub document_id: String,
    pub run_id: String,
    pub source_sha256: String,
    pub questionnaire_path: PathBuf,
    pub chunks: Vec<Chunk>,
}

/// Ingested document reshaped for question answering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessedDocument {
    pub document_id: String,
    pub run_id: String,
    pub questionnaire_path: PathBuf,
    pub chunk_ids: Vec<String>,
    pub total_chars: usize,
    pub chunks: Vec<Chunk>,
}

/// One answered micro-question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnsweredQuestion {
    pub question_id: String,
    pub dimension: String,
    pub policy_area: String,
    /// Normalized score in [0, 1]
    pub score: f64,
    pub evidence_chunks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionsOutput {
    pub document_id: String,
    pub run_id: String,
    pub questions: Vec<AnsweredQuestion>,
}

// ========================================
// External collaborators
// ========================================

/// Splits a document into content chunks
#[async_trait]
pub trait DocumentIngestor: Send + Sync {
    fn name(&self) -> &str;

    async fn ingest(&self, document_path: &Path) -> anyhow::Result<Vec<Chunk>>;
}

/// Answers the questionnaire against a preprocessed document
#[async_trait]
pub trait QuestionAnswerer: Send + Sync {
    fn name(&self) -> &str;

    async fn answer(
        &self,
        questionnaire_path: &Path,
        document: &PreprocessedDocument,
    ) -> anyhow::Result<Vec<AnsweredQuestion>>;
}

// ========================================
// Phase 0: input validation
// ========================================

pub struct InputValidationPhase;

#[async_trait]
impl PhaseContract for InputValidationPhase {
    type Input = PipelineInput;
    type Output = CanonicalInput;

    fn name(&self) -> &str {
        PHASE0_NAME
    }

    fn validate_input(&self, input: &PipelineInput) -> ContractCheck {
        let mut check = ContractCheck::new();
        check.require(
            !input.document_path.as_os_str().is_empty(),
            "document_path cannot be empty",
        );
        check.require(
            !input.questionnaire_path.as_os_str().is_empty(),
            "questionnaire_path cannot be empty",
        );
        check.require(!input.run_id.trim().is_empty(), "run_id cannot be empty");
        check.require(
            !input.run_id.contains(&FORBIDDEN_RUN_ID_CHARS[..]),
            "run_id contains invalid characters (must be filesystem-safe)",
        );
        check
    }

    fn validate_output(&self, output: &CanonicalInput) -> ContractCheck {
        let mut check = ContractCheck::new();
        check.require(!output.document_id.is_empty(), "document_id cannot be empty");
        check.require(is_sha256_hex(&output.document_sha256), "document_sha256 must be 64 hex chars");
        check.require(
            is_sha256_hex(&output.questionnaire_sha256),
            "questionnaire_sha256 must be 64 hex chars",
        );
        check
    }

    async fn execute(&self, input: PipelineInput) -> anyhow::Result<CanonicalInput> {
        let document = tokio::fs::read(&input.document_path)
            .await
            .with_context(|| format!("Failed to read document {:?}", input.document_path))?;
        let questionnaire = tokio::fs::read(&input.questionnaire_path)
            .await
            .with_context(|| {
                format!("Failed to read questionnaire {:?}", input.questionnaire_path)
            })?;

        let document_sha256 = sha256_hex(&document);
        debug!(bytes = document.len(), sha256 = %document_sha256, "Hashed input document");

        Ok(CanonicalInput {
            document_id: format!("doc-{}", &document_sha256[..16]),
            run_id: input.run_id,
            document_path: input.document_path,
            document_size_bytes: document.len() as u64,
            document_sha256,
            questionnaire_path: input.questionnaire_path,
            questionnaire_sha256: sha256_hex(&questionnaire),
            questionnaire_size_bytes: questionnaire.len() as u64,
            created_at: time::now(),
            phase0_version: PHASE0_VERSION.to_string(),
        })
    }

    fn invariants(&self) -> Vec<PhaseInvariant<CanonicalInput>> {
        vec![PhaseInvariant::new(
            "document_size_positive",
            "Input document is not empty",
            "document_size_bytes must be > 0",
            |o: &CanonicalInput| o.document_size_bytes > 0,
        )]
    }

    fn artifacts(&self, output: &CanonicalInput) -> Vec<ArtifactRecord> {
        vec![
            ArtifactRecord {
                name: "document".to_string(),
                path: output.document_path.to_string_lossy().into_owned(),
                sha256: output.document_sha256.clone(),
                size_bytes: output.document_size_bytes,
            },
            ArtifactRecord {
                name: "questionnaire".to_string(),
                path: output.questionnaire_path.to_string_lossy().into_owned(),
                sha256: output.questionnaire_sha256.clone(),
                size_bytes: output.questionnaire_size_bytes,
            },
        ]
    }
}

// ========================================
// Phase 1: ingestion
// ========================================

pub struct IngestionPhase {
    ingestor: Arc<dyn DocumentIngestor>,
}

impl IngestionPhase {
    pub fn new(ingestor: Arc<dyn DocumentIngestor>) -> Self {
        Self { ingestor }
    }
}

#[async_trait]
impl PhaseContract for IngestionPhase {
    type Input = CanonicalInput;
    type Output = IngestedDocument;

    fn name(&self) -> &str {
        PHASE1_NAME
    }

    fn validate_input(&self, input: &CanonicalInput) -> ContractCheck {
        let mut check = ContractCheck::new();
        check.require(is_sha256_hex(&input.document_sha256), "document_sha256 must be 64 hex chars");
        check.require(input.document_size_bytes > 0, "document_size_bytes must be > 0");
        check
    }

    fn validate_output(&self, output: &IngestedDocument) -> ContractCheck {
        let mut check = ContractCheck::new();
        for chunk in &output.chunks {
            check.require(!chunk.chunk_id.is_empty(), "chunk_id cannot be empty");
            if chunk.text.trim().is_empty() {
                check.warn(format!("chunk {} has no text", chunk.chunk_id));
            }
        }
        check
    }

    async fn execute(&self, input: CanonicalInput) -> anyhow::Result<IngestedDocument> {
        let chunks = self
            .ingestor
            .ingest(&input.document_path)
            .await
            .with_context(|| format!("Ingestor {} failed", self.ingestor.name()))?;

        Ok(IngestedDocument {
            document_id: input.document_id,
            run_id: input.run_id,
            source_sha256: input.document_sha256,
            questionnaire_path: input.questionnaire_path,
            chunks,
        })
    }

    fn invariants(&self) -> Vec<PhaseInvariant<IngestedDocument>> {
        vec![
            PhaseInvariant::new(
                "chunks_non_empty",
                "Ingestion produced at least one chunk",
                "no chunks were produced",
                |o: &IngestedDocument| !o.chunks.is_empty(),
            ),
            PhaseInvariant::new(
                "chunk_ids_unique",
                "Chunk ids are unique within the document",
                "duplicate chunk ids",
                |o: &IngestedDocument| {
                    let mut seen = HashSet::new();
                    o.chunks.iter().all(|c| seen.insert(c.chunk_id.as_str()))
                },
            ),
        ]
    }
}

// ========================================
// Phase 1 → 2 adapter
// ========================================

pub struct AdapterPhase;

#[async_trait]
impl PhaseContract for AdapterPhase {
    type Input = IngestedDocument;
    type Output = PreprocessedDocument;

    fn name(&self) -> &str {
        ADAPTER_NAME
    }

    fn validate_input(&self, input: &IngestedDocument) -> ContractCheck {
        let mut check = ContractCheck::new();
        check.require(!input.chunks.is_empty(), "ingested document has no chunks");
        check
    }

    fn validate_output(&self, output: &PreprocessedDocument) -> ContractCheck {
        let mut check = ContractCheck::new();
        check.require(
            output.chunk_ids.len() == output.chunks.len(),
            "chunk_ids must index every chunk",
        );
        check
    }

    async fn execute(&self, input: IngestedDocument) -> anyhow::Result<PreprocessedDocument> {
        let chunk_ids = input.chunks.iter().map(|c| c.chunk_id.clone()).collect();
        let total_chars = input.chunks.iter().map(|c| c.text.chars().count()).sum();
        Ok(PreprocessedDocument {
            document_id: input.document_id,
            run_id: input.run_id,
            questionnaire_path: input.questionnaire_path,
            chunk_ids,
            total_chars,
            chunks: input.chunks,
        })
    }
}

// ========================================
// Phase 2: micro-questions
// ========================================

pub struct MicroQuestionsPhase {
    answerer: Arc<dyn QuestionAnswerer>,
}

impl MicroQuestionsPhase {
    pub fn new(answerer: Arc<dyn QuestionAnswerer>) -> Self {
        Self { answerer }
    }
}

#[async_trait]
impl PhaseContract for MicroQuestionsPhase {
    type Input = PreprocessedDocument;
    type Output = QuestionsOutput;

    fn name(&self) -> &str {
        PHASE2_NAME
    }

    fn validate_input(&self, input: &PreprocessedDocument) -> ContractCheck {
        let mut check = ContractCheck::new();
        check.require(!input.chunk_ids.is_empty(), "preprocessed document has no chunks");
        check
    }

    fn validate_output(&self, output: &QuestionsOutput) -> ContractCheck {
        let mut check = ContractCheck::new();
        let mut seen = HashSet::new();
        for q in &output.questions {
            check.require(
                (0.0..=1.0).contains(&q.score),
                format!("{} score {} outside [0, 1]", q.question_id, q.score),
            );
            check.require(
                seen.insert(q.question_id.as_str()),
                format!("duplicate question id {}", q.question_id),
            );
            if q.evidence_chunks.is_empty() {
                check.warn(format!("{} has no supporting evidence", q.question_id));
            }
        }
        check
    }

    async fn execute(&self, input: PreprocessedDocument) -> anyhow::Result<QuestionsOutput> {
        let questions = self
            .answerer
            .answer(&input.questionnaire_path, &input)
            .await
            .with_context(|| format!("Question answerer {} failed", self.answerer.name()))?;
        Ok(QuestionsOutput {
            document_id: input.document_id,
            run_id: input.run_id,
            questions,
        })
    }

    fn invariants(&self) -> Vec<PhaseInvariant<QuestionsOutput>> {
        vec![PhaseInvariant::new(
            QUESTIONS_PRESENT_INVARIANT,
            "Question answering yields at least one answered question",
            QUESTIONS_EMPTY_MESSAGE,
            |o: &QuestionsOutput| !o.questions.is_empty(),
        )]
    }
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}
