//! End-to-end run: phases → plan → aggregation → signed manifest

use rce_engine::aggregation::{HierarchicalAggregator, MicroScore};
use rce_engine::phases::canonical::PipelineInput;
use rce_engine::phases::collaborators::{KeywordAnswerer, ParagraphIngestor};
use rce_engine::phases::{OrchestratorConfig, PhaseOrchestrator, PipelineEvent};
use rce_engine::plan::{task_for_question, ExecutionPlan, PlanArchive};
use rce_engine::uncertainty::BootstrapAggregator;
use rce_engine::verification::{
    verify_manifest, VerificationManifestBuilder, INTEGRITY_MODE_DISABLED, INTEGRITY_MODE_FIELD,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

const SECRET: &str = "integration-secret";

fn write_inputs(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let document = dir.join("plan.txt");
    std::fs::write(
        &document,
        "Water access targets for rural areas.\n\nAn annual budget funds the programme.\n\nYouth employment indicators are reported yearly.\n",
    )
    .unwrap();

    let keywords = [["water", "budget"], ["youth", "missing"], ["absent", "nothing"]];
    let questions: Vec<Value> = (1..=300)
        .map(|i| {
            json!({
                "question_id": format!("Q{:03}", i),
                "dimension": format!("DIM{:02}", (i - 1) % 6 + 1),
                "policy_area": format!("PA{:02}", (i - 1) / 30 + 1),
                "keywords": keywords[i % 3],
            })
        })
        .collect();
    let questionnaire = dir.join("questionnaire.json");
    std::fs::write(&questionnaire, json!({ "questions": questions }).to_string()).unwrap();
    (document, questionnaire)
}

#[tokio::test]
async fn test_full_run_produces_verifiable_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let (document, questionnaire) = write_inputs(dir.path());
    let artifacts = dir.path().join("artifacts");

    let (tx, mut rx) = mpsc::channel(32);
    let orchestrator = PhaseOrchestrator::with_events(
        OrchestratorConfig {
            artifacts_dir: Some(artifacts.clone()),
        },
        Arc::new(ParagraphIngestor),
        Arc::new(KeywordAnswerer),
        tx,
    );
    let result = orchestrator
        .run_pipeline(PipelineInput {
            document_path: document,
            questionnaire_path: questionnaire,
            run_id: "it".to_string(),
        })
        .await;
    drop(orchestrator);

    assert!(result.success, "errors: {:?}", result.errors);
    let mut started = 0;
    while let Some(event) = rx.recv().await {
        if matches!(event, PipelineEvent::PhaseStarted { .. }) {
            started += 1;
        }
    }
    assert_eq!(started, result.phases_completed);

    // Plan
    let answers = result.outputs.questions.clone().unwrap().questions;
    assert_eq!(answers.len(), 300);
    let tasks = answers
        .iter()
        .map(|a| task_for_question(a, "0000-none", "1.0.0"))
        .collect();
    let plan = ExecutionPlan::new("plan-it", tasks, BTreeMap::new()).unwrap();
    let archive = PlanArchive::open(dir.path().join("plans")).await.unwrap();
    let entry = archive.archive(&plan, Some(&result.run_id.to_string())).await.unwrap();

    // Aggregation
    let micro: Vec<MicroScore> = answers
        .iter()
        .map(|a| MicroScore {
            question_id: a.question_id.clone(),
            dimension: a.dimension.clone(),
            policy_area: a.policy_area.clone(),
            score: a.score,
            weight: 1.0,
        })
        .collect();
    let mut aggregator = HierarchicalAggregator::new(BootstrapAggregator::new(100, 42).unwrap());
    let report = aggregator.run(&micro, &[]).unwrap();
    assert_eq!(report.areas.len(), 10);
    assert_eq!(report.dimensions.len(), 60);
    let expected: f64 = micro.iter().map(|m| m.score).sum::<f64>() / 300.0;
    assert!((report.macro_score.score - expected).abs() < 1e-9);

    // Manifest
    let manifest = VerificationManifestBuilder::new(Some(SECRET.to_string()))
        .set_success(result.success)
        .add_phases_from_manifest(&result.manifest)
        .add_artifact(
            "execution_plan",
            &entry.storage_path.to_string_lossy(),
            &entry.integrity_hash,
            None,
        )
        .set_section("aggregation", json!({ "macro_score": report.macro_score.score }))
        .build()
        .unwrap();
    let path = artifacts.join("verification_manifest.json");
    manifest.save(&path).await.unwrap();

    let reloaded: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(verify_manifest(&reloaded, SECRET));
    assert!(!verify_manifest(&reloaded, "another-secret"));
    assert_eq!(reloaded["phases"].as_array().unwrap().len(), result.phases_completed);

    let mut tampered = reloaded.clone();
    tampered["aggregation"]["macro_score"] = json!(1.0);
    assert!(!verify_manifest(&tampered, SECRET));
}

#[tokio::test]
async fn test_missing_document_fails_first_phase() {
    let dir = tempfile::tempdir().unwrap();
    let (_, questionnaire) = write_inputs(dir.path());

    let orchestrator = PhaseOrchestrator::new(
        OrchestratorConfig { artifacts_dir: None },
        Arc::new(ParagraphIngestor),
        Arc::new(KeywordAnswerer),
    );
    let result = orchestrator
        .run_pipeline(PipelineInput {
            document_path: dir.path().join("absent.txt"),
            questionnaire_path: questionnaire,
            run_id: "missing".to_string(),
        })
        .await;

    assert!(!result.success);
    assert_eq!(result.phases_completed, 0);
    assert!(result.outputs.questions.is_none());
    assert!(!result.errors.is_empty());
}

#[test]
fn test_unsigned_manifest_never_verifies() {
    let manifest = VerificationManifestBuilder::new(None)
        .set_success(true)
        .build()
        .unwrap();

    assert!(!manifest.is_signed());
    let value = manifest.to_json();
    assert_eq!(value[INTEGRITY_MODE_FIELD], json!(INTEGRITY_MODE_DISABLED));
    assert!(!verify_manifest(&value, SECRET));
}
