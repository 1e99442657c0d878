//! rce-engine - demonstration run of the evaluation core
//!
//! Runs the canonical phases over one document and questionnaire, then:
//! 1. Builds and archives the execution plan
//! 2. Calibrates the aggregation method through the registry gate
//! 3. Rolls the answers up to a macro score with uncertainty and provenance
//! 4. Writes a signed verification manifest

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use rce_common::config::{
    default_config_path, resolve_archive_dir, resolve_hmac_secret, resolve_log_level, TomlConfig,
};
use rce_common::logging::init_tracing;
use rce_common::sha256_hex;
use rce_engine::aggregation::{HierarchicalAggregator, MicroScore, WeightedMeanMethod};
use rce_engine::error::GatedAggregationError;
use rce_engine::calibration::layers::MetaEvidence;
use rce_engine::calibration::{
    CalibrationContext, CalibrationOrchestrator, ComputationGraph, ContextTuple,
    IntrinsicCalibration, LayerConfig, MethodRegistry,
};
use rce_engine::phases::canonical::{PipelineInput, QuestionsOutput};
use rce_engine::phases::collaborators::{KeywordAnswerer, ParagraphIngestor};
use rce_engine::phases::{OrchestratorConfig, PhaseOrchestrator, PipelineEvent, PipelineResult};
use rce_engine::plan::{task_for_question, ExecutionPlan, PlanArchive};
use rce_engine::provenance::export::{export_graphml, export_prov_json};
use rce_engine::uncertainty::BootstrapAggregator;
use rce_engine::verification::{DeterminismInfo, VerificationManifestBuilder};

const SYNCHRONIZER_VERSION: &str = env!("CARGO_PKG_VERSION");
const VERIFICATION_MANIFEST_FILE: &str = "verification_manifest.json";

/// Command-line arguments for rce-engine
#[derive(Parser, Debug)]
#[command(name = "rce-engine")]
#[command(about = "Rubric calibration engine demonstration run")]
#[command(version)]
struct Args {
    /// Policy document (plain text, paragraphs separated by blank lines)
    document: PathBuf,

    /// Questionnaire JSON
    questionnaire: PathBuf,

    /// TOML configuration file
    #[arg(short, long, env = "RCE_CONFIG")]
    config: Option<PathBuf>,

    /// Label for this run
    #[arg(long, default_value = "demo")]
    run_label: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = TomlConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    init_tracing(&resolve_log_level(&config));

    info!("Starting rce-engine v{}", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", config_path.display());

    let artifacts_dir = config
        .artifacts_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("artifacts"));
    let secret = resolve_hmac_secret(&config);

    // Step 1: canonical phases
    let result = run_phases(&args, &artifacts_dir).await;
    let mut manifest = VerificationManifestBuilder::new(secret)
        .set_success(result.success)
        .set_environment()
        .set_determinism(&DeterminismInfo {
            seed_version: "fixed_v1".into(),
            base_seed: Some(config.uncertainty.seed),
            correlation_id: Some(result.run_id.to_string()),
            seeds_by_component: BTreeMap::from([("bootstrap".to_string(), config.uncertainty.seed)]),
            ..DeterminismInfo::default()
        })
        .add_phases_from_manifest(&result.manifest);

    if let Some(ingested) = &result.outputs.ingested {
        let text_length = ingested.chunks.iter().map(|c| c.text.chars().count()).sum();
        let sentences = ingested.chunks.iter().map(|c| c.text.matches('.').count()).sum();
        manifest = manifest.set_ingestion("paragraph", ingested.chunks.len(), text_length, sentences);
    }

    let questions = match (&result.outputs.questions, result.success) {
        (Some(q), true) => q.clone(),
        _ => {
            for e in &result.errors {
                error!(error = %e, "Pipeline error");
            }
            write_manifest(manifest, &artifacts_dir).await?;
            anyhow::bail!("Pipeline failed after {} phase(s)", result.phases_completed);
        }
    };

    // Step 2: execution plan
    let default_chunk = result
        .outputs
        .preprocessed
        .as_ref()
        .and_then(|p| p.chunk_ids.first().cloned())
        .unwrap_or_default();
    let tasks = questions
        .questions
        .iter()
        .map(|q| task_for_question(q, &default_chunk, SYNCHRONIZER_VERSION))
        .collect();
    let plan_id = format!("plan-{}", result.run_id);
    match ExecutionPlan::new(&plan_id, tasks, BTreeMap::new()) {
        Ok(plan) => {
            let archive = PlanArchive::open(resolve_archive_dir(&config)).await?;
            let entry = archive
                .archive(&plan, Some(&result.run_id.to_string()))
                .await
                .context("Failed to archive execution plan")?;
            manifest = manifest.add_artifact(
                "execution_plan",
                &entry.storage_path.to_string_lossy(),
                &entry.integrity_hash,
                None,
            );
        }
        Err(e) => warn!(plan_id = %plan_id, error = %e, "Execution plan not archived"),
    }

    // Step 3: calibration gate
    let calibration = load_calibration(&config)?;
    let mut registry = MethodRegistry::new();
    registry.register(WeightedMeanMethod::METHOD_ID, || Arc::new(WeightedMeanMethod))?;
    registry.resolve()?;

    let (calibrated, missing) = calibration.coverage(registry.method_ids());
    manifest = manifest.set_calibrations(
        "1.0.0",
        calibration.config_hash(),
        calibrated.len(),
        missing.len(),
    );

    let context = calibration_context(&questions, &result)?;

    // Step 4: hierarchical aggregation, only behind the gate
    let bootstrap = BootstrapAggregator::new(config.uncertainty.bootstrap_samples, config.uncertainty.seed)?;
    let mut aggregator = HierarchicalAggregator::new(bootstrap);
    let micro: Vec<MicroScore> = questions
        .questions
        .iter()
        .map(|q| MicroScore {
            question_id: q.question_id.clone(),
            dimension: q.dimension.clone(),
            policy_area: q.policy_area.clone(),
            score: q.score,
            weight: 1.0,
        })
        .collect();
    let report = match aggregator.run_gated(&registry, &calibration, context.as_ref(), &micro, &[]) {
        Ok((calibration_score, report)) => {
            manifest = manifest.set_section(
                "calibration_gate",
                json!({
                    "method_id": WeightedMeanMethod::METHOD_ID,
                    "passed": true,
                    "calibration_score": calibration_score,
                }),
            );
            report
        }
        Err(GatedAggregationError::GateRejected { method_id, source }) => {
            error!(method_id = %method_id, error = %source, "Aggregation method did not pass calibration");
            manifest = manifest.set_success(false).set_section(
                "calibration_gate",
                json!({
                    "method_id": method_id,
                    "passed": false,
                    "error": source.to_string(),
                }),
            );
            write_manifest(manifest, &artifacts_dir).await?;
            anyhow::bail!("Calibration gate rejected {}", method_id);
        }
        Err(e) => return Err(e.into()),
    };
    info!(
        macro_score = report.macro_score.score,
        quality = report.macro_score.quality.as_str(),
        "Macro score computed"
    );

    tokio::fs::create_dir_all(&artifacts_dir).await?;
    let dag = aggregator.into_dag();
    let graphml = artifacts_dir.join("aggregation_dag.graphml");
    let prov = artifacts_dir.join("provenance.json");
    export_graphml(&dag, &graphml).await?;
    export_prov_json(&dag, &prov).await?;
    for (id, path) in [("aggregation_graphml", &graphml), ("provenance_json", &prov)] {
        let bytes = tokio::fs::read(path).await?;
        manifest = manifest.add_artifact(
            id,
            &path.to_string_lossy(),
            &sha256_hex(&bytes),
            Some(bytes.len() as u64),
        );
    }

    manifest = manifest.set_section(
        "aggregation",
        json!({
            "macro_score": report.macro_score.score,
            "quality": report.macro_score.quality,
            "uncertainty": report.macro_score.uncertainty.to_json(),
            "dag": dag.statistics(),
        }),
    );
    write_manifest(manifest, &artifacts_dir).await?;

    info!("Run complete");
    Ok(())
}

async fn run_phases(args: &Args, artifacts_dir: &Path) -> PipelineResult {
    let (event_tx, mut event_rx) = mpsc::channel(32);
    let orchestrator = PhaseOrchestrator::with_events(
        OrchestratorConfig {
            artifacts_dir: Some(artifacts_dir.to_path_buf()),
        },
        Arc::new(ParagraphIngestor),
        Arc::new(KeywordAnswerer),
        event_tx,
    );

    let listener = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                PipelineEvent::PhaseStarted { phase, index, total } => {
                    info!("[{}/{}] {}", index + 1, total, phase)
                }
                PipelineEvent::PhaseFailed { phase, error } => warn!(phase = %phase, error = %error, "Phase failed"),
                _ => {}
            }
        }
    });

    let result = orchestrator
        .run_pipeline(PipelineInput {
            document_path: args.document.clone(),
            questionnaire_path: args.questionnaire.clone(),
            run_id: args.run_label.clone(),
        })
        .await;
    drop(orchestrator);
    let _ = listener.await;
    result
}

/// Calibration documents from config, or empty defaults (every method uncalibrated)
fn load_calibration(config: &TomlConfig) -> Result<CalibrationOrchestrator> {
    let paths = &config.calibration;
    let intrinsic = match &paths.intrinsic_path {
        Some(path) => IntrinsicCalibration::load(path)?,
        None => {
            warn!("No intrinsic calibration configured; every method will fail the gate");
            IntrinsicCalibration::default()
        }
    };
    let layers = match &paths.layer_config_path {
        Some(path) => LayerConfig::load(path)?,
        None => LayerConfig::default(),
    };
    Ok(CalibrationOrchestrator::new(intrinsic, layers)?)
}

/// Context for the aggregation method, anchored at the first answered question
fn calibration_context(questions: &QuestionsOutput, result: &PipelineResult) -> Result<Option<CalibrationContext>> {
    let Some(first) = questions.questions.first() else {
        return Ok(None);
    };
    let answered = questions.questions.iter().filter(|q| !q.evidence_chunks.is_empty()).count();
    let unit_quality = answered as f64 / questions.questions.len() as f64;
    let tuple = ContextTuple::new(Some(&first.question_id), &first.dimension, &first.policy_area, unit_quality)?;

    let mut graph = ComputationGraph::default();
    let nodes = ["phases.ParagraphIngestor.ingest", "phases.KeywordAnswerer.answer", WeightedMeanMethod::METHOD_ID];
    graph.nodes.extend(nodes.iter().map(|n| n.to_string()));
    graph.edges.push((nodes[0].into(), nodes[1].into()));
    graph.edges.push((nodes[1].into(), nodes[2].into()));
    graph.required_inputs.insert(nodes[2].into(), vec!["scores".into()]);

    let evidence = MetaEvidence {
        formula_export_valid: true,
        trace_complete: result.success,
        logs_conform_schema: true,
        version_tagged: true,
        config_hash_matches: true,
        signature_valid: false,
        runtime_ms: Some(result.total_duration_ms),
    };

    Ok(Some(CalibrationContext::new(tuple).with_graph(graph).with_evidence(evidence)))
}

async fn write_manifest(builder: VerificationManifestBuilder, artifacts_dir: &Path) -> Result<()> {
    let manifest = builder.build()?;
    manifest.save(&artifacts_dir.join(VERIFICATION_MANIFEST_FILE)).await?;
    Ok(())
}
