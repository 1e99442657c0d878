//! Plain-text collaborators
//!
//! Minimal [`DocumentIngestor`] and [`QuestionAnswerer`] implementations used
//! by the `rce-engine` binary and by integration tests. Production
//! deployments plug in richer extractors through the same traits.

use super::canonical::{AnsweredQuestion, Chunk, DocumentIngestor, PreprocessedDocument, QuestionAnswerer};
use anyhow::Context;
use async_trait::async_trait;
use rce_common::sha256_hex;
use serde::Deserialize;
use std::path::Path;

/// Splits UTF-8 text on blank lines; chunk ids are content hashes
pub struct ParagraphIngestor;

#[async_trait]
impl DocumentIngestor for ParagraphIngestor {
    fn name(&self) -> &str {
        "paragraph"
    }

    async fn ingest(&self, document_path: &Path) -> anyhow::Result<Vec<Chunk>> {
        let text = tokio::fs::read_to_string(document_path)
            .await
            .with_context(|| format!("Document {:?} is not readable UTF-8", document_path))?;

        Ok(split_paragraphs(&text)
            .into_iter()
            .enumerate()
            .map(|(i, paragraph)| Chunk {
                chunk_id: format!("{:04}-{}", i, &sha256_hex(paragraph.as_bytes())[..12]),
                text: paragraph,
                policy_area: None,
                dimension: None,
            })
            .collect())
    }
}

fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }
    paragraphs
}

/// Questionnaire document consumed by [`KeywordAnswerer`]
#[derive(Debug, Deserialize)]
pub struct Questionnaire {
    pub questions: Vec<QuestionSpec>,
}

#[derive(Debug, Deserialize)]
pub struct QuestionSpec {
    pub question_id: String,
    pub dimension: String,
    pub policy_area: String,
    pub keywords: Vec<String>,
}

/// Scores each question by the fraction of its keywords found in the document
pub struct KeywordAnswerer;

#[async_trait]
impl QuestionAnswerer for KeywordAnswerer {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn answer(
        &self,
        questionnaire_path: &Path,
        document: &PreprocessedDocument,
    ) -> anyhow::Result<Vec<AnsweredQuestion>> {
        let text = tokio::fs::read_to_string(questionnaire_path)
            .await
            .with_context(|| format!("Failed to read questionnaire {:?}", questionnaire_path))?;
        let questionnaire: Questionnaire =
            serde_json::from_str(&text).context("Questionnaire is not valid JSON")?;

        let lowered: Vec<(String, String)> = document
            .chunks
            .iter()
            .map(|c| (c.chunk_id.clone(), c.text.to_lowercase()))
            .collect();

        Ok(questionnaire
            .questions
            .into_iter()
            .map(|q| {
                let keywords: Vec<String> = q.keywords.iter().map(|k| k.to_lowercase()).collect();
                let found = keywords
                    .iter()
                    .filter(|k| lowered.iter().any(|(_, text)| text.contains(k.as_str())))
                    .count();
                let evidence_chunks = lowered
                    .iter()
                    .filter(|(_, text)| keywords.iter().any(|k| text.contains(k.as_str())))
                    .map(|(id, _)| id.clone())
                    .collect();
                let score = if keywords.is_empty() {
                    0.0
                } else {
                    found as f64 / keywords.len() as f64
                };
                AnsweredQuestion {
                    question_id: q.question_id,
                    dimension: q.dimension,
                    policy_area: q.policy_area,
                    score,
                    evidence_chunks,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_paragraphs() {
        let paragraphs = split_paragraphs("a\nb\n\n\n  c  \n\n");
        assert_eq!(paragraphs, vec!["a\nb".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_keyword_answerer_scores_fraction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.json");
        std::fs::write(
            &path,
            r#"{"questions": [{"question_id": "Q001", "dimension": "DIM01",
                "policy_area": "PA01", "keywords": ["water", "budget", "missing"]}]}"#,
        )
        .unwrap();
        let document = PreprocessedDocument {
            document_id: "d".to_string(),
            run_id: "r".to_string(),
            questionnaire_path: path.clone(),
            chunk_ids: vec!["c1".to_string(), "c2".to_string()],
            total_chars: 0,
            chunks: vec![
                Chunk {
                    chunk_id: "c1".to_string(),
                    text: "Water access".to_string(),
                    policy_area: None,
                    dimension: None,
                },
                Chunk {
                    chunk_id: "c2".to_string(),
                    text: "Annual BUDGET".to_string(),
                    policy_area: None,
                    dimension: None,
                },
            ],
        };

        let answers = KeywordAnswerer.answer(&path, &document).await.unwrap();
        assert_eq!(answers.len(), 1);
        assert!((answers[0].score - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(answers[0].evidence_chunks, vec!["c1", "c2"]);
    }
}
