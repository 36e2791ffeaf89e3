//! Cross-encoder reranking with entity and intent boosts.
//!
//! Candidates surviving rank fusion are re-scored jointly against the
//! query by a cross-encoder model, then nudged by two additive biases:
//!
//! - **entity boost** — `β · |entities matched in text| / max(1, |entities|)`
//!   with case-insensitive whole-word matching, `β = 0.1`;
//! - **intent boost** — `β_intent = 0.05` for textual cues matching the
//!   query's intent label (definition phrasing, cause-effect phrasing, or
//!   entity co-occurrence for comparisons).
//!
//! `final_score = rerank_score + entity_boost + intent_boost`. Ordering is
//! descending final score, ties by descending rerank score then ascending
//! chunk id.
//!
//! The model transport is a TEI-style `POST /rerank` endpoint returning raw
//! relevance logits; raw scores are squashed to `[0, 1]` with a logistic
//! sigmoid. When the model is unavailable the orchestrator reuses
//! [`finalize`] with RRF scores as the base, so the boost arithmetic and
//! ordering stay identical on the fallback path.

use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;

use crate::config::{RerankConfig, RetrievalConfig};
use crate::error::{RagError, RagResult};
use crate::models::{Intent, Level};
use crate::retry::{classify_status, classify_transport, retry_transient};

/// Span of text within which two entities count as co-occurring.
const COMPARISON_WINDOW: usize = 200;

/// One candidate passed to the reranker.
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub chunk_id: String,
    pub text: String,
    pub level: Level,
}

/// One reranked candidate with its score breakdown.
#[derive(Debug, Clone)]
pub struct RerankedChunk {
    pub chunk_id: String,
    pub rerank_score: f64,
    pub entity_boost: f64,
    pub intent_boost: f64,
    pub final_score: f64,
}

/// A cross-encoder scoring model for (query, passage) pairs.
#[async_trait]
pub trait RerankModel: Send + Sync {
    /// Raw relevance logits for each (query, text) pair, in input order.
    async fn score_pairs(&self, query: &str, texts: &[String]) -> RagResult<Vec<f32>>;
}

/// Instantiate the configured rerank backend, or `None` when disabled.
pub fn create_rerank_model(config: &RerankConfig) -> RagResult<Option<Box<dyn RerankModel>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => Ok(Some(Box::new(HttpReranker::new(config)?))),
        other => Err(RagError::Permanent(format!(
            "unknown rerank provider: {}",
            other
        ))),
    }
}

/// Score candidates with the model, then apply boosts and ordering.
pub async fn rerank(
    model: &dyn RerankModel,
    query: &str,
    candidates: &[RerankCandidate],
    entities: &[String],
    intent: Intent,
    retrieval: &RetrievalConfig,
) -> RagResult<Vec<RerankedChunk>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
    let raw = model.score_pairs(query, &texts).await?;

    if raw.len() != candidates.len() {
        return Err(RagError::Permanent(format!(
            "reranker returned {} scores for {} candidates",
            raw.len(),
            candidates.len()
        )));
    }

    let base: Vec<f64> = raw.iter().map(|&s| sigmoid(f64::from(s))).collect();
    Ok(finalize(candidates, &base, entities, intent, retrieval))
}

/// Apply entity/intent boosts to per-candidate base scores, then sort and
/// truncate to `k_rerank`.
///
/// `base_scores[i]` becomes candidate i's `rerank_score`; on the normal
/// path that is the sigmoid-normalized cross-encoder score, on the
/// fallback path the RRF score.
pub fn finalize(
    candidates: &[RerankCandidate],
    base_scores: &[f64],
    entities: &[String],
    intent: Intent,
    retrieval: &RetrievalConfig,
) -> Vec<RerankedChunk> {
    let mut reranked: Vec<RerankedChunk> = candidates
        .iter()
        .zip(base_scores.iter())
        .map(|(candidate, &rerank_score)| {
            let entity_boost = entity_boost(&candidate.text, entities, retrieval.entity_beta);
            let intent_boost = intent_boost(candidate, entities, intent, retrieval.intent_beta);
            RerankedChunk {
                chunk_id: candidate.chunk_id.clone(),
                rerank_score,
                entity_boost,
                intent_boost,
                final_score: rerank_score + entity_boost + intent_boost,
            }
        })
        .collect();

    reranked.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.rerank_score
                    .partial_cmp(&a.rerank_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    reranked.truncate(retrieval.k_rerank);

    reranked
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Case-insensitive whole-word matcher for one entity phrase.
fn entity_pattern(entity: &str) -> Option<Regex> {
    let trimmed = entity.trim();
    if trimmed.is_empty() {
        return None;
    }
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(trimmed))).ok()
}

/// Fraction of the query's entities present in the text, scaled by `beta`.
fn entity_boost(text: &str, entities: &[String], beta: f64) -> f64 {
    if entities.is_empty() {
        return 0.0;
    }
    let matched = entities
        .iter()
        .filter_map(|e| entity_pattern(e))
        .filter(|re| re.is_match(text))
        .count();
    beta * matched as f64 / entities.len().max(1) as f64
}

/// Intent-cue boost: `beta` when the candidate matches the intent's cue,
/// zero otherwise. APPLICATION, STUDY_DETAIL, and CRITIQUE carry no
/// implicit cue yet.
fn intent_boost(
    candidate: &RerankCandidate,
    entities: &[String],
    intent: Intent,
    beta: f64,
) -> f64 {
    let hit = match intent {
        Intent::Definition => {
            let lower = candidate.text.to_lowercase();
            lower.contains("is defined as")
                || lower.contains("refers to")
                || candidate.level == Level::H1
        }
        Intent::Mechanism => {
            let lower = candidate.text.to_lowercase();
            lower.contains("because") || lower.contains("results in") || lower.contains("mechanism")
        }
        Intent::Comparison => entities_co_occur(&candidate.text, entities),
        Intent::Application | Intent::StudyDetail | Intent::Critique | Intent::Unknown => false,
    };
    if hit {
        beta
    } else {
        0.0
    }
}

/// True when any two distinct entities occur within [`COMPARISON_WINDOW`]
/// characters of each other.
fn entities_co_occur(text: &str, entities: &[String]) -> bool {
    let mut positions: Vec<(usize, usize)> = Vec::new();
    for (idx, entity) in entities.iter().enumerate() {
        if let Some(re) = entity_pattern(entity) {
            for m in re.find_iter(text) {
                positions.push((idx, m.start()));
            }
        }
    }

    for (i, &(entity_a, pos_a)) in positions.iter().enumerate() {
        for &(entity_b, pos_b) in &positions[i + 1..] {
            if entity_a != entity_b && pos_a.abs_diff(pos_b) <= COMPARISON_WINDOW {
                return true;
            }
        }
    }
    false
}

// ============ HTTP model ============

/// TEI-style rerank endpoint: `POST {url}/rerank` with
/// `{query, texts, raw_scores: true}` returning `[{index, score}]`.
pub struct HttpReranker {
    url: String,
    model: Option<String>,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> RagResult<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| RagError::Permanent("rerank.url required".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Permanent(e.to_string()))?;

        Ok(Self {
            url,
            model: config.model.clone(),
            client,
        })
    }
}

#[async_trait]
impl RerankModel for HttpReranker {
    async fn score_pairs(&self, query: &str, texts: &[String]) -> RagResult<Vec<f32>> {
        let mut body = serde_json::json!({
            "query": query,
            "texts": texts,
            "raw_scores": true,
        });
        if let Some(model) = &self.model {
            body["model"] = serde_json::Value::String(model.clone());
        }

        retry_transient(3, || async {
            let resp = self
                .client
                .post(format!("{}/rerank", self.url))
                .json(&body)
                .send()
                .await
                .map_err(classify_transport)?;

            let status = resp.status();
            if !status.is_success() {
                let body_text = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, &body_text));
            }

            let json: serde_json::Value = resp.json().await.map_err(classify_transport)?;
            parse_rerank_response(&json, texts.len())
        })
        .await
    }
}

/// Scores come back index-tagged and possibly reordered; restore input order.
fn parse_rerank_response(json: &serde_json::Value, expected: usize) -> RagResult<Vec<f32>> {
    let items = json
        .as_array()
        .ok_or_else(|| RagError::Permanent("invalid rerank response: not an array".into()))?;

    let mut scores = vec![None; expected];
    for item in items {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .ok_or_else(|| RagError::Permanent("invalid rerank response: missing index".into()))?
            as usize;
        let score = item
            .get("score")
            .and_then(|s| s.as_f64())
            .ok_or_else(|| RagError::Permanent("invalid rerank response: missing score".into()))?;
        if index < expected {
            scores[index] = Some(score as f32);
        }
    }

    scores
        .into_iter()
        .collect::<Option<Vec<f32>>>()
        .ok_or_else(|| RagError::Permanent("invalid rerank response: missing indices".into()))
}
