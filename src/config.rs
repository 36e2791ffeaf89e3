//! Configuration parsing and validation.
//!
//! corpus-rag is configured via a TOML file (default: `config/crag.toml`).
//! The config defines the database path, embedding / generation / rerank
//! service settings, retrieval tuning, and the server bind address.
//!
//! # Retrieval presets
//!
//! The `[retrieval]` section provides file-level defaults. A row in the
//! `rag_config` table with preset name `retrieval` overrides those defaults;
//! each pipeline stage reads the merged value once at stage entry via
//! [`retrieval_preset`], so no stage observes a mid-run config change.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Embedding service settings. Dimension `dims` is fixed per deployment;
/// every stored vector must match it.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: default_dims(),
            url: None,
            timeout_secs: default_embed_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Generative model settings. `model` is the light tier, `full_model` the
/// FULL tier selected by `use_full_model` on expansion/answer requests.
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub full_model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_generate_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            full_model: None,
            url: None,
            timeout_secs: default_generate_timeout(),
            temperature: default_temperature(),
        }
    }
}

/// Cross-encoder rerank service settings. `provider = "disabled"` makes the
/// orchestrator take its RRF fallback path deterministically.
#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_rerank_timeout")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            timeout_secs: default_rerank_timeout(),
        }
    }
}

/// Retrieval and consolidation tuning. This is the `RagConfig` value each
/// stage reads once; all constants from the pipeline design live here.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Per-variant dense search candidate count.
    #[serde(default = "default_search_limit")]
    pub dense_limit: usize,
    /// Per-query lexical search candidate count.
    #[serde(default = "default_search_limit")]
    pub lexical_limit: usize,
    /// RRF rank constant.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,
    /// Candidates kept after fusion.
    #[serde(default = "default_k_fuse")]
    pub k_fuse: usize,
    /// Candidates kept after reranking.
    #[serde(default = "default_k_rerank")]
    pub k_rerank: usize,
    /// Weight of the entity-overlap boost.
    #[serde(default = "default_entity_beta")]
    pub entity_beta: f64,
    /// Weight of the intent cue boost.
    #[serde(default = "default_intent_beta")]
    pub intent_beta: f64,
    /// Max line gap for two chunks to be merged as adjacent.
    #[serde(default = "default_gap_threshold")]
    pub gap_threshold: i64,
    /// Child line coverage at or above which a parent replaces its children.
    #[serde(default = "default_coverage_threshold")]
    pub coverage_threshold: f64,
    /// Minimum enriched content length for a group to survive.
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,
    /// Reserved coverage filter; 0.0 disables it.
    #[serde(default)]
    pub coverage_floor: f64,
    /// Consolidated groups included in the prompt.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    /// Dense/lexical search deadline in seconds.
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dense_limit: default_search_limit(),
            lexical_limit: default_search_limit(),
            rrf_k: default_rrf_k(),
            k_fuse: default_k_fuse(),
            k_rerank: default_k_rerank(),
            entity_beta: default_entity_beta(),
            intent_beta: default_intent_beta(),
            gap_threshold: default_gap_threshold(),
            coverage_threshold: default_coverage_threshold(),
            min_content_chars: default_min_content_chars(),
            coverage_floor: 0.0,
            top_n: default_top_n(),
            search_timeout_secs: default_search_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_embed_timeout() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_generate_timeout() -> u64 {
    120
}
fn default_temperature() -> f64 {
    0.7
}
fn default_rerank_timeout() -> u64 {
    60
}
fn default_search_limit() -> usize {
    50
}
fn default_rrf_k() -> u32 {
    60
}
fn default_k_fuse() -> usize {
    30
}
fn default_k_rerank() -> usize {
    15
}
fn default_entity_beta() -> f64 {
    0.1
}
fn default_intent_beta() -> f64 {
    0.05
}
fn default_gap_threshold() -> i64 {
    7
}
fn default_coverage_threshold() -> f64 {
    0.5
}
fn default_min_content_chars() -> usize {
    350
}
fn default_top_n() -> usize {
    5
}
fn default_search_timeout() -> u64 {
    5
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Model name for the requested tier, falling back to the light model
    /// when no FULL tier is configured.
    pub fn model_for_tier(&self, use_full_model: bool) -> Option<&str> {
        if use_full_model {
            self.full_model.as_deref().or(self.model.as_deref())
        } else {
            self.model.as_deref()
        }
    }
}

impl RerankConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.embedding.is_enabled() {
        if config.embedding.dims == 0 {
            anyhow::bail!("embedding.dims must be > 0");
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.generation.is_enabled() && config.generation.model.is_none() {
        anyhow::bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }

    match config.rerank.provider.as_str() {
        "disabled" | "http" => {}
        other => anyhow::bail!(
            "Unknown rerank provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    if config.rerank.provider == "http" && config.rerank.url.is_none() {
        anyhow::bail!("rerank.url must be specified when provider is 'http'");
    }

    validate_retrieval(&config.retrieval)?;

    Ok(config)
}

fn validate_retrieval(r: &RetrievalConfig) -> Result<()> {
    if r.k_fuse == 0 || r.k_rerank == 0 || r.top_n == 0 {
        anyhow::bail!("retrieval.k_fuse, k_rerank, and top_n must all be >= 1");
    }
    if r.gap_threshold < 0 {
        anyhow::bail!("retrieval.gap_threshold must be >= 0");
    }
    if !(0.0..=1.0).contains(&r.coverage_threshold) {
        anyhow::bail!("retrieval.coverage_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&r.coverage_floor) {
        anyhow::bail!("retrieval.coverage_floor must be in [0.0, 1.0]");
    }
    Ok(())
}

/// Merged retrieval tuning: file-level `[retrieval]` defaults overlaid with
/// the `retrieval` preset from the `rag_config` table, when present.
///
/// Stored presets are partial TOML/JSON objects; unknown keys are rejected
/// so a typo in a stored preset fails loudly rather than silently using a
/// default.
pub async fn retrieval_preset(pool: &SqlitePool, base: &RetrievalConfig) -> RetrievalConfig {
    let row = sqlx::query("SELECT config_json FROM rag_config WHERE preset = 'retrieval'")
        .fetch_optional(pool)
        .await;

    let json = match row {
        Ok(Some(row)) => row.get::<String, _>("config_json"),
        Ok(None) => return base.clone(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read rag_config preset; using file defaults");
            return base.clone();
        }
    };

    match merge_preset(base, &json) {
        Ok(merged) => merged,
        Err(e) => {
            tracing::warn!(error = %e, "invalid retrieval preset; using file defaults");
            base.clone()
        }
    }
}

fn merge_preset(base: &RetrievalConfig, json: &str) -> Result<RetrievalConfig> {
    let overrides: serde_json::Value = serde_json::from_str(json)?;
    let mut value = serde_json::to_value(base)?;

    let (Some(obj), Some(over)) = (value.as_object_mut(), overrides.as_object()) else {
        anyhow::bail!("retrieval preset must be a JSON object");
    };

    for (k, v) in over {
        if !obj.contains_key(k) {
            anyhow::bail!("unknown retrieval preset key: {}", k);
        }
        obj.insert(k.clone(), v.clone());
    }

    let merged: RetrievalConfig = serde_json::from_value(value)?;
    validate_retrieval(&merged)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrieval_defaults_match_pipeline_constants() {
        let r = RetrievalConfig::default();
        assert_eq!(r.dense_limit, 50);
        assert_eq!(r.rrf_k, 60);
        assert_eq!(r.k_fuse, 30);
        assert_eq!(r.k_rerank, 15);
        assert!((r.entity_beta - 0.1).abs() < 1e-12);
        assert!((r.intent_beta - 0.05).abs() < 1e-12);
        assert_eq!(r.gap_threshold, 7);
        assert!((r.coverage_threshold - 0.5).abs() < 1e-12);
        assert_eq!(r.min_content_chars, 350);
        assert_eq!(r.coverage_floor, 0.0);
        assert_eq!(r.top_n, 5);
    }

    #[test]
    fn test_merge_preset_overrides_known_keys() {
        let base = RetrievalConfig::default();
        let merged = merge_preset(&base, r#"{"k_rerank": 8, "gap_threshold": 3}"#).unwrap();
        assert_eq!(merged.k_rerank, 8);
        assert_eq!(merged.gap_threshold, 3);
        assert_eq!(merged.k_fuse, 30);
    }

    #[test]
    fn test_merge_preset_rejects_unknown_key() {
        let base = RetrievalConfig::default();
        assert!(merge_preset(&base, r#"{"k_rernak": 8}"#).is_err());
    }

    #[test]
    fn test_merge_preset_rejects_invalid_value() {
        let base = RetrievalConfig::default();
        assert!(merge_preset(&base, r#"{"coverage_threshold": 1.5}"#).is_err());
    }

    #[test]
    fn test_model_for_tier() {
        let gen = GenerationConfig {
            provider: "openai".into(),
            model: Some("light".into()),
            full_model: Some("full".into()),
            ..Default::default()
        };
        assert_eq!(gen.model_for_tier(true), Some("full"));
        assert_eq!(gen.model_for_tier(false), Some("light"));

        let no_full = GenerationConfig {
            provider: "openai".into(),
            model: Some("light".into()),
            ..Default::default()
        };
        assert_eq!(no_full.model_for_tier(true), Some("light"));
    }
}
