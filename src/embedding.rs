//! Embedding client abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete backends:
//! - **[`DisabledEmbedder`]** — returns errors; used when embeddings are not configured.
//! - **[`OpenAiEmbedder`]** — calls the OpenAI embeddings API.
//! - **[`OllamaEmbedder`]** — calls a local Ollama instance's `/api/embed` endpoint.
//!
//! All backends share the bounded retry policy in [`crate::retry`] and a
//! fixed vector dimension `D` from configuration; a response with the wrong
//! dimension is a permanent error.
//!
//! Also provides vector utilities:
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 BLOB codec for SQLite storage
//! - [`cosine_similarity`] — similarity between two embedding vectors
//!
//! An empty input string produces a zero-norm vector on every supported
//! backend; callers are expected to skip empty inputs rather than embed
//! them (the query embedder leaves such embeddings null).

use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{RagError, RagResult};
use crate::retry::{classify_status, classify_transport, retry_transient};

/// A client that maps strings to fixed-dimension dense vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Embedding dimensionality `D`.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, preserving input order.
    async fn embed_many(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> RagResult<Vec<f32>> {
        let mut vecs = self.embed_many(&[text.to_string()]).await?;
        vecs.pop()
            .ok_or_else(|| RagError::Permanent("empty embedding response".into()))
    }
}

/// Instantiate the configured embedding backend.
pub fn create_embedder(config: &EmbeddingConfig) -> RagResult<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        other => Err(RagError::Permanent(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Disabled ============

/// A no-op backend that always fails; set when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_many(&self, _texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        Err(RagError::Permanent(
            "embedding provider is disabled".into(),
        ))
    }
}

// ============ OpenAI ============

/// OpenAI `POST /v1/embeddings` backend. Requires `OPENAI_API_KEY`.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    max_attempts: u32,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> RagResult<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::Permanent("embedding.model required".into()))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(RagError::Permanent(
                "OPENAI_API_KEY environment variable not set".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Permanent(e.to_string()))?;

        Ok(Self {
            model,
            dims: config.dims,
            max_attempts: config.max_attempts,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RagError::Permanent("OPENAI_API_KEY not set".into()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let vectors = retry_transient(self.max_attempts, || async {
            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await
                .map_err(classify_transport)?;

            let status = resp.status();
            if !status.is_success() {
                let body_text = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, &body_text));
            }

            let json: serde_json::Value =
                resp.json().await.map_err(classify_transport)?;
            parse_openai_embeddings(&json)
        })
        .await?;

        check_dims(&vectors, self.dims, texts)?;
        Ok(vectors)
    }
}

fn parse_openai_embeddings(json: &serde_json::Value) -> RagResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::Permanent("invalid response: missing data array".into()))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| RagError::Permanent("invalid response: missing embedding".into()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

// ============ Ollama ============

/// Ollama `POST /api/embed` backend (default url `http://localhost:11434`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    max_attempts: u32,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> RagResult<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::Permanent("embedding.model required".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RagError::Permanent(e.to_string()))?;

        Ok(Self {
            model,
            dims: config.dims,
            url,
            max_attempts: config.max_attempts,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let vectors = retry_transient(self.max_attempts, || async {
            let resp = self
                .client
                .post(format!("{}/api/embed", self.url))
                .json(&body)
                .send()
                .await
                .map_err(classify_transport)?;

            let status = resp.status();
            if !status.is_success() {
                let body_text = resp.text().await.unwrap_or_default();
                return Err(classify_status(status, &body_text));
            }

            let json: serde_json::Value =
                resp.json().await.map_err(classify_transport)?;
            parse_ollama_embeddings(&json)
        })
        .await?;

        check_dims(&vectors, self.dims, texts)?;
        Ok(vectors)
    }
}

fn parse_ollama_embeddings(json: &serde_json::Value) -> RagResult<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| RagError::Permanent("invalid response: missing embeddings array".into()))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| RagError::Permanent("invalid response: embedding not an array".into()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

/// Dimension mismatches never fix themselves on retry, so they are permanent.
fn check_dims(vectors: &[Vec<f32>], dims: usize, texts: &[String]) -> RagResult<()> {
    if vectors.len() != texts.len() {
        return Err(RagError::Permanent(format!(
            "embedding count mismatch: sent {} texts, got {} vectors",
            texts.len(),
            vectors.len()
        )));
    }
    for v in vectors {
        if v.len() != dims {
            return Err(RagError::Permanent(format!(
                "embedding dimension mismatch: expected {}, got {}",
                dims,
                v.len()
            )));
        }
    }
    Ok(())
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors, in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, zero-norm vectors, or mismatched
/// lengths (length agreement is enforced upstream via [`check_dims`]).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
