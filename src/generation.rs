//! Generative model client abstraction and implementations.
//!
//! Defines the [`GenerativeProvider`] trait used by the query expander and
//! the answerer, with OpenAI chat-completions and Ollama chat backends.
//! Transport errors follow the same transient/permanent classification and
//! bounded retry policy as the embedding client.
//!
//! Two model tiers are supported: the light `model` and the `full_model`
//! selected when a request sets `use_full_model`. Requests carry their own
//! temperature so the expander can re-ask deterministically after a parse
//! failure.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::{RagError, RagResult};
use crate::retry::{classify_status, classify_transport, retry_transient};

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Optional system priming; user content follows.
    pub system: Option<String>,
    /// The fully built user prompt.
    pub prompt: String,
    /// Sampling temperature for this call.
    pub temperature: f64,
    /// Select the FULL model tier.
    pub use_full_model: bool,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            temperature: 0.7,
            use_full_model: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_full_model(mut self, use_full_model: bool) -> Self {
        self.use_full_model = use_full_model;
        self
    }
}

/// A client for the external generative model.
#[async_trait]
pub trait GenerativeProvider: Send + Sync + std::fmt::Debug {
    /// Model identifier for the given tier.
    fn model_name(&self, use_full_model: bool) -> &str;

    /// Produce a completion for the request.
    async fn generate(&self, request: &GenerationRequest) -> RagResult<String>;
}

/// Instantiate the configured generation backend.
pub fn create_generator(config: &GenerationConfig) -> RagResult<Box<dyn GenerativeProvider>> {
    match config.provider.as_str() {
        "disabled" => Err(RagError::Permanent(
            "generation provider is disabled".into(),
        )),
        "openai" => Ok(Box::new(OpenAiGenerator::new(config)?)),
        "ollama" => Ok(Box::new(OllamaGenerator::new(config)?)),
        other => Err(RagError::Permanent(format!(
            "unknown generation provider: {}",
            other
        ))),
    }
}

// ============ OpenAI ============

/// OpenAI `POST /v1/chat/completions` backend. Requires `OPENAI_API_KEY`.
#[derive(Debug)]
pub struct OpenAiGenerator {
    model: String,
    full_model: String,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> RagResult<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::Permanent("generation.model required".into()))?;
        let full_model = config.full_model.clone().unwrap_or_else(|| model.clone());

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
            full_model,
            client,
        })
    }
}

#[async_trait]
impl GenerativeProvider for OpenAiGenerator {
    fn model_name(&self, use_full_model: bool) -> &str {
        if use_full_model {
            &self.full_model
        } else {
            &self.model
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> RagResult<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RagError::Permanent("OPENAI_API_KEY not set".into()))?;

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));

        let body = serde_json::json!({
            "model": self.model_name(request.use_full_model),
            "messages": messages,
            "temperature": request.temperature,
        });

        retry_transient(3, || async {
            let resp = self
                .client
                .post("https://api.openai.com/v1/chat/completions")
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

            let json: serde_json::Value = resp.json().await.map_err(classify_transport)?;
            json.get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|t| t.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    RagError::Permanent("invalid response: missing choices[0].message.content".into())
                })
        })
        .await
    }
}

// ============ Ollama ============

/// Ollama `POST /api/chat` backend (default url `http://localhost:11434`).
#[derive(Debug)]
pub struct OllamaGenerator {
    model: String,
    full_model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> RagResult<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::Permanent("generation.model required".into()))?;
        let full_model = config.full_model.clone().unwrap_or_else(|| model.clone());
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
            full_model,
            url,
            client,
        })
    }
}

#[async_trait]
impl GenerativeProvider for OllamaGenerator {
    fn model_name(&self, use_full_model: bool) -> &str {
        if use_full_model {
            &self.full_model
        } else {
            &self.model
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> RagResult<String> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));

        let body = serde_json::json!({
            "model": self.model_name(request.use_full_model),
            "messages": messages,
            "stream": false,
            "options": {"temperature": request.temperature},
        });

        retry_transient(3, || async {
            let resp = self
                .client
                .post(format!("{}/api/chat", self.url))
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
            json.get("message")
                .and_then(|m| m.get("content"))
                .and_then(|t| t.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    RagError::Permanent("invalid response: missing message.content".into())
                })
        })
        .await
    }
}
