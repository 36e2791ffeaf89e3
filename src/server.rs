//! HTTP server exposing the RAG query pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/rag/expansion/run` | Expand a question and create a query |
//! | `POST` | `/rag/expansion/manual` | Parse a pasted model response and create a query |
//! | `POST` | `/rag/queries/{id}/embed` | Embed the query texts |
//! | `POST` | `/rag/queries/{id}/retrieve` | Hybrid retrieval |
//! | `POST` | `/rag/queries/{id}/consolidate` | Consolidate retrieved context |
//! | `GET`  | `/rag/queries/{id}/augment/prompt` | Build the prompt without calling the model |
//! | `POST` | `/rag/queries/{id}/augment/run` | Build the prompt and produce an answer |
//! | `POST` | `/rag/queries/{id}/augment/manual` | Persist an externally produced answer |
//! | `GET`  | `/rag/queries/{id}` | Full query snapshot |
//! | `GET`  | `/rag/queries/{id}/results` | Results for a query |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses use the envelope:
//!
//! ```json
//! { "error": { "code": "precondition_failed", "message": "precondition failed: vector_status = vec" } }
//! ```
//!
//! Codes: `bad_request` (400), `not_found` (404), `precondition_failed`
//! (409), `provider_disabled` (400), `upstream_error` (502),
//! `upstream_unavailable` (503), `internal` (500). Degraded-but-successful
//! outcomes (stale sources, parse warnings, zero candidates) are flagged on
//! 200 responses, never raised as errors.

use axum::{
    extract::{Path, Query as UrlQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::augment;
use crate::config::Config;
use crate::consolidate;
use crate::db;
use crate::embed_query;
use crate::embedding;
use crate::error::RagError;
use crate::expand;
use crate::generation;
use crate::models::{Query, ResultRecord};
use crate::query_store;
use crate::rerank;
use crate::retrieve;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
}

/// Starts the HTTP server on the configured bind address.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();

    let state = AppState {
        config: Arc::new(config.clone()),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/rag/expansion/run", post(handle_expansion_run))
        .route("/rag/expansion/manual", post(handle_expansion_manual))
        .route("/rag/queries/{id}/embed", post(handle_embed))
        .route("/rag/queries/{id}/retrieve", post(handle_retrieve))
        .route("/rag/queries/{id}/consolidate", post(handle_consolidate))
        .route("/rag/queries/{id}/augment/prompt", get(handle_augment_prompt))
        .route("/rag/queries/{id}/augment/run", post(handle_augment_run))
        .route("/rag/queries/{id}/augment/manual", post(handle_augment_manual))
        .route("/rag/queries/{id}", get(handle_get_query))
        .route("/rag/queries/{id}/results", get(handle_get_results))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(bind = %bind_addr, "server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let (status, code) = match &err {
            RagError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            RagError::PreconditionFailed { .. } => (StatusCode::CONFLICT, "precondition_failed"),
            RagError::Permanent(msg) if msg.contains("disabled") => {
                (StatusCode::BAD_REQUEST, "provider_disabled")
            }
            RagError::Permanent(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            RagError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: err.to_string(),
        }
    }
}

// ============ POST /rag/expansion/run ============

#[derive(Deserialize)]
struct ExpansionRunRequest {
    original_query: String,
    #[serde(default)]
    use_full_model: bool,
}

#[derive(Serialize)]
struct ExpansionResponse {
    query_id: String,
    expanded_queries: Vec<String>,
    hyde_answer: String,
    intent: String,
    entities: Vec<String>,
    parse_warning: bool,
}

impl From<&Query> for ExpansionResponse {
    fn from(query: &Query) -> Self {
        Self {
            query_id: query.id.clone(),
            expanded_queries: query.expanded_queries.clone(),
            hyde_answer: query.hyde_answer.clone(),
            intent: query.intent.as_str().to_string(),
            entities: query.entities.clone(),
            parse_warning: query.parse_warning,
        }
    }
}

async fn handle_expansion_run(
    State(state): State<AppState>,
    Json(req): Json<ExpansionRunRequest>,
) -> Result<Json<ExpansionResponse>, AppError> {
    if req.original_query.trim().is_empty() {
        return Err(bad_request("original_query must not be empty"));
    }

    let pool = db::connect(&state.config).await?;
    let generator = generation::create_generator(&state.config.generation)?;
    let query = expand::run_expansion(
        &pool,
        generator.as_ref(),
        &state.config.generation,
        &req.original_query,
        req.use_full_model,
    )
    .await;
    pool.close().await;

    Ok(Json(ExpansionResponse::from(&query?)))
}

// ============ POST /rag/expansion/manual ============

#[derive(Deserialize)]
struct ExpansionManualRequest {
    original_query: String,
    llm_response: String,
}

#[derive(Serialize)]
struct QueryIdResponse {
    query_id: String,
}

async fn handle_expansion_manual(
    State(state): State<AppState>,
    Json(req): Json<ExpansionManualRequest>,
) -> Result<Json<QueryIdResponse>, AppError> {
    if req.original_query.trim().is_empty() {
        return Err(bad_request("original_query must not be empty"));
    }

    let pool = db::connect(&state.config).await?;
    let query = expand::run_manual_expansion(&pool, &req.original_query, &req.llm_response).await;
    pool.close().await;

    Ok(Json(QueryIdResponse {
        query_id: query?.id,
    }))
}

// ============ POST /rag/queries/{id}/embed ============

#[derive(Serialize)]
struct EmbedResponse {
    vector_status: String,
}

async fn handle_embed(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EmbedResponse>, AppError> {
    let pool = db::connect(&state.config).await?;
    let embedder = embedding::create_embedder(&state.config.embedding)?;
    let status = embed_query::run_embed(&pool, embedder.as_ref(), &id).await;
    pool.close().await;

    Ok(Json(EmbedResponse {
        vector_status: status?.as_str().to_string(),
    }))
}

// ============ POST /rag/queries/{id}/retrieve ============

#[derive(Serialize)]
struct RetrieveResponse {
    chunks_retrieved: usize,
}

async fn handle_retrieve(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RetrieveResponse>, AppError> {
    let pool = db::connect(&state.config).await?;
    let rerank_model = rerank::create_rerank_model(&state.config.rerank)?;
    let count = retrieve::run_retrieve(
        &pool,
        rerank_model.as_deref(),
        &state.config.retrieval,
        &id,
    )
    .await;
    pool.close().await;

    Ok(Json(RetrieveResponse {
        chunks_retrieved: count?,
    }))
}

// ============ POST /rag/queries/{id}/consolidate ============

#[derive(Serialize)]
struct ConsolidateResponse {
    original_count: usize,
    consolidated_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

async fn handle_consolidate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConsolidateResponse>, AppError> {
    let pool = db::connect(&state.config).await?;
    let outcome = consolidate::run_consolidate(&pool, &state.config.retrieval, &id).await;
    pool.close().await;

    let outcome = outcome?;
    Ok(Json(ConsolidateResponse {
        original_count: outcome.original_count,
        consolidated_count: outcome.consolidated_count,
        warning: outcome
            .stale_warning
            .then(|| "stale sanitized source; stored chunk content used".to_string()),
    }))
}

// ============ GET /rag/queries/{id}/augment/prompt ============

#[derive(Deserialize)]
struct PromptParams {
    top_n: Option<usize>,
}

#[derive(Serialize)]
struct PromptResponse {
    prompt: String,
    context_count: usize,
}

async fn handle_augment_prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    UrlQuery(params): UrlQuery<PromptParams>,
) -> Result<Json<PromptResponse>, AppError> {
    let pool = db::connect(&state.config).await?;
    let built = augment::build_prompt(&pool, &state.config.retrieval, &id, params.top_n).await;
    pool.close().await;

    let built = built?;
    Ok(Json(PromptResponse {
        prompt: built.prompt,
        context_count: built.context_count,
    }))
}

// ============ POST /rag/queries/{id}/augment/run ============

#[derive(Deserialize)]
struct AugmentRunRequest {
    top_n: Option<usize>,
    #[serde(default)]
    use_full_model: bool,
}

#[derive(Serialize)]
struct AugmentRunResponse {
    result_id: String,
    response_text: String,
}

async fn handle_augment_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AugmentRunRequest>,
) -> Result<Json<AugmentRunResponse>, AppError> {
    let pool = db::connect(&state.config).await?;
    let generator = generation::create_generator(&state.config.generation)?;
    let record = augment::run_answer(
        &pool,
        generator.as_ref(),
        &state.config.generation,
        &state.config.retrieval,
        &id,
        req.top_n,
        req.use_full_model,
    )
    .await;
    pool.close().await;

    let record = record?;
    Ok(Json(AugmentRunResponse {
        result_id: record.id,
        response_text: record.response_text,
    }))
}

// ============ POST /rag/queries/{id}/augment/manual ============

#[derive(Deserialize)]
struct AugmentManualRequest {
    #[allow(dead_code)]
    top_n: Option<usize>,
    response_text: String,
}

#[derive(Serialize)]
struct ResultIdResponse {
    result_id: String,
}

async fn handle_augment_manual(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AugmentManualRequest>,
) -> Result<Json<ResultIdResponse>, AppError> {
    if req.response_text.trim().is_empty() {
        return Err(bad_request("response_text must not be empty"));
    }

    let pool = db::connect(&state.config).await?;
    let record = augment::run_manual_answer(&pool, &id, &req.response_text).await;
    pool.close().await;

    Ok(Json(ResultIdResponse {
        result_id: record?.id,
    }))
}

// ============ GET /rag/queries/{id} ============

/// Full query snapshot. Raw embedding vectors are summarized (dimension
/// counts) rather than inlined.
#[derive(Serialize)]
struct QuerySnapshot {
    id: String,
    original_query: String,
    expanded_queries: Vec<String>,
    hyde_answer: String,
    intent: String,
    entities: Vec<String>,
    vector_status: String,
    state: String,
    parse_warning: bool,
    embedding_original_dims: Option<usize>,
    embeddings_mqe_dims: Vec<usize>,
    embedding_hyde_dims: Option<usize>,
    retrieved_context: Vec<crate::models::RetrievedChunk>,
    clean_retrieval_context: Vec<crate::models::ConsolidatedGroup>,
    created_at: String,
    updated_at: String,
}

impl From<Query> for QuerySnapshot {
    fn from(query: Query) -> Self {
        Self {
            id: query.id,
            original_query: query.original_query,
            expanded_queries: query.expanded_queries,
            hyde_answer: query.hyde_answer,
            intent: query.intent.as_str().to_string(),
            entities: query.entities,
            vector_status: query.vector_status.as_str().to_string(),
            state: query.state.as_str().to_string(),
            parse_warning: query.parse_warning,
            embedding_original_dims: query.embedding_original.map(|v| v.len()),
            embeddings_mqe_dims: query.embeddings_mqe.iter().map(|v| v.len()).collect(),
            embedding_hyde_dims: query.embedding_hyde.map(|v| v.len()),
            retrieved_context: query.retrieved_context,
            clean_retrieval_context: query.clean_retrieval_context,
            created_at: format_ts_iso(query.created_at),
            updated_at: format_ts_iso(query.updated_at),
        }
    }
}

async fn handle_get_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QuerySnapshot>, AppError> {
    let pool = db::connect(&state.config).await?;
    let query = query_store::get_query(&pool, &id).await;
    pool.close().await;

    Ok(Json(QuerySnapshot::from(query?)))
}

// ============ GET /rag/queries/{id}/results ============

#[derive(Serialize)]
struct ResultsResponse {
    results: Vec<ResultView>,
}

#[derive(Serialize)]
struct ResultView {
    id: String,
    query_id: String,
    response_text: String,
    created_at: String,
}

impl From<ResultRecord> for ResultView {
    fn from(record: ResultRecord) -> Self {
        Self {
            id: record.id,
            query_id: record.query_id,
            response_text: record.response_text,
            created_at: format_ts_iso(record.created_at),
        }
    }
}

async fn handle_get_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResultsResponse>, AppError> {
    let pool = db::connect(&state.config).await?;
    // Listing results for an unknown query is a 404, not an empty list.
    let query = query_store::get_query(&pool, &id).await;
    let results = match &query {
        Ok(_) => query_store::list_results(&pool, &id).await,
        Err(_) => Ok(Vec::new()),
    };
    pool.close().await;

    query?;
    Ok(Json(ResultsResponse {
        results: results?.into_iter().map(ResultView::from).collect(),
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
