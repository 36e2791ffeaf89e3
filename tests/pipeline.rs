//! End-to-end pipeline tests over a seeded corpus with stub model
//! providers. Each test builds its own temporary database and sanitized
//! files, drives the stages through the public API, and checks the
//! persisted query record.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

use corpus_rag::augment;
use corpus_rag::config::{
    Config, DbConfig, EmbeddingConfig, GenerationConfig, RerankConfig, RetrievalConfig,
    ServerConfig,
};
use corpus_rag::consolidate;
use corpus_rag::db;
use corpus_rag::embed_query;
use corpus_rag::embedding::{vec_to_blob, EmbeddingProvider};
use corpus_rag::error::{RagError, RagResult};
use corpus_rag::expand;
use corpus_rag::generation::{GenerationRequest, GenerativeProvider};
use corpus_rag::migrate;
use corpus_rag::models::{Level, RetrievedChunk, VectorStatus};
use corpus_rag::query_store;
use corpus_rag::retrieve;

const DIMS: usize = 4;

// ============ Fixtures ============

fn test_config(root: &Path) -> Config {
    Config {
        db: DbConfig {
            path: root.join("data/crag.sqlite"),
        },
        embedding: EmbeddingConfig {
            provider: "disabled".to_string(),
            model: None,
            dims: DIMS,
            url: None,
            timeout_secs: 5,
            max_attempts: 3,
        },
        generation: GenerationConfig::default(),
        rerank: RerankConfig::default(),
        retrieval: RetrievalConfig::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
    }
}

async fn setup() -> (TempDir, Config, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(tmp.path());
    migrate::run_migrations(&cfg).await.unwrap();
    let pool = db::connect(&cfg).await.unwrap();
    (tmp, cfg, pool)
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Write a sanitized file and register a work pointing at it.
async fn seed_work(pool: &SqlitePool, root: &Path, work_id: &str, title: &str, lines: &[String]) -> PathBuf {
    let path = root.join(format!("{}.md", work_id));
    let text = lines.join("\n");
    fs::write(&path, &text).unwrap();
    seed_work_with_hash(pool, work_id, title, &path, &sha256_hex(&text)).await;
    path
}

async fn seed_work_with_hash(
    pool: &SqlitePool,
    work_id: &str,
    title: &str,
    path: &Path,
    hash: &str,
) {
    let files = serde_json::json!({
        "sanitized": {"path": path.to_str().unwrap(), "sha256": hash}
    });
    sqlx::query(
        "INSERT INTO works (id, title, authors, year, files_json, created_at, updated_at)
         VALUES (?, ?, 'Test Author', 1990, ?, 0, 0)",
    )
    .bind(work_id)
    .bind(title)
    .bind(files.to_string())
    .execute(pool)
    .await
    .unwrap();
}

#[allow(clippy::too_many_arguments)]
async fn seed_chunk(
    pool: &SqlitePool,
    id: &str,
    work_id: &str,
    parent_id: Option<&str>,
    level: Level,
    content: &str,
    start_line: i64,
    end_line: i64,
    embedding: Option<&[f32]>,
) {
    let status = if embedding.is_some() { "vec" } else { "no_vec" };
    sqlx::query(
        "INSERT INTO chunks
         (id, work_id, parent_id, level, content, start_line, end_line, vector_status, embedding)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(work_id)
    .bind(parent_id)
    .bind(level.as_str())
    .bind(content)
    .bind(start_line)
    .bind(end_line)
    .bind(status)
    .bind(embedding.map(vec_to_blob))
    .execute(pool)
    .await
    .unwrap();

    if embedding.is_some() {
        sqlx::query("INSERT INTO chunks_fts (chunk_id, content) VALUES (?, ?)")
            .bind(id)
            .bind(content)
            .execute(pool)
            .await
            .unwrap();
    }
}

// ============ Stub providers ============

/// Deterministic embedder: every text maps to the same unit vector.
struct StubEmbedder;

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    fn model_name(&self) -> &str {
        "stub"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed_many(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
    }
}

/// Embedder that fails with a transient error after the first call,
/// leaving partial work behind.
struct FailingEmbedder {
    calls: Mutex<u32>,
}

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing-stub"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed_many(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if *calls > 1 {
            return Err(RagError::Transient("embedding service down".into()));
        }
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
    }
}

/// Generator that replays canned responses in order.
#[derive(Debug)]
struct StubGenerator {
    responses: Mutex<Vec<String>>,
    calls: Mutex<u32>,
}

impl StubGenerator {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
            calls: Mutex::new(0),
        }
    }

    fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl GenerativeProvider for StubGenerator {
    fn model_name(&self, _use_full_model: bool) -> &str {
        "stub"
    }
    async fn generate(&self, _request: &GenerationRequest) -> RagResult<String> {
        *self.calls.lock().unwrap() += 1;
        self.responses
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| RagError::Permanent("stub exhausted".into()))
    }
}

// ============ Corpus for the retrieval pipeline ============

/// Two sections under one work:
/// - "Short-Term Memory" (lines 1..=40) with two content chunks that
///   together cover most of it (parent replacement territory);
/// - "Capacity Limits" (lines 41..=60) with one small chunk (merge
///   territory).
async fn seed_memory_corpus(pool: &SqlitePool, root: &Path) {
    let mut lines: Vec<String> = Vec::new();
    lines.push("## Short-Term Memory".to_string());
    for i in 2..=20 {
        lines.push(format!(
            "Rehearsal keeps verbal traces alive in the phonological loop, line {}.",
            i
        ));
    }
    for i in 21..=40 {
        lines.push(format!(
            "Unrehearsed traces decay rapidly over a span of seconds, line {}.",
            i
        ));
    }
    lines.push("## Capacity Limits".to_string());
    for i in 42..=50 {
        lines.push(format!(
            "The span of immediate apprehension holds about seven items, line {}.",
            i
        ));
    }
    for i in 51..=60 {
        lines.push(format!("Trailing filler text for padding, line {}.", i));
    }
    seed_work(pool, root, "w1", "Memory and Mind", &lines).await;

    // Headings carry no embedding (not retrievable); content chunks do.
    seed_chunk(pool, "p1", "w1", None, Level::H2, "## Short-Term Memory", 1, 40, None).await;
    seed_chunk(pool, "p2", "w1", None, Level::H2, "## Capacity Limits", 41, 60, None).await;

    let c1_text: String = (2..=20)
        .map(|i| format!("Rehearsal keeps verbal traces alive in the phonological loop, line {}.", i))
        .collect::<Vec<_>>()
        .join("\n");
    let c2_text: String = (21..=40)
        .map(|i| format!("Unrehearsed traces decay rapidly over a span of seconds, line {}.", i))
        .collect::<Vec<_>>()
        .join("\n");
    let c3_text: String = (42..=50)
        .map(|i| format!("The span of immediate apprehension holds about seven items, line {}.", i))
        .collect::<Vec<_>>()
        .join("\n");

    seed_chunk(pool, "c1", "w1", Some("p1"), Level::Chunk, &c1_text, 2, 20, Some(&[1.0, 0.0, 0.0, 0.0])).await;
    seed_chunk(pool, "c2", "w1", Some("p1"), Level::Chunk, &c2_text, 21, 40, Some(&[0.8, 0.6, 0.0, 0.0])).await;
    seed_chunk(pool, "c3", "w1", Some("p2"), Level::Chunk, &c3_text, 42, 50, Some(&[0.6, 0.8, 0.0, 0.0])).await;
}

/// Manual expansion response used to create a controllable query.
const EXPANSION_JSON: &str = r#"{
    "expanded": ["phonological loop rehearsal"],
    "hyde": "",
    "intent": "DEFINITION",
    "entities": ["rehearsal"]
}"#;

async fn make_embedded_query(pool: &SqlitePool) -> String {
    let query = expand::run_manual_expansion(pool, "rehearsal", EXPANSION_JSON)
        .await
        .unwrap();
    let status = embed_query::run_embed(pool, &StubEmbedder, &query.id)
        .await
        .unwrap();
    assert_eq!(status, VectorStatus::Vec);
    query.id
}

// ============ Tests ============

#[tokio::test]
async fn test_full_pipeline_with_rrf_fallback() {
    let (tmp, cfg, pool) = setup().await;
    seed_memory_corpus(&pool, tmp.path()).await;

    let query_id = make_embedded_query(&pool).await;

    let query = query_store::get_query(&pool, &query_id).await.unwrap();
    assert_eq!(query.embedding_original.as_ref().unwrap().len(), DIMS);
    assert_eq!(query.embeddings_mqe.len(), 1);
    assert_eq!(query.embeddings_mqe[0].len(), DIMS);
    assert!(query.embedding_hyde.is_none());

    // No rerank model configured: RRF fallback with boosts.
    let count = retrieve::run_retrieve(&pool, None, &cfg.retrieval, &query_id)
        .await
        .unwrap();
    assert_eq!(count, 3);

    let query = query_store::get_query(&pool, &query_id).await.unwrap();
    let ids: Vec<&str> = query
        .retrieved_context
        .iter()
        .map(|r| r.chunk_id.as_str())
        .collect();
    // c1 leads: top dense similarity plus the only lexical hit for
    // "rehearsal", plus the entity boost.
    assert_eq!(ids[0], "c1");
    for chunk in &query.retrieved_context {
        let intent_boost = chunk.final_score - chunk.rerank_score - chunk.entity_boost;
        assert!(intent_boost >= -1e-6, "final_score must be additive");
        // Fallback path: rerank_score equals the RRF score.
        assert!((chunk.rerank_score - chunk.rrf_score).abs() < 1e-9);
    }
    let c1 = &query.retrieved_context[0];
    assert!((c1.entity_boost - 0.1).abs() < 1e-9, "one of one entities matched");

    // Consolidate: c1+c2 cover 38/40 lines of their section, so the
    // heading replaces them; c3 stays a merged singleton.
    let outcome = consolidate::run_consolidate(&pool, &cfg.retrieval, &query_id)
        .await
        .unwrap();
    assert_eq!(outcome.original_count, 3);
    assert_eq!(outcome.consolidated_count, 2);
    assert!(!outcome.stale_warning);

    let query = query_store::get_query(&pool, &query_id).await.unwrap();
    let groups = &query.clean_retrieval_context;
    assert_eq!(groups[0].chunk_ids, vec!["p1"]);
    assert_eq!(groups[0].parent_id.as_deref(), Some("p1"));
    assert_eq!(groups[0].start_line, 1);
    assert_eq!(groups[0].end_line, 40);
    assert!(groups[0].content.starts_with("## Short-Term Memory"));
    assert_eq!(groups[0].heading_chain, vec!["Short-Term Memory"]);

    assert_eq!(groups[1].chunk_ids, vec!["c3"]);
    assert_eq!(groups[1].parent_id.as_deref(), Some("p2"));
    assert_eq!(groups[1].start_line, 42);
    assert_eq!(groups[1].end_line, 50);
    assert_eq!(groups[1].heading_chain, vec!["Capacity Limits"]);

    // Prompt: two numbered blocks, byte-identical across calls.
    let built = augment::build_prompt(&pool, &cfg.retrieval, &query_id, None)
        .await
        .unwrap();
    assert_eq!(built.context_count, 2);
    assert!(built.prompt.contains("[S1] Source: Memory and Mind -- ## Short-Term Memory"));
    assert!(built.prompt.contains("[S2] Source: Memory and Mind"));
    assert!(built.prompt.contains("work_id=w1, start_line=1, end_line=40"));
    assert!(built.prompt.contains("rehearsal"));
    assert!(!built.prompt.contains("[S3]"));

    let again = augment::build_prompt(&pool, &cfg.retrieval, &query_id, None)
        .await
        .unwrap();
    assert_eq!(built.prompt, again.prompt);

    // Answer via the generative stub; the result lands on the query.
    let generator = StubGenerator::new(&["Rehearsal refreshes traces. [S1]"]);
    let record = augment::run_answer(
        &pool,
        &generator,
        &GenerationConfig::default(),
        &cfg.retrieval,
        &query_id,
        None,
        false,
    )
    .await
    .unwrap();
    assert_eq!(record.response_text, "Rehearsal refreshes traces. [S1]");

    let results = query_store::list_results(&pool, &query_id).await.unwrap();
    assert_eq!(results.len(), 1);
    let query = query_store::get_query(&pool, &query_id).await.unwrap();
    assert_eq!(query.state.as_str(), "answered");
}

#[tokio::test]
async fn test_retrieve_is_idempotent() {
    let (tmp, cfg, pool) = setup().await;
    seed_memory_corpus(&pool, tmp.path()).await;
    let query_id = make_embedded_query(&pool).await;

    retrieve::run_retrieve(&pool, None, &cfg.retrieval, &query_id)
        .await
        .unwrap();
    let first = query_store::get_query(&pool, &query_id).await.unwrap();

    retrieve::run_retrieve(&pool, None, &cfg.retrieval, &query_id)
        .await
        .unwrap();
    let second = query_store::get_query(&pool, &query_id).await.unwrap();

    assert_eq!(
        serde_json::to_string(&first.retrieved_context).unwrap(),
        serde_json::to_string(&second.retrieved_context).unwrap()
    );
}

#[tokio::test]
async fn test_consolidate_is_idempotent() {
    let (tmp, cfg, pool) = setup().await;
    seed_memory_corpus(&pool, tmp.path()).await;
    let query_id = make_embedded_query(&pool).await;
    retrieve::run_retrieve(&pool, None, &cfg.retrieval, &query_id)
        .await
        .unwrap();

    consolidate::run_consolidate(&pool, &cfg.retrieval, &query_id)
        .await
        .unwrap();
    let first = query_store::get_query(&pool, &query_id).await.unwrap();

    consolidate::run_consolidate(&pool, &cfg.retrieval, &query_id)
        .await
        .unwrap();
    let second = query_store::get_query(&pool, &query_id).await.unwrap();

    assert_eq!(
        serde_json::to_string(&first.clean_retrieval_context).unwrap(),
        serde_json::to_string(&second.clean_retrieval_context).unwrap()
    );
}

#[tokio::test]
async fn test_re_retrieve_clears_consolidated_context() {
    let (tmp, cfg, pool) = setup().await;
    seed_memory_corpus(&pool, tmp.path()).await;
    let query_id = make_embedded_query(&pool).await;

    retrieve::run_retrieve(&pool, None, &cfg.retrieval, &query_id)
        .await
        .unwrap();
    consolidate::run_consolidate(&pool, &cfg.retrieval, &query_id)
        .await
        .unwrap();
    let query = query_store::get_query(&pool, &query_id).await.unwrap();
    assert!(!query.clean_retrieval_context.is_empty());

    // Backward transition: retrieval again clears the consolidated
    // context but keeps the query itself.
    retrieve::run_retrieve(&pool, None, &cfg.retrieval, &query_id)
        .await
        .unwrap();
    let query = query_store::get_query(&pool, &query_id).await.unwrap();
    assert!(query.clean_retrieval_context.is_empty());
    assert_eq!(query.state.as_str(), "retrieved");
}

#[tokio::test]
async fn test_precondition_gate_on_retrieve() {
    let (_tmp, cfg, pool) = setup().await;

    let query = expand::run_manual_expansion(&pool, "rehearsal", EXPANSION_JSON)
        .await
        .unwrap();

    let err = retrieve::run_retrieve(&pool, None, &cfg.retrieval, &query.id)
        .await
        .unwrap_err();
    match err {
        RagError::PreconditionFailed { predicate } => {
            assert_eq!(predicate, "vector_status = vec");
        }
        other => panic!("expected PreconditionFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_expansion_parse_failure_still_creates_query() {
    let (_tmp, _cfg, pool) = setup().await;

    // Prose both times: the expander retries once at temperature 0, then
    // creates a bare query with the warning flag.
    let generator = StubGenerator::new(&[
        "I would be happy to help with that question about memory.",
        "Let me think about working memory in general terms.",
    ]);
    let query = expand::run_expansion(
        &pool,
        &generator,
        &GenerationConfig::default(),
        "What is working memory?",
        true,
    )
    .await
    .unwrap();

    assert_eq!(generator.call_count(), 2);
    assert!(query.parse_warning);
    assert!(query.expanded_queries.is_empty());
    assert!(query.hyde_answer.is_empty());
    assert_eq!(query.intent.as_str(), "UNKNOWN");
    assert!(query.entities.is_empty());

    // Embedding still works and only embeds the original question.
    let status = embed_query::run_embed(&pool, &StubEmbedder, &query.id)
        .await
        .unwrap();
    assert_eq!(status, VectorStatus::Vec);

    let stored = query_store::get_query(&pool, &query.id).await.unwrap();
    assert!(stored.embedding_original.is_some());
    assert!(stored.embeddings_mqe.is_empty());
    assert!(stored.embedding_hyde.is_none());
}

#[tokio::test]
async fn test_expansion_parses_on_first_attempt() {
    let (_tmp, _cfg, pool) = setup().await;

    let generator = StubGenerator::new(&[EXPANSION_JSON]);
    let query = expand::run_expansion(
        &pool,
        &generator,
        &GenerationConfig::default(),
        "What is rehearsal?",
        false,
    )
    .await
    .unwrap();

    assert_eq!(generator.call_count(), 1);
    assert!(!query.parse_warning);
    assert_eq!(query.expanded_queries, vec!["phonological loop rehearsal"]);
    assert_eq!(query.intent.as_str(), "DEFINITION");
    assert_eq!(query.entities, vec!["rehearsal"]);
}

#[tokio::test]
async fn test_embed_transient_failure_persists_partials_as_vec_err() {
    let (_tmp, _cfg, pool) = setup().await;

    let query = expand::run_manual_expansion(&pool, "rehearsal", EXPANSION_JSON)
        .await
        .unwrap();

    // First call (original) succeeds, second (MQE batch) fails.
    let embedder = FailingEmbedder {
        calls: Mutex::new(0),
    };
    let err = embed_query::run_embed(&pool, &embedder, &query.id)
        .await
        .unwrap_err();
    assert!(err.is_transient());

    let stored = query_store::get_query(&pool, &query.id).await.unwrap();
    assert_eq!(stored.vector_status, VectorStatus::VecErr);
    assert!(stored.embedding_original.is_some(), "partial kept for debugging");
    assert!(stored.embeddings_mqe.is_empty());

    // The answerer refuses to run on a query in an _err state.
    let generator = StubGenerator::new(&["should not be called"]);
    let answer = augment::run_answer(
        &pool,
        &generator,
        &GenerationConfig::default(),
        &RetrievalConfig::default(),
        &query.id,
        None,
        false,
    )
    .await;
    assert!(matches!(
        answer,
        Err(RagError::PreconditionFailed { .. })
    ));
    assert_eq!(generator.call_count(), 0);
}

#[tokio::test]
async fn test_adjacency_merge_at_gap_seven() {
    let (tmp, cfg, pool) = setup().await;

    let lines: Vec<String> = (1..=100)
        .map(|i| format!("Line {} of the treatise on attention and effort.", i))
        .collect();
    seed_work(&pool, tmp.path(), "w2", "Attention and Effort", &lines).await;

    seed_chunk(&pool, "p", "w2", None, Level::H2, "## Attention", 1, 100, None).await;
    seed_chunk(&pool, "a", "w2", Some("p"), Level::Chunk, "chunk a text", 10, 20, Some(&[1.0, 0.0, 0.0, 0.0])).await;
    seed_chunk(&pool, "b", "w2", Some("p"), Level::Chunk, "chunk b text", 27, 35, Some(&[1.0, 0.0, 0.0, 0.0])).await;

    let query = expand::run_manual_expansion(&pool, "attention", EXPANSION_JSON)
        .await
        .unwrap();
    query_store::save_retrieved(
        &pool,
        &query.id,
        &[
            retrieved("a", "w2", "p", 10, 20, 0.9),
            retrieved("b", "w2", "p", 27, 35, 0.6),
        ],
    )
    .await
    .unwrap();

    let outcome = consolidate::run_consolidate(&pool, &cfg.retrieval, &query.id)
        .await
        .unwrap();
    assert_eq!(outcome.consolidated_count, 1);

    let stored = query_store::get_query(&pool, &query.id).await.unwrap();
    let group = &stored.clean_retrieval_context[0];
    // Gap of exactly 7 lines (20 -> 27) merges into one group spanning
    // both chunks, with content read from the sanitized file.
    assert_eq!(group.chunk_ids, vec!["a", "b"]);
    assert_eq!(group.start_line, 10);
    assert_eq!(group.end_line, 35);
    assert!(group.content.contains("Line 10 of the treatise"));
    assert!(group.content.contains("Line 35 of the treatise"));
    assert!((group.score - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn test_adjacency_gap_eight_stays_split() {
    let (tmp, cfg, pool) = setup().await;

    let lines: Vec<String> = (1..=100)
        .map(|i| format!("Line {} of the treatise on attention and effort.", i))
        .collect();
    seed_work(&pool, tmp.path(), "w2", "Attention and Effort", &lines).await;

    seed_chunk(&pool, "p", "w2", None, Level::H2, "## Attention", 1, 100, None).await;
    seed_chunk(&pool, "a", "w2", Some("p"), Level::Chunk, "chunk a text", 10, 20, Some(&[1.0, 0.0, 0.0, 0.0])).await;
    seed_chunk(&pool, "b", "w2", Some("p"), Level::Chunk, "chunk b text", 28, 35, Some(&[1.0, 0.0, 0.0, 0.0])).await;

    let query = expand::run_manual_expansion(&pool, "attention", EXPANSION_JSON)
        .await
        .unwrap();
    query_store::save_retrieved(
        &pool,
        &query.id,
        &[
            retrieved("a", "w2", "p", 10, 20, 0.9),
            retrieved("b", "w2", "p", 28, 35, 0.6),
        ],
    )
    .await
    .unwrap();

    let outcome = consolidate::run_consolidate(&pool, &cfg.retrieval, &query.id)
        .await
        .unwrap();
    assert_eq!(outcome.consolidated_count, 2);
}

#[tokio::test]
async fn test_stale_source_falls_back_to_stored_content() {
    let (tmp, cfg, pool) = setup().await;

    // Recorded hash deliberately disagrees with the file on disk.
    let path = tmp.path().join("w3.md");
    let lines: Vec<String> = (1..=50).map(|i| format!("Line {}.", i)).collect();
    fs::write(&path, lines.join("\n")).unwrap();
    seed_work_with_hash(&pool, "w3", "Stale Work", &path, "not-the-real-hash").await;

    seed_chunk(&pool, "p", "w3", None, Level::H2, "## Section", 1, 50, None).await;
    let long_text = "Stored chunk content kept as the fallback. ".repeat(10);
    seed_chunk(&pool, "a", "w3", Some("p"), Level::Chunk, &long_text, 10, 20, Some(&[1.0, 0.0, 0.0, 0.0])).await;

    let query = expand::run_manual_expansion(&pool, "anything", EXPANSION_JSON)
        .await
        .unwrap();
    query_store::save_retrieved(&pool, &query.id, &[retrieved("a", "w3", "p", 10, 20, 0.5)])
        .await
        .unwrap();

    let outcome = consolidate::run_consolidate(&pool, &cfg.retrieval, &query.id)
        .await
        .unwrap();
    assert!(outcome.stale_warning);
    assert_eq!(outcome.consolidated_count, 1);

    let stored = query_store::get_query(&pool, &query.id).await.unwrap();
    assert!(stored.clean_retrieval_context[0]
        .content
        .starts_with("Stored chunk content kept as the fallback."));
}

#[tokio::test]
async fn test_min_content_chars_boundary() {
    let (tmp, cfg, pool) = setup().await;

    // Line 10 has exactly 350 characters, line 50 exactly 349.
    let mut lines: Vec<String> = (1..=60).map(|i| format!("filler {}", i)).collect();
    lines[9] = "x".repeat(350);
    lines[49] = "y".repeat(349);
    seed_work(&pool, tmp.path(), "w4", "Boundary Work", &lines).await;

    seed_chunk(&pool, "pa", "w4", None, Level::H2, "## A", 1, 30, None).await;
    seed_chunk(&pool, "pb", "w4", None, Level::H2, "## B", 31, 60, None).await;
    seed_chunk(&pool, "keep", "w4", Some("pa"), Level::Chunk, "keep me", 10, 10, Some(&[1.0, 0.0, 0.0, 0.0])).await;
    seed_chunk(&pool, "drop", "w4", Some("pb"), Level::Chunk, "drop me", 50, 50, Some(&[1.0, 0.0, 0.0, 0.0])).await;

    let query = expand::run_manual_expansion(&pool, "boundary", EXPANSION_JSON)
        .await
        .unwrap();
    query_store::save_retrieved(
        &pool,
        &query.id,
        &[
            retrieved("keep", "w4", "pa", 10, 10, 0.9),
            retrieved("drop", "w4", "pb", 50, 50, 0.8),
        ],
    )
    .await
    .unwrap();

    let outcome = consolidate::run_consolidate(&pool, &cfg.retrieval, &query.id)
        .await
        .unwrap();
    assert_eq!(outcome.original_count, 2);
    assert_eq!(outcome.consolidated_count, 1);

    let stored = query_store::get_query(&pool, &query.id).await.unwrap();
    assert_eq!(stored.clean_retrieval_context[0].chunk_ids, vec!["keep"]);
}

#[tokio::test]
async fn test_empty_corpus_yields_zero_candidates() {
    let (_tmp, cfg, pool) = setup().await;
    let query_id = make_embedded_query(&pool).await;

    // No chunks at all: retrieval succeeds with an empty context.
    let count = retrieve::run_retrieve(&pool, None, &cfg.retrieval, &query_id)
        .await
        .unwrap();
    assert_eq!(count, 0);

    let stored = query_store::get_query(&pool, &query_id).await.unwrap();
    assert!(stored.retrieved_context.is_empty());
    assert_eq!(stored.state.as_str(), "retrieved");
}

#[tokio::test]
async fn test_prompt_falls_back_to_retrieved_context() {
    let (tmp, cfg, pool) = setup().await;
    seed_memory_corpus(&pool, tmp.path()).await;
    let query_id = make_embedded_query(&pool).await;
    retrieve::run_retrieve(&pool, None, &cfg.retrieval, &query_id)
        .await
        .unwrap();

    // No consolidation ran: the builder uses retrieved chunks as
    // singleton groups.
    let built = augment::build_prompt(&pool, &cfg.retrieval, &query_id, Some(2))
        .await
        .unwrap();
    assert_eq!(built.context_count, 2);
    assert!(built.prompt.contains("[S1]"));
    assert!(built.prompt.contains("[S2]"));
    assert!(!built.prompt.contains("[S3]"));
}

// ============ helpers ============

fn retrieved(
    id: &str,
    work: &str,
    parent: &str,
    start: i64,
    end: i64,
    score: f64,
) -> RetrievedChunk {
    RetrievedChunk {
        chunk_id: id.to_string(),
        work_id: work.to_string(),
        parent_id: Some(parent.to_string()),
        content: format!("stored content of {}", id),
        heading_breadcrumbs: None,
        start_line: start,
        end_line: end,
        level: Level::Chunk,
        rrf_score: score,
        rerank_score: score,
        entity_boost: 0.0,
        final_score: score,
    }
}
