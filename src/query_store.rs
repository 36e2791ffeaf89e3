//! Query and result persistence, and the per-query state machine.
//!
//! A query advances `created → expanded → embedded → retrieved →
//! consolidated → answered`. Each stage's save is a single UPDATE that
//! also moves the state and clears every derived field strictly downstream
//! of it, so re-running an earlier stage (a backward transition) leaves no
//! stale derived data behind. Past results are never deleted.
//!
//! Stage entry guards live here too: each `ensure_*` returns
//! [`RagError::PreconditionFailed`] naming the unmet predicate.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{RagError, RagResult};
use crate::models::{
    ConsolidatedGroup, Intent, Query, QueryState, ResultRecord, RetrievedChunk, VectorStatus,
};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Construct a fresh query record in `expanded` state. The expander is the
/// only creator of queries; `created` exists as the pre-persistence state.
pub fn new_query(original_query: &str) -> Query {
    let ts = now();
    Query {
        id: Uuid::new_v4().to_string(),
        original_query: original_query.to_string(),
        expanded_queries: Vec::new(),
        hyde_answer: String::new(),
        intent: Intent::Unknown,
        entities: Vec::new(),
        embedding_original: None,
        embeddings_mqe: Vec::new(),
        embedding_hyde: None,
        vector_status: VectorStatus::NoVec,
        state: QueryState::Expanded,
        parse_warning: false,
        retrieved_context: Vec::new(),
        clean_retrieval_context: Vec::new(),
        created_at: ts,
        updated_at: ts,
    }
}

/// Insert a newly expanded query.
pub async fn create_query(pool: &SqlitePool, query: &Query) -> RagResult<()> {
    sqlx::query(
        r#"
        INSERT INTO queries
            (id, original_query, expanded_queries_json, hyde_answer, intent,
             entities_json, vector_status, state, parse_warning, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&query.id)
    .bind(&query.original_query)
    .bind(serde_json::to_string(&query.expanded_queries)?)
    .bind(&query.hyde_answer)
    .bind(query.intent.as_str())
    .bind(serde_json::to_string(&query.entities)?)
    .bind(query.vector_status.as_str())
    .bind(query.state.as_str())
    .bind(query.parse_warning as i64)
    .bind(query.created_at)
    .bind(query.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a query by id.
pub async fn get_query(pool: &SqlitePool, query_id: &str) -> RagResult<Query> {
    let row = sqlx::query(
        r#"
        SELECT id, original_query, expanded_queries_json, hyde_answer, intent,
               entities_json, embedding_original, embeddings_mqe_json, embedding_hyde,
               vector_status, state, parse_warning, retrieved_context_json,
               clean_retrieval_context_json, created_at, updated_at
        FROM queries WHERE id = ?
        "#,
    )
    .bind(query_id)
    .fetch_optional(pool)
    .await?;

    let row = row.ok_or_else(|| RagError::NotFound(format!("query {}", query_id)))?;
    row_to_query(&row)
}

/// Recent queries, newest first.
pub async fn list_queries(pool: &SqlitePool, limit: i64) -> RagResult<Vec<Query>> {
    let rows = sqlx::query(
        r#"
        SELECT id, original_query, expanded_queries_json, hyde_answer, intent,
               entities_json, embedding_original, embeddings_mqe_json, embedding_hyde,
               vector_status, state, parse_warning, retrieved_context_json,
               clean_retrieval_context_json, created_at, updated_at
        FROM queries ORDER BY created_at DESC, id ASC LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_query).collect()
}

/// Persist the embedding stage outcome in one atomic write.
///
/// Moves the query to `embedded` and clears retrieved/consolidated context
/// (a re-embed invalidates both). Partial embeddings are stored as-is when
/// `status` is `vec_err` so a failed run can be inspected.
pub async fn save_embeddings(
    pool: &SqlitePool,
    query_id: &str,
    embedding_original: Option<&[f32]>,
    embeddings_mqe: &[Vec<f32>],
    embedding_hyde: Option<&[f32]>,
    status: VectorStatus,
) -> RagResult<()> {
    let mqe_json = serde_json::to_string(embeddings_mqe)?;

    let updated = sqlx::query(
        r#"
        UPDATE queries SET
            embedding_original = ?,
            embeddings_mqe_json = ?,
            embedding_hyde = ?,
            vector_status = ?,
            state = 'embedded',
            retrieved_context_json = NULL,
            clean_retrieval_context_json = NULL,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(embedding_original.map(vec_to_blob))
    .bind(mqe_json)
    .bind(embedding_hyde.map(vec_to_blob))
    .bind(status.as_str())
    .bind(now())
    .bind(query_id)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(RagError::NotFound(format!("query {}", query_id)));
    }
    Ok(())
}

/// Persist the retrieval stage outcome; clears stale consolidated context.
pub async fn save_retrieved(
    pool: &SqlitePool,
    query_id: &str,
    retrieved: &[RetrievedChunk],
) -> RagResult<()> {
    let updated = sqlx::query(
        r#"
        UPDATE queries SET
            retrieved_context_json = ?,
            clean_retrieval_context_json = NULL,
            state = 'retrieved',
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(serde_json::to_string(retrieved)?)
    .bind(now())
    .bind(query_id)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(RagError::NotFound(format!("query {}", query_id)));
    }
    Ok(())
}

/// Persist the consolidation stage outcome.
pub async fn save_consolidated(
    pool: &SqlitePool,
    query_id: &str,
    groups: &[ConsolidatedGroup],
) -> RagResult<()> {
    let updated = sqlx::query(
        r#"
        UPDATE queries SET
            clean_retrieval_context_json = ?,
            state = 'consolidated',
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(serde_json::to_string(groups)?)
    .bind(now())
    .bind(query_id)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(RagError::NotFound(format!("query {}", query_id)));
    }
    Ok(())
}

/// Record a produced answer and move the query to `answered`.
pub async fn insert_result(
    pool: &SqlitePool,
    query_id: &str,
    response_text: &str,
) -> RagResult<ResultRecord> {
    let ts = now();
    let record = ResultRecord {
        id: Uuid::new_v4().to_string(),
        query_id: query_id.to_string(),
        response_text: response_text.to_string(),
        created_at: ts,
        updated_at: ts,
    };

    sqlx::query(
        "INSERT INTO results (id, query_id, response_text, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.query_id)
    .bind(&record.response_text)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE queries SET state = 'answered', updated_at = ? WHERE id = ?")
        .bind(ts)
        .bind(query_id)
        .execute(pool)
        .await?;

    Ok(record)
}

/// All results for a query, oldest first.
pub async fn list_results(pool: &SqlitePool, query_id: &str) -> RagResult<Vec<ResultRecord>> {
    let rows = sqlx::query(
        "SELECT id, query_id, response_text, created_at, updated_at
         FROM results WHERE query_id = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(query_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ResultRecord {
            id: row.get("id"),
            query_id: row.get("query_id"),
            response_text: row.get("response_text"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
        .collect())
}

// ============ Stage guards ============

/// Embedding requires a non-empty original query.
pub fn ensure_embeddable(query: &Query) -> RagResult<()> {
    if query.original_query.trim().is_empty() {
        return Err(RagError::precondition("original_query is non-empty"));
    }
    Ok(())
}

/// Retrieval requires completed query embeddings.
pub fn ensure_retrievable(query: &Query) -> RagResult<()> {
    if query.vector_status != VectorStatus::Vec {
        return Err(RagError::precondition("vector_status = vec"));
    }
    if query.embedding_original.is_none() {
        return Err(RagError::precondition("embedding_original is present"));
    }
    Ok(())
}

/// Consolidation requires retrieved context.
pub fn ensure_consolidatable(query: &Query) -> RagResult<()> {
    if query.retrieved_context.is_empty() {
        return Err(RagError::precondition("retrieved_context is non-empty"));
    }
    Ok(())
}

/// Answering requires retrieved context and no upstream `_err` state.
pub fn ensure_answerable(query: &Query) -> RagResult<()> {
    if query.vector_status == VectorStatus::VecErr {
        return Err(RagError::precondition("vector_status != vec_err"));
    }
    if query.retrieved_context.is_empty() {
        return Err(RagError::precondition("retrieved_context is non-empty"));
    }
    Ok(())
}

fn row_to_query(row: &sqlx::sqlite::SqliteRow) -> RagResult<Query> {
    let expanded_json: String = row.get("expanded_queries_json");
    let entities_json: String = row.get("entities_json");
    let mqe_json: String = row.get("embeddings_mqe_json");
    let retrieved_json: Option<String> = row.get("retrieved_context_json");
    let clean_json: Option<String> = row.get("clean_retrieval_context_json");

    let status_str: String = row.get("vector_status");
    let vector_status = VectorStatus::parse(&status_str)
        .ok_or_else(|| RagError::Permanent(format!("unknown vector status '{}'", status_str)))?;

    let state_str: String = row.get("state");
    let state = QueryState::parse(&state_str)
        .ok_or_else(|| RagError::Permanent(format!("unknown query state '{}'", state_str)))?;

    let intent_str: String = row.get("intent");

    let embedding_original: Option<Vec<u8>> = row.get("embedding_original");
    let embedding_hyde: Option<Vec<u8>> = row.get("embedding_hyde");

    Ok(Query {
        id: row.get("id"),
        original_query: row.get("original_query"),
        expanded_queries: serde_json::from_str(&expanded_json)?,
        hyde_answer: row.get("hyde_answer"),
        intent: Intent::parse(&intent_str),
        entities: serde_json::from_str(&entities_json)?,
        embedding_original: embedding_original.map(|b| blob_to_vec(&b)),
        embeddings_mqe: serde_json::from_str(&mqe_json)?,
        embedding_hyde: embedding_hyde.map(|b| blob_to_vec(&b)),
        vector_status,
        state,
        parse_warning: row.get::<i64, _>("parse_warning") != 0,
        retrieved_context: match retrieved_json {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        },
        clean_retrieval_context: match clean_json {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
