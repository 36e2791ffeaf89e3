//! Query embedding stage.
//!
//! Embeds the original question, every non-empty expansion (as one batch,
//! order preserved), and the HyDE answer when present. Zero-length inputs
//! are skipped and their embedding left null. On full success the query
//! moves to `vector_status = vec`; any failure after the client's bounded
//! retries stores whatever was embedded so far under `vec_err` before the
//! error surfaces, so a failed run can be inspected and re-run.

use sqlx::SqlitePool;

use crate::embedding::EmbeddingProvider;
use crate::error::RagResult;
use crate::models::{Query, VectorStatus};
use crate::query_store;

/// Run the embedding stage for a query. Returns the final vector status
/// (`vec` on success).
pub async fn run_embed(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    query_id: &str,
) -> RagResult<VectorStatus> {
    let query = query_store::get_query(pool, query_id).await?;
    query_store::ensure_embeddable(&query)?;

    match embed_all(embedder, &query).await {
        Ok(embedded) => {
            query_store::save_embeddings(
                pool,
                query_id,
                embedded.original.as_deref(),
                &embedded.mqe,
                embedded.hyde.as_deref(),
                VectorStatus::Vec,
            )
            .await?;
            tracing::info!(query_id, "query embedded");
            Ok(VectorStatus::Vec)
        }
        Err((partial, err)) => {
            // Keep partial vectors around under vec_err for debugging; the
            // stage itself still fails.
            query_store::save_embeddings(
                pool,
                query_id,
                partial.original.as_deref(),
                &partial.mqe,
                partial.hyde.as_deref(),
                VectorStatus::VecErr,
            )
            .await?;
            tracing::warn!(query_id, error = %err, "query embedding failed");
            Err(err)
        }
    }
}

#[derive(Default)]
struct EmbeddedQuery {
    original: Option<Vec<f32>>,
    mqe: Vec<Vec<f32>>,
    hyde: Option<Vec<f32>>,
}

/// Embed all query texts; on error, return the partial result alongside it.
async fn embed_all(
    embedder: &dyn EmbeddingProvider,
    query: &Query,
) -> Result<EmbeddedQuery, (EmbeddedQuery, crate::error::RagError)> {
    let mut out = EmbeddedQuery::default();

    match embedder.embed_one(&query.original_query).await {
        Ok(vector) => out.original = Some(vector),
        Err(e) => return Err((out, e)),
    }

    // One batch for all non-empty expansions; empty ones keep a null
    // (zero-length) slot so indices line up with expanded_queries.
    let non_empty: Vec<(usize, String)> = query
        .expanded_queries
        .iter()
        .enumerate()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(i, text)| (i, text.clone()))
        .collect();

    if !non_empty.is_empty() {
        let texts: Vec<String> = non_empty.iter().map(|(_, t)| t.clone()).collect();
        match embedder.embed_many(&texts).await {
            Ok(vectors) => {
                out.mqe = vec![Vec::new(); query.expanded_queries.len()];
                for ((index, _), vector) in non_empty.iter().zip(vectors) {
                    out.mqe[*index] = vector;
                }
            }
            Err(e) => return Err((out, e)),
        }
    }

    if !query.hyde_answer.trim().is_empty() {
        match embedder.embed_one(&query.hyde_answer).await {
            Ok(vector) => out.hyde = Some(vector),
            Err(e) => return Err((out, e)),
        }
    }

    Ok(out)
}
