//! Retrieval orchestrator.
//!
//! Runs the hybrid retrieval fan-out for one query and persists the ranked
//! outcome:
//!
//! 1. Dense searches for every present query embedding (original, each
//!    MQE variant, HyDE) in parallel, plus lexical searches for the
//!    original question and each expansion. All searches start before any
//!    result is consumed; each carries its own deadline.
//! 2. Dense lists collapse into one pooled list by max similarity per
//!    chunk; lexical lists pool the same way by rank score.
//! 3. Reciprocal Rank Fusion over the two pooled lists keeps `k_fuse`
//!    candidates.
//! 4. The cross-encoder reranks fused candidates; if the model is
//!    unavailable or times out, RRF order is kept with `rerank_score =
//!    rrf_score` and the entity/intent boosts still applied.
//! 5. The top `k_rerank` chunks are persisted as `retrieved_context`,
//!    clearing any stale consolidated context.
//!
//! A failing individual search is logged and contributes an empty list;
//! only the all-empty case short-circuits, persisting an empty context and
//! reporting zero retrieved chunks.

use futures::future::join_all;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::RetrievalConfig;
use crate::dense::{dense_search, DenseHit};
use crate::error::RagResult;
use crate::fuse::{reciprocal_rank_fusion, FusedHit};
use crate::lexical::{lexical_search, LexicalHit};
use crate::models::RetrievedChunk;
use crate::query_store;
use crate::rerank::{self, RerankCandidate, RerankModel, RerankedChunk};
use crate::store;

/// Run the retrieval stage for a query. Returns the number of chunks
/// persisted into `retrieved_context` (zero when no candidates exist).
pub async fn run_retrieve(
    pool: &SqlitePool,
    rerank_model: Option<&dyn RerankModel>,
    base_retrieval: &RetrievalConfig,
    query_id: &str,
) -> RagResult<usize> {
    let retrieval = crate::config::retrieval_preset(pool, base_retrieval).await;

    let query = query_store::get_query(pool, query_id).await?;
    query_store::ensure_retrievable(&query)?;

    // Every present embedding becomes one dense variant.
    let mut embeddings: Vec<&Vec<f32>> = Vec::new();
    if let Some(original) = &query.embedding_original {
        embeddings.push(original);
    }
    embeddings.extend(query.embeddings_mqe.iter().filter(|v| !v.is_empty()));
    if let Some(hyde) = &query.embedding_hyde {
        if !hyde.is_empty() {
            embeddings.push(hyde);
        }
    }

    // Lexical covers the original question and each expansion; the HyDE
    // answer is embedding-only.
    let mut lexical_texts: Vec<&str> = vec![query.original_query.as_str()];
    lexical_texts.extend(
        query
            .expanded_queries
            .iter()
            .filter(|t| !t.trim().is_empty())
            .map(|t| t.as_str()),
    );

    let deadline = Duration::from_secs(retrieval.search_timeout_secs);

    let dense_futures = embeddings
        .into_iter()
        .enumerate()
        .map(|(variant, vector)| dense_with_deadline(pool, vector, retrieval.dense_limit, deadline, variant));
    let lexical_futures = lexical_texts
        .into_iter()
        .enumerate()
        .map(|(variant, text)| lexical_with_deadline(pool, text, retrieval.lexical_limit, deadline, variant));

    let (dense_lists, lexical_lists) =
        tokio::join!(join_all(dense_futures), join_all(lexical_futures));

    let pooled_dense = max_pool(
        dense_lists
            .iter()
            .map(|hits| hits.iter().map(|h| (h.chunk_id.clone(), h.similarity)).collect())
            .collect(),
    );
    let pooled_lexical = max_pool(
        lexical_lists
            .iter()
            .map(|hits| hits.iter().map(|h| (h.chunk_id.clone(), h.rank_score)).collect())
            .collect(),
    );

    let fused = reciprocal_rank_fusion(
        &[pooled_dense, pooled_lexical],
        retrieval.rrf_k,
        retrieval.k_fuse,
    );

    if fused.is_empty() {
        tracing::info!(query_id, "no retrieval candidates");
        query_store::save_retrieved(pool, query_id, &[]).await?;
        return Ok(0);
    }

    let reranked = rerank_fused(pool, rerank_model, &query, &fused, &retrieval).await?;
    let retrieved = to_retrieved_chunks(pool, &fused, &reranked).await?;

    query_store::save_retrieved(pool, query_id, &retrieved).await?;
    tracing::info!(query_id, count = retrieved.len(), "retrieval persisted");
    Ok(retrieved.len())
}

async fn dense_with_deadline(
    pool: &SqlitePool,
    vector: &[f32],
    limit: usize,
    deadline: Duration,
    variant: usize,
) -> Vec<DenseHit> {
    match tokio::time::timeout(deadline, dense_search(pool, vector, limit)).await {
        Ok(Ok(hits)) => hits,
        Ok(Err(e)) => {
            tracing::warn!(variant, error = %e, "dense search failed; treating as empty");
            Vec::new()
        }
        Err(_) => {
            tracing::warn!(variant, "dense search timed out; treating as empty");
            Vec::new()
        }
    }
}

async fn lexical_with_deadline(
    pool: &SqlitePool,
    text: &str,
    limit: usize,
    deadline: Duration,
    variant: usize,
) -> Vec<LexicalHit> {
    match tokio::time::timeout(deadline, lexical_search(pool, text, limit)).await {
        Ok(Ok(hits)) => hits,
        Ok(Err(e)) => {
            tracing::warn!(variant, error = %e, "lexical search failed; treating as empty");
            Vec::new()
        }
        Err(_) => {
            tracing::warn!(variant, "lexical search timed out; treating as empty");
            Vec::new()
        }
    }
}

/// Collapse several scored lists into one ranked id list, keeping each
/// chunk's maximum score. Order: descending pooled score, ties by
/// ascending chunk id.
fn max_pool(lists: Vec<Vec<(String, f64)>>) -> Vec<String> {
    let mut pooled: HashMap<String, f64> = HashMap::new();
    for list in lists {
        for (chunk_id, score) in list {
            pooled
                .entry(chunk_id)
                .and_modify(|existing| *existing = existing.max(score))
                .or_insert(score);
        }
    }

    let mut entries: Vec<(String, f64)> = pooled.into_iter().collect();
    entries.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    entries.into_iter().map(|(chunk_id, _)| chunk_id).collect()
}

/// Rerank the fused candidates, falling back to RRF ordering (with boosts
/// still applied) when the model is missing or fails.
async fn rerank_fused(
    pool: &SqlitePool,
    rerank_model: Option<&dyn RerankModel>,
    query: &crate::models::Query,
    fused: &[FusedHit],
    retrieval: &RetrievalConfig,
) -> RagResult<Vec<RerankedChunk>> {
    let ids: Vec<String> = fused.iter().map(|f| f.chunk_id.clone()).collect();
    let chunks = store::get_chunks(pool, &ids).await?;

    // Preserve fused order; chunks that vanished between fusion and load
    // are dropped (the gateway omits missing ids).
    let mut candidates = Vec::with_capacity(fused.len());
    let mut rrf_scores = Vec::with_capacity(fused.len());
    for hit in fused {
        if let Some(chunk) = chunks.get(&hit.chunk_id) {
            candidates.push(RerankCandidate {
                chunk_id: chunk.id.clone(),
                text: chunk.content.clone(),
                level: chunk.level,
            });
            rrf_scores.push(hit.rrf_score);
        } else {
            tracing::warn!(chunk_id = %hit.chunk_id, "fused chunk no longer present; skipping");
        }
    }

    if let Some(model) = rerank_model {
        match rerank::rerank(
            model,
            &query.original_query,
            &candidates,
            &query.entities,
            query.intent,
            retrieval,
        )
        .await
        {
            Ok(reranked) => return Ok(reranked),
            Err(e) => {
                tracing::warn!(error = %e, "reranker unavailable; falling back to RRF order");
            }
        }
    }

    Ok(rerank::finalize(
        &candidates,
        &rrf_scores,
        &query.entities,
        query.intent,
        retrieval,
    ))
}

/// Join reranked scores with chunk rows and fused RRF scores into the
/// persisted record shape.
async fn to_retrieved_chunks(
    pool: &SqlitePool,
    fused: &[FusedHit],
    reranked: &[RerankedChunk],
) -> RagResult<Vec<RetrievedChunk>> {
    let rrf_by_id: HashMap<&str, f64> = fused
        .iter()
        .map(|f| (f.chunk_id.as_str(), f.rrf_score))
        .collect();

    let ids: Vec<String> = reranked.iter().map(|r| r.chunk_id.clone()).collect();
    let chunks = store::get_chunks(pool, &ids).await?;

    let mut out = Vec::with_capacity(reranked.len());
    for item in reranked {
        let Some(chunk) = chunks.get(&item.chunk_id) else {
            continue;
        };
        out.push(RetrievedChunk {
            chunk_id: chunk.id.clone(),
            work_id: chunk.work_id.clone(),
            parent_id: chunk.parent_id.clone(),
            content: chunk.content.clone(),
            heading_breadcrumbs: chunk.heading_breadcrumbs.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            level: chunk.level,
            rrf_score: rrf_by_id.get(item.chunk_id.as_str()).copied().unwrap_or(0.0),
            rerank_score: item.rerank_score,
            entity_boost: item.entity_boost,
            final_score: item.final_score,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Intent, Level};

    #[test]
    fn test_max_pool_takes_maximum_per_chunk() {
        let pooled = max_pool(vec![
            vec![("c1".into(), 0.9), ("c2".into(), 0.7)],
            vec![("c2".into(), 0.8), ("c3".into(), 0.5)],
        ]);
        assert_eq!(pooled, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_max_pool_tie_breaks_by_id() {
        let pooled = max_pool(vec![vec![("b".into(), 0.5), ("a".into(), 0.5)]]);
        assert_eq!(pooled, vec!["a", "b"]);
    }

    #[test]
    fn test_max_pool_empty() {
        assert!(max_pool(vec![]).is_empty());
        assert!(max_pool(vec![vec![]]).is_empty());
    }

    /// The seed definition scenario at the fusion/rerank level: dense
    /// {1:0.9, 2:0.7}, lexical {3:12.0, 1:8.0}, reranker final scores
    /// {1:0.95, 3:0.60, 2:0.30} produce the order [1, 3, 2].
    #[test]
    fn test_definition_scenario_ordering() {
        let pooled_dense = max_pool(vec![vec![("1".into(), 0.9), ("2".into(), 0.7)]]);
        let pooled_lexical = max_pool(vec![vec![("3".into(), 12.0), ("1".into(), 8.0)]]);
        assert_eq!(pooled_dense, vec!["1", "2"]);
        assert_eq!(pooled_lexical, vec!["3", "1"]);

        let fused = reciprocal_rank_fusion(&[pooled_dense, pooled_lexical], 60, 30);
        let fused_order: Vec<&str> = fused.iter().map(|f| f.chunk_id.as_str()).collect();
        assert_eq!(fused_order, vec!["1", "3", "2"]);

        let candidates: Vec<RerankCandidate> = fused
            .iter()
            .map(|f| RerankCandidate {
                chunk_id: f.chunk_id.clone(),
                text: String::new(),
                level: Level::Chunk,
            })
            .collect();
        let base = [0.95, 0.60, 0.30];
        let reranked = rerank::finalize(
            &candidates,
            &base,
            &[],
            Intent::Unknown,
            &RetrievalConfig::default(),
        );
        let order: Vec<&str> = reranked.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["1", "3", "2"]);
    }
}
