//! Dense retrieval over stored chunk embeddings.
//!
//! Performs a filtered scan over eligible chunk vectors and ranks them by
//! cosine similarity. Only chunks with a parent heading and a completed
//! vectorization (`vector_status = 'vec'`) are eligible.
//!
//! # Similarity convention
//!
//! Scores are cosine similarity with negatives clamped to zero, so the
//! range is `[0, 1]` and `1` means identical direction. The same convention
//! is used everywhere downstream (pooling, fusion, persisted scores).
//!
//! Note: this is a brute-force scan over eligible vectors. For larger
//! corpora, swap in an ANN index behind the same signature.

use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity};
use crate::error::{RagError, RagResult};

/// One dense search hit.
#[derive(Debug, Clone)]
pub struct DenseHit {
    pub chunk_id: String,
    /// Cosine-derived similarity in `[0, 1]`.
    pub similarity: f64,
}

/// Rank eligible chunks by similarity to `query_vector`.
///
/// Results are ordered by descending similarity with ties broken by
/// ascending chunk id, truncated to `limit`. A stored vector whose
/// dimension differs from the query's is a permanent error.
pub async fn dense_search(
    pool: &SqlitePool,
    query_vector: &[f32],
    limit: usize,
) -> RagResult<Vec<DenseHit>> {
    if query_vector.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        "SELECT id, embedding FROM chunks
         WHERE parent_id IS NOT NULL AND vector_status = 'vec' AND embedding IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;

    let mut hits = Vec::with_capacity(rows.len());
    for row in &rows {
        let chunk_id: String = row.get("id");
        let blob: Vec<u8> = row.get("embedding");
        let stored = blob_to_vec(&blob);

        if stored.len() != query_vector.len() {
            return Err(RagError::Permanent(format!(
                "vector dimension mismatch for chunk {}: stored {}, query {}",
                chunk_id,
                stored.len(),
                query_vector.len()
            )));
        }

        let similarity = f64::from(cosine_similarity(query_vector, &stored)).max(0.0);
        hits.push(DenseHit {
            chunk_id,
            similarity,
        });
    }

    Ok(rank_hits(hits, limit))
}

/// Order hits by descending similarity, ties by ascending chunk id, and
/// truncate to `limit`.
fn rank_hits(mut hits: Vec<DenseHit>, limit: usize) -> Vec<DenseHit> {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(limit);
    hits
}
