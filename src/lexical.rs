//! Lexical retrieval over chunk content.
//!
//! Uses the `chunks_fts` FTS5 index (porter-stemmed English analyzer) with
//! BM25 ranking. Breadcrumbs are stored outside the indexed column, so
//! structural heading terms never influence ranking. Eligibility matches
//! dense retrieval: a parent heading and `vector_status = 'vec'`.
//!
//! Free-form query text is rewritten into a sanitized OR-of-terms match
//! expression; FTS5 operator characters in user input therefore cannot
//! break the query.

use sqlx::{Row, SqlitePool};

use crate::error::RagResult;

/// One lexical search hit.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub chunk_id: String,
    /// BM25-derived relevance, higher is better.
    pub rank_score: f64,
}

/// Rank eligible chunks by BM25 relevance to `query_text`.
///
/// Results are ordered by descending rank score with ties broken by
/// ascending chunk id, at most `limit` hits. A query with no indexable
/// terms returns no hits.
pub async fn lexical_search(
    pool: &SqlitePool,
    query_text: &str,
    limit: usize,
) -> RagResult<Vec<LexicalHit>> {
    let match_expr = match fts_match_expr(query_text) {
        Some(expr) => expr,
        None => return Ok(Vec::new()),
    };

    // FTS5 rank is negative-better; negate into positive scores.
    let rows = sqlx::query(
        r#"
        SELECT chunks_fts.chunk_id AS chunk_id, chunks_fts.rank AS rank
        FROM chunks_fts
        JOIN chunks c ON c.id = chunks_fts.chunk_id
        WHERE chunks_fts MATCH ?
          AND c.parent_id IS NOT NULL
          AND c.vector_status = 'vec'
        ORDER BY chunks_fts.rank ASC, chunks_fts.chunk_id ASC
        LIMIT ?
        "#,
    )
    .bind(&match_expr)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let hits = rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            LexicalHit {
                chunk_id: row.get("chunk_id"),
                rank_score: -rank,
            }
        })
        .collect();

    Ok(hits)
}

/// Rewrite free text into a quoted OR-of-terms FTS5 match expression.
///
/// Each alphanumeric run becomes a quoted term, so punctuation and FTS5
/// operators (`"`, `-`, `*`, `NEAR`) in user input are neutralized.
/// Returns `None` when no terms remain.
fn fts_match_expr(query_text: &str) -> Option<String> {
    let terms: Vec<String> = query_text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}
