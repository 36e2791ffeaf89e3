//! Reciprocal Rank Fusion.
//!
//! Combines multiple ranked candidate lists into one:
//!
//! ```text
//! rrf_score(c) = Σ_i  1 / (k + rank_i(c))
//! ```
//!
//! where `rank_i(c)` is c's 1-based position in list i (absent lists
//! contribute nothing). Ties are broken by the number of lists containing
//! the candidate (more is better), then by ascending chunk id, so the
//! fused order is a total order independent of input list arrangement.

use std::collections::HashMap;

/// One fused candidate.
#[derive(Debug, Clone)]
pub struct FusedHit {
    pub chunk_id: String,
    pub rrf_score: f64,
    /// How many input lists contained this candidate.
    pub list_count: usize,
}

/// Fuse ranked lists of chunk ids, keeping the top `k_fuse`.
///
/// `k` is the RRF rank constant (60 in the original formulation).
pub fn reciprocal_rank_fusion(lists: &[Vec<String>], k: u32, k_fuse: usize) -> Vec<FusedHit> {
    let mut scores: HashMap<&str, (f64, usize)> = HashMap::new();

    for list in lists {
        for (rank0, chunk_id) in list.iter().enumerate() {
            let contribution = 1.0 / f64::from(k + rank0 as u32 + 1);
            let entry = scores.entry(chunk_id.as_str()).or_insert((0.0, 0));
            entry.0 += contribution;
            entry.1 += 1;
        }
    }

    let mut fused: Vec<FusedHit> = scores
        .into_iter()
        .map(|(chunk_id, (rrf_score, list_count))| FusedHit {
            chunk_id: chunk_id.to_string(),
            rrf_score,
            list_count,
        })
        .collect();

    fused.sort_by(fused_order);
    fused.truncate(k_fuse);

    fused
}

/// Total order of fused hits: descending score, then descending list
/// count, then ascending chunk id.
fn fused_order(a: &FusedHit, b: &FusedHit) -> std::cmp::Ordering {
    b.rrf_score
        .partial_cmp(&a.rrf_score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| b.list_count.cmp(&a.list_count))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}
