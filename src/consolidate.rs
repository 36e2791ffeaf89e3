//! Context consolidation.
//!
//! Shrinks `retrieved_context` into a smaller, cleaner evidence set:
//!
//! 1. Retrieved chunks are bucketed by (work, parent heading).
//! 2. Buckets are processed bottom-up, deepest parent first. A bucket
//!    whose children cover at least half of the parent's line span is
//!    replaced by the parent itself, which then competes as a child in its
//!    own parent's bucket (promotion can cascade to a grandparent).
//! 3. Buckets below the coverage bar are swept in ascending line order and
//!    coalesced into runs of adjacent chunks (gap of at most
//!    `gap_threshold` lines).
//! 4. Every group's content is re-read from the work's sanitized file over
//!    the group's line span; a heading line opening the stored chunks is
//!    prepended so prompts keep the section title. A stale or missing
//!    sanitized file downgrades the group to its stored chunk contents and
//!    flags a warning instead of failing the stage.
//! 5. Heading chains are recomputed from parent walks; breadcrumbs stored
//!    at chunk creation time are deliberately ignored (older corpora carry
//!    them inline in content, newer ones in a column).
//! 6. Undersized groups are dropped, survivors sorted by descending score
//!    (ties by work and start line) and persisted as
//!    `clean_retrieval_context`.

use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};

use crate::config::RetrievalConfig;
use crate::error::{RagError, RagResult};
use crate::models::{Chunk, ConsolidatedGroup};
use crate::query_store;
use crate::store;

/// Upper bound on parent-walk depth; the hierarchy is a shallow tree and
/// anything deeper indicates corrupt parent pointers.
const MAX_WALK: usize = 32;

/// Outcome of one consolidation run.
#[derive(Debug, Clone)]
pub struct ConsolidateOutcome {
    pub original_count: usize,
    pub consolidated_count: usize,
    /// True when at least one group fell back to stored content because
    /// its sanitized file was missing or changed.
    pub stale_warning: bool,
}

/// One unit moving through consolidation: a retrieved chunk, or a parent
/// standing in for its children after promotion.
#[derive(Debug, Clone)]
struct Node {
    chunk_id: String,
    work_id: String,
    parent_id: Option<String>,
    start_line: i64,
    end_line: i64,
    score: f64,
    content: String,
    promoted: bool,
}

/// Run the consolidation stage for a query.
pub async fn run_consolidate(
    pool: &SqlitePool,
    base_retrieval: &RetrievalConfig,
    query_id: &str,
) -> RagResult<ConsolidateOutcome> {
    let retrieval = crate::config::retrieval_preset(pool, base_retrieval).await;

    let query = query_store::get_query(pool, query_id).await?;
    query_store::ensure_consolidatable(&query)?;

    let nodes: Vec<Node> = query
        .retrieved_context
        .iter()
        .map(|r| Node {
            chunk_id: r.chunk_id.clone(),
            work_id: r.work_id.clone(),
            parent_id: r.parent_id.clone(),
            start_line: r.start_line,
            end_line: r.end_line,
            score: r.final_score,
            content: r.content.clone(),
            promoted: false,
        })
        .collect();
    let original_count = nodes.len();

    let ancestors = load_ancestors(pool, &nodes).await?;
    let proto_groups = build_groups(nodes, &ancestors, &retrieval);

    let mut stale_warning = false;
    let mut groups: Vec<ConsolidatedGroup> = Vec::new();

    for proto in proto_groups {
        let (content, stale) = enrich(pool, &proto).await?;
        stale_warning |= stale;

        if content.chars().count() < retrieval.min_content_chars {
            continue;
        }
        // Parent replacements cover their parent by construction; only
        // merge groups are subject to the (default-off) coverage floor.
        if !proto.is_parent {
            if let Some(parent) = proto.parent_id.as_ref().and_then(|id| ancestors.get(id)) {
                let span = (proto.end_line.min(parent.end_line)
                    - proto.start_line.max(parent.start_line)
                    + 1)
                .max(0);
                let coverage = span as f64 / parent.span().max(1) as f64;
                if coverage < retrieval.coverage_floor {
                    continue;
                }
            }
        }

        let heading_chain = heading_chain(&proto, &ancestors);
        groups.push(ConsolidatedGroup {
            chunk_ids: proto.chunk_ids,
            parent_id: proto.parent_id,
            work_id: proto.work_id,
            content,
            start_line: proto.start_line,
            end_line: proto.end_line,
            score: proto.score,
            heading_chain,
        });
    }

    groups.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.work_id.cmp(&b.work_id))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });

    query_store::save_consolidated(pool, query_id, &groups).await?;
    tracing::info!(
        query_id,
        original = original_count,
        consolidated = groups.len(),
        stale_warning,
        "consolidation persisted"
    );

    Ok(ConsolidateOutcome {
        original_count,
        consolidated_count: groups.len(),
        stale_warning,
    })
}

/// A group before enrichment.
#[derive(Debug, Clone)]
struct ProtoGroup {
    chunk_ids: Vec<String>,
    parent_id: Option<String>,
    work_id: String,
    start_line: i64,
    end_line: i64,
    score: f64,
    /// Stored contents of the members in run order; the enrichment
    /// fallback and the heading-prepend rule read these.
    stored_contents: Vec<String>,
    /// Parent replacement: `chunk_ids` is exactly the parent id.
    is_parent: bool,
}

/// Fetch the transitive closure of parent chunks for all nodes: one
/// parent-resolution pass for the retrieved chunks, then plain id fetches
/// walking upward until the roots.
async fn load_ancestors(
    pool: &SqlitePool,
    nodes: &[Node],
) -> RagResult<HashMap<String, Chunk>> {
    let child_ids: Vec<String> = nodes.iter().map(|n| n.chunk_id.clone()).collect();
    let parents = store::get_parent_chunks(pool, &child_ids).await?;

    let mut ancestors: HashMap<String, Chunk> = HashMap::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut frontier: Vec<String> = Vec::new();

    for parent in parents.into_values() {
        seen.insert(parent.id.clone());
        if let Some(grandparent_id) = &parent.parent_id {
            if seen.insert(grandparent_id.clone()) {
                frontier.push(grandparent_id.clone());
            }
        }
        ancestors.insert(parent.id.clone(), parent);
    }
    frontier.sort();

    for _ in 0..MAX_WALK {
        if frontier.is_empty() {
            break;
        }
        let fetched = store::get_chunks(pool, &frontier).await?;
        let mut next: Vec<String> = Vec::new();
        for (id, chunk) in fetched {
            if let Some(parent_id) = &chunk.parent_id {
                if seen.insert(parent_id.clone()) {
                    next.push(parent_id.clone());
                }
            }
            ancestors.insert(id, chunk);
        }
        next.sort();
        frontier = next;
    }

    Ok(ancestors)
}

/// Depth of a chunk below its root (root headings have depth 0).
fn depth_of(chunk_id: &str, ancestors: &HashMap<String, Chunk>) -> usize {
    let mut depth = 0;
    let mut current = ancestors.get(chunk_id).and_then(|c| c.parent_id.as_deref());
    while let Some(parent_id) = current {
        depth += 1;
        if depth >= MAX_WALK {
            break;
        }
        current = ancestors.get(parent_id).and_then(|c| c.parent_id.as_deref());
    }
    depth
}

/// Bottom-up grouping: promote buckets meeting the coverage bar, merge the
/// rest into adjacent runs. Deterministic: buckets process in key order,
/// children in ascending start line.
fn build_groups(
    nodes: Vec<Node>,
    ancestors: &HashMap<String, Chunk>,
    retrieval: &RetrievalConfig,
) -> Vec<ProtoGroup> {
    let mut groups: Vec<ProtoGroup> = Vec::new();
    let mut pending = nodes;

    let max_depth = pending
        .iter()
        .filter_map(|n| n.parent_id.as_deref())
        .map(|p| depth_of(p, ancestors))
        .max();

    let Some(max_depth) = max_depth else {
        // Nothing has a parent: a flat merge pass is all there is.
        groups.extend(merge_buckets(pending, retrieval.gap_threshold));
        return groups;
    };

    for depth in (0..=max_depth).rev() {
        let (current, rest): (Vec<Node>, Vec<Node>) = pending.into_iter().partition(|n| {
            n.parent_id
                .as_deref()
                .map(|p| depth_of(p, ancestors) == depth)
                .unwrap_or(false)
        });
        pending = rest;

        for bucket in bucket_nodes(current) {
            let parent = bucket
                .nodes
                .first()
                .and_then(|n| n.parent_id.as_deref())
                .and_then(|p| ancestors.get(p));

            match parent {
                Some(parent) if coverage_of(&bucket.nodes, parent) >= retrieval.coverage_threshold => {
                    let score = bucket
                        .nodes
                        .iter()
                        .map(|n| n.score)
                        .fold(f64::NEG_INFINITY, f64::max);
                    // The parent replaces its children and competes one
                    // level up (or finalizes if it is itself top-level).
                    pending.push(Node {
                        chunk_id: parent.id.clone(),
                        work_id: parent.work_id.clone(),
                        parent_id: parent.parent_id.clone(),
                        start_line: parent.start_line,
                        end_line: parent.end_line,
                        score,
                        content: parent.content.clone(),
                        promoted: true,
                    });
                }
                _ => {
                    groups.extend(merge_adjacent(bucket, retrieval.gap_threshold));
                }
            }
        }

        // Deduplicate: a promoted parent can coincide with a directly
        // retrieved heading chunk. Keep one node with the max score.
        pending = dedup_nodes(pending);
    }

    // Whatever remains has no parent bucket left to promote into.
    groups.extend(merge_buckets(pending, retrieval.gap_threshold));
    groups
}

struct Bucket {
    nodes: Vec<Node>,
}

/// Group nodes by (work, parent), deterministic bucket order.
fn bucket_nodes(nodes: Vec<Node>) -> Vec<Bucket> {
    let mut by_key: HashMap<(String, Option<String>), Vec<Node>> = HashMap::new();
    for node in nodes {
        by_key
            .entry((node.work_id.clone(), node.parent_id.clone()))
            .or_default()
            .push(node);
    }

    let mut keys: Vec<(String, Option<String>)> = by_key.keys().cloned().collect();
    keys.sort();

    keys.into_iter()
        .map(|key| {
            let mut nodes = by_key.remove(&key).unwrap_or_default();
            nodes.sort_by(|a, b| {
                a.start_line
                    .cmp(&b.start_line)
                    .then_with(|| a.chunk_id.cmp(&b.chunk_id))
            });
            Bucket { nodes }
        })
        .collect()
}

fn merge_buckets(nodes: Vec<Node>, gap_threshold: i64) -> Vec<ProtoGroup> {
    bucket_nodes(nodes)
        .into_iter()
        .flat_map(|bucket| merge_adjacent(bucket, gap_threshold))
        .collect()
}

fn dedup_nodes(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::new();
    for node in nodes {
        if let Some(existing) = out.iter_mut().find(|n| n.chunk_id == node.chunk_id) {
            existing.score = existing.score.max(node.score);
            existing.promoted |= node.promoted;
        } else {
            out.push(node);
        }
    }
    out
}

/// Fraction of the parent's line span covered by the children, overlaps
/// counted once and everything clipped to the parent's own range.
fn coverage_of(children: &[Node], parent: &Chunk) -> f64 {
    let mut intervals: Vec<(i64, i64)> = children
        .iter()
        .map(|c| {
            (
                c.start_line.max(parent.start_line),
                c.end_line.min(parent.end_line),
            )
        })
        .filter(|(start, end)| start <= end)
        .collect();
    intervals.sort();

    let mut covered = 0i64;
    let mut cursor = i64::MIN;
    for (start, end) in intervals {
        let start = start.max(cursor);
        if end >= start {
            covered += end - start + 1;
            cursor = end + 1;
        }
    }

    covered as f64 / parent.span().max(1) as f64
}

/// Sweep a bucket in line order, coalescing runs whose gap is at most
/// `gap_threshold`. A run consisting of a single promoted parent yields a
/// parent-replacement group (its own id doubles as the group's parent id).
fn merge_adjacent(bucket: Bucket, gap_threshold: i64) -> Vec<ProtoGroup> {
    let mut groups: Vec<ProtoGroup> = Vec::new();
    let mut run: Vec<Node> = Vec::new();

    let flush = |run: &mut Vec<Node>, groups: &mut Vec<ProtoGroup>| {
        if run.is_empty() {
            return;
        }
        let is_parent = run.len() == 1 && run[0].promoted;
        let parent_id = if is_parent {
            Some(run[0].chunk_id.clone())
        } else {
            run[0].parent_id.clone()
        };
        groups.push(ProtoGroup {
            chunk_ids: run.iter().map(|n| n.chunk_id.clone()).collect(),
            parent_id,
            work_id: run[0].work_id.clone(),
            start_line: run.iter().map(|n| n.start_line).min().unwrap_or(0),
            end_line: run.iter().map(|n| n.end_line).max().unwrap_or(0),
            score: run
                .iter()
                .map(|n| n.score)
                .fold(f64::NEG_INFINITY, f64::max),
            stored_contents: run.iter().map(|n| n.content.clone()).collect(),
            is_parent,
        });
        run.clear();
    };

    for node in bucket.nodes {
        match run.last() {
            Some(_) => {
                let run_end = run.iter().map(|n| n.end_line).max().unwrap_or(0);
                let gap = node.start_line - run_end;
                if (0..=gap_threshold).contains(&gap) {
                    run.push(node);
                } else {
                    flush(&mut run, &mut groups);
                    run.push(node);
                }
            }
            None => run.push(node),
        }
    }
    flush(&mut run, &mut groups);

    groups
}

/// Re-read the group's span from the sanitized file, keeping the opening
/// heading line of the stored chunks visible. On a stale source the stored
/// contents are concatenated instead and the stale flag is set.
async fn enrich(pool: &SqlitePool, proto: &ProtoGroup) -> RagResult<(String, bool)> {
    let slice = store::read_sanitized_slice(
        pool,
        &proto.work_id,
        proto.start_line,
        proto.end_line,
    )
    .await;

    match slice {
        Ok(slice) => {
            let content = match leading_heading(&proto.stored_contents) {
                Some(heading) if !slice.starts_with(&heading) => {
                    format!("{}\n\n{}", heading, slice)
                }
                _ => slice,
            };
            Ok((content, false))
        }
        Err(RagError::StaleSource { work_id, reason }) => {
            tracing::warn!(work_id, reason, "sanitized file stale; using stored chunk content");
            Ok((proto.stored_contents.join("\n\n"), true))
        }
        Err(other) => Err(other),
    }
}

/// The first non-blank line of the stored chunk contents, if it is a
/// markdown heading.
fn leading_heading(stored_contents: &[String]) -> Option<String> {
    let first = stored_contents.first()?;
    let line = first.lines().find(|l| !l.trim().is_empty())?;
    if line.trim_start().starts_with('#') {
        Some(line.trim_end().to_string())
    } else {
        None
    }
}

/// Root-first ancestor heading titles, starting at the group's nearest
/// heading (the replaced parent for parent groups) and walking up.
fn heading_chain(proto: &ProtoGroup, ancestors: &HashMap<String, Chunk>) -> Vec<String> {
    let mut chain: Vec<String> = Vec::new();
    let mut current = proto.parent_id.as_deref();
    let mut steps = 0;

    while let Some(id) = current {
        let Some(chunk) = ancestors.get(id) else {
            break;
        };
        chain.push(chunk.heading_title());
        steps += 1;
        if steps >= MAX_WALK {
            break;
        }
        current = chunk.parent_id.as_deref();
    }

    chain.reverse();
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Level, VectorStatus};

    fn node(id: &str, parent: Option<&str>, start: i64, end: i64, score: f64) -> Node {
        Node {
            chunk_id: id.to_string(),
            work_id: "w1".to_string(),
            parent_id: parent.map(|p| p.to_string()),
            start_line: start,
            end_line: end,
            score,
            content: format!("content of {}", id),
            promoted: false,
        }
    }

    fn heading(id: &str, parent: Option<&str>, start: i64, end: i64, level: Level) -> Chunk {
        Chunk {
            id: id.to_string(),
            work_id: "w1".to_string(),
            parent_id: parent.map(|p| p.to_string()),
            level,
            content: format!("# Heading {}", id),
            heading_breadcrumbs: None,
            start_line: start,
            end_line: end,
            vector_status: VectorStatus::Vec,
            embedding: None,
        }
    }

    fn cfg() -> RetrievalConfig {
        RetrievalConfig::default()
    }

    #[test]
    fn test_coverage_exact_half_promotes() {
        let parent = heading("p", None, 1, 100, Level::H1);
        // 50 of 100 lines covered: exactly the bar.
        let children = vec![node("a", Some("p"), 1, 50, 0.9)];
        assert!((coverage_of(&children, &parent) - 0.5).abs() < 1e-12);

        let mut ancestors = HashMap::new();
        ancestors.insert("p".to_string(), parent);
        let groups = build_groups(children, &ancestors, &cfg());
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_parent);
        assert_eq!(groups[0].chunk_ids, vec!["p"]);
        assert_eq!(groups[0].parent_id.as_deref(), Some("p"));
    }

    #[test]
    fn test_coverage_just_under_half_merges() {
        let parent = heading("p", None, 1, 100, Level::H1);
        let children = vec![node("a", Some("p"), 1, 49, 0.9)];
        assert!(coverage_of(&children, &parent) < 0.5);

        let mut ancestors = HashMap::new();
        ancestors.insert("p".to_string(), parent);
        let groups = build_groups(children, &ancestors, &cfg());
        assert_eq!(groups.len(), 1);
        assert!(!groups[0].is_parent);
        assert_eq!(groups[0].chunk_ids, vec!["a"]);
    }

    #[test]
    fn test_coverage_overlaps_count_once() {
        let parent = heading("p", None, 1, 100, Level::H1);
        let children = vec![
            node("a", Some("p"), 1, 30, 0.9),
            node("b", Some("p"), 20, 40, 0.8),
        ];
        // Union is lines 1..=40, not 30+21.
        assert!((coverage_of(&children, &parent) - 0.40).abs() < 1e-12);
    }

    #[test]
    fn test_adjacency_gap_seven_merges_eight_does_not() {
        let ancestors = HashMap::new();

        // A ends at 20, B starts at 27: gap 7, merge.
        let groups = build_groups(
            vec![
                node("a", None, 10, 20, 0.9),
                node("b", None, 27, 35, 0.6),
            ],
            &ancestors,
            &cfg(),
        );
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].chunk_ids, vec!["a", "b"]);
        assert_eq!(groups[0].start_line, 10);
        assert_eq!(groups[0].end_line, 35);
        assert!((groups[0].score - 0.9).abs() < 1e-12);

        // Gap 8: two groups.
        let groups = build_groups(
            vec![
                node("a", None, 10, 20, 0.9),
                node("b", None, 28, 35, 0.6),
            ],
            &ancestors,
            &cfg(),
        );
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_parent_replacement_scenario() {
        // Parent spans 100..=200; children cover 100-160, 165-180,
        // 185-200: comfortably past the coverage bar.
        let parent = heading("p", None, 100, 200, Level::H2);
        let children = vec![
            node("a", Some("p"), 100, 160, 0.7),
            node("b", Some("p"), 165, 180, 0.9),
            node("c", Some("p"), 185, 200, 0.5),
        ];
        assert!(coverage_of(&children, &parent) >= 0.5);

        let mut ancestors = HashMap::new();
        ancestors.insert("p".to_string(), parent);
        let groups = build_groups(children, &ancestors, &cfg());
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_parent);
        assert_eq!(groups[0].chunk_ids, vec!["p"]);
        // Parent-replacement score is the best child's score.
        assert!((groups[0].score - 0.9).abs() < 1e-12);
        assert_eq!(groups[0].start_line, 100);
        assert_eq!(groups[0].end_line, 200);
    }

    #[test]
    fn test_promotion_cascades_to_grandparent() {
        // child covers parent (depth 1), promoted parent then covers the
        // grandparent (depth 0), ending as a grandparent replacement.
        let grandparent = heading("g", None, 1, 100, Level::H1);
        let parent = heading("p", Some("g"), 1, 90, Level::H2);
        let children = vec![node("a", Some("p"), 1, 60, 0.8)];

        let mut ancestors = HashMap::new();
        ancestors.insert("g".to_string(), grandparent);
        ancestors.insert("p".to_string(), parent);

        let groups = build_groups(children, &ancestors, &cfg());
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_parent);
        assert_eq!(groups[0].chunk_ids, vec!["g"]);
    }

    #[test]
    fn test_promotion_stops_below_grandparent_bar() {
        // Parent replaced, but the parent covers too little of the
        // grandparent to cascade: the promoted parent finalizes alone.
        let grandparent = heading("g", None, 1, 200, Level::H1);
        let parent = heading("p", Some("g"), 1, 60, Level::H2);
        let children = vec![node("a", Some("p"), 1, 40, 0.8)];

        let mut ancestors = HashMap::new();
        ancestors.insert("g".to_string(), grandparent);
        ancestors.insert("p".to_string(), parent);

        let groups = build_groups(children, &ancestors, &cfg());
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_parent);
        assert_eq!(groups[0].chunk_ids, vec!["p"]);
        assert_eq!(groups[0].parent_id.as_deref(), Some("p"));
    }

    #[test]
    fn test_separate_buckets_stay_separate() {
        let p1 = heading("p1", None, 1, 100, Level::H2);
        let p2 = heading("p2", None, 101, 200, Level::H2);
        let mut ancestors = HashMap::new();
        ancestors.insert("p1".to_string(), p1);
        ancestors.insert("p2".to_string(), p2);

        // Adjacent line ranges but different parents: no merge across
        // buckets.
        let groups = build_groups(
            vec![
                node("a", Some("p1"), 95, 100, 0.9),
                node("b", Some("p2"), 101, 105, 0.8),
            ],
            &ancestors,
            &cfg(),
        );
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_leading_heading_detection() {
        assert_eq!(
            leading_heading(&["## Section Title\nBody text".to_string()]),
            Some("## Section Title".to_string())
        );
        assert_eq!(leading_heading(&["Plain text".to_string()]), None);
        assert_eq!(leading_heading(&[]), None);
    }

    #[test]
    fn test_heading_chain_walks_to_root() {
        let root = heading("r", None, 1, 300, Level::H1);
        let mid = heading("m", Some("r"), 10, 100, Level::H2);
        let mut ancestors = HashMap::new();
        ancestors.insert("r".to_string(), root);
        ancestors.insert("m".to_string(), mid);

        let proto = ProtoGroup {
            chunk_ids: vec!["a".to_string()],
            parent_id: Some("m".to_string()),
            work_id: "w1".to_string(),
            start_line: 20,
            end_line: 30,
            score: 0.5,
            stored_contents: vec![],
            is_parent: false,
        };
        assert_eq!(
            heading_chain(&proto, &ancestors),
            vec!["Heading r", "Heading m"]
        );
    }
}
