//! Prompt augmentation and answering.
//!
//! The prompt builder formats the top consolidated groups as numbered
//! `[S#]` context blocks and fills the `rag_augmentation` template; it is a
//! pure function of the query record and `top_n` and never calls the
//! model. The answerer invokes the generative model on the built prompt
//! and persists the response as a result row.
//!
//! When a query has no consolidated context yet, the builder falls back to
//! the raw retrieved chunks, treating each as a singleton group (score =
//! final score, stored content, heading chain from stored breadcrumbs).

use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::config::{GenerationConfig, RetrievalConfig};
use crate::error::RagResult;
use crate::generation::{GenerationRequest, GenerativeProvider};
use crate::models::{ConsolidatedGroup, Query, ResultRecord};
use crate::query_store;
use crate::store;
use crate::templates;

/// A built prompt and the number of context blocks it contains.
#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub prompt: String,
    pub context_count: usize,
}

/// Build the augmentation prompt for a query. Does not invoke the model.
pub async fn build_prompt(
    pool: &SqlitePool,
    base_retrieval: &RetrievalConfig,
    query_id: &str,
    top_n: Option<usize>,
) -> RagResult<BuiltPrompt> {
    let retrieval = crate::config::retrieval_preset(pool, base_retrieval).await;
    let query = query_store::get_query(pool, query_id).await?;
    query_store::ensure_consolidatable(&query)?;

    let top_n = top_n.unwrap_or(retrieval.top_n);
    let groups = select_groups(&query, top_n);

    // Resolve work titles once per distinct work.
    let mut titles: HashMap<String, String> = HashMap::new();
    for group in &groups {
        if !titles.contains_key(&group.work_id) {
            let title = match store::get_work(pool, &group.work_id).await {
                Ok(work) => work.title,
                Err(e) => {
                    tracing::warn!(work_id = %group.work_id, error = %e, "work lookup failed");
                    "(unknown work)".to_string()
                }
            };
            titles.insert(group.work_id.clone(), title);
        }
    }

    let context_blocks = format_context_blocks(&groups, &titles);
    let entities_str = if query.entities.is_empty() {
        "(none)".to_string()
    } else {
        query.entities.join(", ")
    };

    let template = templates::resolve(pool, templates::TAG_RAG_AUGMENTATION).await?;
    let prompt = templates::fill(
        &template,
        &[
            ("query", query.original_query.as_str()),
            ("contexts", context_blocks.as_str()),
            ("intent", query.intent.as_str()),
            ("entities_str", entities_str.as_str()),
        ],
    )?;

    Ok(BuiltPrompt {
        prompt,
        context_count: groups.len(),
    })
}

/// Build the prompt, invoke the model, and persist the answer.
pub async fn run_answer(
    pool: &SqlitePool,
    generator: &dyn GenerativeProvider,
    generation: &GenerationConfig,
    base_retrieval: &RetrievalConfig,
    query_id: &str,
    top_n: Option<usize>,
    use_full_model: bool,
) -> RagResult<ResultRecord> {
    let query = query_store::get_query(pool, query_id).await?;
    query_store::ensure_answerable(&query)?;

    let built = build_prompt(pool, base_retrieval, query_id, top_n).await?;

    let request = GenerationRequest::new(built.prompt.as_str())
        .with_temperature(generation.temperature)
        .with_full_model(use_full_model);
    let response = generator.generate(&request).await?;

    let record = query_store::insert_result(pool, query_id, &response).await?;
    tracing::info!(query_id, result_id = %record.id, "answer persisted");
    Ok(record)
}

/// Persist an externally produced answer without calling the model.
pub async fn run_manual_answer(
    pool: &SqlitePool,
    query_id: &str,
    response_text: &str,
) -> RagResult<ResultRecord> {
    let query = query_store::get_query(pool, query_id).await?;
    query_store::ensure_answerable(&query)?;

    query_store::insert_result(pool, query_id, response_text).await
}

/// Consolidated groups when available, else retrieved chunks as singleton
/// groups, truncated to `top_n` in their stored order.
fn select_groups(query: &Query, top_n: usize) -> Vec<ConsolidatedGroup> {
    let groups: Vec<ConsolidatedGroup> = if !query.clean_retrieval_context.is_empty() {
        query.clean_retrieval_context.clone()
    } else {
        query
            .retrieved_context
            .iter()
            .map(|r| ConsolidatedGroup {
                chunk_ids: vec![r.chunk_id.clone()],
                parent_id: r.parent_id.clone(),
                work_id: r.work_id.clone(),
                content: r.content.clone(),
                start_line: r.start_line,
                end_line: r.end_line,
                score: r.final_score,
                heading_chain: r
                    .heading_breadcrumbs
                    .as_deref()
                    .map(breadcrumbs_to_chain)
                    .unwrap_or_default(),
            })
            .collect()
    };

    groups.into_iter().take(top_n).collect()
}

fn breadcrumbs_to_chain(breadcrumbs: &str) -> Vec<String> {
    breadcrumbs
        .split('>')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Render the numbered `[S#]` context blocks, separated by blank lines.
fn format_context_blocks(
    groups: &[ConsolidatedGroup],
    titles: &HashMap<String, String>,
) -> String {
    let blocks: Vec<String> = groups
        .iter()
        .enumerate()
        .map(|(index, group)| {
            let title = titles
                .get(&group.work_id)
                .map(|t| t.as_str())
                .unwrap_or("(unknown work)");
            let first_line = first_non_blank_line(&group.content);
            let rest = body_after_first_line(&group.content);
            format!(
                "[S{}] Source: {} -- {} | (work_id={}, start_line={}, end_line={})\nText:\n{}",
                index + 1,
                title,
                first_line,
                group.work_id,
                group.start_line,
                group.end_line,
                rest
            )
        })
        .collect();

    blocks.join("\n\n")
}

/// First non-blank line of the content, trimmed.
fn first_non_blank_line(content: &str) -> String {
    content
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
        .unwrap_or_default()
}

/// Content with the first non-blank line (and one immediately following
/// blank line) removed, outer blank lines and trailing whitespace trimmed.
fn body_after_first_line(content: &str) -> String {
    let mut lines = content.lines();
    let mut rest: Vec<&str> = Vec::new();
    let mut skipped_first = false;

    for line in lines.by_ref() {
        if !skipped_first {
            if line.trim().is_empty() {
                continue;
            }
            skipped_first = true;
            continue;
        }
        rest.push(line);
    }

    // Drop one blank line that immediately followed the first line.
    if rest.first().is_some_and(|l| l.trim().is_empty()) {
        rest.remove(0);
    }

    let joined = rest.join("\n");
    joined.trim_matches('\n').trim_end().to_string()
}
