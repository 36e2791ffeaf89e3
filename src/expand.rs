//! Query expansion.
//!
//! Turns a raw question into a `Query` record enriched with multi-query
//! paraphrases, a hypothetical (HyDE) answer, an intent label, and a list
//! of key entities, by prompting the generative model with the
//! `query_expansion` template.
//!
//! Model output is loosely structured, so two parsers share one output
//! shape ([`ParsedExpansion`]): a JSON-framed parser (object body, fenced
//! or bare) and a labeled-section parser (`EXPANDED:` / `HYDE:` /
//! `INTENT:` / `ENTITIES:` blocks). A first parse failure triggers one
//! temperature-0 reattempt; a second failure still creates the query, with
//! empty derived fields and a parse warning, so the pipeline can continue
//! on the original question alone.

use regex::Regex;
use sqlx::SqlitePool;

use crate::config::GenerationConfig;
use crate::error::{RagError, RagResult};
use crate::generation::{GenerationRequest, GenerativeProvider};
use crate::models::{Intent, Query};
use crate::query_store;
use crate::templates;

/// Common output of both expansion parsers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedExpansion {
    pub expanded: Vec<String>,
    pub hyde: String,
    pub intent: Intent,
    pub entities: Vec<String>,
    pub warnings: Vec<String>,
}

/// Run the expander: prompt the model, parse, persist a new query.
///
/// Returns the created query; `parse_warning` is set when both the initial
/// response and the temperature-0 reattempt failed to parse.
pub async fn run_expansion(
    pool: &SqlitePool,
    generator: &dyn GenerativeProvider,
    generation: &GenerationConfig,
    original_query: &str,
    use_full_model: bool,
) -> RagResult<Query> {
    if original_query.trim().is_empty() {
        return Err(RagError::precondition("original_query is non-empty"));
    }

    let template = templates::resolve(pool, templates::TAG_QUERY_EXPANSION).await?;
    let prompt = templates::fill(&template, &[("query", original_query)])?;

    let request = GenerationRequest::new(prompt.as_str())
        .with_temperature(generation.temperature)
        .with_full_model(use_full_model);

    let response = generator.generate(&request).await?;
    let parsed = match parse_expansion(&response) {
        Ok(parsed) => Some(parsed),
        Err(first_err) => {
            tracing::warn!(error = %first_err, "expansion parse failed, retrying at temperature 0");
            let retry_request = GenerationRequest::new(prompt.as_str())
                .with_temperature(0.0)
                .with_full_model(use_full_model);
            let retry_response = generator.generate(&retry_request).await?;
            match parse_expansion(&retry_response) {
                Ok(parsed) => Some(parsed),
                Err(second_err) => {
                    tracing::warn!(error = %second_err, "expansion reparse failed, creating bare query");
                    None
                }
            }
        }
    };

    let query = build_query(original_query, parsed);
    query_store::create_query(pool, &query).await?;
    Ok(query)
}

/// Create a query from an externally produced model response (pasted by a
/// user). Parse failures are tolerated the same way as in automatic mode.
pub async fn run_manual_expansion(
    pool: &SqlitePool,
    original_query: &str,
    llm_response: &str,
) -> RagResult<Query> {
    if original_query.trim().is_empty() {
        return Err(RagError::precondition("original_query is non-empty"));
    }

    let parsed = match parse_expansion(llm_response) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::warn!(error = %err, "manual expansion response did not parse");
            None
        }
    };

    let query = build_query(original_query, parsed);
    query_store::create_query(pool, &query).await?;
    Ok(query)
}

fn build_query(original_query: &str, parsed: Option<ParsedExpansion>) -> Query {
    let mut query = query_store::new_query(original_query);
    match parsed {
        Some(parsed) => {
            query.expanded_queries = parsed.expanded;
            query.hyde_answer = parsed.hyde;
            query.intent = parsed.intent;
            query.entities = parsed.entities;
            query.parse_warning = !parsed.warnings.is_empty();
        }
        None => {
            query.parse_warning = true;
        }
    }
    query
}

// ============ Parsers ============

/// Parse a model response with the JSON-framed parser, falling back to the
/// labeled-section parser.
pub fn parse_expansion(response: &str) -> Result<ParsedExpansion, String> {
    match parse_json_framed(response) {
        Ok(parsed) => Ok(parsed),
        Err(json_err) => parse_labeled_sections(response)
            .map_err(|section_err| format!("{}; {}", json_err, section_err)),
    }
}

/// Extract a JSON object from the response (fenced ```json block or the
/// outermost brace span) and read the expansion fields from it.
fn parse_json_framed(response: &str) -> Result<ParsedExpansion, String> {
    let body = extract_json_body(response).ok_or("no JSON object found")?;
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| format!("invalid JSON: {}", e))?;

    let obj = value.as_object().ok_or("JSON body is not an object")?;

    let mut warnings = Vec::new();

    let expanded = obj
        .get("expanded")
        .or_else(|| obj.get("expanded_queries"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if expanded.is_empty() {
        warnings.push("no expanded queries in response".to_string());
    }

    let hyde = obj
        .get("hyde")
        .or_else(|| obj.get("hyde_answer"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    let intent = obj
        .get("intent")
        .and_then(|v| v.as_str())
        .map(Intent::parse)
        .unwrap_or(Intent::Unknown);

    let entities = obj
        .get("entities")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(ParsedExpansion {
        expanded,
        hyde,
        intent,
        entities: normalize_entities(entities),
        warnings,
    })
}

/// Find the JSON body: prefer a fenced ```json block, else the span from
/// the first `{` to the last `}`.
fn extract_json_body(response: &str) -> Option<&str> {
    if let Some(fence_start) = response.find("```json") {
        let after = &response[fence_start + 7..];
        if let Some(fence_end) = after.find("```") {
            return Some(after[..fence_end].trim());
        }
    }
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end > start {
        Some(&response[start..=end])
    } else {
        None
    }
}

/// Parse labeled sections of the form `EXPANDED:` (bulleted list),
/// `HYDE:` (paragraph), `INTENT:` (single label), `ENTITIES:`
/// (comma-separated or bulleted). At least one section must be present.
fn parse_labeled_sections(response: &str) -> Result<ParsedExpansion, String> {
    let header =
        Regex::new(r"(?i)^\s*(expanded(?:\s+queries)?|expansions|hyde(?:\s+answer)?|intent|entities)\s*:\s*(.*)$")
            .expect("static regex");
    let bullet = Regex::new(r"^\s*(?:[-*]|\d+[.)])\s+(.+)$").expect("static regex");

    #[derive(PartialEq, Clone, Copy)]
    enum Section {
        None,
        Expanded,
        Hyde,
        Entities,
    }

    let mut parsed = ParsedExpansion::default();
    let mut section = Section::None;
    let mut found_any = false;
    let mut hyde_lines: Vec<String> = Vec::new();
    let mut entities: Vec<String> = Vec::new();

    for line in response.lines() {
        if let Some(caps) = header.captures(line) {
            found_any = true;
            let name = caps[1].to_lowercase();
            let rest = caps[2].trim().to_string();
            if name.starts_with("expanded") || name.starts_with("expansions") {
                section = Section::Expanded;
                if !rest.is_empty() {
                    parsed.expanded.push(rest);
                }
            } else if name.starts_with("hyde") {
                section = Section::Hyde;
                if !rest.is_empty() {
                    hyde_lines.push(rest);
                }
            } else if name == "intent" {
                section = Section::None;
                parsed.intent = Intent::parse(&rest);
            } else {
                section = Section::Entities;
                if !rest.is_empty() {
                    entities.extend(rest.split(',').map(|s| s.to_string()));
                }
            }
            continue;
        }

        match section {
            Section::Expanded => {
                if let Some(caps) = bullet.captures(line) {
                    parsed.expanded.push(caps[1].trim().to_string());
                }
            }
            Section::Hyde => {
                if !line.trim().is_empty() {
                    hyde_lines.push(line.trim().to_string());
                }
            }
            Section::Entities => {
                if let Some(caps) = bullet.captures(line) {
                    entities.push(caps[1].to_string());
                } else if !line.trim().is_empty() {
                    entities.extend(line.split(',').map(|s| s.to_string()));
                }
            }
            Section::None => {}
        }
    }

    if !found_any {
        return Err("no labeled sections found".to_string());
    }

    parsed.hyde = hyde_lines.join(" ");
    parsed.entities = normalize_entities(entities);
    if parsed.expanded.is_empty() {
        parsed.warnings.push("no expanded queries in response".to_string());
    }
    Ok(parsed)
}

/// Case-fold, trim, and deduplicate entities, preserving first-seen order.
fn normalize_entities(entities: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for entity in entities {
        let folded = entity.trim().to_lowercase();
        if !folded.is_empty() && !out.contains(&folded) {
            out.push(folded);
        }
    }
    out
}
