//! Prompt template registry.
//!
//! Templates are stored in `prompt_templates`, keyed by a function tag
//! (`query_expansion`, `rag_augmentation`) with at most one active version
//! per tag. Each tag also has a compiled-in fallback so the pipeline works
//! on a fresh database before anyone has authored templates.
//!
//! Filling is strict: every `{variable}` referenced by a template must be
//! supplied at fill time, otherwise the fill fails with a permanent error.

use regex::Regex;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{RagError, RagResult};

/// Function tag for the expansion prompt (`{query}`).
pub const TAG_QUERY_EXPANSION: &str = "query_expansion";
/// Function tag for the augmentation prompt (`{query}`, `{contexts}`,
/// `{intent}`, `{entities_str}`).
pub const TAG_RAG_AUGMENTATION: &str = "rag_augmentation";

/// Built-in `query_expansion` template, used when no stored version is active.
pub const QUERY_EXPANSION_FALLBACK: &str = r#"You are a retrieval assistant for a corpus of long-form academic works.
Analyze the question below and reply with a single JSON object, no prose
before or after it, with exactly these keys:

- "expanded": 3 to 5 paraphrases of the question that preserve its intent
  but vary surface form and specificity.
- "hyde": a hypothetical answer of 2 to 4 sentences, written as if it were
  an authoritative passage from one of the works.
- "intent": one of DEFINITION, MECHANISM, COMPARISON, APPLICATION,
  STUDY_DETAIL, CRITIQUE, UNKNOWN.
- "entities": the key named entities and concepts in the question,
  lower-cased, without duplicates.

Question: {query}"#;

/// Built-in `rag_augmentation` template, used when no stored version is active.
pub const RAG_AUGMENTATION_FALLBACK: &str = r#"Answer the question using the numbered sources below.

Rules:
- Ground every claim you can in the sources and cite it with its [S#]
  label; each label maps to (work_id, start_line, end_line) shown in the
  source header.
- Keep claims supported by the sources clearly separated from additions
  drawn from general knowledge, and mark the latter as such.
- Shape the answer for a question of type {intent}: lead with a concise
  definition for DEFINITION, trace cause and effect for MECHANISM, contrast
  explicitly for COMPARISON.
- Key concepts to attend to: {entities_str}

Sources:
{contexts}

Question: {query}"#;

/// A stored prompt template row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PromptTemplate {
    pub id: String,
    pub function_tag: String,
    pub version: i64,
    pub title: String,
    pub template_content: String,
    pub is_active: bool,
}

/// The active template content for a tag, or the compiled-in fallback.
pub async fn resolve(pool: &SqlitePool, function_tag: &str) -> RagResult<String> {
    if let Some(t) = get_active(pool, function_tag).await? {
        return Ok(t.template_content);
    }
    match function_tag {
        TAG_QUERY_EXPANSION => Ok(QUERY_EXPANSION_FALLBACK.to_string()),
        TAG_RAG_AUGMENTATION => Ok(RAG_AUGMENTATION_FALLBACK.to_string()),
        other => Err(RagError::NotFound(format!(
            "no template for function tag '{}'",
            other
        ))),
    }
}

/// The active stored template for a tag, if any.
pub async fn get_active(
    pool: &SqlitePool,
    function_tag: &str,
) -> RagResult<Option<PromptTemplate>> {
    let row = sqlx::query(
        "SELECT id, function_tag, version, title, template_content, is_active
         FROM prompt_templates WHERE function_tag = ? AND is_active = 1",
    )
    .bind(function_tag)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| row_to_template(&r)))
}

/// All stored templates, newest version first within each tag.
pub async fn list(pool: &SqlitePool) -> RagResult<Vec<PromptTemplate>> {
    let rows = sqlx::query(
        "SELECT id, function_tag, version, title, template_content, is_active
         FROM prompt_templates ORDER BY function_tag ASC, version DESC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(row_to_template).collect())
}

/// Store a new template version for a tag. The new version is one above the
/// highest stored version; it is not activated automatically.
pub async fn create(
    pool: &SqlitePool,
    function_tag: &str,
    title: &str,
    content: &str,
) -> RagResult<PromptTemplate> {
    let next_version: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM prompt_templates WHERE function_tag = ?",
    )
    .bind(function_tag)
    .fetch_one(pool)
    .await?;

    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO prompt_templates
         (id, function_tag, version, title, template_content, is_active, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(&id)
    .bind(function_tag)
    .bind(next_version)
    .bind(title)
    .bind(content)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(PromptTemplate {
        id,
        function_tag: function_tag.to_string(),
        version: next_version,
        title: title.to_string(),
        template_content: content.to_string(),
        is_active: false,
    })
}

/// Activate one version of a tag, deactivating every other version so the
/// one-active-per-tag invariant holds.
pub async fn set_active(pool: &SqlitePool, function_tag: &str, version: i64) -> RagResult<()> {
    let now = chrono::Utc::now().timestamp();

    let updated = sqlx::query(
        "UPDATE prompt_templates SET is_active = 1, updated_at = ?
         WHERE function_tag = ? AND version = ?",
    )
    .bind(now)
    .bind(function_tag)
    .bind(version)
    .execute(pool)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(RagError::NotFound(format!(
            "template {} v{}",
            function_tag, version
        )));
    }

    sqlx::query(
        "UPDATE prompt_templates SET is_active = 0, updated_at = ?
         WHERE function_tag = ? AND version != ?",
    )
    .bind(now)
    .bind(function_tag)
    .bind(version)
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert the built-in templates as version 1 (active) for any tag that has
/// no stored versions yet. Called from migrations.
pub async fn seed_builtin(pool: &SqlitePool) -> anyhow::Result<()> {
    for (tag, title, content) in [
        (
            TAG_QUERY_EXPANSION,
            "Built-in query expansion",
            QUERY_EXPANSION_FALLBACK,
        ),
        (
            TAG_RAG_AUGMENTATION,
            "Built-in RAG augmentation",
            RAG_AUGMENTATION_FALLBACK,
        ),
    ] {
        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM prompt_templates WHERE function_tag = ?")
                .bind(tag)
                .fetch_one(pool)
                .await?;

        if !exists {
            let t = create(pool, tag, title, content).await?;
            set_active(pool, tag, t.version).await?;
        }
    }
    Ok(())
}

/// Substitute `{variable}` placeholders in a template.
///
/// Every placeholder referenced by the template must appear in `vars`;
/// a missing variable is a permanent error (the template is unusable,
/// retrying cannot help).
pub fn fill(template: &str, vars: &[(&str, &str)]) -> RagResult<String> {
    let placeholder = Regex::new(r"\{([a-z_]+)\}").expect("static regex");

    let mut missing: Vec<String> = Vec::new();
    for cap in placeholder.captures_iter(template) {
        let name = &cap[1];
        if !vars.iter().any(|(k, _)| *k == name) && !missing.iter().any(|m| m == name) {
            missing.push(name.to_string());
        }
    }
    if !missing.is_empty() {
        return Err(RagError::Permanent(format!(
            "template references unsupplied variables: {}",
            missing.join(", ")
        )));
    }

    let mut filled = template.to_string();
    for (name, value) in vars {
        filled = filled.replace(&format!("{{{}}}", name), value);
    }
    Ok(filled)
}

fn row_to_template(row: &sqlx::sqlite::SqliteRow) -> PromptTemplate {
    PromptTemplate {
        id: row.get("id"),
        function_tag: row.get("function_tag"),
        version: row.get("version"),
        title: row.get("title"),
        template_content: row.get("template_content"),
        is_active: row.get::<i64, _>("is_active") != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_substitutes_all_variables() {
        let out = fill("Q: {query} I: {intent}", &[("query", "x"), ("intent", "DEFINITION")])
            .unwrap();
        assert_eq!(out, "Q: x I: DEFINITION");
    }

    #[test]
    fn test_fill_missing_variable_is_permanent() {
        let err = fill("Q: {query} {contexts}", &[("query", "x")]).unwrap_err();
        match err {
            RagError::Permanent(msg) => assert!(msg.contains("contexts")),
            other => panic!("expected Permanent, got {other:?}"),
        }
    }

    #[test]
    fn test_fill_ignores_extra_vars() {
        let out = fill("just {query}", &[("query", "x"), ("intent", "y")]).unwrap();
        assert_eq!(out, "just x");
    }

    #[test]
    fn test_fallback_templates_reference_expected_variables() {
        // The built-in templates must be fillable with the documented
        // variable sets and nothing more.
        assert!(fill(QUERY_EXPANSION_FALLBACK, &[("query", "q")]).is_ok());
        assert!(fill(
            RAG_AUGMENTATION_FALLBACK,
            &[
                ("query", "q"),
                ("contexts", "c"),
                ("intent", "UNKNOWN"),
                ("entities_str", "(none)"),
            ],
        )
        .is_ok());
    }

    #[test]
    fn test_fill_repeated_placeholder() {
        let out = fill("{query} and {query}", &[("query", "a")]).unwrap();
        assert_eq!(out, "a and a");
    }
}
