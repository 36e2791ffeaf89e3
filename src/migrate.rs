//! Database schema migrations.
//!
//! Creates all required tables (works, chunks, chunks_fts, queries, results,
//! prompt_templates, rag_config) and ensures idempotent execution. Designed
//! to be run via `crag init`.
//!
//! The ingestion subsystem owns writes to `works`, `chunks`, and
//! `chunks_fts`; the RAG core only reads them. `queries` and `results` are
//! owned by the pipeline stages.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::templates;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS works (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            authors TEXT NOT NULL DEFAULT '',
            year INTEGER,
            files_json TEXT NOT NULL DEFAULT '{}',
            bibliography_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            work_id TEXT NOT NULL,
            parent_id TEXT,
            level TEXT NOT NULL,
            content TEXT NOT NULL,
            heading_breadcrumbs TEXT,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            vector_status TEXT NOT NULL DEFAULT 'no_vec',
            embedding BLOB,
            FOREIGN KEY (work_id) REFERENCES works(id),
            FOREIGN KEY (parent_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // FTS5 over chunk content only; breadcrumbs stay out of the lexical
    // index so structural terms cannot dominate ranking.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(&pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                content,
                tokenize = 'porter unicode61'
            )
            "#,
        )
        .execute(&pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queries (
            id TEXT PRIMARY KEY,
            original_query TEXT NOT NULL,
            expanded_queries_json TEXT NOT NULL DEFAULT '[]',
            hyde_answer TEXT NOT NULL DEFAULT '',
            intent TEXT NOT NULL DEFAULT 'UNKNOWN',
            entities_json TEXT NOT NULL DEFAULT '[]',
            embedding_original BLOB,
            embeddings_mqe_json TEXT NOT NULL DEFAULT '[]',
            embedding_hyde BLOB,
            vector_status TEXT NOT NULL DEFAULT 'no_vec',
            state TEXT NOT NULL DEFAULT 'created',
            parse_warning INTEGER NOT NULL DEFAULT 0,
            retrieved_context_json TEXT,
            clean_retrieval_context_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS results (
            id TEXT PRIMARY KEY,
            query_id TEXT NOT NULL,
            response_text TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (query_id) REFERENCES queries(id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompt_templates (
            id TEXT PRIMARY KEY,
            function_tag TEXT NOT NULL,
            version INTEGER NOT NULL,
            title TEXT NOT NULL,
            template_content TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(function_tag, version)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rag_config (
            preset TEXT PRIMARY KEY,
            config_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_work_id ON chunks(work_id)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_parent_id ON chunks(parent_id)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_vector_status ON chunks(vector_status)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_results_query_id ON results(query_id)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_prompt_templates_tag ON prompt_templates(function_tag)",
    )
    .execute(&pool)
    .await?;

    // Seed the built-in prompt templates for tags that have no version yet.
    templates::seed_builtin(&pool).await?;

    pool.close().await;
    Ok(())
}
