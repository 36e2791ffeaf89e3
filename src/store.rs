//! Read-only gateway to works, chunks, and sanitized source files.
//!
//! The ingestion subsystem owns these tables and the sanitized markdown
//! files on disk; the RAG core reads them through this module only. The
//! orchestrator and consolidator each call into the gateway with a single
//! pool handle, so their reads come from one consistent snapshot.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::error::{RagError, RagResult};
use crate::models::{Chunk, Level, VectorStatus, Work};

/// Fetch a work by id.
pub async fn get_work(pool: &SqlitePool, work_id: &str) -> RagResult<Work> {
    let row = sqlx::query(
        "SELECT id, title, authors, year, files_json, created_at, updated_at
         FROM works WHERE id = ?",
    )
    .bind(work_id)
    .fetch_optional(pool)
    .await?;

    let row = row.ok_or_else(|| RagError::NotFound(format!("work {}", work_id)))?;
    row_to_work(&row)
}

/// Fetch a chunk by id.
pub async fn get_chunk(pool: &SqlitePool, chunk_id: &str) -> RagResult<Chunk> {
    let row = sqlx::query(
        "SELECT id, work_id, parent_id, level, content, heading_breadcrumbs,
                start_line, end_line, vector_status, embedding
         FROM chunks WHERE id = ?",
    )
    .bind(chunk_id)
    .fetch_optional(pool)
    .await?;

    let row = row.ok_or_else(|| RagError::NotFound(format!("chunk {}", chunk_id)))?;
    row_to_chunk(&row)
}

/// Fetch several chunks at once. Missing ids are omitted, not an error.
pub async fn get_chunks(
    pool: &SqlitePool,
    ids: &[String],
) -> RagResult<HashMap<String, Chunk>> {
    let mut out = HashMap::with_capacity(ids.len());
    if ids.is_empty() {
        return Ok(out);
    }

    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT id, work_id, parent_id, level, content, heading_breadcrumbs,
                start_line, end_line, vector_status, embedding
         FROM chunks WHERE id IN ({})",
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }

    for row in query.fetch_all(pool).await? {
        let chunk = row_to_chunk(&row)?;
        out.insert(chunk.id.clone(), chunk);
    }
    Ok(out)
}

/// Resolve each child's heading chunk. Children with a null parent are
/// omitted; a dangling parent pointer is omitted as well (the hierarchy is
/// maintained elsewhere, reads stay tolerant).
pub async fn get_parent_chunks(
    pool: &SqlitePool,
    child_ids: &[String],
) -> RagResult<HashMap<String, Chunk>> {
    let children = get_chunks(pool, child_ids).await?;

    let mut parent_ids: Vec<String> = children
        .values()
        .filter_map(|c| c.parent_id.clone())
        .collect();
    parent_ids.sort();
    parent_ids.dedup();

    let parents = get_chunks(pool, &parent_ids).await?;

    let mut out = HashMap::new();
    for (child_id, child) in &children {
        if let Some(pid) = &child.parent_id {
            if let Some(parent) = parents.get(pid) {
                out.insert(child_id.clone(), parent.clone());
            }
        }
    }
    Ok(out)
}

/// Read an inclusive 1-indexed line range from a work's sanitized file.
///
/// - `end_line` past EOF is clamped to EOF.
/// - `start_line` past EOF yields an empty string.
/// - A missing file, a missing `sanitized` entry, or a content hash that no
///   longer matches the stored hash fails with [`RagError::StaleSource`].
///
/// The file is read as UTF-8; a leading BOM is stripped before hashing and
/// slicing. The returned slice carries no trailing newline.
pub async fn read_sanitized_slice(
    pool: &SqlitePool,
    work_id: &str,
    start_line: i64,
    end_line: i64,
) -> RagResult<String> {
    let work = get_work(pool, work_id).await?;

    let (path, stored_hash) = work.sanitized_file().ok_or_else(|| RagError::StaleSource {
        work_id: work_id.to_string(),
        reason: "no sanitized file recorded".to_string(),
    })?;

    let raw = tokio::fs::read(&path)
        .await
        .map_err(|e| RagError::StaleSource {
            work_id: work_id.to_string(),
            reason: format!("cannot read {}: {}", path, e),
        })?;

    let text = String::from_utf8_lossy(&raw);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let actual_hash = format!("{:x}", hasher.finalize());

    if actual_hash != stored_hash {
        return Err(RagError::StaleSource {
            work_id: work_id.to_string(),
            reason: format!("content hash mismatch for {}", path),
        });
    }

    Ok(slice_lines(text, start_line, end_line))
}

/// Extract 1-indexed inclusive lines from text, clamping to EOF.
fn slice_lines(text: &str, start_line: i64, end_line: i64) -> String {
    if start_line < 1 || end_line < start_line {
        return String::new();
    }
    let lines: Vec<&str> = text.lines().collect();
    let start = (start_line - 1) as usize;
    if start >= lines.len() {
        return String::new();
    }
    let end = (end_line as usize).min(lines.len());
    lines[start..end].join("\n")
}

fn row_to_work(row: &sqlx::sqlite::SqliteRow) -> RagResult<Work> {
    let files_json: String = row.get("files_json");
    let files = serde_json::from_str(&files_json).unwrap_or(serde_json::json!({}));

    Ok(Work {
        id: row.get("id"),
        title: row.get("title"),
        authors: row.get("authors"),
        year: row.get("year"),
        files,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub(crate) fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> RagResult<Chunk> {
    let level_str: String = row.get("level");
    let level = Level::parse(&level_str)
        .ok_or_else(|| RagError::Permanent(format!("unknown chunk level '{}'", level_str)))?;

    let status_str: String = row.get("vector_status");
    let vector_status = VectorStatus::parse(&status_str).ok_or_else(|| {
        RagError::Permanent(format!("unknown vector status '{}'", status_str))
    })?;

    let embedding: Option<Vec<u8>> = row.get("embedding");

    Ok(Chunk {
        id: row.get("id"),
        work_id: row.get("work_id"),
        parent_id: row.get("parent_id"),
        level,
        content: row.get("content"),
        heading_breadcrumbs: row.get("heading_breadcrumbs"),
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        vector_status,
        embedding: embedding.map(|b| crate::embedding::blob_to_vec(&b)),
    })
}
