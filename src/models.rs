//! Core data models for works, chunks, queries, and their derived records.
//!
//! These types flow through the whole query pipeline. `Work` and `Chunk`
//! are created by the ingestion subsystem and read-only here; `Query` is
//! created by the expander and mutated in place by each later stage;
//! `ResultRecord` rows accumulate one per answer invocation.

use serde::{Deserialize, Serialize};

/// An ingested document. Bibliographic fields beyond title/author/year are
/// opaque JSON carried through untouched.
#[derive(Debug, Clone)]
pub struct Work {
    pub id: String,
    pub title: String,
    pub authors: String,
    pub year: Option<i64>,
    /// File-kind → `{path, sha256}` mapping. The core only reads the
    /// `sanitized` entry.
    pub files: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Work {
    /// Path and content hash of the sanitized markdown file, if recorded.
    pub fn sanitized_file(&self) -> Option<(String, String)> {
        let entry = self.files.get("sanitized")?;
        let path = entry.get("path")?.as_str()?.to_string();
        let hash = entry.get("sha256")?.as_str()?.to_string();
        Some((path, hash))
    }
}

/// Structural level of a chunk: heading depth or plain content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    H1,
    H2,
    H3,
    H4,
    H5,
    #[serde(rename = "chunk")]
    Chunk,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::H1 => "H1",
            Level::H2 => "H2",
            Level::H3 => "H3",
            Level::H4 => "H4",
            Level::H5 => "H5",
            Level::Chunk => "chunk",
        }
    }

    pub fn parse(s: &str) -> Option<Level> {
        match s {
            "H1" => Some(Level::H1),
            "H2" => Some(Level::H2),
            "H3" => Some(Level::H3),
            "H4" => Some(Level::H4),
            "H5" => Some(Level::H5),
            "chunk" => Some(Level::Chunk),
            _ => None,
        }
    }

    /// True for `H1`..`H5`.
    pub fn is_heading(&self) -> bool {
        !matches!(self, Level::Chunk)
    }
}

/// Vectorization state shared by chunks and queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorStatus {
    NoVec,
    ToVec,
    Vec,
    VecErr,
}

impl VectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorStatus::NoVec => "no_vec",
            VectorStatus::ToVec => "to_vec",
            VectorStatus::Vec => "vec",
            VectorStatus::VecErr => "vec_err",
        }
    }

    pub fn parse(s: &str) -> Option<VectorStatus> {
        match s {
            "no_vec" => Some(VectorStatus::NoVec),
            "to_vec" => Some(VectorStatus::ToVec),
            "vec" => Some(VectorStatus::Vec),
            "vec_err" => Some(VectorStatus::VecErr),
            _ => None,
        }
    }
}

/// An addressable unit of retrievable text.
///
/// Heading chunks (`H1`..`H5`) carry their heading line as content; content
/// chunks (`chunk`) always have a non-null parent heading. `start_line` /
/// `end_line` are 1-indexed inclusive positions in the work's sanitized
/// file.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub work_id: String,
    pub parent_id: Option<String>,
    pub level: Level,
    pub content: String,
    pub heading_breadcrumbs: Option<String>,
    pub start_line: i64,
    pub end_line: i64,
    pub vector_status: VectorStatus,
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    /// Number of sanitized-file lines this chunk spans.
    pub fn span(&self) -> i64 {
        self.end_line - self.start_line + 1
    }

    /// Heading title with markdown hashes stripped. Meaningful for heading
    /// chunks only.
    pub fn heading_title(&self) -> String {
        self.content
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim_start_matches('#').trim().to_string())
            .unwrap_or_default()
    }
}

/// Coarse question-type classification produced by the expander, used to
/// bias reranking and answer shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Definition,
    Mechanism,
    Comparison,
    Application,
    StudyDetail,
    Critique,
    #[default]
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Definition => "DEFINITION",
            Intent::Mechanism => "MECHANISM",
            Intent::Comparison => "COMPARISON",
            Intent::Application => "APPLICATION",
            Intent::StudyDetail => "STUDY_DETAIL",
            Intent::Critique => "CRITIQUE",
            Intent::Unknown => "UNKNOWN",
        }
    }

    /// Case-insensitive parse; anything unrecognized maps to `UNKNOWN`.
    pub fn parse(s: &str) -> Intent {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEFINITION" => Intent::Definition,
            "MECHANISM" => Intent::Mechanism,
            "COMPARISON" => Intent::Comparison,
            "APPLICATION" => Intent::Application,
            "STUDY_DETAIL" => Intent::StudyDetail,
            "CRITIQUE" => Intent::Critique,
            _ => Intent::Unknown,
        }
    }
}

/// Pipeline progress of a query. Stages may transition backward (re-run),
/// which clears all derived fields strictly downstream of the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Created,
    Expanded,
    Embedded,
    Retrieved,
    Consolidated,
    Answered,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::Created => "created",
            QueryState::Expanded => "expanded",
            QueryState::Embedded => "embedded",
            QueryState::Retrieved => "retrieved",
            QueryState::Consolidated => "consolidated",
            QueryState::Answered => "answered",
        }
    }

    pub fn parse(s: &str) -> Option<QueryState> {
        match s {
            "created" => Some(QueryState::Created),
            "expanded" => Some(QueryState::Expanded),
            "embedded" => Some(QueryState::Embedded),
            "retrieved" => Some(QueryState::Retrieved),
            "consolidated" => Some(QueryState::Consolidated),
            "answered" => Some(QueryState::Answered),
            _ => None,
        }
    }
}

/// One retrieved chunk with its full score breakdown, embedded in
/// `Query.retrieved_context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub work_id: String,
    pub parent_id: Option<String>,
    pub content: String,
    pub heading_breadcrumbs: Option<String>,
    pub start_line: i64,
    pub end_line: i64,
    pub level: Level,
    pub rrf_score: f64,
    pub rerank_score: f64,
    pub entity_boost: f64,
    pub final_score: f64,
}

/// A consolidated evidence group, embedded in
/// `Query.clean_retrieval_context`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedGroup {
    pub chunk_ids: Vec<String>,
    pub parent_id: Option<String>,
    pub work_id: String,
    pub content: String,
    pub start_line: i64,
    pub end_line: i64,
    pub score: f64,
    /// Root-first ancestor heading titles, recomputed from parent walks.
    pub heading_chain: Vec<String>,
}

/// A persistent record of one user question and everything derived from it.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: String,
    pub original_query: String,
    pub expanded_queries: Vec<String>,
    pub hyde_answer: String,
    pub intent: Intent,
    pub entities: Vec<String>,
    pub embedding_original: Option<Vec<f32>>,
    pub embeddings_mqe: Vec<Vec<f32>>,
    pub embedding_hyde: Option<Vec<f32>>,
    pub vector_status: VectorStatus,
    pub state: QueryState,
    pub parse_warning: bool,
    pub retrieved_context: Vec<RetrievedChunk>,
    pub clean_retrieval_context: Vec<ConsolidatedGroup>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An answer produced for a query. A query may own any number of results.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub id: String,
    pub query_id: String,
    pub response_text: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_roundtrip() {
        for s in ["H1", "H2", "H3", "H4", "H5", "chunk"] {
            assert_eq!(Level::parse(s).unwrap().as_str(), s);
        }
        assert!(Level::parse("H6").is_none());
    }

    #[test]
    fn test_vector_status_roundtrip() {
        for s in ["no_vec", "to_vec", "vec", "vec_err"] {
            assert_eq!(VectorStatus::parse(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn test_intent_parse_tolerant() {
        assert_eq!(Intent::parse("definition"), Intent::Definition);
        assert_eq!(Intent::parse(" STUDY_DETAIL "), Intent::StudyDetail);
        assert_eq!(Intent::parse("nonsense"), Intent::Unknown);
    }

    #[test]
    fn test_state_ordering() {
        assert!(QueryState::Created < QueryState::Embedded);
        assert!(QueryState::Retrieved < QueryState::Answered);
    }

    #[test]
    fn test_work_sanitized_file() {
        let work = Work {
            id: "w1".into(),
            title: "T".into(),
            authors: "A".into(),
            year: Some(1991),
            files: serde_json::json!({
                "sanitized": {"path": "/data/w1.md", "sha256": "abc"}
            }),
            created_at: 0,
            updated_at: 0,
        };
        let (path, hash) = work.sanitized_file().unwrap();
        assert_eq!(path, "/data/w1.md");
        assert_eq!(hash, "abc");
    }

    #[test]
    fn test_chunk_heading_title_strips_hashes() {
        let chunk = Chunk {
            id: "c1".into(),
            work_id: "w1".into(),
            parent_id: None,
            level: Level::H2,
            content: "## Background\n".into(),
            heading_breadcrumbs: None,
            start_line: 10,
            end_line: 10,
            vector_status: VectorStatus::Vec,
            embedding: None,
        };
        assert_eq!(chunk.heading_title(), "Background");
        assert_eq!(chunk.span(), 1);
    }
}
