//! # corpus-rag
//!
//! **A retrieval-augmented generation backend for curated long-form
//! academic corpora.**
//!
//! corpus-rag consumes works and chunks produced by an ingestion
//! subsystem (conversion, sanitization, chunking, and chunk vectorization
//! happen upstream) and runs the question-answering pipeline on top of
//! them: query expansion, query embedding, hybrid retrieval, context
//! consolidation, prompt augmentation, and answer generation.
//!
//! ## Pipeline
//!
//! ```text
//! raw question
//!   → expand       multi-query paraphrases, HyDE answer, intent, entities
//!   → embed        vectors for the original, each variant, and HyDE
//!   → retrieve     dense + lexical fan-out → RRF → cross-encoder rerank
//!   → consolidate  parent grouping, adjacent merging, source enrichment
//!   → augment      numbered [S#] context blocks + template fill
//!   → answer       generative call, persisted as a result
//! ```
//!
//! Every stage is gated by the query's persisted state and can be re-run;
//! re-running an earlier stage clears derived data downstream of it.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, validation, stored retrieval presets |
//! | [`models`] | Core data types: `Work`, `Chunk`, `Query`, score records |
//! | [`error`] | `RagError` taxonomy shared by all stages |
//! | [`store`] | Read-only gateway to works, chunks, sanitized files |
//! | [`query_store`] | Query/result persistence and stage guards |
//! | [`embedding`] | Embedding provider trait, OpenAI/Ollama backends, vector utilities |
//! | [`generation`] | Generative provider trait, OpenAI/Ollama chat backends |
//! | [`retry`] | Bounded retry with backoff for external calls |
//! | [`dense`] | Cosine search over stored chunk vectors |
//! | [`lexical`] | FTS5 BM25 search over chunk content |
//! | [`fuse`] | Reciprocal Rank Fusion |
//! | [`rerank`] | Cross-encoder scoring with entity/intent boosts |
//! | [`expand`] | Query expansion and response parsing |
//! | [`embed_query`] | Query embedding stage |
//! | [`retrieve`] | Retrieval orchestrator |
//! | [`consolidate`] | Context consolidation |
//! | [`templates`] | Prompt template registry with built-in fallbacks |
//! | [`augment`] | Prompt builder and answerer |
//! | [`server`] | Axum HTTP surface |
//! | [`db`] | SQLite connection pool (WAL) |
//! | [`migrate`] | Idempotent schema migrations |

pub mod augment;
pub mod config;
pub mod consolidate;
pub mod db;
pub mod dense;
pub mod embed_query;
pub mod embedding;
pub mod error;
pub mod expand;
pub mod fuse;
pub mod generation;
pub mod lexical;
pub mod migrate;
pub mod models;
pub mod query_store;
pub mod rerank;
pub mod retrieve;
pub mod retry;
pub mod server;
pub mod store;
pub mod templates;
