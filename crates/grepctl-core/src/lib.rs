//! # grepctl core
//!
//! Pipeline logic for grepctl: data models, window chunking, the embedding
//! lifecycle, exact and approximate vector retrieval, hybrid filtering,
//! reranking, and the [`search::SearchEngine`] that composes them.
//!
//! This crate contains no sqlx, HTTP clients, or filesystem I/O. Storage
//! and providers are reached through the [`store::Store`],
//! [`embedding::Embedder`] and [`rerank::Scorer`] traits; the `grepctl`
//! crate supplies the SQLite store and the network providers.

pub mod backfill;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod models;
pub mod rerank;
pub mod retrieval;
pub mod search;
pub mod store;
