//! # grepctl
//!
//! **Hybrid semantic search over extracted document corpora.**
//!
//! This crate is the application shell around [`grepctl_core`]: it reads
//! the TOML config, persists the corpus in SQLite, talks to the embedding
//! and scoring providers over HTTP, and exposes everything through the
//! `grepctl` CLI and a small JSON API.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────────────┐   ┌──────────┐
//! │   JSONL    │──▶│ SearchEngine (core)       │──▶│  SQLite   │
//! │ documents  │   │ chunk → embed → index     │   │  store    │
//! └────────────┘   └────────────┬─────────────┘   └──────────┘
//!                               │
//!                 ┌─────────────┴─────────────┐
//!                 ▼                           ▼
//!           ┌──────────┐                ┌──────────┐
//!           │   CLI    │                │   HTTP   │
//!           │(grepctl) │                │  (axum)  │
//!           └──────────┘                └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! grepctl init                          # create database
//! grepctl ingest extracted.jsonl        # chunk, embed, index
//! grepctl search "quarterly revenue" --source pdf --rerank
//! grepctl serve                         # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML config parsing and validation |
//! | [`db`], [`migrate`] | SQLite pool and schema |
//! | [`sqlite_store`] | [`grepctl_core::store::Store`] over SQLite |
//! | [`embedding`], [`scoring`] | Provider implementations |
//! | [`engine`] | Builds a [`grepctl_core::search::SearchEngine`] from config |
//! | [`ingest`] | JSONL reading and the `ingest` command |
//! | [`embed_cmd`], [`index_cmd`], [`search`], [`stats`] | CLI commands |
//! | [`server`] | HTTP API |

pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod engine;
pub mod index_cmd;
pub mod ingest;
pub mod migrate;
pub mod scoring;
pub mod search;
pub mod server;
pub mod sqlite_store;
pub mod stats;
