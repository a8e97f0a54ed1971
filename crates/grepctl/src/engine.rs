//! Wiring: config → SQLite store + providers → [`SearchEngine`].

use anyhow::Result;
use std::sync::Arc;

use grepctl_core::search::SearchEngine;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::scoring::create_scorer;
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

/// Open the configured database and build an engine over it.
///
/// Migrations are applied first, so commands work against a fresh file.
/// Any persisted approximate index is loaded before this returns.
pub async fn open_engine(config: &Config) -> Result<SearchEngine> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;

    let store = Arc::new(SqliteStore::new(pool));
    let embedder = create_embedder(&config.embedding)?;
    let scorer = create_scorer(&config.rerank)?;

    SearchEngine::open(store, embedder, scorer, config.engine_config()).await
}
