//! Database schema creation.
//!
//! Every statement is `IF NOT EXISTS`, so `grepctl init` can be run any
//! number of times against the same file.
//!
//! # Tables
//!
//! | Table | Contents |
//! |-------|----------|
//! | `documents` | One row per ingested document |
//! | `corpus_entries` | Searchable units with their embedding BLOB |
//! | `embedding_cache` | Vectors keyed by content hash |
//! | `index_meta` | Single-row approximate index lifecycle state |
//! | `index_snapshot` | Single-row trained centroids (JSON) |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes on an open pool.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            doc_id TEXT PRIMARY KEY,
            uri TEXT NOT NULL,
            modality TEXT NOT NULL,
            source TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            text_content TEXT,
            mime_type TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // `embedding` is NULL until backfilled. A zero-length BLOB written by
    // an older tool is treated exactly like NULL.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS corpus_entries (
            id TEXT PRIMARY KEY,
            doc_id TEXT NOT NULL,
            uri TEXT NOT NULL,
            modality TEXT NOT NULL,
            source TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            chunk_index INTEGER,
            chunk_start INTEGER,
            chunk_end INTEGER,
            text TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            embedding BLOB,
            embedding_model TEXT,
            embed_attempts INTEGER NOT NULL DEFAULT 0,
            embedded_at INTEGER,
            FOREIGN KEY (doc_id) REFERENCES documents(doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            content_hash TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            state TEXT NOT NULL,
            built_at INTEGER,
            size_at_build INTEGER NOT NULL DEFAULT 0,
            embedded_since_build INTEGER NOT NULL DEFAULT 0,
            dims INTEGER,
            nlist INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_snapshot (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            dims INTEGER NOT NULL,
            snapshot_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_doc_id ON corpus_entries(doc_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_source ON corpus_entries(source)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_uri ON documents(uri)")
        .execute(pool)
        .await?;

    Ok(())
}
