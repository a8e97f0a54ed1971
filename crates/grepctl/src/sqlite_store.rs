//! SQLite-backed [`Store`] implementation.
//!
//! Embeddings are stored as little-endian `f32` BLOBs in
//! `corpus_entries.embedding`. Both `NULL` and a zero-length BLOB mean
//! "not embedded"; every query that distinguishes embedded from pending
//! rows goes through [`PENDING`] so the two can never drift apart.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use grepctl_core::embedding::{blob_to_vec, normalize, vec_to_blob};
use grepctl_core::models::{ChunkSpan, CorpusEntry, Document};
use grepctl_core::retrieval::{IndexMeta, IndexSnapshot, IndexState};
use grepctl_core::store::{
    CorpusStats, RepairReport, ReplaceOutcome, SourceHealth, Store, ValidationReport,
};

/// SQL predicate selecting entries without a usable embedding.
pub const PENDING: &str = "(embedding IS NULL OR length(embedding) = 0)";

/// Stay well under SQLite's bound-parameter limit.
const IN_CHUNK: usize = 500;

const ENTRY_COLUMNS: &str = "id, doc_id, uri, modality, source, created_at, chunk_index, \
     chunk_start, chunk_end, text, content_hash, embedding, embed_attempts, embedded_at";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn row_to_entry(row: &SqliteRow) -> CorpusEntry {
    let chunk_index: Option<i64> = row.get("chunk_index");
    let chunk_start: Option<i64> = row.get("chunk_start");
    let chunk_end: Option<i64> = row.get("chunk_end");
    let span = match (chunk_index, chunk_start, chunk_end) {
        (Some(index), Some(start), Some(end)) => Some(ChunkSpan { index, start, end }),
        _ => None,
    };
    let blob: Option<Vec<u8>> = row.get("embedding");
    let attempts: i64 = row.get("embed_attempts");

    CorpusEntry {
        id: row.get("id"),
        doc_id: row.get("doc_id"),
        uri: row.get("uri"),
        modality: row.get("modality"),
        source: row.get("source"),
        created_at: row.get("created_at"),
        span,
        text: row.get("text"),
        content_hash: row.get("content_hash"),
        embedding: normalize(blob.map(|b| blob_to_vec(&b))),
        embed_attempts: attempts.max(0) as u32,
        embedded_at: row.get("embedded_at"),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let metadata_json = serde_json::to_string(&doc.metadata)?;

        sqlx::query(
            r#"
            INSERT INTO documents (doc_id, uri, modality, source, created_at,
                                   text_content, mime_type, metadata_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(doc_id) DO UPDATE SET
                uri = excluded.uri,
                modality = excluded.modality,
                source = excluded.source,
                created_at = excluded.created_at,
                text_content = excluded.text_content,
                mime_type = excluded.mime_type,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.doc_id)
        .bind(&doc.uri)
        .bind(&doc.modality)
        .bind(&doc.source)
        .bind(doc.created_at)
        .bind(&doc.text_content)
        .bind(&doc.mime_type)
        .bind(&metadata_json)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replace_entries(
        &self,
        doc_id: &str,
        entries: &[CorpusEntry],
    ) -> Result<ReplaceOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = ReplaceOutcome::default();

        let existing: HashMap<String, String> =
            sqlx::query("SELECT id, content_hash FROM corpus_entries WHERE doc_id = ?")
                .bind(doc_id)
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|row| (row.get("id"), row.get("content_hash")))
                .collect();

        let keep: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        for id in existing.keys().filter(|id| !keep.contains(id.as_str())) {
            sqlx::query("DELETE FROM corpus_entries WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            outcome.removed += 1;
        }

        for entry in entries {
            let span = entry.span;
            match existing.get(&entry.id) {
                Some(hash) if *hash == entry.content_hash => {
                    // Same content: refresh descriptive fields, keep the vector.
                    sqlx::query(
                        r#"
                        UPDATE corpus_entries
                        SET uri = ?, modality = ?, source = ?, created_at = ?,
                            chunk_index = ?, chunk_start = ?, chunk_end = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(&entry.uri)
                    .bind(&entry.modality)
                    .bind(&entry.source)
                    .bind(entry.created_at)
                    .bind(span.map(|s| s.index))
                    .bind(span.map(|s| s.start))
                    .bind(span.map(|s| s.end))
                    .bind(&entry.id)
                    .execute(&mut *tx)
                    .await?;
                    outcome.unchanged += 1;
                }
                Some(_) => {
                    sqlx::query(
                        r#"
                        UPDATE corpus_entries
                        SET doc_id = ?, uri = ?, modality = ?, source = ?, created_at = ?,
                            chunk_index = ?, chunk_start = ?, chunk_end = ?,
                            text = ?, content_hash = ?,
                            embedding = NULL, embedding_model = NULL,
                            embed_attempts = 0, embedded_at = NULL
                        WHERE id = ?
                        "#,
                    )
                    .bind(&entry.doc_id)
                    .bind(&entry.uri)
                    .bind(&entry.modality)
                    .bind(&entry.source)
                    .bind(entry.created_at)
                    .bind(span.map(|s| s.index))
                    .bind(span.map(|s| s.start))
                    .bind(span.map(|s| s.end))
                    .bind(&entry.text)
                    .bind(&entry.content_hash)
                    .bind(&entry.id)
                    .execute(&mut *tx)
                    .await?;
                    outcome.updated += 1;
                }
                None => {
                    let blob = normalize(entry.embedding.clone()).map(|v| vec_to_blob(&v));
                    sqlx::query(
                        r#"
                        INSERT INTO corpus_entries (id, doc_id, uri, modality, source, created_at,
                                                    chunk_index, chunk_start, chunk_end,
                                                    text, content_hash, embedding,
                                                    embed_attempts, embedded_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
                        "#,
                    )
                    .bind(&entry.id)
                    .bind(&entry.doc_id)
                    .bind(&entry.uri)
                    .bind(&entry.modality)
                    .bind(&entry.source)
                    .bind(entry.created_at)
                    .bind(span.map(|s| s.index))
                    .bind(span.map(|s| s.start))
                    .bind(span.map(|s| s.end))
                    .bind(&entry.text)
                    .bind(&entry.content_hash)
                    .bind(&blob)
                    .bind(blob.as_ref().and(entry.embedded_at))
                    .execute(&mut *tx)
                    .await?;
                    outcome.created += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn pending_entries(
        &self,
        limit: Option<usize>,
        max_attempts: u32,
    ) -> Result<Vec<CorpusEntry>> {
        let sql = format!(
            "SELECT {} FROM corpus_entries WHERE {} AND embed_attempts < ? \
             ORDER BY embed_attempts ASC, id ASC LIMIT ?",
            ENTRY_COLUMNS, PENDING
        );
        // LIMIT -1 means no limit in SQLite.
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let rows = sqlx::query(&sql)
            .bind(max_attempts as i64)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_entry).collect())
    }

    async fn cached_embeddings(&self, hashes: &[String]) -> Result<HashMap<String, Vec<f32>>> {
        let mut found = HashMap::new();
        for group in hashes.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT content_hash, embedding FROM embedding_cache \
                 WHERE length(embedding) > 0 AND content_hash IN ({})",
                placeholders(group.len())
            );
            let mut query = sqlx::query(&sql);
            for hash in group {
                query = query.bind(hash);
            }
            for row in query.fetch_all(&self.pool).await? {
                let blob: Vec<u8> = row.get("embedding");
                found.insert(row.get("content_hash"), blob_to_vec(&blob));
            }
        }
        Ok(found)
    }

    async fn set_embedding(
        &self,
        entry_id: &str,
        content_hash: &str,
        vector: &[f32],
        model: &str,
    ) -> Result<bool> {
        if vector.is_empty() {
            return Ok(false);
        }
        let now = chrono::Utc::now().timestamp();
        let blob = vec_to_blob(vector);
        let mut tx = self.pool.begin().await?;

        // The content_hash guard makes this a compare-and-set: a vector
        // computed for text that has since been replaced is dropped.
        let result = sqlx::query(
            r#"
            UPDATE corpus_entries
            SET embedding = ?, embedding_model = ?, embedded_at = ?
            WHERE id = ? AND content_hash = ?
            "#,
        )
        .bind(&blob)
        .bind(model)
        .bind(now)
        .bind(entry_id)
        .bind(content_hash)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO embedding_cache (content_hash, embedding, model, dims, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO UPDATE SET
                embedding = excluded.embedding,
                model = excluded.model,
                dims = excluded.dims,
                created_at = excluded.created_at
            "#,
        )
        .bind(content_hash)
        .bind(&blob)
        .bind(model)
        .bind(vector.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn record_embed_failure(&self, entry_ids: &[String]) -> Result<()> {
        for group in entry_ids.chunks(IN_CHUNK) {
            let sql = format!(
                "UPDATE corpus_entries SET embed_attempts = embed_attempts + 1 WHERE id IN ({})",
                placeholders(group.len())
            );
            let mut query = sqlx::query(&sql);
            for id in group {
                query = query.bind(id);
            }
            query.execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn embedded_entries(&self) -> Result<Vec<CorpusEntry>> {
        let sql = format!(
            "SELECT {} FROM corpus_entries WHERE NOT {} ORDER BY id ASC",
            ENTRY_COLUMNS, PENDING
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_entry).collect())
    }

    async fn get_entries(&self, ids: &[String]) -> Result<Vec<CorpusEntry>> {
        let mut by_id: HashMap<String, CorpusEntry> = HashMap::with_capacity(ids.len());
        for group in ids.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT {} FROM corpus_entries WHERE id IN ({})",
                ENTRY_COLUMNS,
                placeholders(group.len())
            );
            let mut query = sqlx::query(&sql);
            for id in group {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                let entry = row_to_entry(&row);
                by_id.insert(entry.id.clone(), entry);
            }
        }
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn count_embedded(&self) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM corpus_entries WHERE NOT {}", PENDING);
        let n: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(n as usize)
    }

    async fn corpus_stats(&self, max_attempts: u32) -> Result<CorpusStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            r#"
            SELECT COUNT(*) AS entries,
                   COALESCE(SUM(CASE WHEN NOT {p} THEN 1 ELSE 0 END), 0) AS embedded,
                   COALESCE(SUM(CASE WHEN {p} AND embed_attempts < ?1 THEN 1 ELSE 0 END), 0) AS pending,
                   COALESCE(SUM(CASE WHEN {p} AND embed_attempts >= ?1 THEN 1 ELSE 0 END), 0) AS parked
            FROM corpus_entries
            "#,
            p = PENDING
        );
        let row = sqlx::query(&sql)
            .bind(max_attempts as i64)
            .fetch_one(&self.pool)
            .await?;

        Ok(CorpusStats {
            documents: documents as usize,
            entries: row.get::<i64, _>("entries") as usize,
            embedded: row.get::<i64, _>("embedded") as usize,
            pending: row.get::<i64, _>("pending") as usize,
            parked: row.get::<i64, _>("parked") as usize,
        })
    }

    async fn embedding_health(&self, dims: usize) -> Result<Vec<SourceHealth>> {
        let rows = sqlx::query(
            r#"
            SELECT source,
                   COUNT(*) AS total,
                   SUM(CASE WHEN embedding IS NOT NULL AND length(embedding) = ?1 THEN 1 ELSE 0 END) AS valid,
                   SUM(CASE WHEN embedding IS NULL THEN 1 ELSE 0 END) AS null_count,
                   SUM(CASE WHEN embedding IS NOT NULL AND length(embedding) = 0 THEN 1 ELSE 0 END) AS empty,
                   SUM(CASE WHEN embedding IS NOT NULL AND length(embedding) NOT IN (0, ?1) THEN 1 ELSE 0 END) AS wrong_dims
            FROM corpus_entries
            GROUP BY source
            ORDER BY source ASC
            "#,
        )
        .bind((dims * 4) as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SourceHealth {
                source: row.get("source"),
                total: row.get::<i64, _>("total") as usize,
                valid: row.get::<i64, _>("valid") as usize,
                null: row.get::<i64, _>("null_count") as usize,
                empty: row.get::<i64, _>("empty") as usize,
                wrong_dims: row.get::<i64, _>("wrong_dims") as usize,
            })
            .collect())
    }

    async fn repair_embeddings(&self, modality: Option<&str>) -> Result<RepairReport> {
        // `?1 IS NULL` leaves the repair unscoped.
        let mut tx = self.pool.begin().await?;
        let emptied = sqlx::query(
            "UPDATE corpus_entries SET embedding = NULL, embedding_model = NULL, embedded_at = NULL \
             WHERE embedding IS NOT NULL AND length(embedding) = 0 \
             AND (?1 IS NULL OR modality = ?1)",
        )
        .bind(modality)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let reset = sqlx::query(
            "UPDATE corpus_entries SET embed_attempts = 0 \
             WHERE embedding IS NULL AND embed_attempts > 0 \
             AND (?1 IS NULL OR modality = ?1)",
        )
        .bind(modality)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        Ok(RepairReport {
            emptied_to_null: emptied as usize,
            attempts_reset: reset as usize,
        })
    }

    async fn validate_documents(&self) -> Result<ValidationReport> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let duplicate_uris = sqlx::query(
            "SELECT uri, COUNT(*) AS n FROM documents GROUP BY uri HAVING COUNT(*) > 1 ORDER BY uri ASC",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| (row.get("uri"), row.get::<i64, _>("n") as usize))
        .collect();
        let without_text: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE text_content IS NULL OR text_content = ''",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ValidationReport {
            documents: documents as usize,
            duplicate_uris,
            documents_without_text: without_text as usize,
        })
    }

    async fn load_index_meta(&self) -> Result<IndexMeta> {
        let row = sqlx::query(
            "SELECT state, built_at, size_at_build, embedded_since_build, dims, nlist \
             FROM index_meta WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(IndexMeta::default());
        };
        let state: String = row.get("state");
        let dims: Option<i64> = row.get("dims");
        Ok(IndexMeta {
            state: IndexState::parse(&state)
                .with_context(|| format!("unknown index state in database: '{}'", state))?,
            built_at: row.get("built_at"),
            size_at_build: row.get::<i64, _>("size_at_build") as usize,
            embedded_since_build: row.get::<i64, _>("embedded_since_build") as usize,
            dims: dims.map(|d| d as usize),
            nlist: row.get::<i64, _>("nlist") as usize,
        })
    }

    async fn save_index_meta(&self, meta: &IndexMeta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_meta (id, state, built_at, size_at_build, embedded_since_build, dims, nlist)
            VALUES (1, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                built_at = excluded.built_at,
                size_at_build = excluded.size_at_build,
                embedded_since_build = excluded.embedded_since_build,
                dims = excluded.dims,
                nlist = excluded.nlist
            "#,
        )
        .bind(meta.state.as_str())
        .bind(meta.built_at)
        .bind(meta.size_at_build as i64)
        .bind(meta.embedded_since_build as i64)
        .bind(meta.dims.map(|d| d as i64))
        .bind(meta.nlist as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_index_snapshot(&self) -> Result<Option<IndexSnapshot>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT snapshot_json FROM index_snapshot WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        json.map(|j| serde_json::from_str(&j).context("corrupt index snapshot"))
            .transpose()
    }

    async fn save_index_snapshot(&self, snapshot: &IndexSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO index_snapshot (id, dims, snapshot_json, created_at)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                dims = excluded.dims,
                snapshot_json = excluded.snapshot_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(snapshot.dims as i64)
        .bind(&json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use grepctl_core::chunk::{chunk_document, content_hash, ChunkPolicy};
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("grepctl.sqlite"))
            .await
            .unwrap();
        migrate::migrate(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn doc(id: &str, uri: &str, text: Option<&str>) -> Document {
        Document {
            doc_id: id.to_string(),
            uri: uri.to_string(),
            modality: "text".to_string(),
            source: "file".to_string(),
            created_at: 1_700_000_000,
            text_content: text.map(str::to_string),
            mime_type: Some("text/plain".to_string()),
            metadata: serde_json::json!({"k": "v"}),
        }
    }

    async fn ingest(store: &SqliteStore, d: &Document) -> ReplaceOutcome {
        store.upsert_document(d).await.unwrap();
        let entries: Vec<_> = chunk_document(d, &ChunkPolicy::default()).collect();
        store.replace_entries(&d.doc_id, &entries).await.unwrap()
    }

    #[tokio::test]
    async fn test_new_entries_are_pending() {
        let (_tmp, store) = test_store().await;
        let d = doc("d1", "file:///a.txt", Some("hello world"));
        let outcome = ingest(&store, &d).await;
        assert_eq!(outcome.created, 1);

        let pending = store.pending_entries(None, 5).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "d1");
        assert!(pending[0].span.is_none());
        assert_eq!(store.count_embedded().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_length_blob_counts_as_pending() {
        let (_tmp, store) = test_store().await;
        ingest(&store, &doc("d1", "file:///a.txt", Some("alpha"))).await;
        ingest(&store, &doc("d2", "file:///b.txt", Some("beta"))).await;

        sqlx::query("UPDATE corpus_entries SET embedding = x'' WHERE id = 'd1'")
            .execute(store.pool())
            .await
            .unwrap();

        let pending = store.pending_entries(None, 5).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].embedding.is_none());
        assert_eq!(store.count_embedded().await.unwrap(), 0);
        assert!(store.embedded_entries().await.unwrap().is_empty());

        let health = store.embedding_health(2).await.unwrap();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].empty, 1);
        assert_eq!(health[0].null, 1);
        assert_eq!(health[0].valid, 0);
    }

    #[tokio::test]
    async fn test_set_embedding_is_compare_and_set() {
        let (_tmp, store) = test_store().await;
        ingest(&store, &doc("d1", "file:///a.txt", Some("original"))).await;

        let stale_hash = content_hash("something else");
        assert!(!store
            .set_embedding("d1", &stale_hash, &[1.0, 2.0], "m")
            .await
            .unwrap());
        assert_eq!(store.count_embedded().await.unwrap(), 0);

        let hash = content_hash("original");
        assert!(store.set_embedding("d1", &hash, &[1.0, 2.0], "m").await.unwrap());
        let embedded = store.embedded_entries().await.unwrap();
        assert_eq!(embedded[0].embedding.as_deref(), Some(&[1.0f32, 2.0][..]));
        assert!(embedded[0].embedded_at.is_some());

        let cached = store.cached_embeddings(&[hash.clone()]).await.unwrap();
        assert_eq!(cached.get(&hash), Some(&vec![1.0f32, 2.0]));
    }

    #[tokio::test]
    async fn test_set_embedding_rejects_empty_vector() {
        let (_tmp, store) = test_store().await;
        ingest(&store, &doc("d1", "file:///a.txt", Some("text"))).await;
        let hash = content_hash("text");
        assert!(!store.set_embedding("d1", &hash, &[], "m").await.unwrap());
        assert!(store.cached_embeddings(&[hash]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_entries_keeps_unchanged_vectors() {
        let (_tmp, store) = test_store().await;
        let d = doc("d1", "file:///a.txt", Some("stable text"));
        ingest(&store, &d).await;
        store
            .set_embedding("d1", &content_hash("stable text"), &[0.5, 0.5], "m")
            .await
            .unwrap();

        let outcome = ingest(&store, &d).await;
        assert_eq!(outcome.unchanged, 1);
        assert_eq!(outcome.created, 0);
        assert_eq!(store.count_embedded().await.unwrap(), 1);

        let changed = doc("d1", "file:///a.txt", Some("new text"));
        let outcome = ingest(&store, &changed).await;
        assert_eq!(outcome.updated, 1);
        assert_eq!(store.count_embedded().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_entries_removes_vanished_windows() {
        let (_tmp, store) = test_store().await;
        let long = "x".repeat(2500);
        ingest(&store, &doc("d1", "file:///a.txt", Some(&long))).await;
        assert_eq!(store.pending_entries(None, 5).await.unwrap().len(), 3);

        let outcome = ingest(&store, &doc("d1", "file:///a.txt", Some("short now"))).await;
        assert_eq!(outcome.removed, 3);
        assert_eq!(outcome.created, 1);
        let ids: Vec<String> = store
            .pending_entries(None, 5)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["d1".to_string()]);
    }

    #[tokio::test]
    async fn test_failures_park_entries() {
        let (_tmp, store) = test_store().await;
        ingest(&store, &doc("d1", "file:///a.txt", Some("one"))).await;
        ingest(&store, &doc("d2", "file:///b.txt", Some("two"))).await;

        let ids = vec!["d1".to_string()];
        store.record_embed_failure(&ids).await.unwrap();
        store.record_embed_failure(&ids).await.unwrap();

        let pending = store.pending_entries(None, 2).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "d2");

        let stats = store.corpus_stats(2).await.unwrap();
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.parked, 1);

        let report = store.repair_embeddings(None).await.unwrap();
        assert_eq!(report.attempts_reset, 1);
        assert_eq!(store.pending_entries(None, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_repair_scoped_to_modality() {
        let (_tmp, store) = test_store().await;
        let mut scan = doc("p1", "s3://b/p1.pdf", Some("scanned page"));
        scan.modality = "pdf".to_string();
        ingest(&store, &scan).await;
        ingest(&store, &doc("t1", "file:///t1.txt", Some("plain text"))).await;
        sqlx::query("UPDATE corpus_entries SET embedding = x'', embed_attempts = 5")
            .execute(store.pool())
            .await
            .unwrap();

        let report = store.repair_embeddings(Some("pdf")).await.unwrap();
        assert_eq!(report.emptied_to_null, 1);
        assert_eq!(report.attempts_reset, 1);
        let ids: Vec<String> = store
            .pending_entries(None, 5)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["p1".to_string()]);

        let report = store.repair_embeddings(None).await.unwrap();
        assert_eq!(report.emptied_to_null, 1);
        assert_eq!(store.pending_entries(None, 5).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_limit() {
        let (_tmp, store) = test_store().await;
        for i in 0..4 {
            let id = format!("d{}", i);
            ingest(&store, &doc(&id, &format!("file:///{}", i), Some(&id))).await;
        }
        assert_eq!(store.pending_entries(Some(3), 5).await.unwrap().len(), 3);
        assert_eq!(store.pending_entries(None, 5).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_get_entries_preserves_request_order() {
        let (_tmp, store) = test_store().await;
        ingest(&store, &doc("a", "file:///a", Some("aaa"))).await;
        ingest(&store, &doc("b", "file:///b", Some("bbb"))).await;
        let ids = vec!["b".to_string(), "missing".to_string(), "a".to_string()];
        let got: Vec<String> = store
            .get_entries(&ids)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(got, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_validate_reports_duplicate_uris() {
        let (_tmp, store) = test_store().await;
        store
            .upsert_document(&doc("d1", "file:///same", Some("x")))
            .await
            .unwrap();
        store
            .upsert_document(&doc("d2", "file:///same", None))
            .await
            .unwrap();
        let report = store.validate_documents().await.unwrap();
        assert_eq!(report.documents, 2);
        assert_eq!(report.duplicate_uris, vec![("file:///same".to_string(), 2)]);
        assert_eq!(report.documents_without_text, 1);
    }

    #[tokio::test]
    async fn test_index_meta_and_snapshot_persist() {
        let (_tmp, store) = test_store().await;
        assert_eq!(store.load_index_meta().await.unwrap(), IndexMeta::default());
        assert!(store.load_index_snapshot().await.unwrap().is_none());

        let meta = IndexMeta {
            state: IndexState::Ready,
            built_at: Some(1_700_000_000),
            size_at_build: 42,
            embedded_since_build: 3,
            dims: Some(2),
            nlist: 6,
        };
        store.save_index_meta(&meta).await.unwrap();
        assert_eq!(store.load_index_meta().await.unwrap(), meta);

        let snapshot = IndexSnapshot {
            dims: 2,
            centroids: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
        };
        store.save_index_snapshot(&snapshot).await.unwrap();
        let loaded = store.load_index_snapshot().await.unwrap().unwrap();
        assert_eq!(loaded.dims, 2);
        assert_eq!(loaded.centroids.len(), 2);
    }
}
