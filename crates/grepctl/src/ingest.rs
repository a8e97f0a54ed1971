//! Ingestion of extracted documents from JSON Lines.
//!
//! Each line is one extraction-service record:
//!
//! ```json
//! {"doc_id": "a1", "uri": "s3://bucket/a.pdf", "modality": "pdf", "source": "pdf",
//!  "created_at": "2024-03-01T12:00:00Z", "text_content": "…", "metadata": {"pages": 3}}
//! ```
//!
//! `doc_id` may be omitted, in which case a UUIDv5 of the `uri` is used so
//! that re-ingesting the same file yields the same id. `created_at` is
//! Unix seconds or an RFC 3339 string. Malformed lines are reported and
//! skipped; they never abort the run.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

use grepctl_core::models::Document;
use grepctl_core::search::IngestReport;

use crate::config::Config;
use crate::engine::open_engine;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Timestamp {
    Seconds(i64),
    Text(String),
}

impl Timestamp {
    fn to_unix(&self) -> Result<i64> {
        match self {
            Timestamp::Seconds(s) => Ok(*s),
            Timestamp::Text(t) => {
                if let Ok(s) = t.trim().parse::<i64>() {
                    return Ok(s);
                }
                let dt = chrono::DateTime::parse_from_rfc3339(t.trim())
                    .with_context(|| format!("invalid created_at '{}'", t))?;
                Ok(dt.timestamp())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DocumentRecord {
    #[serde(default)]
    doc_id: Option<String>,
    uri: String,
    #[serde(default = "default_modality")]
    modality: String,
    source: String,
    created_at: Timestamp,
    #[serde(default)]
    text_content: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

fn default_modality() -> String {
    "text".to_string()
}

impl DocumentRecord {
    fn into_document(self) -> Result<Document> {
        if self.uri.trim().is_empty() {
            bail!("uri must not be empty");
        }
        let doc_id = match self.doc_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => Uuid::new_v5(&Uuid::NAMESPACE_URL, self.uri.as_bytes()).to_string(),
        };
        let metadata = match self.metadata {
            None | Some(serde_json::Value::Null) => serde_json::json!({}),
            Some(m) => m,
        };
        Ok(Document {
            doc_id,
            uri: self.uri,
            modality: self.modality,
            source: self.source,
            created_at: self.created_at.to_unix()?,
            text_content: self.text_content,
            mime_type: self.mime_type,
            metadata,
        })
    }
}

/// Parse one JSONL line into a [`Document`].
pub fn parse_record(line: &str) -> Result<Document> {
    let record: DocumentRecord = serde_json::from_str(line)?;
    record.into_document()
}

/// Documents read from a JSONL file, plus the number of rejected lines.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub documents: Vec<Document>,
    pub rejected: usize,
}

pub fn read_documents(path: &Path) -> Result<ReadOutcome> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open input file: {}", path.display()))?;
    let mut out = ReadOutcome::default();

    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_record(&line) {
            Ok(doc) => out.documents.push(doc),
            Err(e) => {
                warn!(line = i + 1, error = %e, "skipping malformed record");
                out.rejected += 1;
            }
        }
    }
    Ok(out)
}

/// `grepctl ingest <file>`.
pub async fn run_ingest(config: &Config, path: &Path, no_embed: bool) -> Result<()> {
    let input = read_documents(path)?;
    let engine = open_engine(config).await?;

    let embed = !no_embed && config.embedding.is_enabled();
    let report = if embed {
        engine.ingest(&input.documents).await?
    } else {
        engine.load(&input.documents).await?
    };

    print_report(path, &input, &report, embed);
    Ok(())
}

fn print_report(path: &Path, input: &ReadOutcome, report: &IngestReport, embedded: bool) {
    println!("ingest {}", path.display());
    println!("  documents: {}", report.documents);
    if input.rejected > 0 {
        println!("  malformed lines skipped: {}", input.rejected);
    }
    println!("  without text: {}", report.skipped_no_text);
    println!("  failed: {}", report.failed_documents);
    println!(
        "  entries: {} created, {} updated, {} unchanged, {} removed",
        report.entries_created,
        report.entries_updated,
        report.entries_unchanged,
        report.entries_removed
    );
    if embedded {
        let b = &report.backfill;
        println!(
            "  embeddings: {} backfilled ({} from cache), {} failed",
            report.embeddings_backfilled(),
            b.dedup_hits,
            b.failed
        );
    } else {
        println!("  embeddings: skipped (run `grepctl embed pending` later)");
    }
    if let Some(state) = report.index_state {
        println!("  index: {}", state.as_str());
    }
    println!("ok");
}
