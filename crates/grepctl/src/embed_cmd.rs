//! `grepctl embed pending`: backfill entries that have no vector yet.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::engine::open_engine;

pub async fn run_embed_pending(config: &Config, limit: Option<usize>) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let engine = open_engine(config).await?;
    let report = engine.backfill(limit).await?;

    println!("embed pending");
    if report.pending == 0 {
        println!("  all entries up to date");
        return Ok(());
    }
    println!("  pending: {}", report.pending);
    println!("  embedded: {}", report.embedded);
    println!("  from cache: {}", report.dedup_hits);
    println!("  failed: {}", report.failed);
    println!(
        "  batches: {} ({} failed)",
        report.batches, report.failed_batches
    );
    Ok(())
}
