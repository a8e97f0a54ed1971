//! `grepctl status` and the `grepctl fix` maintenance commands.

use anyhow::Result;

use crate::config::Config;
use crate::engine::open_engine;

pub async fn run_status(config: &Config) -> Result<()> {
    let engine = open_engine(config).await?;
    let status = engine.status().await?;
    let c = &status.corpus;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("grepctl status");
    println!("  database:  {} ({} bytes)", config.db.path.display(), db_size);
    println!("  documents: {}", c.documents);
    println!("  entries:   {}", c.entries);
    println!(
        "  embedded:  {} / {} ({}%)",
        c.embedded,
        c.entries,
        if c.entries > 0 {
            (c.embedded * 100) / c.entries
        } else {
            0
        }
    );
    println!("  pending:   {}", c.pending);
    if c.parked > 0 {
        println!("  parked:    {} (run `grepctl fix stuck` to retry)", c.parked);
    }
    println!("  index:     {}", status.index.state.as_str());
    Ok(())
}

/// Normalize empty vectors to NULL and reset retry counters, optionally
/// for one modality only.
pub async fn run_fix_stuck(config: &Config, modality: Option<&str>) -> Result<()> {
    let engine = open_engine(config).await?;
    let report = engine.repair(modality).await?;
    match modality {
        Some(m) => println!("fix stuck (modality: {})", m),
        None => println!("fix stuck"),
    }
    println!("  empty vectors cleared: {}", report.emptied_to_null);
    println!("  retry counters reset: {}", report.attempts_reset);
    Ok(())
}

pub async fn run_fix_validate(config: &Config) -> Result<()> {
    let engine = open_engine(config).await?;
    let report = engine.validate().await?;
    println!("fix validate");
    println!("  documents: {}", report.documents);
    println!("  without text: {}", report.documents_without_text);
    if report.duplicate_uris.is_empty() {
        println!("  duplicate uris: none");
    } else {
        println!("  duplicate uris: {}", report.duplicate_uris.len());
        for (uri, n) in &report.duplicate_uris {
            println!("    {} ({} documents)", uri, n);
        }
    }
    Ok(())
}
