//! `grepctl index rebuild|verify|status`.

use anyhow::Result;

use grepctl_core::retrieval::IndexMeta;

use crate::config::Config;
use crate::engine::open_engine;

pub async fn run_rebuild(config: &Config) -> Result<()> {
    let engine = open_engine(config).await?;
    let meta = engine.rebuild_index().await?;
    println!("index rebuild");
    print_meta(&meta);
    Ok(())
}

pub async fn run_status(config: &Config) -> Result<()> {
    let engine = open_engine(config).await?;
    let status = engine.status().await?;
    println!("index status");
    print_meta(&status.index);
    println!("  loaded: {}", if status.index_loaded { "yes" } else { "no" });
    println!(
        "  embedded entries: {} (approximate search from {})",
        status.corpus.embedded, status.approximate_threshold
    );
    Ok(())
}

/// Per-source vector health. Returns an error when any vector is unusable
/// so scripts can gate on the exit status.
pub async fn run_verify(config: &Config) -> Result<()> {
    let engine = open_engine(config).await?;
    let health = engine.verify().await?;

    println!("index verify");
    if health.is_empty() {
        println!("  no entries");
        return Ok(());
    }
    println!(
        "  {:<20} {:>8} {:>8} {:>8} {:>8} {:>10}",
        "SOURCE", "TOTAL", "VALID", "NULL", "EMPTY", "WRONG_DIMS"
    );
    println!("  {}", "-".repeat(68));
    let mut bad = 0;
    for h in &health {
        println!(
            "  {:<20} {:>8} {:>8} {:>8} {:>8} {:>10}",
            h.source, h.total, h.valid, h.null, h.empty, h.wrong_dims
        );
        bad += h.empty + h.wrong_dims;
    }
    if bad > 0 {
        anyhow::bail!(
            "{} entries have unusable vectors; run `grepctl fix stuck` and re-embed",
            bad
        );
    }
    Ok(())
}

fn print_meta(meta: &IndexMeta) {
    println!("  state: {}", meta.state.as_str());
    match meta.built_at {
        Some(ts) => println!("  built: {}", format_ts(ts)),
        None => println!("  built: never"),
    }
    println!("  vectors at build: {}", meta.size_at_build);
    println!("  embedded since build: {}", meta.embedded_since_build);
    if let Some(dims) = meta.dims {
        println!("  dims: {}", dims);
    }
    if meta.nlist > 0 {
        println!("  lists: {}", meta.nlist);
    }
}

pub(crate) fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
