//! # grepctl CLI
//!
//! ```bash
//! grepctl --config ./config/grepctl.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `grepctl init` | Create the SQLite database and run schema migrations |
//! | `grepctl ingest <file.jsonl>` | Chunk, embed, and index extracted documents |
//! | `grepctl embed pending` | Backfill entries without vectors |
//! | `grepctl index rebuild\|verify\|status` | Manage the approximate index |
//! | `grepctl search "<query>"` | Search the corpus |
//! | `grepctl status` | Corpus and index overview |
//! | `grepctl fix stuck\|validate` | Maintenance |
//! | `grepctl serve` | Start the HTTP API |
//!
//! Logs go to stderr and are controlled with `RUST_LOG`
//! (default `grepctl=info`); command output goes to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use grepctl::search::SearchArgs;
use grepctl::{config, embed_cmd, index_cmd, ingest, migrate, search, server, stats};

/// grepctl: hybrid semantic search over extracted document corpora.
#[derive(Parser)]
#[command(
    name = "grepctl",
    about = "Hybrid semantic search over extracted document corpora",
    version,
    long_about = "grepctl chunks extracted documents, embeds them, and answers queries that \
    combine vector similarity, source/time/regex filters, and optional LLM reranking."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/grepctl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Ingest a JSON Lines file of extracted documents.
    ///
    /// Documents are chunked and their entries upserted; pending entries are
    /// then embedded and the approximate index rebuilt when due.
    Ingest {
        /// Path to the `.jsonl` file.
        file: PathBuf,

        /// Store documents and entries only; embed later with `embed pending`.
        #[arg(long)]
        no_embed: bool,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Manage the approximate nearest-neighbor index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Search the corpus.
    Search {
        /// The search query.
        query: String,

        /// Number of results (default `[retrieval].default_top_k`).
        #[arg(short = 'k', long = "top-k")]
        top_k: Option<usize>,

        /// Only return entries from this source (repeatable).
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Only entries created on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only entries created on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Regex the entry text must fully match (case-insensitive).
        #[arg(long)]
        regex: Option<String>,

        /// Rerank candidates with the configured scoring model.
        #[arg(long)]
        rerank: bool,

        /// Print the results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show corpus and index status.
    Status,

    /// Maintenance commands.
    Fix {
        #[command(subcommand)]
        action: FixAction,
    },

    /// Start the HTTP API server.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed entries that have no vector yet.
    Pending {
        /// Maximum number of entries to embed.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Train a fresh index over all embedded entries.
    Rebuild,
    /// Report per-source vector health.
    Verify,
    /// Show index state.
    Status,
}

#[derive(Subcommand)]
enum FixAction {
    /// Clear empty vectors and reset retry counters so parked entries retry.
    Stuck {
        /// Only repair entries of this modality (e.g. `pdf`, `image`).
        #[arg(long)]
        modality: Option<String>,
    },
    /// Report duplicate URIs and documents without text.
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("grepctl=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file, no_embed } => {
            ingest::run_ingest(&cfg, &file, no_embed).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit } => {
                embed_cmd::run_embed_pending(&cfg, limit).await?;
            }
        },
        Commands::Index { action } => match action {
            IndexAction::Rebuild => index_cmd::run_rebuild(&cfg).await?,
            IndexAction::Verify => index_cmd::run_verify(&cfg).await?,
            IndexAction::Status => index_cmd::run_status(&cfg).await?,
        },
        Commands::Search {
            query,
            top_k,
            sources,
            since,
            until,
            regex,
            rerank,
            json,
        } => {
            let args = SearchArgs {
                query,
                top_k,
                sources,
                since,
                until,
                regex,
                rerank,
                json,
            };
            search::run_search(&cfg, &args).await?;
        }
        Commands::Status => stats::run_status(&cfg).await?,
        Commands::Fix { action } => match action {
            FixAction::Stuck { modality } => {
                stats::run_fix_stuck(&cfg, modality.as_deref()).await?
            }
            FixAction::Validate => stats::run_fix_validate(&cfg).await?,
        },
        Commands::Serve => server::run_server(&cfg).await?,
    }

    Ok(())
}
