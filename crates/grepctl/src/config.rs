//! Configuration parsing and validation.
//!
//! grepctl is configured via a TOML file (default `config/grepctl.toml`).
//! Only `[db]` is required; every other section falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/grepctl.sqlite"
//!
//! [chunking]
//! short_threshold = 2000
//! window = 1200
//! stride = 1000
//!
//! [embedding]
//! provider = "openai"            # disabled | openai | ollama | local
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [rerank]
//! provider = "disabled"          # disabled | openai | ollama
//!
//! [retrieval]
//! default_top_k = 10
//!
//! [index]
//! approximate_threshold = 5000
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! ```
//!
//! API keys are read from the environment (`OPENAI_API_KEY`), never from
//! the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use grepctl_core::backfill::{BackfillOptions, MAX_BATCH_SIZE};
use grepctl_core::chunk::ChunkPolicy;
use grepctl_core::rerank::RerankOptions;
use grepctl_core::retrieval::ivf::{DEFAULT_ITERATIONS, MAX_NLIST};
use grepctl_core::retrieval::RetrievalParams;
use grepctl_core::search::{EngineConfig, IndexParams};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_short_threshold")]
    pub short_threshold: usize,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            short_threshold: default_short_threshold(),
            window: default_window(),
            stride: default_stride(),
        }
    }
}

fn default_short_threshold() -> usize {
    2000
}
fn default_window() -> usize {
    1200
}
fn default_stride() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, or an OpenAI-compatible endpoint).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_embed_concurrency(),
            max_attempts: default_max_attempts(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Upper bound for one provider call including every retry and its
    /// backoff sleep.
    pub fn call_deadline(&self) -> Duration {
        let attempts = self.max_retries as u64 + 1;
        let backoff: u64 = (1..attempts).map(|a| 1u64 << (a - 1).min(5)).sum();
        Duration::from_secs(self.timeout_secs * attempts + backoff)
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_embed_concurrency() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    5
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    #[serde(default = "default_rerank_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_rerank_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            snippet_chars: default_snippet_chars(),
            concurrency: default_rerank_concurrency(),
            max_candidates: default_max_candidates(),
            timeout_secs: default_rerank_timeout_secs(),
        }
    }
}

impl RerankConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_snippet_chars() -> usize {
    1500
}
fn default_rerank_concurrency() -> usize {
    8
}
fn default_max_candidates() -> usize {
    50
}
fn default_rerank_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    #[serde(default = "default_floor_k")]
    pub floor_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            overfetch_factor: default_overfetch_factor(),
            floor_k: default_floor_k(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_overfetch_factor() -> usize {
    5
}
fn default_floor_k() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_approximate_threshold")]
    pub approximate_threshold: usize,
    #[serde(default = "default_min_train_size")]
    pub min_train_size: usize,
    /// Fixed list count. Unset picks `sqrt(n)`.
    #[serde(default)]
    pub nlist: Option<usize>,
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
    #[serde(default = "default_stale_fraction")]
    pub stale_fraction: f64,
    #[serde(default = "default_auto_rebuild")]
    pub auto_rebuild: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            approximate_threshold: default_approximate_threshold(),
            min_train_size: default_min_train_size(),
            nlist: None,
            nprobe: default_nprobe(),
            stale_fraction: default_stale_fraction(),
            auto_rebuild: default_auto_rebuild(),
        }
    }
}

fn default_approximate_threshold() -> usize {
    5000
}
fn default_min_train_size() -> usize {
    5000
}
fn default_nprobe() -> usize {
    10
}
fn default_stale_fraction() -> f64 {
    0.2
}
fn default_auto_rebuild() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    pub fn chunk_policy(&self) -> ChunkPolicy {
        ChunkPolicy {
            short_threshold: self.chunking.short_threshold,
            window: self.chunking.window,
            stride: self.chunking.stride,
        }
    }

    /// Translate the file settings into core engine parameters.
    pub fn engine_config(&self) -> EngineConfig {
        let deadline = self.embedding.call_deadline();
        EngineConfig {
            chunking: self.chunk_policy(),
            backfill: BackfillOptions {
                batch_size: self.embedding.batch_size,
                concurrency: self.embedding.concurrency,
                max_attempts: self.embedding.max_attempts,
                timeout: deadline,
                limit: None,
            },
            retrieval: RetrievalParams {
                overfetch_factor: self.retrieval.overfetch_factor,
                floor_k: self.retrieval.floor_k,
                approximate_threshold: self.index.approximate_threshold,
                nprobe: self.index.nprobe,
            },
            index: IndexParams {
                min_train_size: self.index.min_train_size,
                nlist: self.index.nlist,
                iterations: DEFAULT_ITERATIONS,
                stale_fraction: self.index.stale_fraction,
                auto_rebuild: self.index.auto_rebuild,
            },
            rerank: RerankOptions {
                snippet_chars: self.rerank.snippet_chars,
                concurrency: self.rerank.concurrency,
                timeout: Duration::from_secs(self.rerank.timeout_secs),
                max_candidates: self.rerank.max_candidates,
            },
            query_timeout: deadline,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    config.chunk_policy().validate()?;

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.provider != "local" {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        if config.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0");
        }
    }
    if config.embedding.batch_size == 0 || config.embedding.batch_size > MAX_BATCH_SIZE {
        bail!("embedding.batch_size must be in 1..={}", MAX_BATCH_SIZE);
    }
    if config.embedding.concurrency == 0 {
        bail!("embedding.concurrency must be >= 1");
    }
    if config.embedding.max_attempts == 0 {
        bail!("embedding.max_attempts must be >= 1");
    }

    // Rerank
    match config.rerank.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown rerank provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.rerank.is_enabled() && config.rerank.model.is_none() {
        bail!(
            "rerank.model must be specified when provider is '{}'",
            config.rerank.provider
        );
    }
    if config.rerank.concurrency == 0 {
        bail!("rerank.concurrency must be >= 1");
    }
    if config.rerank.snippet_chars == 0 {
        bail!("rerank.snippet_chars must be > 0");
    }

    // Retrieval
    if config.retrieval.default_top_k == 0 {
        bail!("retrieval.default_top_k must be >= 1");
    }
    if config.retrieval.overfetch_factor == 0 {
        bail!("retrieval.overfetch_factor must be >= 1");
    }

    // Index
    if config.index.nprobe == 0 {
        bail!("index.nprobe must be >= 1");
    }
    if let Some(nlist) = config.index.nlist {
        if nlist == 0 || nlist > MAX_NLIST {
            bail!("index.nlist must be in 1..={}", MAX_NLIST);
        }
    }
    if !(config.index.stale_fraction > 0.0) {
        bail!("index.stale_fraction must be > 0.0");
    }

    Ok(config)
}
