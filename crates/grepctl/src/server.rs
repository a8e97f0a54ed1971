//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/search` | Run a query through the full pipeline |
//! | `POST` | `/index/rebuild` | Train and swap in a fresh approximate index |
//! | `GET`  | `/status` | Corpus counts and index metadata |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `embeddings_disabled` (400),
//! `timeout` (408), `internal` (500).

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use grepctl_core::error::QueryError;
use grepctl_core::models::{SearchFilters, SearchQuery};
use grepctl_core::retrieval::IndexMeta;
use grepctl_core::search::{EngineStatus, SearchEngine, SearchOutcome};

use crate::config::Config;
use crate::engine::open_engine;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<SearchEngine>,
    default_top_k: usize,
}

impl AppState {
    pub fn new(engine: Arc<SearchEngine>, default_top_k: usize) -> Self {
        Self {
            engine,
            default_top_k,
        }
    }
}

/// `grepctl serve`: bind `[server].bind` and serve until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Arc::new(open_engine(config).await?);
    let app = router(AppState::new(engine, config.retrieval.default_top_k));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "server listening");
    println!("grepctl server listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/search", post(handle_search))
        .route("/index/rebuild", post(handle_rebuild))
        .route("/status", get(handle_status))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(q) = err.downcast_ref::<QueryError>() {
            return AppError {
                status: StatusCode::BAD_REQUEST,
                code: "bad_request",
                message: q.to_string(),
            };
        }
        let message = format!("{:#}", err);
        if message.contains("provider is disabled") {
            AppError {
                status: StatusCode::BAD_REQUEST,
                code: "embeddings_disabled",
                message,
            }
        } else if message.contains("timed out") {
            AppError {
                status: StatusCode::REQUEST_TIMEOUT,
                code: "timeout",
                message,
            }
        } else {
            error!(error = %message, "request failed");
            AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message,
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /search ============

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub start_ts: Option<i64>,
    #[serde(default)]
    pub end_ts: Option<i64>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub rerank: bool,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchOutcome>, AppError> {
    let query = SearchQuery {
        text: req.query,
        top_k: req.top_k.unwrap_or(state.default_top_k),
        filters: SearchFilters {
            sources: req.sources,
            start_ts: req.start_ts,
            end_ts: req.end_ts,
            regex: req.regex,
        },
        rerank: req.rerank,
    };
    Ok(Json(state.engine.search(&query).await?))
}

// ============ POST /index/rebuild ============

async fn handle_rebuild(State(state): State<AppState>) -> Result<Json<IndexMeta>, AppError> {
    Ok(Json(state.engine.rebuild_index().await?))
}

// ============ GET /status ============

async fn handle_status(State(state): State<AppState>) -> Result<Json<EngineStatus>, AppError> {
    Ok(Json(state.engine.status().await?))
}
