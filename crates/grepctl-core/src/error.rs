//! Request-boundary errors.
//!
//! Everything else in the crate reports failures as [`anyhow::Error`].
//! A [`QueryError`] means the request itself was malformed: it is raised
//! before any retrieval work starts, and frontends can recover it with
//! `err.downcast_ref::<QueryError>()` to answer with a user-facing message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query must not be empty")]
    EmptyQuery,

    #[error("top_k must be >= 1")]
    InvalidTopK,

    #[error("invalid regex filter `{pattern}`: {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("invalid time range: start {start} is after end {end}")]
    InvalidTimeRange { start: i64, end: i64 },
}
