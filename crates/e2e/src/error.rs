//! Error types for the harness

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the harness Error
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("condition not met after {waited:?}: {last}")]
    PollTimeout { waited: Duration, last: String },

    #[error("poll cancelled: {last}")]
    PollCancelled { last: String },

    #[error("{url} did not become ready after {waited:?}: {last}")]
    ReadinessTimeout {
        url: String,
        waited: Duration,
        last: String,
    },

    #[error("probe of {url} failed: {reason}")]
    ProbeFailed { url: String, reason: String },

    #[error("expected exit code {expected}, got {actual}:\n{output}")]
    UnexpectedExitCode {
        expected: i32,
        actual: i32,
        output: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
