use std::io;

use thiserror::Error;

/// Result type used throughout the archival pipeline.
pub type Result<T> = std::result::Result<T, PandaError>;

/// Error type covering every failure the archival pipeline can produce.
///
/// Recoverable failures (network hiccups, transient parse errors) are retried
/// by the mode orchestrators; everything else aborts the run.
#[derive(Error, Debug)]
pub enum PandaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed executing network request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("unexpected JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unexpected content: {0}")]
    Parse(String),

    #[error("{0}")]
    Failed(String),
}

impl PandaError {
    pub fn config(message: impl Into<String>) -> Self {
        PandaError::Config(message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        PandaError::Parse(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        PandaError::Failed(message.into())
    }
}
