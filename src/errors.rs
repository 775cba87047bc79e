use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::downloader::TaskId;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Errors produced by the download core and its collaborators.
///
/// Resolution and transfer errors never cross the task boundary: they end up
/// as a single `Failed` event. Expansion errors abort one submission, lookup
/// errors are handed back to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Expansion error: {0}")]
    Expansion(String),

    #[error("Unknown task: {0}")]
    Lookup(TaskId),
}

impl DownloadError {
    pub fn resolution(msg: impl Into<String>) -> Self {
        Self::Resolution(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::Transfer(msg.into())
    }

    pub fn expansion(msg: impl Into<String>) -> Self {
        Self::Expansion(msg.into())
    }

    /// Reason code carried by a `Failed` event.
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Resolution(_) => FailureReason::ResolutionError,
            Self::Transfer(_) => FailureReason::TransferError,
            Self::Expansion(_) => FailureReason::ExpansionError,
            Self::Lookup(_) => FailureReason::LookupError,
        }
    }
}

/// Machine-readable failure code, stable enough for a UI to map to a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ResolutionError,
    TransferError,
    ExpansionError,
    LookupError,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureReason::ResolutionError => "resolution error",
            FailureReason::TransferError => "transfer error",
            FailureReason::ExpansionError => "expansion error",
            FailureReason::LookupError => "lookup error",
        };
        f.write_str(text)
    }
}
