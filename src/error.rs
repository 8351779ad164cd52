//! Error taxonomy of the export pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessError;
use crate::storage::StorageError;

pub type ExportResult<T> = Result<T, ExportError>;

/// Every way an export job can fail. All variants abort the job; there is no
/// partial success.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Malformed request (blank title, empty timeline, ...).
    #[error("{0}")]
    Validation(String),

    /// The timeline references a source the catalog does not know.
    #[error("unknown clip source: {0}")]
    UnknownSource(String),

    /// The source exists but has no stored media to download.
    #[error("clip source {0} has no stored media")]
    MissingStorageKey(String),

    /// Operator configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("database error: {0}")]
    Database(String),

    #[error("export did not finish within {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExportError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn database(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }

    /// True for failures caused by the request itself (reported as 4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::UnknownSource(_) | Self::MissingStorageKey(_)
        )
    }
}
