use crate::Version;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Optimistic concurrency check failed for `key`.
    #[error("Could not save {key} with version {attempted}, current version is {current}")]
    Concurrency {
        key: String,
        attempted: Version,
        current: CurrentVersion,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Maintenance already in progress")]
    MaintenanceInProgress,

    #[error("Compaction error: {0}")]
    CompactionError(String),

    #[error("Timed out waiting for result")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Version found in the store when a concurrency check fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentVersion {
    Missing,
    Live(Version),
    Deleted(Version),
}

impl std::fmt::Display for CurrentVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CurrentVersion::Missing => write!(f, "<missing>"),
            CurrentVersion::Live(v) => write!(f, "{}", v),
            CurrentVersion::Deleted(v) => write!(f, "{} (deleted)", v),
        }
    }
}

impl Error {
    /// Returns a stable error code for this error variant.
    /// These codes are stable and can be used by clients for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "IO_ERROR",
            Error::Corruption(_) => "CORRUPTION",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Concurrency { .. } => "CONCURRENCY_CONFLICT",
            Error::Codec(_) => "CODEC_ERROR",
            Error::ShuttingDown => "SHUTTING_DOWN",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::MaintenanceInProgress => "MAINTENANCE_IN_PROGRESS",
            Error::CompactionError(_) => "COMPACTION_ERROR",
            Error::Timeout => "TIMEOUT",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error is potentially retryable as-is.
    ///
    /// A concurrency conflict is not: the caller has to re-read the entity
    /// and retry with the fresh version.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Retryable errors (transient)
            Error::Io(_) => true,
            Error::MaintenanceInProgress => true,
            Error::CompactionError(_) => true,
            Error::Timeout => true,

            // Non-retryable errors (logical/permanent)
            Error::Corruption(_) => false,
            Error::InvalidArgument(_) => false,
            Error::Concurrency { .. } => false,
            Error::Codec(_) => false,
            Error::ShuttingDown => false,
            Error::InvalidState(_) => false,
            Error::Internal(_) => false,
        }
    }

    /// True for optimistic concurrency failures.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Error::Concurrency { .. })
    }

    /// Adds context to an error by wrapping it in an Internal error.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rkv_core::Error;
    ///
    /// fn append() -> Result<(), Error> {
    ///     Err(Error::Io(std::io::Error::new(
    ///         std::io::ErrorKind::Other,
    ///         "disk full"
    ///     )))
    /// }
    ///
    /// fn save_record() -> Result<(), Error> {
    ///     append().map_err(|e| e.with_context("failed to append record"))
    /// }
    /// ```
    pub fn with_context(self, context: &str) -> Error {
        Error::Internal(format!("{}: {}", context, self))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
