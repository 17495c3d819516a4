use std::fmt;

use thiserror::Error;

/// Failure reported by a byte source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Safe to retry once (connection reset, 5xx, upstream timeout).
    Transient,
    Permanent,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Transient => f.write_str("transient fetch error"),
            FetchErrorKind::Permanent => f.write_str("fetch error"),
        }
    }
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FetchErrorKind::Transient
    }
}

/// Errors surfaced by the media cache.
///
/// Cloneable because one single-flight outcome is shared by every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Disk full, permission problems, corrupt or missing blobs.
    #[error("cache io: {0}")]
    Io(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("fetch timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("fetch no longer needed")]
    Cancelled,
    #[error("cache is shut down")]
    Closed,
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        CacheError::Io(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlayerError {
    #[error("native player construction failed: {0}")]
    NativeConstruction(String),
    #[error("native player command failed: {0}")]
    Command(String),
}
