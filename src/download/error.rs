//! 下载错误分类。

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 单次传输 / 校验可能出现的错误。
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("filesystem error at {path}: {source}")]
    Filesystem { path: PathBuf, source: io::Error },
    #[error("rate limited by remote (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("authorization rejected: {0}")]
    Unauthorized(String),
    #[error("item not found: {0}")]
    NotFound(String),
    #[error("interrupted")]
    Interrupted,
}

/// Retry classification of a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    /// Retryable, but the remote suggested how long to wait.
    Throttled(Option<Duration>),
    Fatal,
    Interrupted,
}

impl TransferError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::Network(_)
            | TransferError::Timeout(_)
            | TransferError::Integrity(_)
            | TransferError::Filesystem { .. } => FailureKind::Retryable,
            TransferError::RateLimited { retry_after } => FailureKind::Throttled(*retry_after),
            TransferError::Unauthorized(_) | TransferError::NotFound(_) => FailureKind::Fatal,
            TransferError::Interrupted => FailureKind::Interrupted,
        }
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Filesystem {
            path: path.into(),
            source,
        }
    }
}
