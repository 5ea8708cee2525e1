//! Dispatch error types and protocol status codes.

use ferry_vfs::VfsError;
use thiserror::Error;

use crate::quota::QuotaError;

/// Protocol-level outcome of a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum StatusCode {
    /// Handled, no further data.
    Ok,
    /// Authorization failed.
    PermissionDenied,
    /// Nothing exists at the path.
    NoSuchFile,
    /// Generic failure. Also carries quota denials, the protocol has no
    /// dedicated code for them.
    Failure,
    /// Operation not recognized, or wrong kind of target.
    OpUnsupported,
}

/// Errors returned by the request dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The user lacks the permission for this operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The file name is rejected by the user's allow-list.
    #[error("path not allowed: {0}")]
    NotAllowedPath(String),

    /// Quota budget exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Storage-layer failure.
    #[error(transparent)]
    Backend(#[from] VfsError),

    /// Unknown operation, or a directory where a file is required.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Generic failure.
    #[error("failure: {0}")]
    Failure(String),

    /// Resume arithmetic on the quota budget went negative.
    #[error("inconsistent quota state: remaining {remaining} bytes, {existing} bytes already stored")]
    InconsistentQuotaState { remaining: u64, existing: u64 },

    /// A write landed below the transfer's minimum offset.
    #[error("invalid write offset {offset}, minimum is {min}")]
    InvalidOffset { offset: u64, min: u64 },

    /// The transfer was aborted before it completed.
    #[error("transfer aborted: {0}")]
    TransferAborted(String),
}

impl DispatchError {
    /// Create a PermissionDenied error.
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a NotAllowedPath error.
    pub fn not_allowed(path: impl Into<String>) -> Self {
        Self::NotAllowedPath(path.into())
    }

    /// Create a QuotaExceeded error.
    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    /// Create an Unsupported error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a Failure error.
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into())
    }

    /// Map to the protocol status code.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::PermissionDenied(_) | Self::NotAllowedPath(_) => StatusCode::PermissionDenied,
            Self::Backend(e) if e.is_not_found() => StatusCode::NoSuchFile,
            Self::Backend(e) if e.is_permission_denied() => StatusCode::PermissionDenied,
            Self::Backend(_) => StatusCode::Failure,
            Self::Unsupported(_) => StatusCode::OpUnsupported,
            Self::QuotaExceeded(_)
            | Self::Failure(_)
            | Self::InconsistentQuotaState { .. }
            | Self::InvalidOffset { .. }
            | Self::TransferAborted(_) => StatusCode::Failure,
        }
    }
}

impl From<QuotaError> for DispatchError {
    fn from(e: QuotaError) -> Self {
        match e {
            QuotaError::InconsistentState {
                remaining,
                existing,
            } => Self::InconsistentQuotaState {
                remaining,
                existing,
            },
            QuotaError::Ledger(msg) => Self::Failure(msg),
        }
    }
}

/// Dispatch result type.
pub type DispatchResult<T> = Result<T, DispatchError>;
