//! Error types for QuorumIO
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for QuorumIO operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for QuorumIO
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Volume group errors
    #[error("volume group not open")]
    GroupNotOpen,

    #[error("volume group is down")]
    GroupDown,

    #[error("volume group has no functional replicas")]
    GroupInvalid,

    #[error("volume not activated: no coordinator has opened the group")]
    NotActivated,

    #[error("invalid coordinator")]
    InvalidCoordinator,

    #[error("invalid version: expected {expected}, got {actual}")]
    InvalidVersion { expected: i64, actual: i64 },

    #[error("replay window miss: op {requested} outside [{oldest}, {latest}]")]
    ResyncRequired {
        requested: i64,
        oldest: i64,
        latest: i64,
    },

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("volume group handle is closed")]
    Closed,

    // Volume / blob errors
    #[error("volume not found: {0}")]
    VolumeNotFound(u64),

    #[error("volume access denied")]
    VolumeAccessDenied,

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("catalog entry not found")]
    CatalogEntryNotFound,

    #[error("blob offset invalid")]
    BlobOffsetInvalid,

    #[error("operation not allowed: {0}")]
    OpNotAllowed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Network/RPC errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timeout")]
    Timeout,

    #[error("replica unavailable: {0}")]
    ReplicaUnavailable(String),

    #[error("out of order op: expected {expected}, got {actual}")]
    OutOfOrder { expected: i64, actual: i64 },

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::Transport(_)
                | Self::ReplicaUnavailable(_)
                | Self::GroupNotOpen
                | Self::NotReady(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::VolumeNotFound(_)
                | Self::BlobNotFound(_)
                | Self::CatalogEntryNotFound
                | Self::BlobOffsetInvalid
        )
    }

    /// Check if the error means the group cannot take requests right now
    #[must_use]
    pub fn is_group_unavailable(&self) -> bool {
        matches!(
            self,
            Self::GroupNotOpen | Self::GroupDown | Self::GroupInvalid | Self::Closed
        )
    }

    /// Stable error code used in diagnostics and replica replies
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::GroupNotOpen => "ERR_VOLUMEGROUP_NOT_OPEN",
            Self::GroupDown => "ERR_VOLUMEGROUP_DOWN",
            Self::GroupInvalid => "ERR_VOLUMEGROUP_INVALID",
            Self::NotActivated => "ERR_VOL_NOT_ACTIVATED",
            Self::InvalidCoordinator => "ERR_INVALID_COORDINATOR",
            Self::InvalidVersion { .. } => "ERR_INVALID_VERSION",
            Self::ResyncRequired { .. } => "ERR_RESYNC_REQUIRED",
            Self::NotReady(_) => "ERR_NOT_READY",
            Self::Closed => "ERR_HANDLE_CLOSED",
            Self::VolumeNotFound(_) => "ERR_VOL_NOT_FOUND",
            Self::VolumeAccessDenied => "ERR_VOLUME_ACCESS_DENIED",
            Self::BlobNotFound(_) => "ERR_BLOB_NOT_FOUND",
            Self::CatalogEntryNotFound => "ERR_CAT_ENTRY_NOT_FOUND",
            Self::BlobOffsetInvalid => "ERR_BLOB_OFFSET_INVALID",
            Self::OpNotAllowed(_) => "ERR_OP_NOT_ALLOWED",
            Self::InvalidArgument(_) => "ERR_INVALID_ARG",
            Self::Transport(_) => "ERR_TRANSPORT",
            Self::Timeout => "ERR_TIMEOUT",
            Self::ReplicaUnavailable(_) => "ERR_REPLICA_UNAVAILABLE",
            Self::OutOfOrder { .. } => "ERR_OUT_OF_ORDER",
            Self::Internal(_) => "ERR_INTERNAL",
            Self::Configuration(_) => "ERR_CONFIGURATION",
            Self::Serialization(_) => "ERR_SERIALIZATION",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::transport("reset").is_retryable());
        assert!(!Error::VolumeAccessDenied.is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::BlobNotFound("foo".into()).is_not_found());
        assert!(Error::CatalogEntryNotFound.is_not_found());
        assert!(!Error::GroupDown.is_not_found());
    }

    #[test]
    fn test_error_group_unavailable() {
        assert!(Error::GroupDown.is_group_unavailable());
        assert!(Error::GroupNotOpen.is_group_unavailable());
        assert!(!Error::Timeout.is_group_unavailable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::GroupDown.error_code(), "ERR_VOLUMEGROUP_DOWN");
        assert_eq!(
            Error::VolumeAccessDenied.error_code(),
            "ERR_VOLUME_ACCESS_DENIED"
        );
    }
}
