//! Fault classification of replica replies
//!
//! A reply error is either a logical result of the request (the replica
//! processed it and said "not found", for example) or a fault that says the
//! replica can no longer be trusted. Only faults take a replica out of the
//! functional set.

use quorumio_common::{Error, MsgType};

/// Decides whether a replica error is fault-inducing
pub trait ErrorClassifier: Send + Sync {
    /// Name for logging
    fn name(&self) -> &str;

    /// True if `error` returned for a `msg_type` request should mark the
    /// replica offline
    fn is_fault(&self, msg_type: MsgType, error: &Error) -> bool;
}

/// Classifier that treats a fixed set of logical errors as non-faults
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorClassifier;

impl DefaultErrorClassifier {
    /// Errors that are results, not faults
    #[must_use]
    pub const fn is_logical(error: &Error) -> bool {
        matches!(
            error,
            Error::CatalogEntryNotFound
                | Error::BlobNotFound(_)
                | Error::BlobOffsetInvalid
                | Error::InvalidArgument(_)
                | Error::OpNotAllowed(_)
                | Error::VolumeAccessDenied
        )
    }
}

impl ErrorClassifier for DefaultErrorClassifier {
    fn name(&self) -> &str {
        "default"
    }

    fn is_fault(&self, _msg_type: MsgType, error: &Error) -> bool {
        !Self::is_logical(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_errors_are_not_faults() {
        let classifier = DefaultErrorClassifier;
        for error in [
            Error::CatalogEntryNotFound,
            Error::BlobNotFound("b".into()),
            Error::BlobOffsetInvalid,
            Error::invalid_argument("bad"),
            Error::OpNotAllowed("tx".into()),
            Error::VolumeAccessDenied,
        ] {
            assert!(
                !classifier.is_fault(MsgType::UpdateCatalog, &error),
                "{}",
                error
            );
        }
    }

    #[test]
    fn test_io_errors_are_faults() {
        let classifier = DefaultErrorClassifier;
        assert!(classifier.is_fault(MsgType::UpdateCatalog, &Error::Timeout));
        assert!(classifier.is_fault(MsgType::QueryCatalog, &Error::transport("reset")));
        assert!(classifier.is_fault(
            MsgType::CommitBlobTx,
            &Error::OutOfOrder {
                expected: 2,
                actual: 3
            }
        ));
    }
}
