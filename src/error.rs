//! Error taxonomy for overlay operations.

use thiserror::Error;

use crate::group::GroupId;
use crate::identity::NodeId;
use crate::messages::MessageId;

/// Opaque failure reported by the security collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CryptoError(pub String);

impl CryptoError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OverlayError {
    /// Transport could not reach the address. Retryable.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The security collaborator rejected an operation. Never retried.
    #[error("crypto failure: {0}")]
    CryptoFailure(#[from] CryptoError),

    /// Routing or group update older than local state; discarded.
    #[error("stale update: {0}")]
    StaleUpdate(String),

    #[error("routing table is empty")]
    EmptyTable,

    #[error("no route to {0:?}")]
    RouteNotFound(NodeId),

    #[error("delivery of {message_id} exhausted after {retries} retries")]
    DeliveryExhausted { message_id: MessageId, retries: u32 },

    /// Some contacts are unreachable; broadcasts to them are suspended.
    #[error("partition detected: {unreachable} contacts unreachable")]
    PartitionDetected { unreachable: usize },

    #[error("lookup cancelled")]
    LookupCancelled,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not permitted: {0}")]
    NotPermitted(String),

    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    #[error("node is shut down")]
    Shutdown,
}

impl OverlayError {
    /// Whether the condition may clear up on its own and is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OverlayError::Unreachable(_)
                | OverlayError::EmptyTable
                | OverlayError::RouteNotFound(_)
                | OverlayError::LookupCancelled
        )
    }
}

impl From<bincode::Error> for OverlayError {
    fn from(err: bincode::Error) -> Self {
        OverlayError::Codec(err.to_string())
    }
}

pub type Result<T, E = OverlayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(OverlayError::Unreachable("x".into()).is_retryable());
        assert!(OverlayError::EmptyTable.is_retryable());
        assert!(!OverlayError::CryptoFailure(CryptoError::new("bad key")).is_retryable());
        assert!(!OverlayError::StaleUpdate("seq".into()).is_retryable());
    }

    #[test]
    fn crypto_error_converts() {
        let err: OverlayError = CryptoError::new("verify").into();
        assert_eq!(err.to_string(), "crypto failure: verify");
    }
}
