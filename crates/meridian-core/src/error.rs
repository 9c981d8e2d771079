//! Engine error kinds.
//!
//! Per-peer failures (`PeerUnresponsive`, `ChunkIntegrityMismatch`) are
//! normally absorbed by the component that owns the peer; the rest surface to
//! callers at the command/query boundary.

use crate::id::{ContentHash, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("peer {0} did not respond")]
    PeerUnresponsive(NodeId),

    #[error("lookup for {0} timed out")]
    LookupTimeout(crate::id::Id),

    #[error("no providers left for {0}")]
    ProviderExhausted(ContentHash),

    #[error("chunk {index} from {peer} failed integrity check")]
    ChunkIntegrityMismatch { index: u32, peer: NodeId },

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("unknown content {0}")]
    UnknownContent(ContentHash),

    #[error("cannot {action} a session that is {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    #[error("storage: {0}")]
    Storage(String),
}

impl EngineError {
    /// Transient per-peer failures that the owning component retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::PeerUnresponsive(_) | EngineError::ChunkIntegrityMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;

    #[test]
    fn transient_kinds() {
        assert!(EngineError::PeerUnresponsive(Id::ZERO).is_transient());
        assert!(EngineError::ChunkIntegrityMismatch { index: 1, peer: Id::ZERO }.is_transient());
        assert!(!EngineError::ProviderExhausted(Id::ZERO).is_transient());
        assert!(!EngineError::ConfigurationInvalid("x".into()).is_transient());
    }

    #[test]
    fn messages_name_the_subject() {
        let e = EngineError::InvalidTransition { action: "resume", state: "completed" };
        assert_eq!(e.to_string(), "cannot resume a session that is completed");
    }
}
