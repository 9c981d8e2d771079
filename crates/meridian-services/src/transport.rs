//! Transport seam between the engine and the network.
//!
//! The engine only ever sends requests and answers requests. How envelopes
//! move (UDP in the daemon, in-process channels in tests and simulation) is
//! behind [`Transport`]; inbound requests are delivered to a
//! [`RequestHandler`].

use std::net::SocketAddr;

use futures::future::BoxFuture;

use meridian_core::wire::{Contact, Message};
use meridian_core::NodeId;

/// A response and the id of the node that sent it.
#[derive(Debug, Clone)]
pub struct Reply {
    pub from: NodeId,
    pub message: Message,
}

/// Why a single request produced no usable reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("request timed out")]
    Timeout,
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    /// Peer is over its upload budget or slot limit.
    #[error("peer busy")]
    Busy,
    /// Peer does not hold what was asked for.
    #[error("peer does not have it")]
    Unavailable,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    /// True when the peer itself is likely gone, as opposed to merely
    /// declining this request.
    pub fn counts_against_peer(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout | RpcError::Unreachable(_) | RpcError::Protocol(_)
        )
    }
}

/// Outbound half: deliver `message` to `to` and wait for the reply.
///
/// Implementations stamp the local node id on every envelope and must not
/// apply their own timeout longer than the caller's.
pub trait Transport: Send + Sync + 'static {
    fn local_id(&self) -> NodeId;

    fn local_addr(&self) -> SocketAddr;

    fn request(&self, to: SocketAddr, message: Message) -> BoxFuture<'static, Result<Reply, RpcError>>;
}

/// Inbound half: answer a request received from `from`.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, from: Contact, message: Message) -> BoxFuture<'static, Message>;
}
