//! In-process network: endpoints addressed by synthetic socket addresses,
//! requests delivered straight to the target's [`RequestHandler`].
//!
//! Used by the multi-node tests and by the daemon's simulation mode. Every
//! request and reply passes through the wire codec so size limits and
//! serialization behave as they do over UDP. Faults (offline, silent) and
//! per-node latency can be injected.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;

use meridian_core::wire::{self, Contact, Envelope, Message};
use meridian_core::NodeId;

use crate::transport::{Reply, RequestHandler, RpcError, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Requests fail immediately as unreachable.
    Offline,
    /// Requests are swallowed and never answered.
    Silent,
}

struct Node {
    id: NodeId,
    handler: Option<Weak<dyn RequestHandler>>,
    fault: Fault,
    latency: Duration,
}

#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<SocketAddr, Node>,
    next_host: AtomicU32,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node and return its transport. The node answers nothing
    /// until a handler is attached.
    pub fn endpoint(self: &Arc<Self>, id: NodeId) -> MemoryTransport {
        let host = self.next_host.fetch_add(1, Ordering::Relaxed) + 1;
        let addr = SocketAddr::from((Ipv4Addr::from(0x0a00_0000 | host), 4100));
        self.nodes.insert(
            addr,
            Node {
                id,
                handler: None,
                fault: Fault::None,
                latency: Duration::ZERO,
            },
        );
        MemoryTransport {
            network: Arc::clone(self),
            id,
            addr,
        }
    }

    pub fn attach(&self, addr: SocketAddr, handler: Weak<dyn RequestHandler>) {
        if let Some(mut node) = self.nodes.get_mut(&addr) {
            node.handler = Some(handler);
        }
    }

    pub fn set_fault(&self, addr: SocketAddr, fault: Fault) {
        if let Some(mut node) = self.nodes.get_mut(&addr) {
            node.fault = fault;
        }
    }

    pub fn set_latency(&self, addr: SocketAddr, latency: Duration) {
        if let Some(mut node) = self.nodes.get_mut(&addr) {
            node.latency = latency;
        }
    }

    pub fn remove(&self, addr: &SocketAddr) {
        self.nodes.remove(addr);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    id: NodeId,
    addr: SocketAddr,
}

impl MemoryTransport {
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

/// Push a message through the codec the way a datagram would travel.
fn over_the_wire(sender: NodeId, message: Message) -> Result<Message, RpcError> {
    let envelope = Envelope { rid: 0, sender, message };
    let bytes = wire::encode(&envelope).map_err(|e| RpcError::Protocol(e.to_string()))?;
    let decoded = wire::decode(&bytes).map_err(|e| RpcError::Protocol(e.to_string()))?;
    Ok(decoded.message)
}

impl Transport for MemoryTransport {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn request(&self, to: SocketAddr, message: Message) -> BoxFuture<'static, Result<Reply, RpcError>> {
        let network = Arc::clone(&self.network);
        let from = Contact::new(self.id, self.addr);
        async move {
            let (id, handler, fault, latency) = {
                let node = network
                    .nodes
                    .get(&to)
                    .ok_or_else(|| RpcError::Unreachable(to.to_string()))?;
                (node.id, node.handler.clone(), node.fault, node.latency)
            };
            match fault {
                Fault::None => {}
                Fault::Offline => return Err(RpcError::Unreachable(to.to_string())),
                Fault::Silent => return std::future::pending().await,
            }
            let handler = handler
                .and_then(|h| h.upgrade())
                .ok_or_else(|| RpcError::Unreachable(to.to_string()))?;

            let request = over_the_wire(from.id, message)?;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let response = handler.handle(from, request).await;
            let response = over_the_wire(id, response)?;
            Ok(Reply { from: id, message: response })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::Id;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle(&self, _from: Contact, message: Message) -> BoxFuture<'static, Message> {
            async move {
                match message {
                    Message::Ping => Message::Pong,
                    _ => Message::Stored,
                }
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn request_reaches_attached_handler() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(Id::from_low_u64(1));
        let b = net.endpoint(Id::from_low_u64(2));
        let echo: Arc<dyn RequestHandler> = Arc::new(Echo);
        net.attach(b.local_addr(), Arc::downgrade(&echo));

        let reply = a.request(b.local_addr(), Message::Ping).await.unwrap();
        assert_eq!(reply.from, Id::from_low_u64(2));
        assert_eq!(reply.message, Message::Pong);
    }

    #[tokio::test]
    async fn unknown_and_offline_are_unreachable() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(Id::from_low_u64(1));
        let b = net.endpoint(Id::from_low_u64(2));
        let echo: Arc<dyn RequestHandler> = Arc::new(Echo);
        net.attach(b.local_addr(), Arc::downgrade(&echo));

        let nowhere: SocketAddr = "10.9.9.9:1".parse().unwrap();
        assert!(matches!(a.request(nowhere, Message::Ping).await, Err(RpcError::Unreachable(_))));

        net.set_fault(b.local_addr(), Fault::Offline);
        assert!(matches!(a.request(b.local_addr(), Message::Ping).await, Err(RpcError::Unreachable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_node_never_answers() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(Id::from_low_u64(1));
        let b = net.endpoint(Id::from_low_u64(2));
        net.set_fault(b.local_addr(), Fault::Silent);

        let res = tokio::time::timeout(Duration::from_secs(5), a.request(b.local_addr(), Message::Ping)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn dropped_handler_is_unreachable() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(Id::from_low_u64(1));
        let b = net.endpoint(Id::from_low_u64(2));
        {
            let echo: Arc<dyn RequestHandler> = Arc::new(Echo);
            net.attach(b.local_addr(), Arc::downgrade(&echo));
        }
        assert!(matches!(a.request(b.local_addr(), Message::Ping).await, Err(RpcError::Unreachable(_))));
    }
}
