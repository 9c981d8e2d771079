//! UDP transport — one socket for both directions.
//!
//! Outbound requests get a fresh `rid` and a oneshot slot in `pending`; the
//! receive loop routes replies to their slot by `rid`. Inbound requests are
//! answered by the engine's handler on a spawned task, echoing the `rid`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};

use meridian_core::wire::{self, Contact, Envelope, Message, MAX_DATAGRAM};
use meridian_core::NodeId;
use meridian_services::{Reply, RequestHandler, RpcError, Transport};

type Pending = DashMap<u64, oneshot::Sender<Reply>>;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    id: NodeId,
    addr: SocketAddr,
    pending: Arc<Pending>,
    next_rid: AtomicU64,
}

/// Drops the pending slot when the request finishes or is abandoned.
struct PendingGuard {
    pending: Arc<Pending>,
    rid: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.rid);
    }
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr, id: NodeId) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;
        let addr = socket.local_addr()?;
        tracing::info!(addr = %addr, node = %id, "UDP transport bound");
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            id,
            addr,
            pending: Arc::new(DashMap::new()),
            next_rid: AtomicU64::new(rand::random::<u32>() as u64),
        }))
    }

    /// Receive loop. Runs until shutdown.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn RequestHandler>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];
        tracing::info!(addr = %self.addr, "UDP receive loop started");

        loop {
            let (len, from) = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("UDP receive loop shutting down");
                    return;
                }
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                },
            };

            let envelope = match wire::decode(&buf[..len]) {
                Ok(env) => env,
                Err(e) => {
                    tracing::debug!(from = %from, error = %e, "dropping malformed datagram");
                    continue;
                }
            };
            if envelope.sender == self.id {
                tracing::trace!("ignoring own datagram");
                continue;
            }

            if envelope.message.is_request() {
                self.answer(&handler, envelope, from);
            } else if let Some((_, slot)) = self.pending.remove(&envelope.rid) {
                let _ = slot.send(Reply {
                    from: envelope.sender,
                    message: envelope.message,
                });
            } else {
                tracing::trace!(from = %from, rid = envelope.rid, "late or unknown reply");
            }
        }
    }

    fn answer(&self, handler: &Arc<dyn RequestHandler>, envelope: Envelope, from: SocketAddr) {
        let reply = handler.handle(Contact::new(envelope.sender, from), envelope.message);
        let socket = self.socket.clone();
        let rid = envelope.rid;
        let sender = self.id;
        tokio::spawn(async move {
            let message = reply.await;
            let bytes = match wire::encode(&Envelope { rid, sender, message }) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(to = %from, error = %e, "reply does not fit a datagram");
                    return;
                }
            };
            if let Err(e) = socket.send_to(&bytes, from).await {
                tracing::debug!(to = %from, error = %e, "send reply failed");
            }
        });
    }
}

impl Transport for UdpTransport {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn request(&self, to: SocketAddr, message: Message) -> BoxFuture<'static, Result<Reply, RpcError>> {
        let rid = self.next_rid.fetch_add(1, Ordering::Relaxed);
        let bytes = wire::encode(&Envelope {
            rid,
            sender: self.id,
            message,
        });
        let socket = self.socket.clone();
        let pending = self.pending.clone();

        async move {
            let bytes = bytes.map_err(|e| RpcError::Protocol(e.to_string()))?;
            let (tx, rx) = oneshot::channel();
            pending.insert(rid, tx);
            let _guard = PendingGuard { pending, rid };

            socket
                .send_to(&bytes, to)
                .await
                .map_err(|e| RpcError::Unreachable(e.to_string()))?;
            rx.await
                .map_err(|_| RpcError::Unreachable("transport closed".to_string()))
        }
        .boxed()
    }
}
