//! Typed request helpers over a [`Transport`].
//!
//! Every call counts the message sent and the reply received, enforces the
//! per-request timeout, and turns `ERROR` replies into [`RpcError`]s.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meridian_core::wire::{Contact, ErrorCode, Message};
use meridian_core::{ContentHash, Id, Manifest, NodeId};

use crate::stats::TrafficCounters;
use crate::transport::{Reply, RpcError, Transport};

/// A successful reply with who sent it and how long it took.
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub from: NodeId,
    pub rtt: Duration,
    pub body: T,
}

/// FIND_VALUE answer.
#[derive(Debug, Clone, Default)]
pub struct ValueReply {
    pub providers: Vec<Contact>,
    pub closer: Vec<Contact>,
    pub manifest: Option<Manifest>,
}

#[derive(Clone)]
pub struct PeerClient {
    transport: Arc<dyn Transport>,
    traffic: Arc<TrafficCounters>,
    query_timeout: Duration,
    chunk_timeout: Duration,
}

impl PeerClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        traffic: Arc<TrafficCounters>,
        query_timeout: Duration,
        chunk_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            traffic,
            query_timeout,
            chunk_timeout,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.transport.local_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    async fn call(&self, to: SocketAddr, message: Message, timeout: Duration) -> Result<(Reply, Duration), RpcError> {
        let kind = message.kind();
        self.traffic.record_sent(kind);
        tracing::trace!(to = %to, kind = kind.name(), "request");

        let started = tokio::time::Instant::now();
        let reply = tokio::time::timeout(timeout, self.transport.request(to, message))
            .await
            .map_err(|_| RpcError::Timeout)??;
        let rtt = started.elapsed();

        self.traffic.record_received(reply.message.kind());
        if let Message::Error { code, detail } = &reply.message {
            return Err(match code {
                ErrorCode::Busy => RpcError::Busy,
                ErrorCode::Unavailable => RpcError::Unavailable,
                ErrorCode::BadRequest => RpcError::Protocol(detail.clone()),
            });
        }
        Ok((reply, rtt))
    }

    pub async fn ping(&self, to: SocketAddr) -> Result<Response<()>, RpcError> {
        let (reply, rtt) = self.call(to, Message::Ping, self.query_timeout).await?;
        match reply.message {
            Message::Pong => Ok(Response { from: reply.from, rtt, body: () }),
            other => Err(unexpected("PONG", &other)),
        }
    }

    pub async fn find_node(&self, to: SocketAddr, target: Id) -> Result<Response<Vec<Contact>>, RpcError> {
        let (reply, rtt) = self.call(to, Message::FindNode { target }, self.query_timeout).await?;
        match reply.message {
            Message::Nodes { contacts } => Ok(Response { from: reply.from, rtt, body: contacts }),
            other => Err(unexpected("NODES", &other)),
        }
    }

    pub async fn find_value(&self, to: SocketAddr, hash: ContentHash) -> Result<Response<ValueReply>, RpcError> {
        let (reply, rtt) = self.call(to, Message::FindValue { hash }, self.query_timeout).await?;
        match reply.message {
            Message::Value { providers, closer, manifest } => Ok(Response {
                from: reply.from,
                rtt,
                body: ValueReply { providers, closer, manifest },
            }),
            other => Err(unexpected("VALUE", &other)),
        }
    }

    pub async fn store(&self, to: SocketAddr, hash: ContentHash, ttl: Duration) -> Result<Response<()>, RpcError> {
        let message = Message::Store { hash, ttl_secs: ttl.as_secs() };
        let (reply, rtt) = self.call(to, message, self.query_timeout).await?;
        match reply.message {
            Message::Stored => Ok(Response { from: reply.from, rtt, body: () }),
            other => Err(unexpected("STORED", &other)),
        }
    }

    pub async fn fetch_manifest(&self, to: SocketAddr, hash: ContentHash) -> Result<Response<Manifest>, RpcError> {
        let (reply, rtt) = self.call(to, Message::GetManifest { hash }, self.chunk_timeout).await?;
        match reply.message {
            Message::ManifestReply { manifest } => Ok(Response { from: reply.from, rtt, body: manifest }),
            other => Err(unexpected("MANIFEST", &other)),
        }
    }

    pub async fn fetch_chunk(&self, to: SocketAddr, hash: ContentHash, index: u32) -> Result<Response<Vec<u8>>, RpcError> {
        let (reply, rtt) = self.call(to, Message::GetChunk { hash, index }, self.chunk_timeout).await?;
        match reply.message {
            Message::Chunk { hash: h, index: i, data } if h == hash && i == index => {
                self.traffic.add_bytes_in(data.len() as u64);
                Ok(Response { from: reply.from, rtt, body: data })
            }
            other => Err(unexpected("CHUNK", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Message) -> RpcError {
    RpcError::Protocol(format!("expected {wanted}, got {}", got.kind().name()))
}
