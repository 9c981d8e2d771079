//! Meridian wire format — JSON envelopes exchanged between peers.
//!
//! Every datagram carries one [`Envelope`]: a request id used to pair
//! responses with requests, the sender's node id, and a [`Message`] tagged
//! by type:
//!
//! ```json
//! {"rid": 7, "sender": "9f…", "message": {"type": "FIND_NODE", "payload": {"target": "03…"}}}
//! ```
//!
//! The sender's address is taken from the datagram source, never from the
//! payload. Chunk bytes travel hex-encoded, so chunk sizes must leave room
//! under [`MAX_DATAGRAM`].

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::id::{ContentHash, Id, NodeId};
use crate::manifest::Manifest;

/// Largest encoded envelope we will send or accept.
pub const MAX_DATAGRAM: usize = 60_000;

/// Most contacts returned in a single NODES/VALUE reply.
pub const MAX_CONTACTS: usize = 20;

/// A reachable peer: its id and the address it answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub rid: u64,
    pub sender: NodeId,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Ping,
    Pong,
    FindNode {
        target: Id,
    },
    Nodes {
        contacts: Vec<Contact>,
    },
    FindValue {
        hash: ContentHash,
    },
    Value {
        providers: Vec<Contact>,
        closer: Vec<Contact>,
        manifest: Option<Manifest>,
    },
    /// The sender claims to provide `hash` for `ttl_secs`.
    Store {
        hash: ContentHash,
        ttl_secs: u64,
    },
    Stored,
    GetManifest {
        hash: ContentHash,
    },
    #[serde(rename = "MANIFEST")]
    ManifestReply {
        manifest: Manifest,
    },
    GetChunk {
        hash: ContentHash,
        index: u32,
    },
    Chunk {
        hash: ContentHash,
        index: u32,
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
    },
    Error {
        code: ErrorCode,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Responder is over its upload budget or slot limit; retry elsewhere.
    Busy,
    /// Responder does not hold what was asked for.
    Unavailable,
    BadRequest,
}

/// Request/response family a message belongs to, for traffic counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Ping,
    FindNode,
    FindValue,
    Store,
    GetManifest,
    GetChunk,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 7] = [
        MessageKind::Ping,
        MessageKind::FindNode,
        MessageKind::FindValue,
        MessageKind::Store,
        MessageKind::GetManifest,
        MessageKind::GetChunk,
        MessageKind::Error,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Ping => "PING",
            MessageKind::FindNode => "FIND_NODE",
            MessageKind::FindValue => "FIND_VALUE",
            MessageKind::Store => "STORE",
            MessageKind::GetManifest => "GET_MANIFEST",
            MessageKind::GetChunk => "GET_CHUNK",
            MessageKind::Error => "ERROR",
        }
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ping | Message::Pong => MessageKind::Ping,
            Message::FindNode { .. } | Message::Nodes { .. } => MessageKind::FindNode,
            Message::FindValue { .. } | Message::Value { .. } => MessageKind::FindValue,
            Message::Store { .. } | Message::Stored => MessageKind::Store,
            Message::GetManifest { .. } | Message::ManifestReply { .. } => {
                MessageKind::GetManifest
            }
            Message::GetChunk { .. } | Message::Chunk { .. } => MessageKind::GetChunk,
            Message::Error { .. } => MessageKind::Error,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::Ping
                | Message::FindNode { .. }
                | Message::FindValue { .. }
                | Message::Store { .. }
                | Message::GetManifest { .. }
                | Message::GetChunk { .. }
        )
    }

    pub fn error(code: ErrorCode, detail: impl Into<String>) -> Self {
        Message::Error {
            code,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("envelope is {0} bytes, limit is {MAX_DATAGRAM}")]
    TooLarge(usize),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > MAX_DATAGRAM {
        return Err(WireError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, WireError> {
    if bytes.len() > MAX_DATAGRAM {
        return Err(WireError::TooLarge(bytes.len()));
    }
    Ok(serde_json::from_slice(bytes)?)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
