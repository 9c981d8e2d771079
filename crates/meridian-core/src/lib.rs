//! meridian-core — identifiers, content manifests, wire format and config.
//! All other Meridian crates depend on this one.

pub mod bitmap;
pub mod config;
pub mod error;
pub mod id;
pub mod manifest;
pub mod wire;

pub use bitmap::ChunkBitmap;
pub use error::EngineError;
pub use id::{ContentHash, Distance, Id, NodeId};
pub use manifest::Manifest;
pub use wire::{Contact, Message, MessageKind};
