//! meridian-services — the peer-to-peer engine: routing table, lookups,
//! content records, chunk cache, transfer scheduling and network stats.

pub mod cache;
pub mod content;
pub mod driver;
pub mod engine;
pub mod events;
pub mod lookup;
pub mod maintenance;
pub mod memory;
pub mod qos;
pub mod routing;
pub mod rpc;
pub mod stats;
pub mod transfer;
pub mod transport;

pub use cache::ChunkCache;
pub use content::{ContentStore, SearchResult};
pub use engine::{Engine, LimitsUpdate, SharedContent};
pub use events::{EngineEvent, EventBus};
pub use lookup::{LookupMode, LookupOutcome, LookupResult, NotFoundReason};
pub use memory::{Fault, MemoryNetwork, MemoryTransport};
pub use qos::TokenBucket;
pub use routing::{PeerSnapshot, RoutingTable};
pub use rpc::PeerClient;
pub use stats::{NetworkStats, StatsAggregator, TrafficCounters};
pub use transfer::{Direction, SessionId, SessionSnapshot, SessionState, TransferScheduler};
pub use transport::{Reply, RequestHandler, RpcError, Transport};
