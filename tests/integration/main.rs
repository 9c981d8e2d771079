//! Meridian integration test harness.
//!
//! Every test builds its own swarm of engines on an in-memory network, so
//! nothing here needs root, sockets or a running daemon:
//!
//!   cargo test --test integration
//!
//! Each swarm owns a scratch directory for its chunk caches and removes it
//! on drop. Tests shut their engines down before returning.

mod faults;
mod lookup;
mod transfer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use meridian_core::config::MeridianConfig;
use meridian_core::{Id, NodeId};
use meridian_services::{ChunkCache, Engine, MemoryNetwork};

// ── Harness ───────────────────────────────────────────────────────────────────

static SWARMS: AtomicU64 = AtomicU64::new(0);

/// Config tuned for fast tests: small chunks, a quick driver tick and short
/// provider retry intervals.
pub fn test_config() -> MeridianConfig {
    let mut config = MeridianConfig::default();
    config.transfer.chunk_size = 1024;
    config.transfer.tick_ms = 10;
    config.transfer.chunk_timeout_ms = 2_000;
    config.transfer.provider_refresh_secs = 1;
    config.dht.query_timeout_ms = 500;
    config.dht.lookup_deadline_ms = 5_000;
    config
}

pub struct Swarm {
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<Arc<Engine>>,
    root: PathBuf,
}

impl Swarm {
    pub fn new(tag: &str) -> Self {
        let n = SWARMS.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "meridian-it-{}-{}-{}",
            tag,
            std::process::id(),
            n
        ));
        let _ = std::fs::remove_dir_all(&root);
        Self {
            network: MemoryNetwork::new(),
            nodes: Vec::new(),
            root,
        }
    }

    /// Add a started node with a random id.
    pub fn spawn(&mut self, config: MeridianConfig) -> Result<Arc<Engine>> {
        self.spawn_with_id(Id::random(), config)
    }

    pub fn spawn_with_id(&mut self, id: NodeId, config: MeridianConfig) -> Result<Arc<Engine>> {
        let index = self.nodes.len();
        let transport = self.network.endpoint(id);
        let cache = ChunkCache::new(self.root.join(format!("node-{index}")))
            .with_context(|| format!("failed to create cache for node {index}"))?;
        let engine = Engine::new(config, Arc::new(transport), cache);
        self.network
            .attach(engine.local_contact().addr, Arc::downgrade(&engine.handler()));
        engine.start();
        self.nodes.push(engine.clone());
        Ok(engine)
    }

    /// Bootstrap every node after the first off node 0, in order.
    pub async fn link(&self) {
        let Some(seed) = self.nodes.first().map(|n| n.local_contact().addr) else {
            return;
        };
        for node in self.nodes.iter().skip(1) {
            assert_eq!(node.bootstrap(&[seed]).await, 1, "seed should answer");
        }
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

impl Drop for Swarm {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Poll `cond` every 10 ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Deterministic pseudo-random bytes.
pub fn payload(len: usize, seed: u64) -> Vec<u8> {
    use rand::{RngCore, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// The transport address every engine reports for itself.
pub fn addr_of(engine: &Engine) -> std::net::SocketAddr {
    engine.local_contact().addr
}
