//! Simulation mode — a swarm of virtual nodes on an in-memory network, each
//! sharing some random content, for exercising the dashboard without peers.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::{Rng, RngCore};

use meridian_core::config::MeridianConfig;
use meridian_core::Id;
use meridian_services::{ChunkCache, Engine, MemoryNetwork, Transport};

const EXTENSIONS: [&str; 6] = ["mp4", "flac", "png", "zip", "pdf", "csv"];

pub struct Simulation {
    pub network: Arc<MemoryNetwork>,
    pub nodes: Vec<Arc<Engine>>,
}

impl Simulation {
    /// Build `count` virtual nodes, share content on each, and link them
    /// through the first node.
    pub async fn build(count: usize, config: &MeridianConfig, cache_root: &Path) -> Result<Self> {
        let network = MemoryNetwork::new();
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let mut rng = rand::thread_rng();
            let transport = network.endpoint(Id::random());
            network.set_latency(transport.local_addr(), Duration::from_millis(rng.gen_range(5..80)));
            let cache = ChunkCache::new(cache_root.join(format!("sim-{i}")))
                .with_context(|| format!("failed to create cache for virtual node {i}"))?;
            let engine = Engine::new(config.clone(), Arc::new(transport), cache);
            network.attach(engine.local_contact().addr, Arc::downgrade(&engine.handler()));

            let size = rng.gen_range(16 * 1024..256 * 1024);
            let mut data = vec![0u8; size];
            rng.fill_bytes(&mut data);
            let name = format!("sim-{i:03}.{}", EXTENSIONS[i % EXTENSIONS.len()]);
            engine.share_bytes(&name, &data)?;

            engine.start();
            nodes.push(engine);
        }

        if let Some(seed) = nodes.first().map(|n| n.local_contact().addr) {
            for node in nodes.iter().skip(1) {
                node.bootstrap(&[seed]).await;
            }
        }

        tracing::info!(nodes = nodes.len(), "simulated swarm ready");
        Ok(Self { network, nodes })
    }

    pub fn seeds(&self) -> Vec<SocketAddr> {
        self.nodes.iter().map(|n| n.local_contact().addr).collect()
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}
