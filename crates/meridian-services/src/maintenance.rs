//! Maintenance — periodic cleanup of the routing table and provider records,
//! and republishing of the provider records for local content.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant as TokioInstant};
use tracing::{debug, info, trace};

use crate::engine::Shared;
use crate::events::EngineEvent;

pub struct Maintenance {
    shared: Shared,
    shutdown: broadcast::Receiver<()>,
}

fn every(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_secs(1));
    interval_at(TokioInstant::now() + period, period)
}

impl Maintenance {
    pub(crate) fn new(shared: Shared, shutdown: broadcast::Receiver<()>) -> Self {
        Self { shared, shutdown }
    }

    pub async fn run(mut self) {
        let dht = &self.shared.config.dht;
        let mut bucket_sweep = every(Duration::from_secs(dht.bucket_sweep_secs));
        let mut provider_sweep = every(Duration::from_secs(dht.provider_sweep_secs));
        let mut republish = every(dht.provider_ttl() / 2);

        info!(
            bucket_sweep_secs = dht.bucket_sweep_secs,
            provider_sweep_secs = dht.provider_sweep_secs,
            "maintenance loop started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                _ = bucket_sweep.tick() => self.sweep_buckets(),
                _ = provider_sweep.tick() => self.sweep_providers(),
                _ = republish.tick() => self.republish(),
            }
        }

        info!("maintenance loop stopped");
    }

    /// Evict peers silent for longer than the inactivity timeout.
    fn sweep_buckets(&self) {
        let evicted = self
            .shared
            .routing
            .sweep_inactive(self.shared.config.dht.peer_inactivity());
        if evicted.is_empty() {
            trace!("bucket sweep: nothing to evict");
            return;
        }
        info!(count = evicted.len(), "bucket sweep: evicted inactive peers");
        for peer in evicted {
            self.shared.events.publish(EngineEvent::PeerEvicted { peer });
        }
    }

    fn sweep_providers(&self) {
        match self.shared.content.sweep_expired() {
            0 => trace!("provider sweep: nothing expired"),
            n => info!(count = n, "provider sweep: dropped expired provider records"),
        }
    }

    /// Refresh our own records before the copies held by other nodes expire.
    fn republish(&self) {
        let local = self.shared.content.local_hashes();
        debug!(count = local.len(), "republishing local content");
        for hash in local {
            self.shared.content.announce(hash);
            if self.shared.dht_enabled() {
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    shared.publish_provider(hash).await;
                });
            }
        }
    }
}
