use crate::*;
use std::time::Duration;

use meridian_core::config::MeridianConfig;
use meridian_core::Message;
use meridian_services::{Fault, SessionState};

fn single_source_config() -> MeridianConfig {
    let mut config = test_config();
    // no DHT: the one known provider is all there is
    config.dht.enabled = false;
    config.transfer.selection_retries = 2;
    config
}

#[tokio::test]
async fn provider_loss_fails_the_download() {
    let mut swarm = Swarm::new("loss");
    let provider = swarm.spawn(single_source_config()).unwrap();
    let downloader = swarm.spawn(single_source_config()).unwrap();

    let shared = provider.share_bytes("stream.bin", &payload(100 * 1024, 5)).unwrap();
    swarm
        .network
        .set_latency(addr_of(&provider), Duration::from_millis(20));
    downloader.handle_request(
        provider.local_contact(),
        Message::Store { hash: shared.hash, ttl_secs: 600 },
    );

    let id = downloader.start_download(shared.hash, 0);
    assert!(
        wait_until(Duration::from_secs(10), || {
            downloader.session(id).map(|s| s.chunks_done).unwrap_or(0) >= 5
        })
        .await
    );
    swarm.network.set_fault(addr_of(&provider), Fault::Offline);

    let failed = wait_until(Duration::from_secs(15), || {
        downloader.session(id).map(|s| s.state) == Ok(SessionState::Failed)
    })
    .await;
    let session = downloader.session(id).unwrap();
    assert!(failed, "download should fail once its only provider is gone: {session:?}");
    assert!(session.chunks_done < session.total_chunks);
    assert!(session.last_error.is_some());
    assert_eq!(session.in_flight, 0);

    swarm.shutdown().await;
}

#[tokio::test]
async fn silent_provider_times_out_and_is_excluded() {
    let mut config = single_source_config();
    config.transfer.chunk_timeout_ms = 200;
    config.transfer.selection_retries = 1;

    let mut swarm = Swarm::new("silent");
    let provider = swarm.spawn(config.clone()).unwrap();
    let downloader = swarm.spawn(config).unwrap();

    let shared = provider.share_bytes("quiet.dat", &payload(8 * 1024, 2)).unwrap();
    swarm.network.set_fault(addr_of(&provider), Fault::Silent);
    downloader.handle_request(
        provider.local_contact(),
        Message::Store { hash: shared.hash, ttl_secs: 600 },
    );

    let id = downloader.start_download(shared.hash, 0);
    let failed = wait_until(Duration::from_secs(10), || {
        downloader.session(id).map(|s| s.state) == Ok(SessionState::Failed)
    })
    .await;
    assert!(failed, "{:?}", downloader.session(id));
    assert_eq!(downloader.stats().connections.outgoing, 0);

    swarm.shutdown().await;
}

#[tokio::test]
async fn unreachable_seed_is_reported() {
    let mut swarm = Swarm::new("seedless");
    let node = swarm.spawn(test_config()).unwrap();
    let gone = swarm.spawn(test_config()).unwrap();
    swarm.network.set_fault(addr_of(&gone), Fault::Offline);

    assert_eq!(node.bootstrap(&[addr_of(&gone)]).await, 0);
    assert!(node.peers().is_empty());

    swarm.shutdown().await;
}
