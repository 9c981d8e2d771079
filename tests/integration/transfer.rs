use crate::*;
use std::time::Duration;

use meridian_core::{Id, Message};
use meridian_services::{Engine, Fault, SessionState};

/// Tell `downloader` that `provider` holds `hash`, the way a STORE would.
fn announce_to(downloader: &Engine, provider: &Engine, hash: Id) {
    let reply = downloader.handle_request(
        provider.local_contact(),
        Message::Store { hash, ttl_secs: 600 },
    );
    assert_eq!(reply, Message::Stored);
}

#[tokio::test]
async fn download_from_two_providers() {
    let mut swarm = Swarm::new("two");
    let p1 = swarm.spawn(test_config()).unwrap();
    let p2 = swarm.spawn(test_config()).unwrap();
    let downloader = swarm.spawn(test_config()).unwrap();

    let data = payload(100 * 1024, 7);
    let a = p1.share_bytes("movie.mp4", &data).unwrap();
    let b = p2.share_bytes("movie.mp4", &data).unwrap();
    assert_eq!(a.hash, b.hash);
    assert_eq!(a.chunks, 100);

    announce_to(&downloader, &p1, a.hash);
    announce_to(&downloader, &p2, a.hash);

    let id = downloader.start_download(a.hash, 0);
    let done = wait_until(Duration::from_secs(15), || {
        downloader.session(id).map(|s| s.state) == Ok(SessionState::Completed)
    })
    .await;
    assert!(done, "download did not complete: {:?}", downloader.session(id));

    let session = downloader.session(id).unwrap();
    assert_eq!(session.chunks_done, 100);
    assert_eq!(session.bytes_done, data.len() as u64);
    assert_eq!(session.in_flight, 0);

    // both providers carried part of the load; duplicate requests near the
    // end may add a few chunks on top of the file size
    let sent = [p1.stats().bandwidth.bytes_out, p2.stats().bandwidth.bytes_out];
    assert!(sent.iter().all(|b| *b > 0));
    let received = downloader.stats().bandwidth.bytes_in;
    assert!(received >= data.len() as u64);
    assert!(received <= sent.iter().sum::<u64>());

    let dest = std::env::temp_dir().join(format!("meridian-it-movie-{}.mp4", std::process::id()));
    let written = downloader.export(a.hash, &dest).unwrap();
    assert_eq!(written, data.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
    let _ = std::fs::remove_file(&dest);

    // the downloader now serves the content itself
    let results = downloader.search("movie");
    assert_eq!(results.len(), 1);
    assert!(results[0].complete);

    swarm.shutdown().await;
}

#[tokio::test]
async fn download_through_dht_discovery() {
    let mut swarm = Swarm::new("dht");
    for _ in 0..6 {
        swarm.spawn(test_config()).unwrap();
    }
    swarm.link().await;

    let data = payload(20 * 1024, 3);
    let shared = swarm.nodes[1].share_bytes("album.flac", &data).unwrap();
    let downloader = swarm.nodes[4].clone();

    let id = downloader.start_download(shared.hash, 0);
    let done = wait_until(Duration::from_secs(15), || {
        downloader.session(id).map(|s| s.state) == Ok(SessionState::Completed)
    })
    .await;
    assert!(done, "download did not complete: {:?}", downloader.session(id));
    assert_eq!(downloader.manifest(&shared.hash).unwrap().name, "album.flac");

    // one provider, so every chunk crossed the wire exactly once
    assert_eq!(downloader.stats().bandwidth.bytes_in, data.len() as u64);
    assert_eq!(swarm.nodes[1].stats().bandwidth.bytes_out, data.len() as u64);

    swarm.shutdown().await;
}

#[tokio::test]
async fn cancel_releases_peer_slots() {
    let mut swarm = Swarm::new("cancel");
    let provider = swarm.spawn(test_config()).unwrap();
    let downloader = swarm.spawn(test_config()).unwrap();

    let shared = provider.share_bytes("big.zip", &payload(50 * 1024, 9)).unwrap();
    swarm.network.set_fault(addr_of(&provider), Fault::Silent);
    announce_to(&downloader, &provider, shared.hash);

    let id = downloader.start_download(shared.hash, 0);
    assert!(
        wait_until(Duration::from_secs(5), || downloader.stats().connections.outgoing == 1).await,
        "manifest request never went out"
    );

    downloader.cancel(id).unwrap();
    assert_eq!(downloader.session(id).unwrap().state, SessionState::Cancelled);
    assert_eq!(downloader.session(id).unwrap().in_flight, 0);
    assert_eq!(downloader.stats().connections.outgoing, 0);

    // the driver must not pick the session up again
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(downloader.stats().connections.outgoing, 0);
    assert!(downloader.resume(id).is_err());

    swarm.shutdown().await;
}

#[tokio::test]
async fn paused_download_resumes_to_completion() {
    let mut swarm = Swarm::new("pause");
    let provider = swarm.spawn(test_config()).unwrap();
    let downloader = swarm.spawn(test_config()).unwrap();

    let data = payload(60 * 1024, 11);
    let shared = provider.share_bytes("clip.mp4", &data).unwrap();
    swarm
        .network
        .set_latency(addr_of(&provider), Duration::from_millis(20));
    announce_to(&downloader, &provider, shared.hash);

    let id = downloader.start_download(shared.hash, 0);
    assert!(
        wait_until(Duration::from_secs(10), || {
            downloader.session(id).map(|s| s.chunks_done).unwrap_or(0) >= 4
        })
        .await
    );

    downloader.pause(id).unwrap();
    let paused = downloader.session(id).unwrap();
    assert_eq!(paused.state, SessionState::Paused);
    assert_eq!(paused.in_flight, 0);
    assert!(paused.chunks_done < 60);

    downloader.resume(id).unwrap();
    let done = wait_until(Duration::from_secs(15), || {
        downloader.session(id).map(|s| s.state) == Ok(SessionState::Completed)
    })
    .await;
    assert!(done, "resumed download did not complete");
    assert_eq!(downloader.session(id).unwrap().chunks_done, 60);

    swarm.shutdown().await;
}
