use crate::*;
use std::time::Duration;

use meridian_core::{Id, Message};
use meridian_services::{LookupMode, LookupOutcome};

#[tokio::test]
async fn bootstrap_through_one_seed_fills_its_table() {
    let mut swarm = Swarm::new("seed");
    for _ in 0..8 {
        swarm.spawn(test_config()).unwrap();
    }
    swarm.link().await;

    assert_eq!(swarm.nodes[0].peers().len(), 7);
    for node in &swarm.nodes[1..] {
        assert!(!node.peers().is_empty());
    }
    swarm.shutdown().await;
}

#[tokio::test]
async fn node_lookup_converges_on_the_nearest_node() {
    let mut swarm = Swarm::new("converge");
    for _ in 0..20 {
        swarm.spawn(test_config()).unwrap();
    }
    swarm.link().await;

    // knows only the seed; everything else has to come from the lookup
    let searcher = swarm.spawn(test_config()).unwrap();
    searcher.handle_request(swarm.nodes[0].local_contact(), Message::Ping);
    assert_eq!(searcher.peers().len(), 1);

    let target = Id::random();
    let nearest = swarm.nodes[..20]
        .iter()
        .map(|n| n.node_id())
        .min_by_key(|id| target.distance(id))
        .unwrap();

    let result = searcher.lookup(target, LookupMode::Node).await;
    let LookupOutcome::Converged { closest } = result.outcome else {
        panic!("expected convergence, got {:?}", result.outcome);
    };
    assert_eq!(closest[0].id, nearest);
    assert!(closest
        .windows(2)
        .all(|w| target.distance(&w[0].id) < target.distance(&w[1].id)));
    assert!(closest.iter().all(|c| c.id != searcher.node_id()));
    assert!(result.rounds >= 1);
    assert!(result.queried >= 1);
    assert!(searcher.peers().len() > 1, "lookup should teach the searcher new peers");

    swarm.shutdown().await;
}

#[tokio::test]
async fn value_lookup_finds_published_provider() {
    let mut swarm = Swarm::new("value");
    for _ in 0..10 {
        swarm.spawn(test_config()).unwrap();
    }
    swarm.link().await;

    let provider = swarm.nodes[3].clone();
    let shared = provider.share_bytes("notes.txt", &payload(5_000, 1)).unwrap();
    let seeker = swarm.nodes[7].clone();

    let mut found = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        let result = seeker.lookup(shared.hash, LookupMode::Value).await;
        if let LookupOutcome::Found { providers, .. } = result.outcome {
            found = Some(providers);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let providers = found.expect("value lookup should find the provider");
    assert!(providers.iter().any(|c| c.id == provider.node_id()));
    // the lookup leaves the record behind
    assert!(seeker
        .providers(&shared.hash)
        .iter()
        .any(|c| c.id == provider.node_id()));

    swarm.shutdown().await;
}

#[tokio::test]
async fn value_lookup_for_unknown_content_is_not_found() {
    let mut swarm = Swarm::new("novalue");
    for _ in 0..6 {
        swarm.spawn(test_config()).unwrap();
    }
    swarm.link().await;

    let failed_before = swarm.nodes[2].stats().lookups_failed;
    let result = swarm.nodes[2].lookup(Id::random(), LookupMode::Value).await;
    let LookupOutcome::NotFound { closest, .. } = result.outcome else {
        panic!("nothing was published, got {:?}", result.outcome);
    };
    assert!(!closest.is_empty());
    assert_eq!(swarm.nodes[2].stats().lookups_failed, failed_before + 1);

    swarm.shutdown().await;
}
