//! meridiand — Meridian peer-to-peer content distribution daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use meridian_core::config::MeridianConfig;
use meridian_core::Id;
use meridian_services::{ChunkCache, Engine, Transport};

mod identity;
mod simulate;
mod udp;

use simulate::Simulation;
use udp::UdpTransport;

struct Args {
    simulate: Option<usize>,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut simulate = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--simulate" => {
                let n = args.next().context("--simulate needs a node count")?;
                simulate = Some(n.parse().with_context(|| format!("invalid node count '{n}'"))?);
            }
            other => anyhow::bail!("unknown argument '{other}' (usage: meridiand [--simulate N])"),
        }
    }
    Ok(Args { simulate })
}

/// Resolve "host:port" seeds, skipping ones that do not resolve.
async fn resolve_seeds(seeds: &[String]) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for seed in seeds {
        match tokio::net::lookup_host(seed.as_str()).await {
            Ok(addrs) => out.extend(addrs),
            Err(e) => tracing::warn!(seed, error = %e, "failed to resolve bootstrap peer"),
        }
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = parse_args()?;

    // Load config
    if let Err(e) = MeridianConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeridianConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeridianConfig::default()
    });
    tracing::info!(
        port = config.network.port,
        api_port = config.network.api_port,
        dht = config.dht.enabled,
        "meridiand starting"
    );

    // Chunk cache
    let cache_root = config.identity.cache_path.clone();
    let cache = ChunkCache::new(&cache_root)?;
    tracing::info!(root = %cache_root.display(), "chunk cache initialized");

    // ── Shutdown channel ─────────────────────────────────────────────────────

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Transport and engine ─────────────────────────────────────────────────

    let mut simulation = None;
    let mut transport_task = None;

    let (engine, seeds) = match args.simulate {
        Some(count) => {
            let sim = Simulation::build(count, &config, &cache_root.join("simulation")).await?;
            let transport = sim.network.endpoint(Id::random());
            let engine = Engine::new(config.clone(), Arc::new(transport), cache);
            sim.network
                .attach(engine.local_contact().addr, Arc::downgrade(&engine.handler()));
            let seeds = sim.seeds();
            simulation = Some(sim);
            (engine, seeds)
        }
        None => {
            let node_id = identity::load_or_create(&config.identity.node_id_path)?;
            let bind: SocketAddr = ([0, 0, 0, 0], config.network.port).into();
            let transport = UdpTransport::bind(bind, node_id).await?;
            let engine = Engine::new(config.clone(), transport.clone() as Arc<dyn Transport>, cache);
            transport_task = Some(tokio::spawn(
                transport.run(engine.handler(), shutdown_tx.subscribe()),
            ));
            (engine, resolve_seeds(&config.network.bootstrap).await)
        }
    };
    tracing::info!(node = %engine.node_id(), addr = %engine.local_contact().addr, "node ready");

    if !seeds.is_empty() {
        engine.bootstrap(&seeds).await;
    }
    engine.start();

    // ── API ──────────────────────────────────────────────────────────────────

    let api_task = {
        let state = meridian_api::ApiState {
            engine: engine.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        let port = config.network.api_port;
        tokio::spawn(async move {
            if let Err(e) = meridian_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let transport_exit = async {
        match transport_task {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = api_task           => tracing::error!("API task exited: {:?}", r),
        r = transport_exit     => tracing::error!("transport task exited: {:?}", r),
    }

    let _ = shutdown_tx.send(());
    engine.shutdown().await;
    if let Some(sim) = simulation {
        sim.shutdown().await;
    }
    tracing::info!("meridiand stopped");
    Ok(())
}
