//! Daemon status, peers, limits, events and shutdown commands.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::http::{base_url, get_json, get_stream, post_json, put_json_body};
use super::{fmt_bytes, short};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    version: String,
    addr: String,
    node_id: String,
    uptime_secs: u64,
    cache: CacheInfo,
    peers: PeerStats,
    bandwidth: BandwidthStats,
    connections: ConnectionStats,
    messages: BTreeMap<String, MessageCount>,
    lookups: u64,
    lookups_failed: u64,
    stores_sent: u64,
    stores_received: u64,
    sessions: BTreeMap<String, usize>,
    content: ContentStats,
}

#[derive(Deserialize)]
struct CacheInfo {
    chunks: usize,
    bytes: u64,
}

#[derive(Deserialize)]
struct PeerStats {
    total: usize,
    active: usize,
    average_rtt_ms: Option<u64>,
}

#[derive(Deserialize)]
struct BandwidthStats {
    download_bps: u64,
    upload_bps: u64,
    bytes_in: u64,
    bytes_out: u64,
}

#[derive(Deserialize)]
struct ConnectionStats {
    outgoing: usize,
    incoming: usize,
}

#[derive(Deserialize)]
struct MessageCount {
    sent: u64,
    received: u64,
}

#[derive(Deserialize)]
struct ContentStats {
    known: usize,
    local: usize,
}

#[derive(Deserialize)]
struct PeersResponse {
    peers: Vec<PeerInfo>,
}

#[derive(Deserialize)]
struct PeerInfo {
    id: String,
    addr: String,
    bucket: usize,
    rtt_ms: Option<u64>,
    failures: u32,
    connections: u32,
    uptime_secs: u64,
    idle_secs: u64,
    active: bool,
}

#[derive(Serialize, Deserialize)]
pub struct Limits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_download_bps: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_upload_bps: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<i64>,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    message: String,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Meridian Node Status (v{})", resp.version);
    println!("═══════════════════════════════════════");
    println!("  Node id       : {}", resp.node_id);
    println!("  Address       : {}", resp.addr);
    println!("  Uptime        : {}s", resp.uptime_secs);
    println!(
        "  Peers         : {} ({} active, avg rtt {})",
        resp.peers.total,
        resp.peers.active,
        resp.peers
            .average_rtt_ms
            .map(|ms| format!("{ms} ms"))
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "  Connections   : {} out / {} in",
        resp.connections.outgoing, resp.connections.incoming
    );
    println!(
        "  Bandwidth     : ↓ {}/s  ↑ {}/s",
        fmt_bytes(resp.bandwidth.download_bps),
        fmt_bytes(resp.bandwidth.upload_bps)
    );
    println!(
        "  Traffic       : {} in / {} out",
        fmt_bytes(resp.bandwidth.bytes_in),
        fmt_bytes(resp.bandwidth.bytes_out)
    );
    println!(
        "  Lookups       : {} ({} failed)",
        resp.lookups, resp.lookups_failed
    );
    println!(
        "  Stores        : {} sent / {} received",
        resp.stores_sent, resp.stores_received
    );
    println!(
        "  Content       : {} known, {} local",
        resp.content.known, resp.content.local
    );
    println!(
        "  Cache         : {} chunks, {}",
        resp.cache.chunks,
        fmt_bytes(resp.cache.bytes)
    );

    println!("\n  Sessions:");
    for (state, count) in &resp.sessions {
        println!("    {:<10} {}", state, count);
    }

    println!("\n  Messages (sent / received):");
    for (kind, count) in &resp.messages {
        println!("    {:<13} {:>8} / {}", kind, count.sent, count.received);
    }

    Ok(())
}

pub async fn cmd_peers(port: u16) -> Result<()> {
    let resp: PeersResponse = get_json(&format!("{}/peers", base_url(port))).await?;

    if resp.peers.is_empty() {
        println!("No peers in the routing table yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Routing Table ({} peers)", resp.peers.len());
    println!("═══════════════════════════════════════");

    for p in &resp.peers {
        println!(
            "  ┌─ {} {}",
            short(&p.id),
            if p.active { "● active" } else { "○ idle" }
        );
        println!("  │  addr        : {}", p.addr);
        println!("  │  bucket      : {}", p.bucket);
        println!(
            "  │  rtt         : {}",
            p.rtt_ms
                .map(|ms| format!("{ms} ms"))
                .unwrap_or_else(|| "-".to_string())
        );
        println!("  │  failures    : {}", p.failures);
        println!("  │  connections : {}", p.connections);
        println!("  └─ seen        : {}s ago (known {}s)", p.idle_secs, p.uptime_secs);
    }

    Ok(())
}

pub async fn cmd_limits(port: u16) -> Result<()> {
    let resp: Limits = get_json(&format!("{}/limits", base_url(port))).await?;
    print_limits(&resp);
    Ok(())
}

pub async fn cmd_limits_set(port: u16, update: Limits) -> Result<()> {
    let resp: Limits = put_json_body(&format!("{}/limits", base_url(port)), &update).await?;
    println!("✓ Limits updated");
    print_limits(&resp);
    Ok(())
}

fn print_limits(limits: &Limits) {
    let show = |v: Option<i64>, bytes: bool| match v {
        Some(0) | None => "unlimited".to_string(),
        Some(n) if bytes => format!("{}/s", fmt_bytes(n as u64)),
        Some(n) => n.to_string(),
    };
    println!("  Download    : {}", show(limits.max_download_bps, true));
    println!("  Upload      : {}", show(limits.max_upload_bps, true));
    println!("  Connections : {}", show(limits.max_connections, false));
}

/// Print engine events as they arrive until the daemon closes the stream.
pub async fn cmd_events(port: u16) -> Result<()> {
    let mut resp = get_stream(&format!("{}/events", base_url(port))).await?;
    println!("Streaming events (Ctrl-C to stop)...");

    let mut pending = String::new();
    while let Some(chunk) = resp.chunk().await.context("event stream broke")? {
        pending.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(end) = pending.find("\n\n") {
            let frame: String = pending.drain(..end + 2).collect();
            if let Some(line) = sse_data(&frame) {
                println!("{line}");
            }
        }
    }
    Ok(())
}

/// The `data:` payload of one SSE frame, if any.
fn sse_data(frame: &str) -> Option<&str> {
    frame
        .lines()
        .find_map(|l| l.strip_prefix("data:"))
        .map(str::trim)
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
