//! Transfer session commands.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::http::{base_url, delete_json, get_json, post_json, post_json_body};
use super::{fmt_bytes, short};

#[derive(Deserialize)]
struct SessionsResponse {
    sessions: Vec<Session>,
}

#[derive(Deserialize)]
struct Session {
    id: String,
    hash: String,
    name: Option<String>,
    direction: String,
    state: String,
    size: u64,
    total_chunks: u32,
    chunks_done: u32,
    progress: f64,
    bytes_done: u64,
    speed_bps: u64,
    eta_secs: Option<u64>,
    peers: Vec<String>,
    in_flight: usize,
    selection_retries: u32,
    last_error: Option<String>,
}

#[derive(Deserialize)]
struct StateResponse {
    session_id: String,
    state: String,
}

#[derive(Deserialize)]
struct DismissResponse {
    session_id: String,
    dismissed: bool,
}

#[derive(Serialize)]
struct DownloadRequest<'a> {
    hash: &'a str,
    size: u64,
}

fn progress_bar(progress: f64) -> String {
    const WIDTH: usize = 20;
    let filled = ((progress.clamp(0.0, 1.0)) * WIDTH as f64).round() as usize;
    format!("[{}{}]", "█".repeat(filled), "·".repeat(WIDTH - filled))
}

fn fmt_eta(eta: Option<u64>) -> String {
    match eta {
        None => "-".to_string(),
        Some(s) if s >= 3600 => format!("{}h{:02}m", s / 3600, (s % 3600) / 60),
        Some(s) if s >= 60 => format!("{}m{:02}s", s / 60, s % 60),
        Some(s) => format!("{s}s"),
    }
}

pub async fn cmd_sessions(port: u16) -> Result<()> {
    let resp: SessionsResponse = get_json(&format!("{}/sessions", base_url(port))).await?;

    if resp.sessions.is_empty() {
        println!("No transfer sessions.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Transfer Sessions ({})", resp.sessions.len());
    println!("═══════════════════════════════════════");

    for s in &resp.sessions {
        let arrow = if s.direction == "upload" { "↑" } else { "↓" };
        println!(
            "  ┌─ {} {} {}",
            s.id,
            arrow,
            s.name.as_deref().unwrap_or(short(&s.hash))
        );
        println!("  │  state    : {}", s.state);
        println!(
            "  │  progress : {} {:>5.1}%  {}/{} chunks",
            progress_bar(s.progress),
            s.progress * 100.0,
            s.chunks_done,
            s.total_chunks
        );
        println!(
            "  └─ speed    : {}/s  eta {}  ({} peers)",
            fmt_bytes(s.speed_bps),
            fmt_eta(s.eta_secs),
            s.peers.len()
        );
    }

    Ok(())
}

pub async fn cmd_session_inspect(port: u16, session_id: &str) -> Result<()> {
    let s: Session = get_json(&format!("{}/sessions/{}", base_url(port), session_id)).await?;

    println!("═══════════════════════════════════════");
    println!("  Session Details");
    println!("═══════════════════════════════════════");
    println!("  ID        : {}", s.id);
    println!("  Hash      : {}", s.hash);
    if let Some(name) = &s.name {
        println!("  Name      : {}", name);
    }
    println!("  Direction : {}", s.direction);
    println!("  State     : {}", s.state);
    println!("  Size      : {}", fmt_bytes(s.size));
    println!(
        "  Progress  : {} {:.1}% ({}/{} chunks, {})",
        progress_bar(s.progress),
        s.progress * 100.0,
        s.chunks_done,
        s.total_chunks,
        fmt_bytes(s.bytes_done)
    );
    println!("  Speed     : {}/s", fmt_bytes(s.speed_bps));
    println!("  ETA       : {}", fmt_eta(s.eta_secs));
    println!("  In flight : {}", s.in_flight);
    println!("  Retries   : {}", s.selection_retries);
    if let Some(err) = &s.last_error {
        println!("  Error     : {}", err);
    }
    if !s.peers.is_empty() {
        println!("  Peers     :");
        for p in &s.peers {
            println!("    {}", short(p));
        }
    }

    Ok(())
}

pub async fn cmd_download(port: u16, hash: &str, size: u64) -> Result<()> {
    let resp: StateResponse = post_json_body(
        &format!("{}/downloads", base_url(port)),
        &DownloadRequest { hash, size },
    )
    .await?;
    println!("✓ Download started: session {} ({})", resp.session_id, resp.state);
    Ok(())
}

/// `pause`, `resume` or `cancel`.
pub async fn cmd_session_action(port: u16, session_id: &str, action: &str) -> Result<()> {
    let resp: StateResponse = post_json(&format!(
        "{}/sessions/{}/{}",
        base_url(port),
        session_id,
        action
    ))
    .await?;
    println!("✓ Session {}: {}", resp.session_id, resp.state);
    Ok(())
}

pub async fn cmd_session_dismiss(port: u16, session_id: &str) -> Result<()> {
    let resp: DismissResponse =
        delete_json(&format!("{}/sessions/{}", base_url(port), session_id)).await?;
    if resp.dismissed {
        println!("✓ Session dismissed: {}", resp.session_id);
    }
    Ok(())
}
