//! Content commands: search, share, announce, export and raw DHT lookups.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::http::{base_url, get_json, post_json_body, post_multipart};
use super::{fmt_bytes, short};

#[derive(Deserialize)]
struct SearchResponse {
    query: String,
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    hash: String,
    name: Option<String>,
    size: Option<u64>,
    kind: Option<String>,
    seeders: usize,
    local_chunks: u32,
    total_chunks: u32,
    complete: bool,
}

#[derive(Deserialize)]
struct Contact {
    id: String,
    addr: String,
}

#[derive(Deserialize)]
struct ProvidersResponse {
    hash: String,
    providers: Vec<Contact>,
}

#[derive(Deserialize)]
struct SharedContent {
    hash: String,
    name: String,
    size: u64,
    chunks: u32,
}

#[derive(Deserialize)]
struct AnnounceResponse {
    hash: String,
    announced: bool,
}

#[derive(Deserialize)]
struct ExportResponse {
    path: String,
    bytes: u64,
}

#[derive(Deserialize)]
struct LookupResponse {
    target: String,
    mode: String,
    rounds: u32,
    queried: usize,
    elapsed_ms: u64,
    outcome: Outcome,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Outcome {
    Converged {
        closest: Vec<Contact>,
    },
    Found {
        providers: Vec<Contact>,
        manifest: Option<Value>,
    },
    NotFound {
        reason: String,
        closest: Vec<Contact>,
    },
}

fn print_contacts(label: &str, contacts: &[Contact]) {
    println!("  {} ({}):", label, contacts.len());
    for c in contacts {
        println!("    {}  {}", short(&c.id), c.addr);
    }
}

pub async fn cmd_search(port: u16, query: &str) -> Result<()> {
    let url = reqwest::Url::parse_with_params(&format!("{}/content", base_url(port)), &[("q", query)])
        .context("invalid search query")?;
    let resp: SearchResponse = get_json(url.as_str()).await?;

    if resp.results.is_empty() {
        println!("Nothing matches \"{}\".", resp.query);
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Search: \"{}\" ({} results)", resp.query, resp.results.len());
    println!("═══════════════════════════════════════");

    for r in &resp.results {
        println!(
            "  ┌─ {}{}",
            r.name.as_deref().unwrap_or("(unnamed)"),
            if r.complete { "  ✓ local" } else { "" }
        );
        println!("  │  hash    : {}", r.hash);
        if let Some(kind) = &r.kind {
            println!("  │  kind    : {}", kind);
        }
        println!(
            "  │  size    : {}",
            r.size.map(fmt_bytes).unwrap_or_else(|| "unknown".to_string())
        );
        println!("  │  held    : {}/{} chunks", r.local_chunks, r.total_chunks);
        println!("  └─ seeders : {}", r.seeders);
    }

    Ok(())
}

pub async fn cmd_providers(port: u16, hash: &str) -> Result<()> {
    let resp: ProvidersResponse =
        get_json(&format!("{}/content/{}/providers", base_url(port), hash)).await?;
    println!("Providers of {}", resp.hash);
    if resp.providers.is_empty() {
        println!("  none known");
    }
    for p in &resp.providers {
        println!("  {}  {}", short(&p.id), p.addr);
    }
    Ok(())
}

pub async fn cmd_share(port: u16, path: &str) -> Result<()> {
    // the daemon reads the file itself, so hand it an absolute path
    let abs = std::fs::canonicalize(Path::new(path))
        .with_context(|| format!("cannot resolve {}", path))?;
    let resp: SharedContent =
        post_json_body(&format!("{}/share", base_url(port)), &json!({ "path": abs })).await?;
    print_shared(&resp);
    Ok(())
}

/// Share a file the daemon cannot read directly by uploading its bytes.
pub async fn cmd_upload(port: u16, path: &str) -> Result<()> {
    use reqwest::multipart;

    let file_data =
        std::fs::read(path).with_context(|| format!("failed to read file: {}", path))?;
    let filename = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();

    let form = multipart::Form::new().part("file", multipart::Part::bytes(file_data).file_name(filename));
    let resp: SharedContent = post_multipart(&format!("{}/share/upload", base_url(port)), form).await?;
    print_shared(&resp);
    Ok(())
}

fn print_shared(resp: &SharedContent) {
    println!("✓ Sharing {}", resp.name);
    println!("  Hash   : {}", resp.hash);
    println!("  Size   : {}", fmt_bytes(resp.size));
    println!("  Chunks : {}", resp.chunks);
}

pub async fn cmd_announce(port: u16, hash: &str) -> Result<()> {
    let resp: AnnounceResponse =
        post_json_body(&format!("{}/announce", base_url(port)), &json!({ "hash": hash })).await?;
    if resp.announced {
        println!("✓ Announced {}", resp.hash);
    }
    Ok(())
}

pub async fn cmd_export(port: u16, hash: &str, dest: &str) -> Result<()> {
    let dest = std::path::absolute(dest).with_context(|| format!("cannot resolve {}", dest))?;
    let resp: ExportResponse = post_json_body(
        &format!("{}/content/{}/export", base_url(port), hash),
        &json!({ "path": dest }),
    )
    .await?;
    println!("✓ Wrote {} to {}", fmt_bytes(resp.bytes), resp.path);
    Ok(())
}

pub async fn cmd_lookup(port: u16, target: &str, mode: &str) -> Result<()> {
    let resp: LookupResponse = get_json(&format!(
        "{}/lookup/{}?mode={}",
        base_url(port),
        target,
        mode
    ))
    .await?;

    println!("═══════════════════════════════════════");
    println!("  {} lookup for {}", resp.mode.to_uppercase(), short(&resp.target));
    println!("═══════════════════════════════════════");
    println!(
        "  {} rounds, {} peers queried, {} ms",
        resp.rounds, resp.queried, resp.elapsed_ms
    );

    match &resp.outcome {
        Outcome::Converged { closest } => {
            println!("  Converged");
            print_contacts("Closest", closest);
        }
        Outcome::Found { providers, manifest } => {
            println!("  Found");
            print_contacts("Providers", providers);
            if let Some(m) = manifest {
                let chunks = m["chunk_digests"].as_array().map(Vec::len).unwrap_or(0);
                println!("  Manifest: {} chunks", chunks);
            }
        }
        Outcome::NotFound { reason, closest } => {
            println!("  Not found ({})", reason);
            print_contacts("Closest", closest);
        }
    }

    Ok(())
}
