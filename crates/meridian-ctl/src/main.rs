//! meridian-ctl — command-line interface for the meridian daemon.

mod cmd;

use anyhow::{Context, Result};

use cmd::{content, sessions, status};

const DEFAULT_PORT: u16 = 9001;

fn print_usage() {
    println!("Usage: meridian-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                          Show node status and network statistics");
    println!("  peers                           List peers in the routing table");
    println!("  sessions                        List transfer sessions");
    println!("  session <id>                    Show one session in detail");
    println!("  download <hash> [size]          Start downloading content");
    println!("  pause <id>                      Pause a download");
    println!("  resume <id>                     Resume a paused download");
    println!("  cancel <id>                     Cancel a transfer");
    println!("  dismiss <id>                    Remove a finished session");
    println!("  search <text>                   Search known content by name or hash");
    println!("  providers <hash>                List known providers of content");
    println!("  share <path>                    Chunk a local file and announce it");
    println!("  share --upload <path>           Upload a file to the daemon and share it");
    println!("  announce <hash>                 Re-announce locally held content");
    println!("  export <hash> <dest>            Write downloaded content to a file");
    println!("  lookup <id> [node|value]        Run a DHT lookup");
    println!("  limits                          Show bandwidth and connection limits");
    println!("  limits set <down> <up> <conns>  Change limits (0 = unlimited, - = keep)");
    println!("  events                          Stream engine events");
    println!("  shutdown                        Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

/// One `limits set` argument: `-` leaves the value unchanged.
fn limit_arg(raw: &str) -> Result<Option<i64>> {
    if raw == "-" {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .with_context(|| format!("limit must be a number or '-', got {raw}"))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => status::cmd_status(port).await,
        ["peers"] => status::cmd_peers(port).await,
        ["sessions"] => sessions::cmd_sessions(port).await,
        ["session", id] => sessions::cmd_session_inspect(port, id).await,
        ["download", hash] => sessions::cmd_download(port, hash, 0).await,
        ["download", hash, size] => {
            let size = size.parse().context("size must be a number of bytes")?;
            sessions::cmd_download(port, hash, size).await
        }
        [action @ ("pause" | "resume" | "cancel"), id] => {
            sessions::cmd_session_action(port, id, action).await
        }
        ["dismiss", id] => sessions::cmd_session_dismiss(port, id).await,
        ["search", words @ ..] if !words.is_empty() => {
            content::cmd_search(port, &words.join(" ")).await
        }
        ["providers", hash] => content::cmd_providers(port, hash).await,
        ["share", path] => content::cmd_share(port, path).await,
        ["share", "--upload", path] => content::cmd_upload(port, path).await,
        ["announce", hash] => content::cmd_announce(port, hash).await,
        ["export", hash, dest] => content::cmd_export(port, hash, dest).await,
        ["lookup", id] => content::cmd_lookup(port, id, "node").await,
        ["lookup", id, mode @ ("node" | "value")] => content::cmd_lookup(port, id, mode).await,
        ["limits"] => status::cmd_limits(port).await,
        ["limits", "set", down, up, conns] => {
            let update = status::Limits {
                max_download_bps: limit_arg(down)?,
                max_upload_bps: limit_arg(up)?,
                max_connections: limit_arg(conns)?,
            };
            status::cmd_limits_set(port, update).await
        }
        ["events"] => status::cmd_events(port).await,
        ["shutdown"] => status::cmd_shutdown(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
