//! CLI command modules.

pub mod content;
pub mod http;
pub mod sessions;
pub mod status;

/// Human-readable byte count.
pub fn fmt_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// First 16 hex characters of an id, for tables.
pub fn short(id: &str) -> &str {
    id.get(..16).unwrap_or(id)
}
