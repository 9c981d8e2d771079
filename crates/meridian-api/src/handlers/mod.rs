//! HTTP API handlers — exposes engine state and commands as JSON.

pub mod content;
pub mod events;
pub mod sessions;
pub mod status;

use std::sync::Arc;

use axum::http::StatusCode;

use meridian_core::{ContentHash, EngineError};
use meridian_services::{Engine, SessionId};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
    /// Shutdown broadcast sender — signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Parse a hex-encoded 20-byte content hash or node id.
fn parse_hash(hex_str: &str) -> Result<ContentHash, (StatusCode, String)> {
    hex_str
        .parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid id: {e}")))
}

/// Parse a hex-encoded 64-bit session id.
fn parse_session_id(hex_str: &str) -> Result<SessionId, (StatusCode, String)> {
    hex_str
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid session id".to_string()))
}

/// Map an engine error to the status the API reports it with.
fn engine_error(e: EngineError) -> (StatusCode, String) {
    let status = match &e {
        EngineError::ConfigurationInvalid(_) | EngineError::InvalidTransition { .. } => {
            StatusCode::BAD_REQUEST
        }
        EngineError::UnknownSession(_) | EngineError::UnknownContent(_) => StatusCode::NOT_FOUND,
        EngineError::LookupTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

// Re-export handler functions for use in router setup.
pub use content::{
    handle_announce, handle_export, handle_lookup, handle_providers, handle_search, handle_share,
    handle_share_upload,
};
pub use events::handle_events;
pub use sessions::{
    handle_download, handle_session_cancel, handle_session_dismiss, handle_session_inspect,
    handle_session_pause, handle_session_resume, handle_sessions,
};
pub use status::{handle_limits, handle_limits_update, handle_peers, handle_shutdown, handle_status};


#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::Id;

    #[test]
    fn errors_map_to_statuses() {
        let (status, _) = engine_error(EngineError::ConfigurationInvalid("x".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = engine_error(EngineError::UnknownContent(Id::ZERO));
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, msg) = engine_error(EngineError::InvalidTransition {
            action: "pause",
            state: "completed",
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(msg, "cannot pause a session that is completed");
    }

    #[test]
    fn ids_are_validated() {
        assert!(parse_hash("zz").is_err());
        assert!(parse_hash(&Id::from_low_u64(9).to_string()).is_ok());
        assert_eq!(parse_session_id("00000000000000ff").unwrap(), SessionId(255));
        assert_eq!(parse_session_id("nope").unwrap_err().0, StatusCode::BAD_REQUEST);
    }
}
