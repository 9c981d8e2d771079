//! /sessions, /downloads handlers — transfer session inspection and control.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use meridian_services::{SessionId, SessionSnapshot, SessionState};

use super::{engine_error, parse_hash, parse_session_id, ApiState};

// ── /sessions (GET) ───────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSnapshot>,
}

pub async fn handle_sessions(State(state): State<ApiState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.engine.sessions(),
    })
}

// ── /sessions/:id (GET) ───────────────────────────────────────────────────────

pub async fn handle_session_inspect(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, (StatusCode, String)> {
    let id = parse_session_id(&session_id)?;
    state.engine.session(id).map(Json).map_err(engine_error)
}

// ── /downloads (POST) ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DownloadRequest {
    pub hash: String,
    /// Size hint, shown until the manifest arrives.
    #[serde(default)]
    pub size: u64,
}

#[derive(Serialize)]
pub struct DownloadResponse {
    pub session_id: SessionId,
    pub state: SessionState,
}

pub async fn handle_download(
    State(state): State<ApiState>,
    Json(req): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, (StatusCode, String)> {
    let hash = parse_hash(&req.hash)?;
    let id = state.engine.start_download(hash, req.size);
    let session = state.engine.session(id).map_err(engine_error)?;
    tracing::info!(session = %id, hash = %hash, "download requested via API");

    Ok(Json(DownloadResponse {
        session_id: id,
        state: session.state,
    }))
}

// ── /sessions/:id/{pause,resume,cancel} (POST) ────────────────────────────────

#[derive(Serialize)]
pub struct SessionActionResponse {
    pub session_id: SessionId,
    pub state: SessionState,
}

fn after_action(
    state: &ApiState,
    id: SessionId,
    result: Result<(), meridian_core::EngineError>,
) -> Result<Json<SessionActionResponse>, (StatusCode, String)> {
    result.map_err(engine_error)?;
    let session = state.engine.session(id).map_err(engine_error)?;
    Ok(Json(SessionActionResponse {
        session_id: id,
        state: session.state,
    }))
}

pub async fn handle_session_pause(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionActionResponse>, (StatusCode, String)> {
    let id = parse_session_id(&session_id)?;
    let result = state.engine.pause(id);
    after_action(&state, id, result)
}

pub async fn handle_session_resume(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionActionResponse>, (StatusCode, String)> {
    let id = parse_session_id(&session_id)?;
    let result = state.engine.resume(id);
    after_action(&state, id, result)
}

pub async fn handle_session_cancel(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionActionResponse>, (StatusCode, String)> {
    let id = parse_session_id(&session_id)?;
    let result = state.engine.cancel(id);
    after_action(&state, id, result)
}

// ── /sessions/:id (DELETE) ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionDismissResponse {
    pub session_id: SessionId,
    pub dismissed: bool,
}

pub async fn handle_session_dismiss(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDismissResponse>, (StatusCode, String)> {
    let id = parse_session_id(&session_id)?;
    state.engine.dismiss(id).map_err(engine_error)?;
    tracing::info!(session = %id, "session dismissed via API");

    Ok(Json(SessionDismissResponse {
        session_id: id,
        dismissed: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support;
    use meridian_core::Id;

    async fn download(state: &ApiState) -> SessionId {
        let req = DownloadRequest {
            hash: Id::from_hash(b"wanted").to_string(),
            size: 100,
        };
        let Json(resp) = handle_download(State(state.clone()), Json(req)).await.unwrap();
        assert_eq!(resp.state, SessionState::Active);
        resp.session_id
    }

    #[tokio::test]
    async fn pause_resume_cancel_dismiss() {
        let state = test_support::state();
        let id = download(&state).await;
        let path = || Path(id.to_string());

        let Json(r) = handle_session_pause(State(state.clone()), path()).await.unwrap();
        assert_eq!(r.state, SessionState::Paused);
        let Json(r) = handle_session_resume(State(state.clone()), path()).await.unwrap();
        assert_eq!(r.state, SessionState::Active);

        // a live session cannot be dismissed
        let err = handle_session_dismiss(State(state.clone()), path()).await.err().unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let Json(r) = handle_session_cancel(State(state.clone()), path()).await.unwrap();
        assert_eq!(r.state, SessionState::Cancelled);
        let err = handle_session_pause(State(state.clone()), path()).await.err().unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let Json(r) = handle_session_dismiss(State(state.clone()), path()).await.unwrap();
        assert!(r.dismissed);
        let Json(list) = handle_sessions(State(state)).await;
        assert!(list.sessions.is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let state = test_support::state();
        let err = handle_session_inspect(State(state), Path("00000000000000aa".to_string()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_hash_is_rejected() {
        let state = test_support::state();
        let req = DownloadRequest {
            hash: "abc".to_string(),
            size: 0,
        };
        let err = handle_download(State(state), Json(req)).await.err().unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
