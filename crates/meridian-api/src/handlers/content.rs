//! /content, /share, /announce, /lookup handlers.

use std::path::PathBuf;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use meridian_core::wire::Contact;
use meridian_core::ContentHash;
use meridian_services::{LookupMode, LookupResult, SearchResult, SharedContent};

use super::{engine_error, parse_hash, ApiState};

/// Maximum upload size per file (256 MB).
pub const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

// ── /content?q= ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
}

pub async fn handle_search(
    State(state): State<ApiState>,
    Query(query): Query<SearchQuery>,
) -> Json<SearchResponse> {
    let results = state.engine.search(&query.q);
    Json(SearchResponse {
        query: query.q,
        results,
    })
}

// ── /content/:hash/providers ──────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ProvidersResponse {
    pub hash: ContentHash,
    pub providers: Vec<Contact>,
}

pub async fn handle_providers(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
) -> Result<Json<ProvidersResponse>, (StatusCode, String)> {
    let hash = parse_hash(&hash)?;
    Ok(Json(ProvidersResponse {
        hash,
        providers: state.engine.providers(&hash),
    }))
}

// ── /content/:hash/export (POST) ──────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ExportRequest {
    pub path: PathBuf,
}

#[derive(Serialize)]
pub struct ExportResponse {
    pub path: PathBuf,
    pub bytes: u64,
}

pub async fn handle_export(
    State(state): State<ApiState>,
    Path(hash): Path<String>,
    Json(req): Json<ExportRequest>,
) -> Result<Json<ExportResponse>, (StatusCode, String)> {
    let hash = parse_hash(&hash)?;
    let bytes = state.engine.export(hash, &req.path).map_err(engine_error)?;
    tracing::info!(hash = %hash, path = %req.path.display(), bytes, "content exported");
    Ok(Json(ExportResponse {
        path: req.path,
        bytes,
    }))
}

// ── /share (POST) ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ShareRequest {
    pub path: PathBuf,
}

pub async fn handle_share(
    State(state): State<ApiState>,
    Json(req): Json<ShareRequest>,
) -> Result<Json<SharedContent>, (StatusCode, String)> {
    state
        .engine
        .share_file(&req.path)
        .await
        .map(Json)
        .map_err(engine_error)
}

// ── /share/upload (POST, multipart) ───────────────────────────────────────────

pub async fn handle_share_upload(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<Json<SharedContent>, (StatusCode, String)> {
    let mut file_data = Vec::new();
    let mut filename = String::from("uploaded_file");

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if let Some(name) = field.file_name() {
            filename = sanitize_filename(name);
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        if file_data.len() + data.len() > MAX_UPLOAD_BYTES {
            return Err((
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("file exceeds {} byte limit", MAX_UPLOAD_BYTES),
            ));
        }
        file_data.extend_from_slice(&data);
    }

    if file_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no file data".to_string()));
    }
    if filename.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "empty filename".to_string()));
    }

    state
        .engine
        .share_bytes(&filename, &file_data)
        .map(Json)
        .map_err(engine_error)
}

/// Keep only the final path component and drop control characters.
fn sanitize_filename(name: &str) -> String {
    name.rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

// ── /announce (POST) ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AnnounceRequest {
    pub hash: String,
}

#[derive(Serialize)]
pub struct AnnounceResponse {
    pub hash: ContentHash,
    pub announced: bool,
}

pub async fn handle_announce(
    State(state): State<ApiState>,
    Json(req): Json<AnnounceRequest>,
) -> Result<Json<AnnounceResponse>, (StatusCode, String)> {
    let hash = parse_hash(&req.hash)?;
    state.engine.announce(hash).map_err(engine_error)?;
    Ok(Json(AnnounceResponse {
        hash,
        announced: true,
    }))
}

// ── /lookup/:id?mode= ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LookupQuery {
    pub mode: Option<String>,
}

pub async fn handle_lookup(
    State(state): State<ApiState>,
    Path(target): Path<String>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<LookupResult>, (StatusCode, String)> {
    let target = parse_hash(&target)?;
    let mode = match query.mode.as_deref() {
        None => LookupMode::Node,
        Some(m) => m.parse().map_err(|e| (StatusCode::BAD_REQUEST, e))?,
    };
    Ok(Json(state.engine.lookup(target, mode).await))
}
