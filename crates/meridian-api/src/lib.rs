pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

/// All `/api` routes, without CORS or a listener.
pub fn router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/peers", get(handlers::handle_peers))
        .route("/sessions", get(handlers::handle_sessions))
        .route(
            "/sessions/{id}",
            get(handlers::handle_session_inspect).delete(handlers::handle_session_dismiss),
        )
        .route("/sessions/{id}/pause", post(handlers::handle_session_pause))
        .route("/sessions/{id}/resume", post(handlers::handle_session_resume))
        .route("/sessions/{id}/cancel", post(handlers::handle_session_cancel))
        .route("/downloads", post(handlers::handle_download))
        .route("/content", get(handlers::handle_search))
        .route("/content/{hash}/providers", get(handlers::handle_providers))
        .route("/content/{hash}/export", post(handlers::handle_export))
        .route("/share", post(handlers::handle_share))
        .route(
            "/share/upload",
            post(handlers::handle_share_upload)
                .layer(DefaultBodyLimit::max(handlers::content::MAX_UPLOAD_BYTES)),
        )
        .route("/announce", post(handlers::handle_announce))
        .route("/lookup/{id}", get(handlers::handle_lookup))
        .route(
            "/limits",
            get(handlers::handle_limits).put(handlers::handle_limits_update),
        )
        .route("/events", get(handlers::handle_events))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
