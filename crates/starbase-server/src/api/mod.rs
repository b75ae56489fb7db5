//! Query Surface
//!
//! Thin HTTP boundary: validates inputs, dispatches to the core services,
//! and encodes results (and errors) as JSON.

mod handlers;

use axum::Router;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Build the API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Sync
        .route("/api/sync/status", get(handlers::sync_status))
        .route("/api/sync/manual", post(handlers::sync_manual))
        .route("/api/sync/history", get(handlers::sync_history))
        .route(
            "/api/sync/repo/{owner}/{name}/reanalyze",
            post(handlers::reanalyze_repo),
        )
        // Search & repositories
        .route("/api/search", get(handlers::search))
        .route("/api/repos", get(handlers::list_repos))
        .route("/api/repos/{owner}/{name}", get(handlers::get_repo))
        // Recommendations
        .route(
            "/api/recommendations/{owner}/{name}",
            get(handlers::recommendations),
        )
        // Graph
        .route("/api/graph/rebuild", post(handlers::graph_rebuild))
        .route(
            "/api/graph/semantic-edges/rebuild",
            post(handlers::semantic_edges_rebuild),
        )
        .route("/api/graph/status", get(handlers::graph_status))
        .route(
            "/api/graph/nodes/{owner}/{name}/edges",
            get(handlers::node_edges),
        )
        .route(
            "/api/graph/nodes/{owner}/{name}/related",
            get(handlers::node_related),
        )
        // Vectors
        .route("/api/vector/status", get(handlers::vector_status))
        .route("/api/vector/reindex", post(handlers::vector_reindex))
        // Liveness
        .route("/health", get(handlers::health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map a core error to a response with the stable JSON error shape
pub(crate) fn error_response(e: starbase_core::Error) -> (StatusCode, Json<Value>) {
    use starbase_core::Error;

    let (status, kind, suggestions): (StatusCode, &str, Option<Vec<&str>>) = match &e {
        Error::InputInvalid(_) => (StatusCode::BAD_REQUEST, "invalid_input", None),
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
        Error::Conflict(_) => (
            StatusCode::CONFLICT,
            "conflict",
            Some(vec!["wait for the running sync to finish"]),
        ),
        Error::RemoteTransient(_) => (
            StatusCode::BAD_GATEWAY,
            "remote_transient",
            Some(vec!["retry later; the upstream API is flaky or throttling"]),
        ),
        Error::RemoteFatal { .. } => (
            StatusCode::BAD_GATEWAY,
            "remote_fatal",
            Some(vec!["check the configured remote token"]),
        ),
        Error::EmbedderUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "embedder_unavailable", None),
        Error::Cancelled => (StatusCode::BAD_REQUEST, "cancelled", None),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
    };

    if status.is_server_error() {
        tracing::error!("Request failed: {}", e);
    }

    let mut body = json!({
        "error": kind,
        "message": e.to_string(),
    });
    if let Some(suggestions) = suggestions {
        body["suggestions"] = json!(suggestions);
    }
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use starbase_core::Error;

    #[test]
    fn test_error_mapping_statuses() {
        let (status, _) = error_response(Error::InputInvalid("bad".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = error_response(Error::NotFound("x".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = error_response(Error::Conflict("sync already running".into()));
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.0["error"], "conflict");
        assert!(body.0["suggestions"].is_array());

        let (status, _) = error_response(Error::Internal("bug".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_body_shape() {
        let (_, body) = error_response(Error::NotFound("repository a/b".into()));
        assert!(body.0["error"].is_string());
        assert!(body.0["message"].as_str().unwrap().contains("a/b"));
    }
}
