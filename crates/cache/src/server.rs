//! Minimal HTTP build cache server.
//!
//! Serves a [`LocalDirectoryBackend`] over the same protocol
//! [`HttpBackend`](crate::HttpBackend) speaks, so a shared directory can act
//! as a remote cache for other machines.

use crate::backend::{BuildCacheBackend, LocalDirectoryBackend};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use kiln_core::CacheKey;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct ServerState {
    backend: Arc<LocalDirectoryBackend>,
}

/// Routes `GET` and `PUT` on `/cache/:key`
pub fn router(backend: Arc<LocalDirectoryBackend>) -> Router {
    Router::new()
        .route("/cache/:key", get(load_entry).put(store_entry))
        .layer(DefaultBodyLimit::disable())
        .with_state(ServerState { backend })
}

/// Serve `backend` on `listener` until the task is dropped
pub async fn serve(
    listener: TcpListener,
    backend: Arc<LocalDirectoryBackend>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, root = %backend.root().display(), "Serving build cache");
    }
    axum::serve(listener, router(backend)).await
}

async fn load_entry(State(state): State<ServerState>, Path(key): Path<String>) -> Response {
    let Some(key) = CacheKey::parse(&key) else {
        return (StatusCode::BAD_REQUEST, "invalid cache key").into_response();
    };
    match state.backend.load(&key).await {
        Ok(Some(entry)) => (StatusCode::OK, entry).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(%key, "Failed to read cache entry: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn store_entry(
    State(state): State<ServerState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    let Some(key) = CacheKey::parse(&key) else {
        return (StatusCode::BAD_REQUEST, "invalid cache key").into_response();
    };
    debug!(%key, bytes = body.len(), "Storing cache entry");
    match state.backend.store(&key, Arc::new(body.to_vec())).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => {
            warn!(%key, "Failed to write cache entry: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
