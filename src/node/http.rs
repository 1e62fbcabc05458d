//! Admin HTTP API
//!
//! - `GET /health`
//! - `GET /peers`: peers from the local gossip metadata
//! - `GET /self`
//! - `GET /metrics`: Prometheus text format
//! - `POST /sync/:peer`: pull a peer's full state now (peer id or RPC address)

use crate::common::{Error, METRICS};
use crate::membership::MembershipAgent;
use crate::store::ReplicatedStore;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AdminState {
    pub agent: Arc<MembershipAgent>,
    pub store: Arc<ReplicatedStore>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/peers", get(peers))
        .route("/self", get(local_node))
        .route("/metrics", get(metrics))
        .route("/sync/:peer", post(sync_from_peer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "node": state.agent.local_node().id,
        "peers": state.agent.directory().len(),
        "locked": state.store.is_locked(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn peers(State(state): State<AdminState>) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.agent.peers()?))
}

async fn local_node(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.agent.local_node())
}

async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, METRICS.to_prometheus())
}

async fn sync_from_peer(
    State(state): State<AdminState>,
    Path(peer): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let address = match state.agent.directory().get(&peer) {
        Some(known) => known.rpc_address,
        None => peer,
    };
    let report = state.store.peer_sync(&address).await?;
    Ok(Json(report))
}
