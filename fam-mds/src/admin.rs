//! Health and debug-dump HTTP surface, grounded on `vcontrol`'s
//! `Router`+`Extension`+`ServiceBuilder` layout. axum 0.8 replaces that
//! teacher's `axum::Server::bind(...).serve(...)` call with
//! `axum::serve(listener, app)`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tracing::info;

use crate::MdsState;

pub fn router(state: Arc<MdsState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/debug/state", get(debug_state))
        .layer(ServiceBuilder::new().layer(Extension(state)))
}

pub async fn serve(state: Arc<MdsState>, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("fam-mds admin listening on {addr}");
    axum::serve(listener, app).await
}

async fn healthz() -> impl IntoResponse {
    ""
}

async fn debug_state(Extension(state): Extension<Arc<MdsState>>) -> impl IntoResponse {
    Json(json!({
        "memservers": state.memservers.node_ids(),
    }))
}
