//! Health and debug-dump HTTP surface, grounded the same way as
//! `fam-ms`/`fam-mds`'s admin routers on `vcontrol`'s `Router`+
//! `Extension` layout, using axum 0.8's `axum::serve(listener, app)`
//! entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tracing::info;

use crate::CisCoordinator;

pub fn router(state: Arc<CisCoordinator>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/debug/state", get(debug_state))
        .layer(ServiceBuilder::new().layer(Extension(state)))
}

pub async fn serve(state: Arc<CisCoordinator>, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("fam-cis admin listening on {addr}");
    axum::serve(listener, app).await
}

async fn healthz() -> impl IntoResponse {
    ""
}

async fn debug_state(Extension(_state): Extension<Arc<CisCoordinator>>) -> impl IntoResponse {
    Json(json!({ "role": "cis" }))
}
