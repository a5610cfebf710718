//! Health and debug-dump HTTP surface, grounded the same way as
//! `fam-mds`'s admin router on `vcontrol`'s `Router`+`Extension` layout,
//! using axum 0.8's `axum::serve(listener, app)` entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use fam_rdma::provider::FabricProvider;
use serde_json::json;
use tower::ServiceBuilder;
use tracing::info;

use crate::MemoryServer;

pub fn router<P: FabricProvider + 'static>(state: Arc<MemoryServer<P>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/debug/state", get(debug_state::<P>))
        .layer(ServiceBuilder::new().layer(Extension(state)))
}

pub async fn serve<P: FabricProvider + 'static>(
    state: Arc<MemoryServer<P>>,
    addr: SocketAddr,
) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("fam-ms admin listening on {addr}");
    axum::serve(listener, app).await
}

async fn healthz() -> impl IntoResponse {
    ""
}

async fn debug_state<P: FabricProvider + 'static>(
    Extension(state): Extension<Arc<MemoryServer<P>>>,
) -> impl IntoResponse {
    Json(json!({
        "node_id": state.fabric.node_id(),
        "atl_disabled": state.service.atl.any_disabled(),
    }))
}
