//! HTTP status surface.
//!
//! Serves the JSON the (external) dashboard consumes: `/health` and
//! `/status` on the `--listen-ui` address. Read-only; everything mutating
//! goes through the control RPC.

use crate::control::{ControlState, StatusSnapshot};
use axum::{extract::State, response::Json, routing::get, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

#[derive(Clone)]
struct AppState {
    control: Arc<ControlState>,
}

pub async fn serve(
    addr: String,
    control: Arc<ControlState>,
    shutdown: CancellationToken,
) -> crate::Result<()> {
    let app = Router::new()
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(AppState { control });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("http status server listening on http://{}/status", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "meshtund",
    }))
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.control.status_snapshot())
}
