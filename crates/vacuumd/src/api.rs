//! HTTP status and map-image surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Path;
use axum::extract::State;
use axum::http::header;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::hub::Hub;
use crate::hub::ImageServeError;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
}

#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

#[tracing::instrument(skip(state))]
async fn devices(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.hub.device_statuses().await))
}

/// Handler for GET /v1/devices/:duid/maps/:map_id
///
/// Serves the cached render; a render failure is a 500 for this request
/// only, never a crash of the device's coordinator.
#[tracing::instrument(skip(state))]
async fn map_image(
    State(state): State<AppState>,
    Path((duid, map_id)): Path<(String, u32)>,
) -> impl IntoResponse {
    match state.hub.map_image(&duid, map_id).await {
        Ok(png) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/png")],
            png,
        )
            .into_response(),
        Err(e @ (ImageServeError::UnknownDevice | ImageServeError::UnknownMap)) => {
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        Err(e) => {
            tracing::error!(duid, map_id, "map image request failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/devices", get(devices))
        .route("/v1/devices/:duid/maps/:map_id", get(map_image))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server.
///
/// Binds the given address and serves until the shutdown signal fires.
pub async fn serve(
    listen: String,
    port: u16,
    hub: Arc<Hub>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(AppState { hub });

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
