//! HTTP bootstrap server
//!
//! `POST /connect_webrtc_peer` takes `{name, uuid, sdp}` and replies with the
//! coordinator's answer. `GET /status` reports the registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::constants::CONNECT_ROUTE;
use crate::error::Result;
use crate::identity::PeerIdentity;
use crate::protocol::{ConnectRequest, ConnectResponse};
use crate::signaling::hub::SignalingHub;

/// API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// One registry entry as reported by `/status`
#[derive(Debug, Serialize)]
pub struct PeerStatus {
    #[serde(flatten)]
    pub identity: PeerIdentity,
    pub state: String,
}

/// Mesh status
#[derive(Debug, Serialize)]
pub struct MeshStatus {
    pub local: PeerIdentity,
    pub coordinator: Option<String>,
    pub peers: Vec<PeerStatus>,
}

pub fn router(hub: Arc<SignalingHub>) -> Router {
    Router::new()
        .route(CONNECT_ROUTE, post(connect_peer))
        .route("/status", get(get_status))
        .layer(CorsLayer::permissive())
        .with_state(hub)
}

/// Bind `addr` and serve the bootstrap routes until the task is dropped
pub async fn serve(hub: Arc<SignalingHub>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Bootstrap server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(hub)).await?;
    Ok(())
}

/// Answer a peer's offer
pub async fn connect_peer(
    State(hub): State<Arc<SignalingHub>>,
    payload: std::result::Result<Json<ConnectRequest>, JsonRejection>,
) -> (StatusCode, Json<ConnectResponse>) {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::warn!("Bad bootstrap request: {}", rejection.body_text());
            return (
                StatusCode::BAD_REQUEST,
                Json(ConnectResponse::error(rejection.body_text())),
            );
        }
    };

    match hub
        .accept_inbound_offer(&request.name, &request.uuid, request.sdp)
        .await
    {
        Ok(answer) => (
            StatusCode::OK,
            Json(ConnectResponse::ok(answer, hub.local_identity().uuid)),
        ),
        Err(e) => {
            tracing::warn!("Rejected offer from {}: {}", request.uuid, e);
            (StatusCode::BAD_REQUEST, Json(ConnectResponse::error(e.to_string())))
        }
    }
}

/// Get mesh status
pub async fn get_status(State(hub): State<Arc<SignalingHub>>) -> Json<ApiResponse<MeshStatus>> {
    let registry = hub.registry();
    let mut peers: Vec<PeerStatus> = registry
        .remotes()
        .into_iter()
        .map(|peer| PeerStatus {
            identity: peer.identity(),
            state: peer.state().to_string(),
        })
        .collect();
    peers.sort_by(|a, b| a.identity.uuid.cmp(&b.identity.uuid));

    Json(ApiResponse::ok(MeshStatus {
        local: hub.local_identity(),
        coordinator: registry.coordinator(),
        peers,
    }))
}
