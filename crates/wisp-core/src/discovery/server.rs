//! HTTP front end for the peer registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;

use super::{spawn_pruner, Announcement, Neighbor, PeerRegistry, SharedRegistry, PRUNE_INTERVAL};
use crate::code::EndpointId;
use crate::error::{Error, Result};

/// Announcements are tiny; anything larger is refused.
const BODY_LIMIT: usize = 16 * 1024;

/// JSON error body.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    /// Error code (e.g. "E009")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable message
    pub message: String,
    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            details: None,
        }
    }

    /// 404 for an unknown or stale peer.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// 400 for a malformed request.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Add details to the error.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// HTTP status of this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::EndpointTaken(_) => StatusCode::CONFLICT,
            Error::PeerUnavailable(_) => StatusCode::NOT_FOUND,
            Error::InvalidCodeFormat(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code().map(String::from),
            message: err.to_string(),
            details: err.suggestion().map(String::from),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

/// Result type for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Response to an announcement.
#[derive(Debug, Serialize, Deserialize)]
pub struct AnnounceResponse {
    /// Other live peers behind the caller's IP
    pub neighbors: Vec<Neighbor>,
}

/// Response to a lookup.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveResponse {
    /// The peer
    pub peer_id: EndpointId,
    /// Its announced socket address
    pub addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
struct WithdrawQuery {
    key: String,
}

/// Build the registry router.
pub fn router(registry: SharedRegistry) -> Router {
    Router::new()
        .route("/api/discovery", post(announce))
        .route("/api/peers/{peer_id}", get(resolve).delete(withdraw))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

async fn announce(
    State(registry): State<SharedRegistry>,
    ConnectInfo(caller): ConnectInfo<SocketAddr>,
    Json(mut announcement): Json<Announcement>,
) -> ApiResult<Json<AnnounceResponse>> {
    if announcement.key.is_empty() {
        return Err(ApiError::bad_request("announcement key must not be empty"));
    }

    // Listeners bound to the wildcard address are reachable on the caller's IP.
    if let Some(addr) = announcement.addr.as_mut() {
        if addr.ip().is_unspecified() {
            addr.set_ip(caller.ip());
        }
    }

    let neighbors = registry
        .lock()
        .await
        .announce(caller.ip(), announcement, Instant::now())?;
    Ok(Json(AnnounceResponse { neighbors }))
}

async fn resolve(
    State(registry): State<SharedRegistry>,
    Path(peer_id): Path<String>,
) -> ApiResult<Json<ResolveResponse>> {
    let peer_id = EndpointId::from_raw(peer_id);
    let addr = registry
        .lock()
        .await
        .resolve(&peer_id, Instant::now())
        .ok_or_else(|| ApiError::not_found(format!("peer {peer_id} not found")))?;
    Ok(Json(ResolveResponse { peer_id, addr }))
}

async fn withdraw(
    State(registry): State<SharedRegistry>,
    Path(peer_id): Path<String>,
    Query(query): Query<WithdrawQuery>,
) -> StatusCode {
    let peer_id = EndpointId::from_raw(peer_id);
    if registry.lock().await.withdraw(&peer_id, &query.key) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Serve the registry on `bind` until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn serve(bind: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    serve_on(listener, cancel).await
}

/// Serve the registry on an already bound listener until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the server stops abnormally.
pub async fn serve_on(listener: tokio::net::TcpListener, cancel: CancellationToken) -> Result<()> {
    let registry: SharedRegistry = Arc::new(Mutex::new(PeerRegistry::default()));
    let pruner = spawn_pruner(registry.clone(), PRUNE_INTERVAL, cancel.child_token());

    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "Registry listening");

    let app = router(registry).into_make_service_with_connect_info::<SocketAddr>();
    let shutdown = cancel.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    cancel.cancel();
    let _ = pruner.await;
    tracing::info!("Registry stopped");
    result.map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let taken: ApiError = Error::EndpointTaken("x".into()).into();
        assert_eq!(taken.status_code(), StatusCode::CONFLICT);

        let registry: ApiError = Error::Registry("down".into()).into();
        assert_eq!(registry.code.as_deref(), Some("E009"));
        assert_eq!(registry.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(
            ApiError::not_found("gone").status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_error_serialization() {
        let err = ApiError::bad_request("bad").with_details("more");
        let json = serde_json::to_string(&err).expect("json");
        assert!(json.contains("\"message\":\"bad\""));
        assert!(json.contains("\"details\":\"more\""));
        assert!(!json.contains("code"));
        assert!(!json.contains("status"));
    }
}
