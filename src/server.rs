//! HTTP ingestion API.
//!
//! Collectors push metrics, events and inventory here and pull their device
//! list. Every route except `/health` carries an HMAC-signed [`Envelope`].
//!
//! [`Envelope`]: crate::ingest::Envelope

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::ingest::wire::{
    CapabilitiesRequest, DevicesRequest, DevicesResponse, EventsRequest, EventsResponse,
    InterfacesRequest, InterfacesResponse, LeasesRequest, LeasesResponse, MetricsRequest,
    MetricsResponse, SessionsRequest, SessionsResponse, StatusResponse,
};
use crate::ingest::{Authenticator, Envelope, IngestError, IngestionSink};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub sink: IngestionSink,
    pub auth: Authenticator,
}

/// Request failures that short-circuit a handler.
#[derive(Debug)]
enum ApiError {
    Unauthorized,
    Ingest(IngestError),
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        Self::Ingest(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(StatusResponse::error("Authentication failed")),
            )
                .into_response(),
            // Data errors are reported in-band
            Self::Ingest(
                e @ (IngestError::UnknownDevice(_)
                | IngestError::EmptyPayload
                | IngestError::InvalidPayload(_)),
            ) => Json(StatusResponse::error(e.to_string())).into_response(),
            Self::Ingest(IngestError::Storage(e)) => {
                tracing::error!(error = %e, "Ingestion failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(StatusResponse::error("Internal storage error")),
                )
                    .into_response()
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn authenticate(state: &AppState, envelope: &Envelope) -> Result<(), ApiError> {
    state.auth.check(envelope).map_err(|e| {
        tracing::warn!(collector_id = %envelope.collector_id, error = %e, "Rejected request");
        ApiError::Unauthorized
    })
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ingest/metrics", post(metrics_handler))
        .route("/ingest/events", post(events_handler))
        .route("/ingest/interfaces", post(interfaces_handler))
        .route("/ingest/leases", post(leases_handler))
        .route("/ingest/sessions", post(sessions_handler))
        .route("/devices", post(devices_handler))
        .route("/device/{uid}/capabilities", post(capabilities_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Bind `addr` and serve until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Ingestion API listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// Unauthenticated liveness check.
async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MetricsRequest>,
) -> ApiResult<MetricsResponse> {
    authenticate(&state, &req.envelope)?;
    if req.devices.is_empty() {
        return Ok(Json(MetricsResponse {
            success: false,
            error: Some("No devices in payload".to_string()),
            ..Default::default()
        }));
    }

    let report = state.sink.ingest_metrics(&req.devices).await?;
    Ok(Json(MetricsResponse {
        success: true,
        metrics_processed: report.metrics_processed,
        rates_suppressed: report.rates_suppressed,
        errors: (!report.errors.is_empty()).then_some(report.errors),
        error: None,
    }))
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EventsRequest>,
) -> ApiResult<EventsResponse> {
    authenticate(&state, &req.envelope)?;
    let created = state.sink.ingest_events(&req.events).await?;
    Ok(Json(EventsResponse {
        success: true,
        events_created: created,
        error: None,
    }))
}

async fn interfaces_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InterfacesRequest>,
) -> ApiResult<InterfacesResponse> {
    authenticate(&state, &req.envelope)?;
    let synced = state
        .sink
        .sync_interfaces(&req.device_uid, &req.interfaces)
        .await?;
    Ok(Json(InterfacesResponse {
        success: true,
        interfaces_synced: synced,
        error: None,
    }))
}

async fn leases_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LeasesRequest>,
) -> ApiResult<LeasesResponse> {
    authenticate(&state, &req.envelope)?;
    let sync = state.sink.sync_leases(&req.device_uid, &req.leases).await?;
    Ok(Json(LeasesResponse {
        success: true,
        leases_synced: sync.synced,
        active_leases: sync.active,
        error: None,
    }))
}

async fn sessions_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionsRequest>,
) -> ApiResult<SessionsResponse> {
    authenticate(&state, &req.envelope)?;
    let sync = state
        .sink
        .sync_sessions(&req.device_uid, &req.session_type, &req.sessions)
        .await?;
    Ok(Json(SessionsResponse {
        success: true,
        sessions_synced: sync.synced,
        active_sessions: sync.active,
        error: None,
    }))
}

/// Device configuration, credentials included, for the calling collector.
async fn devices_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DevicesRequest>,
) -> ApiResult<DevicesResponse> {
    authenticate(&state, &req.envelope)?;
    let devices = state.sink.device_configs().await?;
    tracing::debug!(
        collector_id = %req.envelope.collector_id,
        count = devices.len(),
        "Serving device list"
    );
    Ok(Json(DevicesResponse {
        success: true,
        devices,
        error: None,
    }))
}

async fn capabilities_handler(
    State(state): State<Arc<AppState>>,
    Path(uid): Path<String>,
    Json(req): Json<CapabilitiesRequest>,
) -> ApiResult<StatusResponse> {
    authenticate(&state, &req.envelope)?;
    state.sink.update_capabilities(&uid, &req.capabilities).await?;
    Ok(Json(StatusResponse::ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::ingest::{Notifier, sign};
    use crate::storage::{StorageBuilder, StorageHandles};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    async fn create_test_state(secret: Option<&str>) -> (AppState, StorageHandles) {
        let handles = StorageBuilder::new("sqlite::memory:").build().await.unwrap();
        handles
            .devices
            .upsert(&DeviceConfig::new("r1", "10.0.0.1"))
            .await
            .unwrap();
        let state = AppState {
            sink: IngestionSink::new(&handles, Notifier::default()),
            auth: Authenticator::new(secret.map(str::to_string)),
        };
        (state, handles)
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, _handles) = create_test_state(Some("s")).await;
        let response = create_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"OK");
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let (state, _handles) = create_test_state(Some("secret")).await;
        let (status, body) = post_json(
            create_router(state),
            "/ingest/events",
            json!({"collector_id": "c", "timestamp": "1", "signature": "00", "events": []}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({"success": false, "error": "Authentication failed"}));
    }

    #[tokio::test]
    async fn test_signed_metrics_accepted() {
        let (state, _handles) = create_test_state(Some("secret")).await;
        let signature = sign("secret", "c", "1700000000").unwrap();
        let (status, body) = post_json(
            create_router(state),
            "/ingest/metrics",
            json!({
                "collector_id": "c",
                "timestamp": 1700000000,
                "signature": signature,
                "devices": [
                    {"device_uid": "r1", "metrics": {"system.cpu.load_pct": 5}},
                    {"device_uid": "ghost", "metrics": {"system.cpu.load_pct": 5}}
                ]
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["metrics_processed"], json!(1));
        assert_eq!(body["errors"][0]["device_uid"], json!("ghost"));
    }

    #[tokio::test]
    async fn test_in_band_data_errors() {
        let (state, _handles) = create_test_state(None).await;
        let app = create_router(state);

        let (status, body) =
            post_json(app.clone(), "/ingest/metrics", json!({"devices": []})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], json!("No devices in payload"));

        let (status, body) = post_json(
            app.clone(),
            "/ingest/leases",
            json!({"device_uid": "ghost", "leases": []}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": false, "error": "Unknown device"}));

        let (_, body) = post_json(
            app,
            "/device/ghost/capabilities",
            json!({"capabilities": {"version": "7.15"}}),
        )
        .await;
        assert_eq!(body["error"], json!("Unknown device"));
    }
}
