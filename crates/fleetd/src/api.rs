//! HTTP API for fleet operations, health checks and Prometheus metrics

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fleet_core::{
    controller::FleetController,
    error::{ErrorKind, FleetError},
    health::{ComponentStatus, HealthRegistry},
    lifecycle::ScaleRequest,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<FleetController>,
    pub health_registry: HealthRegistry,
}

impl AppState {
    pub fn new(controller: Arc<FleetController>) -> Self {
        Self {
            health_registry: controller.health().clone(),
            controller,
        }
    }
}

/// A domain error rendered as `{error, message, ...context}`
pub struct ApiError(pub FleetError);

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        ApiError(e)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest
        | ErrorKind::ConfigurationInvalid
        | ErrorKind::UnknownAgentType => StatusCode::BAD_REQUEST,
        ErrorKind::AgentNotFound | ErrorKind::ReservationNotFound => StatusCode::NOT_FOUND,
        ErrorKind::ReservationExpired => StatusCode::GONE,
        ErrorKind::InsufficientResources | ErrorKind::OperationInProgress => StatusCode::CONFLICT,
        ErrorKind::AgentUnhealthy
        | ErrorKind::PlatformUnsupported
        | ErrorKind::CommandFailed => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::StateDriftDetected | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(self.0.to_response())).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn resource_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.status().await)
}

#[derive(Debug, Deserialize)]
pub struct MonitorParams {
    pub interval_ms: Option<u64>,
}

async fn monitor_start(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MonitorParams>,
) -> ApiResult<fleet_core::MonitorStatus> {
    Ok(Json(
        state.controller.start_monitoring(params.interval_ms).await?,
    ))
}

async fn monitor_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.stop_monitoring().await)
}

async fn analyze(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.analyze())
}

#[derive(Debug, Deserialize)]
pub struct OptimizeParams {
    pub strategy: Option<String>,
}

async fn optimize(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OptimizeParams>,
) -> ApiResult<fleet_core::optimizer::OptimizationPlan> {
    Ok(Json(state.controller.optimize(params.strategy.as_deref())?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub duration: Option<String>,
}

async fn history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<fleet_core::HistoryReport> {
    Ok(Json(state.controller.history(params.duration.as_deref())?))
}

async fn list_agents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.list_agents())
}

/// Scale results are returned as-is; a refused scale answers 409 with the
/// shortage in the body
async fn scale_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> Result<Response, ApiError> {
    let result = state.controller.scale_agent(&id, request).await?;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(result)).into_response())
}

async fn agent_recommendations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<fleet_core::lifecycle::AgentRecommendation>> {
    Ok(Json(state.controller.agent_recommendations(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct ConfigParams {
    pub key: Option<String>,
}

async fn config_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConfigParams>,
) -> ApiResult<Value> {
    Ok(Json(state.controller.config_get(params.key.as_deref())?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub key: String,
    pub value: Value,
}

async fn config_set(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> ApiResult<ConfigUpdate> {
    let value = state.controller.config_set(&update.key, update.value).await?;
    Ok(Json(ConfigUpdate {
        key: update.key,
        value,
    }))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/resource/status", get(resource_status))
        .route("/v1/resource/monitor/start", post(monitor_start))
        .route("/v1/resource/monitor/stop", post(monitor_stop))
        .route("/v1/resource/analyze", get(analyze))
        .route("/v1/resource/optimize", post(optimize))
        .route("/v1/resource/history", get(history))
        .route("/v1/agents", get(list_agents))
        .route("/v1/agents/:id/scale", post(scale_agent))
        .route("/v1/agents/:id/recommendations", get(agent_recommendations))
        .route("/v1/config", get(config_get).put(config_set))
        .with_state(state)
}

/// Start the API server
pub async fn serve(addr: String, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
