//! Integration tests for the fleet API endpoints

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use fleet_core::{
    config::{FleetConfig, PoolSpec},
    controller::FleetController,
    error::PlatformError,
    health::components,
    lifecycle::{AgentRuntime, AgentSpec, LaunchSpec, ProbeResult},
    platform::{PlatformAdapter, PlatformKind, RawReading},
    CpuSample, Dimension, DiskSample, MemorySample, NetworkSample, ResourceVector,
};
use fleetd::api::{create_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Host that always reads 30% CPU and 40% memory on 4 cores and 8 GB
struct QuietHost;

#[async_trait]
impl PlatformAdapter for QuietHost {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Linux
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn preferred_polling_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn sample(&self, dimension: Dimension) -> Result<RawReading, PlatformError> {
        Ok(match dimension {
            Dimension::Cpu => RawReading::Cpu(CpuSample {
                cores: 4,
                usage_percent: 30.0,
                load_average: [1.2; 3],
                process_count: 120,
            }),
            Dimension::Memory => RawReading::Memory(MemorySample {
                total_mb: 8_192,
                used_mb: 3_277,
                free_mb: 4_915,
                percent: 40.0,
                buffers: 0,
                cached: 0,
            }),
            Dimension::Disk => RawReading::Disk(vec![DiskSample {
                total_kb: 50_000_000,
                used_kb: 10_000_000,
                free_kb: 40_000_000,
                percent: 20.0,
                filesystem: "/dev/sda1".to_string(),
                mount_point: "/".to_string(),
            }]),
            Dimension::Network => RawReading::Network(vec![NetworkSample {
                iface: "eth0".to_string(),
                bytes_in: 0,
                bytes_out: 0,
            }]),
        })
    }
}

/// Runtime whose agents are always healthy
struct NoopRuntime;

#[async_trait]
impl AgentRuntime for NoopRuntime {
    async fn launch(&self, _spec: &LaunchSpec) -> anyhow::Result<()> {
        Ok(())
    }

    async fn terminate(&self, _agent_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn probe(&self, _agent_id: &str) -> anyhow::Result<ProbeResult> {
        Ok(ProbeResult::healthy())
    }
}

async fn setup_test_app() -> (Router, Arc<FleetController>) {
    let mut config = FleetConfig::default();
    config.allocator.pools = vec![PoolSpec {
        id: "local".to_string(),
        capacity: ResourceVector::new(400, 8_192),
        labels: vec![],
    }];
    config.lifecycle.scale_max_retries = 0;

    let controller = FleetController::new(config, Arc::new(QuietHost), Arc::new(NoopRuntime))
        .await
        .unwrap();
    controller
        .agents()
        .register_spec(AgentSpec::new("indexer", ResourceVector::new(300, 1_024)))
        .unwrap();

    let router = create_router(Arc::new(AppState::new(controller.clone())));
    (router, controller)
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _controller) = setup_test_app().await;

    let (status, health) = send(app, "GET", "/healthz", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["components"].as_object().unwrap().len(), 4);
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, controller) = setup_test_app().await;

    controller
        .health()
        .set_degraded(components::DETECTOR, "memory sample stale")
        .await;

    // Degraded still returns 200 (operational)
    let (status, health) = send(app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, controller) = setup_test_app().await;

    controller
        .health()
        .set_unhealthy(components::ALLOCATOR, "ledger drift")
        .await;

    let (status, health) = send(app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_controller() {
    let (app, controller) = setup_test_app().await;

    let (status, readiness) = send(app.clone(), "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);

    controller.health().set_ready(false).await;
    let (status, readiness) = send(app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _controller) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));
}

#[tokio::test]
async fn test_status_reports_platform_and_pools() {
    let (app, _controller) = setup_test_app().await;

    let (status, body) = send(app, "GET", "/v1/resource/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["platform"], "linux");
    assert_eq!(body["monitoring"]["running"], false);
    assert_eq!(body["pools"][0]["id"], "local");
}

#[tokio::test]
async fn test_monitor_start_and_stop() {
    let (app, controller) = setup_test_app().await;

    let (status, body) = send(
        app.clone(),
        "POST",
        "/v1/resource/monitor/start?interval_ms=2000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);
    assert_eq!(controller.config().monitoring.interval_ms, 2_000);

    let (status, body) = send(app, "POST", "/v1/resource/monitor/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);
}

#[tokio::test]
async fn test_monitor_start_rejects_out_of_range_interval() {
    let (app, _controller) = setup_test_app().await;

    let (status, body) = send(
        app,
        "POST",
        "/v1/resource/monitor/start?interval_ms=10",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "configuration_invalid");
    assert_eq!(body["field"], "monitoring.interval_ms");
}

#[tokio::test]
async fn test_optimize_strategy_validation() {
    let (app, _controller) = setup_test_app().await;

    let (status, body) = send(
        app.clone(),
        "POST",
        "/v1/resource/optimize?strategy=conservative",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["strategy"], "conservative");

    let (status, body) = send(app, "POST", "/v1/resource/optimize?strategy=reckless", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(
        body["acceptedValues"],
        json!(["conservative", "balanced", "aggressive"])
    );
}

#[tokio::test]
async fn test_history_rejects_bad_duration() {
    let (app, _controller) = setup_test_app().await;

    let (status, _) = send(app.clone(), "GET", "/v1/resource/history?duration=1h", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(app, "GET", "/v1/resource/history?duration=fortnight", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_agent_list_and_recommendations() {
    let (app, controller) = setup_test_app().await;

    let (status, body) = send(app.clone(), "GET", "/v1/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let agent = controller.agents().create_agent("indexer", None).unwrap();
    let (_, body) = send(app.clone(), "GET", "/v1/agents", None).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], agent.id);

    let uri = format!("/v1/agents/{}/recommendations", agent.id);
    let (status, body) = send(app.clone(), "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_array());

    let (status, body) = send(app, "GET", "/v1/agents/ghost/recommendations", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "agent_not_found");
    assert_eq!(body["agentId"], "ghost");
}

#[tokio::test]
async fn test_scale_shortage_returns_conflict_with_shortage() {
    let (app, controller) = setup_test_app().await;
    let agent = controller.agents().create_agent("indexer", None).unwrap();

    let uri = format!("/v1/agents/{}/scale", agent.id);
    let (status, body) = send(
        app.clone(),
        "POST",
        &uri,
        Some(json!({"direction": "to", "replicas": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["fromReplicas"], 1);
    assert_eq!(body["toReplicas"], 1);
    assert_eq!(body["shortage"]["cpu"], 200);

    let (status, body) = send(
        app,
        "POST",
        &uri,
        Some(json!({"direction": "to", "replicas": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_config_get_and_set() {
    let (app, controller) = setup_test_app().await;

    let (status, body) = send(
        app.clone(),
        "GET",
        "/v1/config?key=monitoring.interval_ms",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(5000));

    let (status, body) = send(
        app.clone(),
        "PUT",
        "/v1/config",
        Some(json!({"key": "pressure.thresholds.cpu.high", "value": 80.0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], json!(80.0));
    assert_eq!(
        controller.pressure().thresholds().get(Dimension::Cpu).high,
        80.0
    );

    // Out of order tiers are rejected and nothing changes
    let (status, body) = send(
        app,
        "PUT",
        "/v1/config",
        Some(json!({"key": "pressure.thresholds.cpu.critical", "value": 50.0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "configuration_invalid");
    assert_eq!(
        controller.config().pressure.thresholds.get(Dimension::Cpu).high,
        80.0
    );
}
