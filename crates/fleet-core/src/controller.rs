//! Fleet controller
//!
//! Wires the detector, pressure detector, allocator, lifecycle manager and
//! optimizer together. The controller is the monitoring loop's
//! [`CycleObserver`]: every cycle it classifies pressure, expires and
//! activates reservations, reconciles agent allocations and, every
//! `schedule_every_cycles` cycles, asks the optimizer for a plan.
//!
//! The operation surface served by the daemon lives here too, so every
//! operation returns a serializable result or a [`FleetError`].

use crate::allocator::{PoolSummary, ResourceAllocator};
use crate::config::{FleetConfig, PoolSpec};
use crate::detector::{
    AdaptiveInterval, CycleObserver, DetectorRecommendation, MonitorHandle, MonitorLoop,
    ResourceDetector,
};
use crate::error::{FleetError, FleetResult};
use crate::health::{components, HealthRegistry};
use crate::lifecycle::{
    AgentInstance, AgentManager, AgentRecommendation, AgentRuntime, AgentStatus, ScaleRequest,
    ScaleResult,
};
use crate::models::{Dimension, ResourceSnapshot, ResourceVector, Trend};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::optimizer::{ActionType, Analysis, ObservedImpact, OptimizationPlan, Optimizer, Strategy};
use crate::platform::PlatformAdapter;
use crate::pressure::{PressureDetector, PressureLevel, PressurePattern, PressureReading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Share of throttleable capacity reclaimed when pressure turns high
const THROTTLE_HIGH: f64 = 0.10;
/// Share reclaimed when pressure turns critical
const THROTTLE_CRITICAL: f64 = 0.25;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub running: bool,
    /// Interval the loop will wait before its next cycle
    pub interval_ms: u64,
    pub cycles: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    pub timestamp: DateTime<Utc>,
    pub platform: String,
    pub monitoring: MonitorStatus,
    /// Set when the latest snapshot carried over stale dimensions
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ResourceSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<PressureReading>,
    pub pools: Vec<PoolSummary>,
    pub agents: BTreeMap<AgentStatus, usize>,
    pub recommendations: Vec<DetectorRecommendation>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_secs: Option<u64>,
    pub snapshots: Vec<ResourceSnapshot>,
    pub pressure: Vec<PressureReading>,
    pub trends: BTreeMap<Dimension, Trend>,
    pub patterns: Vec<PressurePattern>,
}

/// Host utilization before an auto-executed action, to be compared with
/// the next cycle's
#[derive(Debug, Clone, Copy)]
struct PendingOutcome {
    action_type: ActionType,
    cpu_percent: f64,
    memory_percent: f64,
}

struct Running {
    monitor: MonitorHandle,
    health_shutdown: broadcast::Sender<()>,
    health_task: JoinHandle<()>,
}

/// Parse `90s`, `15m`, `1h`, `2d` or `500ms`. A bare number is seconds.
pub fn parse_duration(input: &str) -> FleetResult<Duration> {
    let s = input.trim().to_ascii_lowercase();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let invalid = || {
        FleetError::invalid_choice(
            format!("invalid duration '{}'", input),
            "durations look like 90s, 15m, 1h or 2d",
            &["ms", "s", "m", "h", "d"],
        )
    };
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    let secs = |scale: u64| n.checked_mul(scale).map(Duration::from_secs).ok_or_else(invalid);
    let duration = match unit {
        "ms" => Duration::from_millis(n),
        "" | "s" => Duration::from_secs(n),
        "m" => secs(60)?,
        "h" => secs(3_600)?,
        "d" => secs(86_400)?,
        _ => return Err(invalid()),
    };
    if duration.is_zero() {
        return Err(invalid());
    }
    Ok(duration)
}

/// Pool capacity the local host offers, derived from a snapshot
fn host_capacity(snapshot: &ResourceSnapshot, network_mbps: u64) -> ResourceVector {
    let disk_mb: u64 = snapshot.disk.iter().map(|d| d.total_kb / 1_024).sum();
    ResourceVector::new(snapshot.cpu.cores as u64 * 100, snapshot.memory.total_mb)
        .with_disk(disk_mb)
        .with_bandwidth(network_mbps)
}

pub struct FleetController {
    config: RwLock<FleetConfig>,
    detector: Arc<ResourceDetector>,
    pressure: Arc<PressureDetector>,
    allocator: Arc<ResourceAllocator>,
    agents: Arc<AgentManager>,
    optimizer: Arc<Optimizer>,
    health: HealthRegistry,
    auto_throttle: Arc<AtomicBool>,
    running: AsyncMutex<Option<Running>>,
    cycles: AtomicU64,
    pending: Mutex<Vec<PendingOutcome>>,
    metrics: FleetMetrics,
    logger: StructuredLogger,
}

impl std::fmt::Debug for FleetController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetController")
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .field("agents", &self.agents)
            .finish()
    }
}

impl FleetController {
    /// Validate `config` and build every component. Nothing runs until
    /// [`start_monitoring`](Self::start_monitoring).
    pub async fn new(
        config: FleetConfig,
        adapter: Arc<dyn PlatformAdapter>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> FleetResult<Arc<Self>> {
        config.validate()?;
        let logger = StructuredLogger::new("fleet");
        let m = &config.monitoring;

        let detector = Arc::new(
            ResourceDetector::new(adapter, m.retention, m.network_capacity_mbps)
                .with_logger(logger.clone()),
        );
        let pressure = Arc::new(PressureDetector::new(&config.pressure, m.interval()));
        let allocator = Arc::new(
            ResourceAllocator::new(&config.allocator)?.with_logger(logger.clone()),
        );
        let agents = Arc::new(
            AgentManager::new(config.lifecycle.clone(), allocator.clone(), runtime)
                .with_logger(logger.clone()),
        );
        let optimizer = Arc::new(
            Optimizer::new(
                config.optimization.clone(),
                detector.clone(),
                pressure.clone(),
                allocator.clone(),
                agents.clone(),
            )
            .with_logger(logger.clone()),
        );
        optimizer.set_predictive(config.features.predictive_analytics);

        let metrics = FleetMetrics::new();
        let auto_throttle = Arc::new(AtomicBool::new(config.features.auto_throttle));
        {
            let allocator = allocator.clone();
            let auto_throttle = auto_throttle.clone();
            let metrics = metrics.clone();
            let logger = logger.clone();
            pressure.on_alert(move |alert| {
                metrics.inc_alerts_fired(alert.level);
                logger.log_pressure_alert(alert);
                if !auto_throttle.load(Ordering::Relaxed) || alert.level <= alert.previous {
                    return;
                }
                let fraction = match alert.level {
                    PressureLevel::Critical => THROTTLE_CRITICAL,
                    PressureLevel::High => THROTTLE_HIGH,
                    _ => return,
                };
                if let Err(e) = allocator.throttle(fraction) {
                    warn!(error = %e, "Auto-throttle failed");
                }
            });
        }

        let controller = Arc::new(Self {
            config: RwLock::new(config),
            detector,
            pressure,
            allocator,
            agents,
            optimizer,
            health: HealthRegistry::for_fleet().await,
            auto_throttle,
            running: AsyncMutex::new(None),
            cycles: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            metrics,
            logger,
        });
        controller.health.set_ready(true).await;
        Ok(controller)
    }

    pub fn config(&self) -> FleetConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn detector(&self) -> &Arc<ResourceDetector> {
        &self.detector
    }

    pub fn pressure(&self) -> &Arc<PressureDetector> {
        &self.pressure
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn agents(&self) -> &Arc<AgentManager> {
        &self.agents
    }

    pub fn optimizer(&self) -> &Arc<Optimizer> {
        &self.optimizer
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Start the sampling loop and the agent health sweep. `interval_ms`
    /// replaces the configured base interval first. Starting a running
    /// monitor only reports its status.
    pub async fn start_monitoring(
        self: &Arc<Self>,
        interval_ms: Option<u64>,
    ) -> FleetResult<MonitorStatus> {
        if let Some(ms) = interval_ms {
            let updated = self
                .config()
                .with_path("monitoring.interval_ms", Value::from(ms))?;
            *self.config.write().unwrap_or_else(|p| p.into_inner()) = updated;
        }

        let mut running = self.running.lock().await;
        if running.is_none() {
            *running = Some(self.spawn_loops());
        }
        Ok(self.monitor_status(running.as_ref()))
    }

    fn spawn_loops(self: &Arc<Self>) -> Running {
        let m = self.config().monitoring;
        let interval = AdaptiveInterval::new(m.interval(), m.min_interval(), m.max_interval());
        let observer: Arc<dyn CycleObserver> = self.clone();
        let monitor = MonitorLoop::new(self.detector.clone(), interval)
            .with_observer(observer)
            .spawn();
        let (health_shutdown, rx) = broadcast::channel(1);
        let health_task = self.agents.spawn_health_monitor(rx);
        info!(interval_ms = m.interval_ms, "Monitoring started");
        Running {
            monitor,
            health_shutdown,
            health_task,
        }
    }

    pub async fn stop_monitoring(&self) -> MonitorStatus {
        let mut running = self.running.lock().await;
        if let Some(r) = running.take() {
            self.stop_loops(r).await;
        }
        self.monitor_status(None)
    }

    async fn stop_loops(&self, running: Running) {
        let timeout = self.config().monitoring.shutdown_timeout();
        if !running.monitor.stop(timeout).await {
            self.health
                .set_degraded(components::DETECTOR, "monitoring loop was aborted")
                .await;
        }
        let _ = running.health_shutdown.send(());
        let mut task = running.health_task;
        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            warn!("Health monitor did not stop in time, aborting");
            task.abort();
        }
        info!("Monitoring stopped");
    }

    pub async fn monitoring(&self) -> MonitorStatus {
        let running = self.running.lock().await;
        self.monitor_status(running.as_ref())
    }

    fn monitor_status(&self, running: Option<&Running>) -> MonitorStatus {
        MonitorStatus {
            running: running.is_some(),
            interval_ms: running
                .map(|r| r.monitor.current_interval().as_millis() as u64)
                .unwrap_or_else(|| self.config().monitoring.interval_ms),
            cycles: self.cycles(),
        }
    }

    pub async fn status(&self) -> FleetStatus {
        FleetStatus {
            timestamp: Utc::now(),
            platform: self.detector.adapter().platform().to_string(),
            monitoring: self.monitoring().await,
            degraded: self.detector.is_degraded(),
            snapshot: self.detector.latest(),
            pressure: self.pressure.latest(),
            pools: self.allocator.available_resources(),
            agents: self.agents.status_counts(),
            recommendations: self.detector.recommendations(),
        }
    }

    /// Snapshots and pressure readings within `duration` (e.g. `1h`), or all
    /// retained history
    pub fn history(&self, duration: Option<&str>) -> FleetResult<HistoryReport> {
        let window = duration.map(parse_duration).transpose()?;
        Ok(HistoryReport {
            window_secs: window.map(|w| w.as_secs()),
            snapshots: self.detector.history(window),
            pressure: self.pressure.history(window),
            trends: self.detector.trends(window),
            patterns: self.pressure.patterns(),
        })
    }

    pub fn analyze(&self) -> Analysis {
        self.optimizer.analyze()
    }

    /// Generate a plan. The strategy name is parsed case-insensitively;
    /// `None` uses the configured strategy.
    pub fn optimize(&self, strategy: Option<&str>) -> FleetResult<OptimizationPlan> {
        let strategy = strategy.map(str::parse::<Strategy>).transpose()?;
        Ok(self.optimizer.generate_plan(strategy))
    }

    pub fn list_agents(&self) -> Vec<AgentInstance> {
        self.agents.list_agents()
    }

    pub async fn scale_agent(&self, id: &str, request: ScaleRequest) -> FleetResult<ScaleResult> {
        self.agents.scale_agent(id, request).await
    }

    pub fn agent_recommendations(&self, id: &str) -> FleetResult<Vec<AgentRecommendation>> {
        self.agents.get_agent_recommendations(id)
    }

    /// Read the configuration, or one dotted key of it
    pub fn config_get(&self, key: Option<&str>) -> FleetResult<Value> {
        self.config().get_path(key.unwrap_or_default())
    }

    /// Replace one dotted key. The whole configuration is validated before
    /// anything changes; on success the new value is pushed to every
    /// component and a running monitor is restarted if its settings moved.
    pub async fn config_set(self: &Arc<Self>, key: &str, value: Value) -> FleetResult<Value> {
        let previous = self.config();
        let updated = previous.with_path(key, value)?;
        self.apply(&previous, &updated)?;
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = updated.clone();
        info!(key = %key, "Configuration updated");

        if previous.monitoring != updated.monitoring {
            let mut running = self.running.lock().await;
            if let Some(r) = running.take() {
                self.stop_loops(r).await;
                *running = Some(self.spawn_loops());
            }
        }
        updated.get_path(key)
    }

    fn apply(&self, previous: &FleetConfig, updated: &FleetConfig) -> FleetResult<()> {
        // Pools first: a pool that cannot shrink rejects the whole change.
        // Pools dropped from the list stay in the allocator with their
        // allocations until restart.
        let changed: Vec<PoolSpec> = updated
            .allocator
            .pools
            .iter()
            .filter(|pool| !previous.allocator.pools.contains(pool))
            .cloned()
            .collect();
        self.allocator.ensure_pools(&changed)?;
        for quota in &updated.allocator.quotas {
            self.allocator.set_quota(&quota.scope, quota.limits)?;
        }
        for quota in &previous.allocator.quotas {
            if !updated.allocator.quotas.iter().any(|q| q.scope == quota.scope) {
                self.allocator.remove_quota(&quota.scope);
            }
        }

        let p = &updated.pressure;
        self.pressure.replace_thresholds(p.thresholds)?;
        self.pressure.set_weights(p.weights)?;
        self.pressure
            .set_cooldown(updated.monitoring.interval() * p.cooldown_multiplier);
        self.pressure.set_history_size(p.history_size);

        self.detector.set_retention(updated.monitoring.retention);
        self.detector
            .set_network_capacity(updated.monitoring.network_capacity_mbps);
        self.agents.set_config(updated.lifecycle.clone());
        self.optimizer.set_config(updated.optimization.clone());
        self.optimizer
            .set_predictive(updated.features.predictive_analytics);
        self.auto_throttle
            .store(updated.features.auto_throttle, Ordering::Relaxed);
        Ok(())
    }

    /// Stop the loops and every agent
    pub async fn shutdown(&self) {
        self.stop_monitoring().await;
        for agent in self.agents.list_agents() {
            if let Err(e) = self.agents.stop_agent(&agent.id).await {
                warn!(agent_id = %agent.id, error = %e, "Agent did not stop cleanly");
            }
        }
        self.health.set_ready(false).await;
        self.logger.log_shutdown("controller shutdown");
    }

    fn size_host_pool(&self, snapshot: &ResourceSnapshot) {
        if self.allocator.has_pools() || snapshot.cpu.cores == 0 {
            return;
        }
        let m = self.config().monitoring;
        let spec = PoolSpec {
            id: m.host_pool.clone(),
            capacity: host_capacity(snapshot, m.network_capacity_mbps),
            labels: Vec::new(),
        };
        match self.allocator.ensure_pool(&spec) {
            Ok(()) => info!(pool = %spec.id, capacity = ?spec.capacity, "Host pool sized from snapshot"),
            Err(e) => warn!(error = %e, "Could not create host pool"),
        }
    }

    async fn report_health(&self, snapshot: &ResourceSnapshot) {
        if snapshot.stale.is_empty() {
            self.health.set_healthy(components::DETECTOR).await;
        } else {
            let stale: Vec<&str> = snapshot.stale.iter().map(|d| d.as_str()).collect();
            self.health
                .set_degraded(
                    components::DETECTOR,
                    format!("carrying over {}", stale.join(", ")),
                )
                .await;
        }

        if self.allocator.validate_state() {
            self.health.set_healthy(components::ALLOCATOR).await;
        } else {
            self.health
                .set_degraded(components::ALLOCATOR, "pool ledgers drifted, repairing")
                .await;
        }

        let counts = self.agents.status_counts();
        let unhealthy = counts.get(&AgentStatus::Unhealthy).copied().unwrap_or(0);
        if unhealthy == 0 {
            self.health.set_healthy(components::LIFECYCLE).await;
        } else {
            self.health
                .set_degraded(
                    components::LIFECYCLE,
                    format!("{} agent(s) unhealthy", unhealthy),
                )
                .await;
        }
    }

    /// Record how host utilization moved since the last auto-executed actions
    fn settle_outcomes(&self, snapshot: &ResourceSnapshot) {
        let pending: Vec<PendingOutcome> = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(|p| p.into_inner()),
        );
        for outcome in pending {
            self.optimizer.record_outcome(
                outcome.action_type,
                ObservedImpact::new(
                    snapshot.percent(Dimension::Cpu) - outcome.cpu_percent,
                    snapshot.percent(Dimension::Memory) - outcome.memory_percent,
                ),
            );
        }
    }

    async fn run_optimizer(&self, snapshot: &ResourceSnapshot) {
        self.settle_outcomes(snapshot);
        let plan = self.optimizer.generate_plan(None);
        self.health.set_healthy(components::OPTIMIZER).await;

        if !self.config().features.auto_scaling {
            return;
        }
        for action in plan
            .actions
            .iter()
            .filter(|a| a.action_type == ActionType::Scale)
        {
            match self.agents.execute_action(action).await {
                Ok(outcome) if outcome.success => {
                    info!(target = %action.target, detail = %outcome.detail, "Auto-scaled agent");
                    self.pending
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push(PendingOutcome {
                            action_type: action.action_type,
                            cpu_percent: snapshot.percent(Dimension::Cpu),
                            memory_percent: snapshot.percent(Dimension::Memory),
                        });
                }
                Ok(outcome) => {
                    warn!(target = %action.target, detail = %outcome.detail, "Auto-scale did not apply")
                }
                Err(e) => warn!(target = %action.target, error = %e, "Auto-scale failed"),
            }
        }
    }
}

#[async_trait]
impl CycleObserver for FleetController {
    async fn on_snapshot(&self, snapshot: &ResourceSnapshot) -> PressureLevel {
        let config = self.config();
        let now = snapshot.timestamp;
        self.size_host_pool(snapshot);

        let level = if config.features.pressure_detection {
            let reading = self.pressure.detect_pressure(snapshot);
            self.metrics.set_composite_pressure(reading.composite_score);
            for (dimension, level) in &reading.levels {
                self.metrics.set_pressure_level(*dimension, *level);
            }
            reading.overall
        } else {
            PressureLevel::Normal
        };

        let expired = self.allocator.expire_reservations(now);
        let activated = self.allocator.activate_recurring(now);
        if !expired.is_empty() || !activated.is_empty() {
            debug!(
                expired = expired.len(),
                activated = activated.len(),
                "Reservations updated"
            );
        }
        self.allocator.sample_utilization(now);

        let repaired = self.agents.reconcile().await;
        if repaired.orphans_released > 0 {
            debug!(orphans = repaired.orphans_released, "Reconciled agent allocations");
        }
        self.report_health(snapshot).await;

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        if cycle % config.optimization.schedule_every_cycles as u64 == 0 {
            self.run_optimizer(snapshot).await;
        }
        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::AgentSpec;
    use crate::platform::RawReading;
    use crate::test_support::{cpu, ScriptedAdapter, ScriptedRuntime};
    use serde_json::json;

    async fn controller_with(config: FleetConfig) -> (Arc<FleetController>, Arc<ScriptedAdapter>) {
        let adapter = Arc::new(ScriptedAdapter::healthy());
        let controller = FleetController::new(
            config,
            adapter.clone(),
            Arc::new(ScriptedRuntime::healthy()),
        )
        .await
        .unwrap();
        (controller, adapter)
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3_600));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration(" 2D ").unwrap(), Duration::from_secs(172_800));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5w").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        let err = parse_duration("300000000000000d").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidRequest);
        assert!(parse_duration("99999999999999999999s").is_err());
        assert!(parse_duration(&format!("{}h", u64::MAX / 3_600 + 1)).is_err());
        assert_eq!(
            parse_duration(&format!("{}m", u64::MAX / 60)).unwrap(),
            Duration::from_secs(u64::MAX / 60 * 60)
        );
    }

    #[tokio::test]
    async fn test_pool_resize_is_all_or_nothing() {
        let mut config = FleetConfig::default();
        config.allocator.pools = ["a", "b"]
            .iter()
            .map(|id| PoolSpec {
                id: id.to_string(),
                capacity: ResourceVector::new(800, 16_384),
                labels: vec![],
            })
            .collect();
        let (controller, _) = controller_with(config.clone()).await;
        controller
            .allocator()
            .allocate(
                &crate::allocator::AllocationRequest::new("batch", ResourceVector::new(500, 0))
                    .with_pool("b"),
            )
            .unwrap();

        let mut pools = config.allocator.pools.clone();
        pools[0].capacity = ResourceVector::new(1_600, 16_384);
        pools[1].capacity = ResourceVector::new(100, 16_384);
        let err = controller
            .config_set("allocator.pools", serde_json::to_value(&pools).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationInvalid);
        assert_eq!(controller.allocator().pool("a").unwrap().total.cpu, 800);
        assert_eq!(controller.allocator().pool("b").unwrap().total.cpu, 800);
        assert_eq!(controller.config().allocator.pools, config.allocator.pools);

        pools[1].capacity = ResourceVector::new(600, 16_384);
        controller
            .config_set("allocator.pools", serde_json::to_value(&pools).unwrap())
            .await
            .unwrap();
        assert_eq!(controller.allocator().pool("a").unwrap().total.cpu, 1_600);
        assert_eq!(controller.allocator().pool("b").unwrap().free.cpu, 100);
    }

    #[tokio::test]
    async fn test_first_cycle_sizes_host_pool() {
        let (controller, _) = controller_with(FleetConfig::default()).await;
        assert!(!controller.allocator().has_pools());

        let snapshot = controller.detector().detect_all().await;
        let level = controller.on_snapshot(&snapshot).await;
        assert_eq!(level, PressureLevel::Normal);

        let pool = controller.allocator().pool("local").unwrap();
        assert_eq!(pool.total.cpu, 800);
        assert_eq!(pool.total.memory_mb, 16_384);
        assert_eq!(controller.cycles(), 1);
        assert!(controller.pressure().latest().is_some());
    }

    #[tokio::test]
    async fn test_cycle_reports_pressure_level() {
        let (controller, adapter) = controller_with(FleetConfig::default()).await;
        adapter.set_default(RawReading::Cpu(cpu(96.0)));
        let snapshot = controller.detector().detect_all().await;
        assert_eq!(controller.on_snapshot(&snapshot).await, PressureLevel::Critical);
    }

    #[tokio::test]
    async fn test_pressure_detection_toggle() {
        let mut config = FleetConfig::default();
        config.features.pressure_detection = false;
        let (controller, adapter) = controller_with(config).await;
        adapter.set_default(RawReading::Cpu(cpu(96.0)));
        let snapshot = controller.detector().detect_all().await;
        assert_eq!(controller.on_snapshot(&snapshot).await, PressureLevel::Normal);
        assert!(controller.pressure().latest().is_none());
    }

    #[tokio::test]
    async fn test_auto_throttle_on_escalation() {
        let mut config = FleetConfig::default();
        config.features.auto_throttle = true;
        config.allocator.pools = vec![PoolSpec {
            id: "local".to_string(),
            capacity: ResourceVector::new(800, 16_384),
            labels: vec![],
        }];
        let (controller, adapter) = controller_with(config).await;
        controller
            .agents()
            .register_spec(
                AgentSpec::new("batch", ResourceVector::new(400, 1_000))
                    .with_limits(ResourceVector::new(800, 2_000)),
            )
            .unwrap();
        controller.agents().create_agent("batch", None).unwrap();

        adapter.set_default(RawReading::Cpu(cpu(96.0)));
        let snapshot = controller.detector().detect_all().await;
        controller.on_snapshot(&snapshot).await;

        // Burstable allocation shrunk by a quarter
        let pool = controller.allocator().pool("local").unwrap();
        assert_eq!(pool.allocated.cpu, 300);
    }

    #[tokio::test]
    async fn test_config_set_propagates() {
        let (controller, _) = controller_with(FleetConfig::default()).await;

        let value = controller
            .config_set("pressure.thresholds.cpu.high", json!(80.0))
            .await
            .unwrap();
        assert_eq!(value, json!(80.0));
        assert_eq!(controller.pressure().thresholds().get(Dimension::Cpu).high, 80.0);

        controller
            .config_set("optimization.strategy", json!("aggressive"))
            .await
            .unwrap();
        assert_eq!(controller.optimizer().config().strategy, Strategy::Aggressive);

        controller
            .config_set("lifecycle.cpu_target_percent", json!(60.0))
            .await
            .unwrap();
        assert_eq!(controller.agents().config().cpu_target_percent, 60.0);
    }

    #[tokio::test]
    async fn test_invalid_config_set_changes_nothing() {
        let (controller, _) = controller_with(FleetConfig::default()).await;
        let before = controller.config();

        let err = controller
            .config_set("pressure.thresholds.cpu.critical", json!(40.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationInvalid);
        assert_eq!(controller.config(), before);
        assert_eq!(controller.pressure().thresholds(), before.pressure.thresholds);

        assert!(controller.config_get(Some("monitoring.nope")).is_err());
        assert_eq!(
            controller.config_get(Some("monitoring.interval_ms")).unwrap(),
            json!(5000)
        );
    }

    #[tokio::test]
    async fn test_monitor_start_stop() {
        let mut config = FleetConfig::default();
        config.monitoring.interval_ms = 1_000;
        let (controller, _) = controller_with(config).await;

        let status = controller.start_monitoring(None).await.unwrap();
        assert!(status.running);
        // Second start is a no-op
        assert!(controller.start_monitoring(None).await.unwrap().running);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(controller.cycles() >= 1);

        let status = controller.stop_monitoring().await;
        assert!(!status.running);
        assert!(!controller.monitoring().await.running);
    }

    #[tokio::test]
    async fn test_start_rejects_interval_out_of_bounds() {
        let (controller, _) = controller_with(FleetConfig::default()).await;
        assert!(controller.start_monitoring(Some(10)).await.is_err());
        assert!(!controller.monitoring().await.running);
    }

    #[tokio::test]
    async fn test_optimize_parses_strategy() {
        let (controller, _) = controller_with(FleetConfig::default()).await;
        let plan = controller.optimize(Some("conservative")).unwrap();
        assert_eq!(plan.strategy, Strategy::Conservative);
        assert!(controller.optimize(Some("yolo")).is_err());
    }

    #[tokio::test]
    async fn test_history_window() {
        let (controller, _) = controller_with(FleetConfig::default()).await;
        for _ in 0..3 {
            let snapshot = controller.detector().detect_all().await;
            controller.on_snapshot(&snapshot).await;
        }
        let report = controller.history(Some("1h")).unwrap();
        assert_eq!(report.window_secs, Some(3_600));
        assert_eq!(report.snapshots.len(), 3);
        assert_eq!(report.pressure.len(), 3);
        assert!(controller.history(Some("later")).is_err());

        // Windows longer than the clock can express return everything
        let report = controller.history(Some("100000000d")).unwrap();
        assert_eq!(report.snapshots.len(), 3);
    }
}
