//! Observability for the fleet core
//!
//! Provides:
//! - Prometheus metrics (sampling latency, pressure, allocations, scaling, repairs)
//! - Structured logging of named fleet events with tracing

use crate::allocator::{RepairSummary, ThrottleSummary};
use crate::models::{Dimension, Shortage};
use crate::pressure::{PressureAlert, PressureLevel};
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Gauge, Histogram, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for sampling latency (in seconds). Commands on macOS and
/// Windows routinely take a second or more.
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Global metrics instance (registered once). `None` when registration
/// failed, in which case every recording call is a no-op.
static GLOBAL_METRICS: OnceLock<Option<FleetMetricsInner>> = OnceLock::new();

struct FleetMetricsInner {
    sample_latency_seconds: Histogram,
    composite_pressure: Gauge,
    dimension_pressure_level: IntGaugeVec,
    active_allocations: IntGauge,
    allocation_rejections: IntCounter,
    alerts_fired: IntCounterVec,
    scale_operations: IntCounterVec,
    stale_samples: IntCounterVec,
    state_repairs: IntCounter,
    agents: IntGaugeVec,
    monitor_interval_ms: IntGauge,
}

impl FleetMetricsInner {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            sample_latency_seconds: register_histogram!(
                "fleet_sample_latency_seconds",
                "Time spent sampling all resource dimensions",
                LATENCY_BUCKETS.to_vec()
            )?,
            composite_pressure: register_gauge!(
                "fleet_composite_pressure",
                "Weighted composite pressure score in [0, 1]"
            )?,
            dimension_pressure_level: register_int_gauge_vec!(
                "fleet_pressure_level",
                "Pressure tier per dimension (0 normal .. 3 critical)",
                &["dimension"]
            )?,
            active_allocations: register_int_gauge!(
                "fleet_active_allocations",
                "Reserved and committed allocations across all pools"
            )?,
            allocation_rejections: register_int_counter!(
                "fleet_allocation_rejections_total",
                "Allocation requests rejected for insufficient capacity or quota"
            )?,
            alerts_fired: register_int_counter_vec!(
                "fleet_pressure_alerts_total",
                "Pressure alerts delivered to handlers",
                &["level"]
            )?,
            scale_operations: register_int_counter_vec!(
                "fleet_scale_operations_total",
                "Agent scale operations by outcome",
                &["outcome"]
            )?,
            stale_samples: register_int_counter_vec!(
                "fleet_stale_samples_total",
                "Dimensions substituted from the last known value",
                &["dimension"]
            )?,
            state_repairs: register_int_counter!(
                "fleet_state_repairs_total",
                "Allocator pools repaired after drift"
            )?,
            agents: register_int_gauge_vec!(
                "fleet_agents",
                "Managed agent instances by status",
                &["status"]
            )?,
            monitor_interval_ms: register_int_gauge!(
                "fleet_monitor_interval_ms",
                "Current adaptive sampling interval"
            )?,
        })
    }
}

/// Fleet metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct FleetMetrics {
    _private: (),
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FleetMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetMetrics").finish()
    }
}

impl FleetMetrics {
    /// Create a metrics handle (registers global metrics on first call)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(|| match FleetMetricsInner::register() {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!(error = %e, "Failed to register fleet metrics, recording disabled");
                None
            }
        });
        Self { _private: () }
    }

    fn inner(&self) -> Option<&FleetMetricsInner> {
        GLOBAL_METRICS.get().and_then(Option::as_ref)
    }

    pub fn observe_sample_latency(&self, duration_secs: f64) {
        if let Some(m) = self.inner() {
            m.sample_latency_seconds.observe(duration_secs);
        }
    }

    pub fn set_composite_pressure(&self, score: f64) {
        if let Some(m) = self.inner() {
            m.composite_pressure.set(score);
        }
    }

    pub fn set_pressure_level(&self, dimension: Dimension, level: PressureLevel) {
        if let Some(m) = self.inner() {
            m.dimension_pressure_level
                .with_label_values(&[dimension.as_str()])
                .set(level.rank() as i64);
        }
    }

    pub fn set_active_allocations(&self, count: i64) {
        if let Some(m) = self.inner() {
            m.active_allocations.set(count);
        }
    }

    pub fn inc_allocation_rejections(&self) {
        if let Some(m) = self.inner() {
            m.allocation_rejections.inc();
        }
    }

    pub fn inc_alerts_fired(&self, level: PressureLevel) {
        if let Some(m) = self.inner() {
            m.alerts_fired.with_label_values(&[level.as_str()]).inc();
        }
    }

    pub fn inc_scale_operations(&self, success: bool) {
        if let Some(m) = self.inner() {
            let outcome = if success { "success" } else { "failure" };
            m.scale_operations.with_label_values(&[outcome]).inc();
        }
    }

    pub fn inc_stale_samples(&self, dimension: Dimension) {
        if let Some(m) = self.inner() {
            m.stale_samples
                .with_label_values(&[dimension.as_str()])
                .inc();
        }
    }

    pub fn inc_state_repairs(&self) {
        if let Some(m) = self.inner() {
            m.state_repairs.inc();
        }
    }

    pub fn set_agents(&self, status: &str, count: i64) {
        if let Some(m) = self.inner() {
            m.agents.with_label_values(&[status]).set(count);
        }
    }

    pub fn set_monitor_interval(&self, interval_ms: u64) {
        if let Some(m) = self.inner() {
            m.monitor_interval_ms.set(interval_ms as i64);
        }
    }
}

/// Structured logger for fleet events
///
/// Every line carries an `event` field so log pipelines can key on it.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_startup(&self, version: &str, platform: &str) {
        info!(
            event = "fleet_started",
            node = %self.node_name,
            version = %version,
            platform = %platform,
            "Fleet resource manager started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "fleet_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Fleet resource manager shutting down"
        );
    }

    pub fn log_allocation_rejected(&self, owner: &str, reason: &str, shortage: &Shortage) {
        info!(
            event = "allocation_rejected",
            node = %self.node_name,
            owner = %owner,
            reason = %reason,
            shortage = %shortage,
            "Allocation rejected"
        );
    }

    pub fn log_pressure_alert(&self, alert: &PressureAlert) {
        let dimensions: Vec<&str> = alert.dimensions.iter().map(|d| d.as_str()).collect();
        match alert.level {
            PressureLevel::Critical => warn!(
                event = "pressure_alert",
                node = %self.node_name,
                level = %alert.level,
                previous = %alert.previous,
                composite_score = alert.composite_score,
                dimensions = ?dimensions,
                "Critical resource pressure"
            ),
            _ => info!(
                event = "pressure_alert",
                node = %self.node_name,
                level = %alert.level,
                previous = %alert.previous,
                composite_score = alert.composite_score,
                dimensions = ?dimensions,
                "Resource pressure increased"
            ),
        }
    }

    pub fn log_stale_sample(&self, dimension: Dimension, error: &str) {
        warn!(
            event = "stale_sample",
            node = %self.node_name,
            dimension = %dimension,
            error = %error,
            "Sampling failed, using last known value"
        );
    }

    pub fn log_agent_scaled(
        &self,
        agent_id: &str,
        from_replicas: u32,
        to_replicas: u32,
        success: bool,
        duration_ms: u64,
    ) {
        if success {
            info!(
                event = "agent_scaled",
                node = %self.node_name,
                agent_id = %agent_id,
                from_replicas = from_replicas,
                to_replicas = to_replicas,
                duration_ms = duration_ms,
                "Agent scaled"
            );
        } else {
            warn!(
                event = "agent_scale_failed",
                node = %self.node_name,
                agent_id = %agent_id,
                from_replicas = from_replicas,
                duration_ms = duration_ms,
                "Agent scale operation failed, replica count unchanged"
            );
        }
    }

    pub fn log_agent_replaced(&self, old_id: &str, new_id: &str) {
        warn!(
            event = "agent_replaced",
            node = %self.node_name,
            old_id = %old_id,
            new_id = %new_id,
            "Replaced unhealthy agent"
        );
    }

    pub fn log_state_repaired(&self, summary: &RepairSummary) {
        warn!(
            event = "state_repaired",
            node = %self.node_name,
            pools = ?summary.pools_repaired,
            expired_released = summary.expired_released,
            orphans_released = summary.orphans_released,
            "Allocator drift corrected"
        );
    }

    pub fn log_throttle(&self, summary: &ThrottleSummary) {
        info!(
            event = "allocations_throttled",
            node = %self.node_name,
            fraction = summary.fraction,
            affected = summary.affected.len(),
            reclaimed_cpu = summary.reclaimed.cpu,
            reclaimed_memory_mb = summary.reclaimed.memory_mb,
            "Throttled non-guaranteed allocations"
        );
    }

    pub fn log_plan_generated(&self, plan_id: &str, strategy: &str, actions: usize) {
        info!(
            event = "plan_generated",
            node = %self.node_name,
            plan_id = %plan_id,
            strategy = %strategy,
            actions = actions,
            "Optimization plan generated"
        );
    }
}
