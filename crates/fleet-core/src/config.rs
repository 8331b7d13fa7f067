//! Runtime configuration for the fleet core
//!
//! Every field has a default so a partial file (or none at all) yields a
//! working configuration. Changes made at runtime go through
//! [`FleetConfig::with_path`], which validates the complete result before
//! anything is replaced.

use crate::error::{FleetError, FleetResult};
use crate::lifecycle::HealthCheckPolicy;
use crate::models::ResourceVector;
use crate::optimizer::Strategy;
use crate::pressure::{DimensionWeights, ThresholdSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

/// Lower bound on the sampling interval
pub const MIN_INTERVAL_MS: u64 = 1_000;
/// Upper bound on the sampling interval
pub const MAX_INTERVAL_MS: u64 = 60_000;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub monitoring: MonitoringConfig,
    pub pressure: PressureConfig,
    pub allocator: AllocatorConfig,
    pub lifecycle: LifecycleConfig,
    pub optimization: OptimizationConfig,
    pub features: FeatureToggles,
}

/// Sampling loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Base sampling interval
    pub interval_ms: u64,
    /// Shortest interval the loop adapts down to
    pub min_interval_ms: u64,
    /// Longest interval the loop adapts up to
    pub max_interval_ms: u64,
    /// Number of snapshots retained in history
    pub retention: usize,
    /// Time allowed for the loop to finish its in-flight sample on stop
    pub shutdown_timeout_ms: u64,
    /// Link capacity used to turn byte counters into a utilization percent
    pub network_capacity_mbps: u64,
    /// Timeout for a single platform command
    pub command_timeout_ms: u64,
    /// Pool whose capacity the local host backs
    pub host_pool: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            min_interval_ms: MIN_INTERVAL_MS,
            max_interval_ms: MAX_INTERVAL_MS,
            retention: 720,
            shutdown_timeout_ms: 5_000,
            network_capacity_mbps: 1_000,
            command_timeout_ms: 5_000,
            host_pool: "local".to_string(),
        }
    }
}

impl MonitoringConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Pressure classification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    pub thresholds: ThresholdSet,
    pub weights: DimensionWeights,
    /// Alert cool-down as a multiple of the polling interval
    pub cooldown_multiplier: u32,
    /// Number of readings kept for patterns and debounce checks
    pub history_size: usize,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdSet::default(),
            weights: DimensionWeights::default(),
            cooldown_multiplier: 3,
            history_size: 720,
        }
    }
}

/// One capacity pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub id: String,
    pub capacity: ResourceVector,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// A quota ceiling for a named scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSpec {
    pub scope: String,
    pub limits: ResourceVector,
}

/// Allocator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Pools to create at startup. When empty the host pool is sized from the
    /// first snapshot.
    pub pools: Vec<PoolSpec>,
    pub quotas: Vec<QuotaSpec>,
    /// Utilization points kept per pool for trend reporting
    pub utilization_history: usize,
    /// TTL applied to reservations that do not specify one
    pub default_reservation_ttl_secs: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            quotas: Vec::new(),
            utilization_history: 288,
            default_reservation_ttl_secs: 300,
        }
    }
}

/// Agent lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub health_check: HealthCheckPolicy,
    /// Attempts per replica when a scale-up hits a transient shortage
    pub scale_max_retries: u32,
    /// First backoff delay between attempts, doubled each retry
    pub scale_backoff_ms: u64,
    /// How long deployment waits for an agent to report ready
    pub ready_timeout_ms: u64,
    /// CPU utilization an agent should settle around
    pub cpu_target_percent: f64,
    /// Memory utilization an agent should settle around
    pub memory_target_percent: f64,
    /// Bounded mailbox size per channel subscriber
    pub mailbox_capacity: usize,
    /// Utilization samples kept per agent
    pub utilization_history: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_check: HealthCheckPolicy::default(),
            scale_max_retries: 3,
            scale_backoff_ms: 200,
            ready_timeout_ms: 30_000,
            cpu_target_percent: 70.0,
            memory_target_percent: 80.0,
            mailbox_capacity: 256,
            utilization_history: 120,
        }
    }
}

impl LifecycleConfig {
    pub fn scale_backoff(&self) -> Duration {
        Duration::from_millis(self.scale_backoff_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationConfig {
    pub strategy: Strategy,
    /// Run analysis every N sampling cycles
    pub schedule_every_cycles: u32,
    /// How long high/critical pressure must persist to count as overload
    pub debounce_secs: u64,
    /// Utilization under which an agent is a consolidation candidate
    pub consolidation_floor_percent: f64,
    /// How long utilization must stay under the floor
    pub consolidation_window_secs: u64,
    /// Agent utilization treated as overloaded
    pub overload_percent: f64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Balanced,
            schedule_every_cycles: 12,
            debounce_secs: 60,
            consolidation_floor_percent: 20.0,
            consolidation_window_secs: 300,
            overload_percent: 85.0,
        }
    }
}

impl OptimizationConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn consolidation_window(&self) -> Duration {
        Duration::from_secs(self.consolidation_window_secs)
    }
}

/// Feature toggles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureToggles {
    // Aliases accept the lowercased keys environment overrides produce
    #[serde(alias = "auto_scaling")]
    pub auto_scaling: bool,
    #[serde(alias = "pressure_detection")]
    pub pressure_detection: bool,
    #[serde(alias = "predictive_analytics")]
    pub predictive_analytics: bool,
    #[serde(alias = "auto_throttle")]
    pub auto_throttle: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            auto_scaling: false,
            pressure_detection: true,
            predictive_analytics: true,
            auto_throttle: false,
        }
    }
}

impl FleetConfig {
    /// Check every rule a configuration must satisfy
    pub fn validate(&self) -> FleetResult<()> {
        let m = &self.monitoring;
        if m.min_interval_ms < MIN_INTERVAL_MS {
            return Err(FleetError::config(
                "monitoring.min_interval_ms",
                format!("must be at least {} ms", MIN_INTERVAL_MS),
            ));
        }
        if m.max_interval_ms > MAX_INTERVAL_MS {
            return Err(FleetError::config(
                "monitoring.max_interval_ms",
                format!("must be at most {} ms", MAX_INTERVAL_MS),
            ));
        }
        if m.min_interval_ms > m.max_interval_ms {
            return Err(FleetError::config(
                "monitoring.min_interval_ms",
                "must not exceed monitoring.max_interval_ms",
            ));
        }
        if m.interval_ms < m.min_interval_ms || m.interval_ms > m.max_interval_ms {
            return Err(FleetError::config(
                "monitoring.interval_ms",
                format!(
                    "must be within [{}, {}] ms",
                    m.min_interval_ms, m.max_interval_ms
                ),
            ));
        }
        if m.retention == 0 {
            return Err(FleetError::config("monitoring.retention", "must be positive"));
        }
        if m.network_capacity_mbps == 0 {
            return Err(FleetError::config(
                "monitoring.network_capacity_mbps",
                "must be positive",
            ));
        }

        self.pressure.thresholds.validate()?;
        self.pressure.weights.validate()?;
        if self.pressure.cooldown_multiplier == 0 {
            return Err(FleetError::config(
                "pressure.cooldown_multiplier",
                "must be at least 1",
            ));
        }
        if self.pressure.history_size == 0 {
            return Err(FleetError::config("pressure.history_size", "must be positive"));
        }

        let mut seen = HashSet::new();
        for pool in &self.allocator.pools {
            if pool.id.trim().is_empty() {
                return Err(FleetError::config("allocator.pools", "pool id must not be empty"));
            }
            if !seen.insert(pool.id.as_str()) {
                return Err(FleetError::config(
                    "allocator.pools",
                    format!("duplicate pool id '{}'", pool.id),
                ));
            }
        }
        for quota in &self.allocator.quotas {
            if quota.scope.trim().is_empty() {
                return Err(FleetError::config("allocator.quotas", "scope must not be empty"));
            }
        }

        self.lifecycle.health_check.validate()?;
        for (field, value) in [
            ("lifecycle.cpu_target_percent", self.lifecycle.cpu_target_percent),
            ("lifecycle.memory_target_percent", self.lifecycle.memory_target_percent),
            (
                "optimization.consolidation_floor_percent",
                self.optimization.consolidation_floor_percent,
            ),
            ("optimization.overload_percent", self.optimization.overload_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(FleetError::config(field, "must be within [0, 100]"));
            }
        }
        if self.lifecycle.mailbox_capacity == 0 {
            return Err(FleetError::config(
                "lifecycle.mailbox_capacity",
                "must be positive",
            ));
        }
        if self.optimization.schedule_every_cycles == 0 {
            return Err(FleetError::config(
                "optimization.schedule_every_cycles",
                "must be at least 1",
            ));
        }

        Ok(())
    }

    /// Read a value by dotted key (`pressure.thresholds.cpu.high`). An empty
    /// key returns the whole configuration.
    pub fn get_path(&self, key: &str) -> FleetResult<Value> {
        let root = serde_json::to_value(self).map_err(|e| FleetError::Internal(e.into()))?;
        if key.is_empty() {
            return Ok(root);
        }

        let mut current = &root;
        for segment in key.split('.') {
            current = current.get(segment).ok_or_else(|| unknown_key(key, current))?;
        }
        Ok(current.clone())
    }

    /// Produce a copy with one dotted key replaced. The copy is validated in
    /// full; on any error `self` is left untouched.
    pub fn with_path(&self, key: &str, value: Value) -> FleetResult<FleetConfig> {
        if key.is_empty() {
            return Err(FleetError::config("key", "must not be empty"));
        }

        let mut root = serde_json::to_value(self).map_err(|e| FleetError::Internal(e.into()))?;
        let segments: Vec<&str> = key.split('.').collect();
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| FleetError::config("key", "must not be empty"))?;

        let mut current = &mut root;
        for segment in parents {
            let snapshot = current.clone();
            current = current
                .get_mut(*segment)
                .ok_or_else(|| unknown_key(key, &snapshot))?;
        }

        let object = current
            .as_object_mut()
            .ok_or_else(|| FleetError::config(key, "parent is not a section"))?;
        if !object.contains_key(*last) {
            let keys: Vec<String> = object.keys().cloned().collect();
            return Err(FleetError::config(
                key,
                format!("unknown key, expected one of: {}", keys.join(", ")),
            ));
        }
        object.insert(last.to_string(), value);

        let updated: FleetConfig = serde_json::from_value(root)
            .map_err(|e| FleetError::config(key, format!("invalid value: {}", e)))?;
        updated.validate()?;
        Ok(updated)
    }
}

fn unknown_key(key: &str, parent: &Value) -> FleetError {
    let expected = parent
        .as_object()
        .map(|o| o.keys().cloned().collect::<Vec<_>>().join(", "))
        .unwrap_or_default();
    FleetError::config(key, format!("unknown key, expected one of: {}", expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config_is_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitoring.interval(), Duration::from_secs(5));
        assert_eq!(config.pressure.cooldown_multiplier, 3);
    }

    #[test]
    fn test_get_path() {
        let config = FleetConfig::default();
        assert_eq!(config.get_path("monitoring.interval_ms").unwrap(), json!(5000));
        assert_eq!(
            config.get_path("features.autoScaling").unwrap(),
            json!(false)
        );
        assert!(config.get_path("monitoring.nope").is_err());
    }

    #[test]
    fn test_with_path_applies_valid_change() {
        let config = FleetConfig::default();
        let updated = config
            .with_path("monitoring.interval_ms", json!(2000))
            .unwrap();
        assert_eq!(updated.monitoring.interval_ms, 2000);
        assert_eq!(config.monitoring.interval_ms, 5000);
    }

    #[test]
    fn test_with_path_rejects_out_of_range_threshold() {
        let config = FleetConfig::default();
        let err = config
            .with_path("pressure.thresholds.cpu.critical", json!(150.0))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationInvalid);
    }

    #[test]
    fn test_with_path_rejects_weights_not_summing_to_one() {
        let config = FleetConfig::default();
        let err = config
            .with_path("pressure.weights.cpu", json!(0.9))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationInvalid);
    }

    #[test]
    fn test_interval_outside_bounds_rejected() {
        let config = FleetConfig::default();
        assert!(config.with_path("monitoring.interval_ms", json!(500)).is_err());
        assert!(config
            .with_path("monitoring.interval_ms", json!(120_000))
            .is_err());
    }

    #[test]
    fn test_duplicate_pool_ids_rejected() {
        let mut config = FleetConfig::default();
        let pool = PoolSpec {
            id: "a".to_string(),
            capacity: ResourceVector::new(100, 100),
            labels: vec![],
        };
        config.allocator.pools = vec![pool.clone(), pool];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: FleetConfig =
            serde_json::from_value(json!({ "monitoring": { "interval_ms": 10000 } })).unwrap();
        assert_eq!(config.monitoring.interval_ms, 10_000);
        assert_eq!(config.monitoring.retention, 720);
        assert!(config.features.pressure_detection);
    }
}
