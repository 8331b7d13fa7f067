//! Pressure classification
//!
//! Turns snapshots into per-dimension tiers and a weighted composite score,
//! keeps a bounded reading history, fires edge-triggered alerts and derives
//! recurring windows and mitigation hints from it.

mod alerter;
mod mitigation;
mod patterns;
mod thresholds;

pub use alerter::{Alerter, PressureAlert};
pub use mitigation::{mitigation_actions, MitigationAction, MitigationKind};
pub use patterns::{find_patterns, PressurePattern, MIN_OCCURRENCES};
pub use thresholds::{DimensionWeights, PressureLevel, ThresholdSet, TierThresholds};

use crate::buffer::{RingBuffer, Timestamped};
use crate::config::PressureConfig;
use crate::error::FleetResult;
use crate::models::{Dimension, ResourceSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Classification of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureReading {
    pub timestamp: DateTime<Utc>,
    pub levels: BTreeMap<Dimension, PressureLevel>,
    pub percents: BTreeMap<Dimension, f64>,
    pub composite_score: f64,
    pub overall: PressureLevel,
}

impl PressureReading {
    pub fn level(&self, dimension: Dimension) -> PressureLevel {
        self.levels
            .get(&dimension)
            .copied()
            .unwrap_or(PressureLevel::Normal)
    }

    /// Dimensions classified at exactly `level`
    pub fn dimensions_at(&self, level: PressureLevel) -> Vec<Dimension> {
        self.levels
            .iter()
            .filter(|(_, l)| **l == level)
            .map(|(d, _)| *d)
            .collect()
    }
}

impl Timestamped for PressureReading {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Weighted composite of tier scores, clamped to [0, 1]
pub fn composite_score(
    levels: &BTreeMap<Dimension, PressureLevel>,
    weights: &DimensionWeights,
) -> f64 {
    let score: f64 = Dimension::ALL
        .iter()
        .map(|d| {
            let level = levels.get(d).copied().unwrap_or(PressureLevel::Normal);
            weights.get(*d) * level.score()
        })
        .sum();
    score.clamp(0.0, 1.0)
}

/// Classify a snapshot without touching any detector state
pub fn classify(
    snapshot: &ResourceSnapshot,
    thresholds: &ThresholdSet,
    weights: &DimensionWeights,
) -> PressureReading {
    let mut levels = BTreeMap::new();
    let mut percents = BTreeMap::new();
    for dimension in Dimension::ALL {
        let percent = snapshot.percent(dimension);
        levels.insert(dimension, thresholds.classify(dimension, percent));
        percents.insert(dimension, percent);
    }

    let overall = levels
        .values()
        .copied()
        .max()
        .unwrap_or(PressureLevel::Normal);

    PressureReading {
        timestamp: snapshot.timestamp,
        composite_score: composite_score(&levels, weights),
        levels,
        percents,
        overall,
    }
}

/// Callback invoked for every fired alert
pub type AlertHandler = Arc<dyn Fn(&PressureAlert) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Tuning {
    thresholds: ThresholdSet,
    weights: DimensionWeights,
}

/// Stateful pressure detector shared by the monitoring loop and the API
pub struct PressureDetector {
    tuning: RwLock<Tuning>,
    history: Mutex<RingBuffer<PressureReading>>,
    alerter: Mutex<Alerter>,
    handlers: RwLock<Vec<AlertHandler>>,
}

impl std::fmt::Debug for PressureDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureDetector")
            .field("thresholds", &self.thresholds())
            .field("weights", &self.weights())
            .finish()
    }
}

impl PressureDetector {
    /// Create a detector. The alert cool-down is `cooldown_multiplier` times
    /// the polling interval.
    pub fn new(config: &PressureConfig, polling_interval: Duration) -> Self {
        let cooldown = polling_interval * config.cooldown_multiplier.max(1);
        Self {
            tuning: RwLock::new(Tuning {
                thresholds: config.thresholds,
                weights: config.weights,
            }),
            history: Mutex::new(RingBuffer::new(config.history_size)),
            alerter: Mutex::new(Alerter::new(cooldown)),
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn tuning(&self) -> Tuning {
        *self.tuning.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Classify a snapshot, record it and fire any resulting alert
    pub fn detect_pressure(&self, snapshot: &ResourceSnapshot) -> PressureReading {
        let tuning = self.tuning();
        let reading = classify(snapshot, &tuning.thresholds, &tuning.weights);

        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(reading.clone());

        let alert = self
            .alerter
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .evaluate(&reading);

        if let Some(alert) = alert {
            self.dispatch(&alert);
        }

        debug!(
            overall = %reading.overall,
            composite = reading.composite_score,
            "Pressure classified"
        );
        reading
    }

    /// Classify a batch in order, as if each had been observed live
    pub fn detect_pressure_batch(&self, snapshots: &[ResourceSnapshot]) -> Vec<PressureReading> {
        snapshots.iter().map(|s| self.detect_pressure(s)).collect()
    }

    fn dispatch(&self, alert: &PressureAlert) {
        let handlers: Vec<AlertHandler> = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        info!(
            level = %alert.level,
            previous = %alert.previous,
            handlers = handlers.len(),
            "Pressure alert fired"
        );
        for handler in handlers {
            handler(alert);
        }
    }

    /// Register an alert handler
    pub fn on_alert<F>(&self, handler: F)
    where
        F: Fn(&PressureAlert) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::new(handler));
    }

    pub fn thresholds(&self) -> ThresholdSet {
        self.tuning().thresholds
    }

    /// Replace cutoffs for the given dimensions. The merged set is validated
    /// in full and swapped in atomically; on error nothing changes.
    pub fn set_thresholds(
        &self,
        updates: &HashMap<Dimension, TierThresholds>,
    ) -> FleetResult<ThresholdSet> {
        let mut tuning = self.tuning.write().unwrap_or_else(|p| p.into_inner());
        let mut merged = tuning.thresholds;
        for (dimension, tiers) in updates {
            merged.set(*dimension, *tiers);
        }
        merged.validate()?;
        tuning.thresholds = merged;
        info!(?merged, "Pressure thresholds updated");
        Ok(merged)
    }

    /// Replace the full threshold set
    pub fn replace_thresholds(&self, thresholds: ThresholdSet) -> FleetResult<()> {
        thresholds.validate()?;
        self.tuning
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .thresholds = thresholds;
        Ok(())
    }

    pub fn weights(&self) -> DimensionWeights {
        self.tuning().weights
    }

    pub fn set_weights(&self, weights: DimensionWeights) -> FleetResult<()> {
        weights.validate()?;
        self.tuning
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .weights = weights;
        Ok(())
    }

    pub fn set_cooldown(&self, cooldown: Duration) {
        self.alerter
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .set_cooldown(cooldown);
    }

    pub fn cooldown(&self) -> Duration {
        self.alerter
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .cooldown()
    }

    pub fn set_history_size(&self, size: usize) {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .resize(size);
    }

    /// Readings newer than `window`, or all of them
    pub fn history(&self, window: Option<Duration>) -> Vec<PressureReading> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        match window
            .and_then(|w| chrono::Duration::from_std(w).ok())
            .and_then(|w| Utc::now().checked_sub_signed(w))
        {
            Some(cutoff) => history.since(cutoff).cloned().collect(),
            None => history.to_vec(),
        }
    }

    pub fn latest(&self) -> Option<PressureReading> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .latest()
            .cloned()
    }

    /// How long the trailing run of high/critical readings has lasted, if the
    /// latest reading is elevated
    pub fn sustained_elevated(&self) -> Option<Duration> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        let latest = history.latest().filter(|r| r.overall.is_elevated())?;
        let start = history
            .iter()
            .rev()
            .take_while(|r| r.overall.is_elevated())
            .last()
            .map(|r| r.timestamp)?;
        (latest.timestamp - start).to_std().ok()
    }

    pub fn patterns(&self) -> Vec<PressurePattern> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        find_patterns(history.iter())
    }

    pub fn mitigation_actions(&self, reading: &PressureReading) -> Vec<MitigationAction> {
        mitigation_actions(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CpuSample, MemorySample};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn snapshot_at(at: DateTime<Utc>, cpu: f64, memory: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            timestamp: at,
            cpu: CpuSample {
                cores: 8,
                usage_percent: cpu,
                load_average: [0.0; 3],
                process_count: 100,
            },
            memory: MemorySample {
                total_mb: 16384,
                used_mb: (16384.0 * memory / 100.0) as u64,
                free_mb: 0,
                percent: memory,
                buffers: 0,
                cached: 0,
            },
            disk: vec![],
            network: vec![],
            network_percent: 0.0,
            stale: vec![],
        }
    }

    fn detector() -> PressureDetector {
        PressureDetector::new(&PressureConfig::default(), Duration::from_secs(5))
    }

    #[test]
    fn test_classification_and_composite() {
        let d = detector();
        let reading = d.detect_pressure(&snapshot_at(Utc::now(), 95.0, 10.0));
        assert_eq!(reading.level(Dimension::Cpu), PressureLevel::Critical);
        assert_eq!(reading.level(Dimension::Memory), PressureLevel::Normal);
        assert_eq!(reading.overall, PressureLevel::Critical);
        // 0.3*1.0 + 0.3*0.2 + 0.2*0.2 + 0.2*0.2
        assert!((reading.composite_score - 0.44).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_series_levels() {
        let d = detector();
        let t0 = Utc::now();
        let snapshots: Vec<ResourceSnapshot> = [30.0, 45.0, 60.0, 75.0, 90.0]
            .iter()
            .enumerate()
            .map(|(i, cpu)| snapshot_at(t0 + chrono::Duration::seconds(i as i64 * 5), *cpu, 0.0))
            .collect();
        let levels: Vec<PressureLevel> = d
            .detect_pressure_batch(&snapshots)
            .iter()
            .map(|r| r.level(Dimension::Cpu))
            .collect();
        assert_eq!(
            levels,
            vec![
                PressureLevel::Normal,
                PressureLevel::Normal,
                PressureLevel::Moderate,
                PressureLevel::High,
                PressureLevel::Critical,
            ]
        );
    }

    #[test]
    fn test_alert_handlers_receive_edges() {
        let d = detector();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        d.on_alert(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let t0 = Utc::now();
        // normal, moderate, high, high, critical
        for (i, cpu) in [10.0, 65.0, 80.0, 82.0, 95.0].iter().enumerate() {
            d.detect_pressure(&snapshot_at(
                t0 + chrono::Duration::seconds(i as i64 * 5),
                *cpu,
                0.0,
            ));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_set_thresholds_is_atomic() {
        let d = detector();
        let before = d.thresholds();

        let mut updates = HashMap::new();
        updates.insert(Dimension::Cpu, TierThresholds::new(50.0, 70.0, 85.0));
        updates.insert(Dimension::Memory, TierThresholds::new(90.0, 80.0, 95.0));
        let err = d.set_thresholds(&updates).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationInvalid);
        assert_eq!(d.thresholds(), before);

        updates.remove(&Dimension::Memory);
        let updated = d.set_thresholds(&updates).unwrap();
        assert_eq!(updated.cpu.critical, 85.0);
        assert_eq!(updated.memory, before.memory);
    }

    #[test]
    fn test_sustained_elevated() {
        let d = detector();
        let t0 = Utc::now() - chrono::Duration::seconds(60);
        d.detect_pressure(&snapshot_at(t0, 10.0, 0.0));
        assert!(d.sustained_elevated().is_none());

        for i in 1..=4 {
            d.detect_pressure(&snapshot_at(t0 + chrono::Duration::seconds(i * 10), 92.0, 0.0));
        }
        assert_eq!(d.sustained_elevated(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let d = detector();
        let err = d
            .set_weights(DimensionWeights {
                cpu: 0.9,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationInvalid);
        assert_eq!(d.weights(), DimensionWeights::default());
    }
}
