//! Resource detection
//!
//! The detector samples every dimension through the platform adapter,
//! normalizes the readings into a [`ResourceSnapshot`] and keeps a bounded
//! history for moving averages, trends and exhaustion forecasts. A failed
//! dimension never fails the caller: the last known value is substituted and
//! the dimension is flagged stale.

mod r#loop;
mod trend;


pub use r#loop::{AdaptiveInterval, CycleObserver, MonitorHandle, MonitorLoop};
pub use trend::{moving_average, trend_of, LinearFit, MIN_POINTS};

use crate::buffer::{RingBuffer, Timestamped};
use crate::error::{FleetError, FleetResult, PlatformError};
use crate::models::{
    CpuSample, Dimension, DiskSample, MemorySample, NetworkSample, ResourceSnapshot, Trend,
};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::platform::{PlatformAdapter, RawReading};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Samples used for exhaustion forecasts
const PREDICTION_WINDOW: usize = 30;

/// Samples used for the moving averages behind recommendations
const RECOMMENDATION_WINDOW: usize = 12;

impl Timestamped for ResourceSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// When a dimension is forecast to reach 100%
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExhaustionForecast {
    pub dimension: Dimension,
    pub eta: DateTime<Utc>,
    pub seconds_remaining: f64,
    /// Percent per second
    pub slope: f64,
    pub current_percent: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Capacity advice derived from history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorRecommendation {
    pub dimension: Dimension,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
}

/// One sampled dimension, possibly carried over
struct Observed<T> {
    value: T,
    stale: bool,
}

#[derive(Default)]
struct LastKnown {
    cpu: Option<CpuSample>,
    memory: Option<MemorySample>,
    disk: Option<Vec<DiskSample>>,
    network: Option<Vec<NetworkSample>>,
}

/// Periodic sampler with bounded history
pub struct ResourceDetector {
    adapter: Arc<dyn PlatformAdapter>,
    history: RwLock<RingBuffer<ResourceSnapshot>>,
    last_known: Mutex<LastKnown>,
    network_capacity_mbps: AtomicU64,
    metrics: FleetMetrics,
    logger: StructuredLogger,
}

impl std::fmt::Debug for ResourceDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDetector")
            .field("platform", &self.adapter.platform())
            .field("history", &self.history_len())
            .finish()
    }
}

fn mismatched(dimension: Dimension, reading: &RawReading) -> FleetError {
    PlatformError::parse(
        dimension.as_str(),
        format!("adapter returned a {} reading", reading.dimension()),
    )
    .into()
}

impl ResourceDetector {
    pub fn new(
        adapter: Arc<dyn PlatformAdapter>,
        retention: usize,
        network_capacity_mbps: u64,
    ) -> Self {
        Self {
            adapter,
            history: RwLock::new(RingBuffer::new(retention)),
            last_known: Mutex::new(LastKnown::default()),
            network_capacity_mbps: AtomicU64::new(network_capacity_mbps.max(1)),
            metrics: FleetMetrics::new(),
            logger: StructuredLogger::new("fleet"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn PlatformAdapter> {
        &self.adapter
    }

    pub fn set_retention(&self, retention: usize) {
        self.history
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .resize(retention);
    }

    pub fn set_network_capacity(&self, mbps: u64) {
        self.network_capacity_mbps.store(mbps.max(1), Ordering::Relaxed);
    }

    fn last_known(&self) -> std::sync::MutexGuard<'_, LastKnown> {
        self.last_known.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sample one dimension, falling back to the last known value
    async fn observe<T, F, G, S>(
        &self,
        dimension: Dimension,
        extract: F,
        cached: G,
        store: S,
    ) -> FleetResult<Observed<T>>
    where
        T: Clone,
        F: FnOnce(RawReading) -> Result<T, FleetError>,
        G: FnOnce(&LastKnown) -> Option<T>,
        S: FnOnce(&mut LastKnown, T),
    {
        let result = self
            .adapter
            .sample(dimension)
            .await
            .map_err(FleetError::from)
            .and_then(extract);

        match result {
            Ok(value) => {
                store(&mut *self.last_known(), value.clone());
                Ok(Observed {
                    value,
                    stale: false,
                })
            }
            Err(e) => {
                self.metrics.inc_stale_samples(dimension);
                self.logger.log_stale_sample(dimension, &e.to_string());
                let carried = cached(&*self.last_known());
                match carried {
                    Some(value) => Ok(Observed { value, stale: true }),
                    None => Err(e),
                }
            }
        }
    }

    async fn observe_cpu(&self) -> FleetResult<Observed<CpuSample>> {
        self.observe(
            Dimension::Cpu,
            |r| match r {
                RawReading::Cpu(s) => Ok(s),
                other => Err(mismatched(Dimension::Cpu, &other)),
            },
            |lk| lk.cpu.clone(),
            |lk, v| lk.cpu = Some(v),
        )
        .await
    }

    async fn observe_memory(&self) -> FleetResult<Observed<MemorySample>> {
        self.observe(
            Dimension::Memory,
            |r| match r {
                RawReading::Memory(s) => Ok(s),
                other => Err(mismatched(Dimension::Memory, &other)),
            },
            |lk| lk.memory.clone(),
            |lk, v| lk.memory = Some(v),
        )
        .await
    }

    async fn observe_disk(&self) -> FleetResult<Observed<Vec<DiskSample>>> {
        self.observe(
            Dimension::Disk,
            |r| match r {
                RawReading::Disk(s) => Ok(s),
                other => Err(mismatched(Dimension::Disk, &other)),
            },
            |lk| lk.disk.clone(),
            |lk, v| lk.disk = Some(v),
        )
        .await
    }

    async fn observe_network(&self) -> FleetResult<Observed<Vec<NetworkSample>>> {
        self.observe(
            Dimension::Network,
            |r| match r {
                RawReading::Network(s) => Ok(s),
                other => Err(mismatched(Dimension::Network, &other)),
            },
            |lk| lk.network.clone(),
            |lk, v| lk.network = Some(v),
        )
        .await
    }

    /// Current CPU, or the last known value when sampling fails
    pub async fn detect_cpu(&self) -> FleetResult<CpuSample> {
        self.observe_cpu().await.map(|o| o.value)
    }

    pub async fn detect_memory(&self) -> FleetResult<MemorySample> {
        self.observe_memory().await.map(|o| o.value)
    }

    pub async fn detect_disk(&self) -> FleetResult<Vec<DiskSample>> {
        self.observe_disk().await.map(|o| o.value)
    }

    pub async fn detect_network(&self) -> FleetResult<Vec<NetworkSample>> {
        self.observe_network().await.map(|o| o.value)
    }

    /// Sample every dimension and append the snapshot to history.
    ///
    /// Never fails: a dimension with neither a fresh nor a last known value
    /// is reported as zero and flagged stale.
    pub async fn detect_all(&self) -> ResourceSnapshot {
        let start = Instant::now();
        let (cpu, memory, disk, network) = tokio::join!(
            self.observe_cpu(),
            self.observe_memory(),
            self.observe_disk(),
            self.observe_network()
        );

        let mut stale = Vec::new();
        let cpu = unwrap_observed(Dimension::Cpu, cpu, &mut stale, || CpuSample {
            cores: 0,
            usage_percent: 0.0,
            load_average: [0.0; 3],
            process_count: 0,
        });
        let memory = unwrap_observed(Dimension::Memory, memory, &mut stale, || MemorySample {
            total_mb: 0,
            used_mb: 0,
            free_mb: 0,
            percent: 0.0,
            buffers: 0,
            cached: 0,
        });
        let disk = unwrap_observed(Dimension::Disk, disk, &mut stale, Vec::new);
        let network = unwrap_observed(Dimension::Network, network, &mut stale, Vec::new);

        let timestamp = Utc::now();
        let mut history = self.history.write().unwrap_or_else(|p| p.into_inner());
        let network_percent = match history.latest() {
            Some(previous) if stale.contains(&Dimension::Network) => previous.network_percent,
            Some(previous) => network_utilization(
                previous,
                timestamp,
                &network,
                self.network_capacity_mbps.load(Ordering::Relaxed),
            ),
            None => 0.0,
        };

        let snapshot = ResourceSnapshot {
            timestamp,
            cpu,
            memory,
            disk,
            network,
            network_percent,
            stale,
        };
        history.push(snapshot.clone());
        drop(history);

        let elapsed = start.elapsed();
        self.metrics.observe_sample_latency(elapsed.as_secs_f64());
        debug!(
            elapsed_ms = elapsed.as_millis() as u64,
            stale = ?snapshot.stale,
            "Snapshot collected"
        );
        snapshot
    }

    /// Append an externally produced snapshot (replay or tests)
    pub fn record(&self, snapshot: ResourceSnapshot) {
        self.history
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(snapshot);
    }

    pub fn latest(&self) -> Option<ResourceSnapshot> {
        self.history
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .latest()
            .cloned()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Snapshots newer than `window`, or all retained snapshots
    pub fn history(&self, window: Option<Duration>) -> Vec<ResourceSnapshot> {
        let history = self.history.read().unwrap_or_else(|p| p.into_inner());
        match window
            .and_then(|w| chrono::Duration::from_std(w).ok())
            .and_then(|w| Utc::now().checked_sub_signed(w))
        {
            Some(cutoff) => history.since(cutoff).cloned().collect(),
            None => history.to_vec(),
        }
    }

    /// Whether the most recent snapshot carried over any dimension
    pub fn is_degraded(&self) -> bool {
        self.history
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .latest()
            .map(|s| !s.stale.is_empty())
            .unwrap_or(false)
    }

    fn series(&self, dimension: Dimension, last: usize) -> Vec<(f64, f64)> {
        let history = self.history.read().unwrap_or_else(|p| p.into_inner());
        history
            .last_n(last)
            .map(|s| (timestamp_secs(s.timestamp), s.percent(dimension)))
            .collect()
    }

    /// Mean percent of the trailing `window` samples
    pub fn moving_average(&self, dimension: Dimension, window: usize) -> Option<f64> {
        let values: Vec<f64> = self
            .series(dimension, window)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        moving_average(&values, window)
    }

    /// Linear extrapolation to 100% over the recent window. `None` with fewer
    /// than three samples or a non-positive slope.
    pub fn predict_exhaustion(&self, dimension: Dimension) -> Option<ExhaustionForecast> {
        let points = self.series(dimension, PREDICTION_WINDOW);
        let fit = LinearFit::fit(&points)?;
        let seconds = fit.seconds_until(&points, 100.0)?;
        let (last_t, last_value) = *points.last()?;

        let eta = from_timestamp_secs(last_t + seconds)?;
        Some(ExhaustionForecast {
            dimension,
            eta,
            seconds_remaining: seconds,
            slope: fit.slope,
            current_percent: last_value,
            confidence: fit.r_squared,
        })
    }

    /// Trend label per dimension over `window` (or all history)
    pub fn trends(&self, window: Option<Duration>) -> BTreeMap<Dimension, Trend> {
        let snapshots = self.history(window);
        Dimension::ALL
            .iter()
            .map(|d| {
                let points: Vec<(f64, f64)> = snapshots
                    .iter()
                    .map(|s| (timestamp_secs(s.timestamp), s.percent(*d)))
                    .collect();
                (*d, trend_of(&points))
            })
            .collect()
    }

    pub fn recommendations(&self) -> Vec<DetectorRecommendation> {
        let mut out = Vec::new();
        let latest = self.latest();

        for dimension in Dimension::ALL {
            if latest.as_ref().map_or(false, |s| s.is_stale(dimension)) {
                out.push(DetectorRecommendation {
                    dimension,
                    severity: Severity::Warning,
                    message: format!(
                        "{} sampling is failing, values are carried over from the last good sample",
                        dimension
                    ),
                    eta: None,
                });
            }

            if let Some(forecast) = self.predict_exhaustion(dimension) {
                if forecast.seconds_remaining <= 3_600.0 {
                    out.push(DetectorRecommendation {
                        dimension,
                        severity: Severity::Critical,
                        message: format!(
                            "{} forecast to reach 100% in {:.0} minutes, add capacity or shed load",
                            dimension,
                            forecast.seconds_remaining / 60.0
                        ),
                        eta: Some(forecast.eta),
                    });
                    continue;
                }
            }

            let Some(average) = self.moving_average(dimension, RECOMMENDATION_WINDOW) else {
                continue;
            };
            if average >= 85.0 {
                out.push(DetectorRecommendation {
                    dimension,
                    severity: Severity::Warning,
                    message: format!(
                        "{} averaging {:.1}%, consider scaling out or migrating load",
                        dimension, average
                    ),
                    eta: None,
                });
            } else if average < 20.0 && matches!(dimension, Dimension::Cpu | Dimension::Memory) {
                out.push(DetectorRecommendation {
                    dimension,
                    severity: Severity::Info,
                    message: format!(
                        "{} averaging {:.1}%, capacity is available for more agents",
                        dimension, average
                    ),
                    eta: None,
                });
            }
        }

        out.sort_by(|a, b| b.severity.cmp(&a.severity));
        out
    }
}

fn unwrap_observed<T>(
    dimension: Dimension,
    observed: FleetResult<Observed<T>>,
    stale: &mut Vec<Dimension>,
    empty: impl FnOnce() -> T,
) -> T {
    match observed {
        Ok(o) => {
            if o.stale {
                stale.push(dimension);
            }
            o.value
        }
        Err(_) => {
            stale.push(dimension);
            empty()
        }
    }
}

/// Link utilization from the counter delta against the previous snapshot
fn network_utilization(
    previous: &ResourceSnapshot,
    now: DateTime<Utc>,
    network: &[NetworkSample],
    capacity_mbps: u64,
) -> f64 {
    let elapsed = (now - previous.timestamp).num_milliseconds() as f64 / 1_000.0;
    if elapsed <= 0.0 {
        return previous.network_percent;
    }
    let current: u64 = network.iter().map(|n| n.bytes_in + n.bytes_out).sum();
    let before = previous.total_bytes_in() + previous.total_bytes_out();
    // Counter reset or interface change
    if current < before {
        return 0.0;
    }
    let bits_per_sec = (current - before) as f64 * 8.0 / elapsed;
    let capacity_bits = capacity_mbps as f64 * 1_000_000.0;
    (bits_per_sec / capacity_bits * 100.0).clamp(0.0, 100.0)
}

fn timestamp_secs(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1_000.0
}

fn from_timestamp_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((secs * 1_000.0) as i64)
}
