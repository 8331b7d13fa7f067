//! Monitoring loop
//!
//! Samples on an adaptive interval: shorter under high pressure, longer when
//! idle, always within the configured bounds. Each cycle hands the snapshot
//! to a [`CycleObserver`] (pressure detection, expiry, optimizer scheduling)
//! whose verdict steers the next interval.

use super::ResourceDetector;
use crate::models::ResourceSnapshot;
use crate::observability::FleetMetrics;
use crate::pressure::PressureLevel;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Consumer run once per sampling cycle
#[async_trait]
pub trait CycleObserver: Send + Sync {
    /// Handle a fresh snapshot and report the pressure it represents
    async fn on_snapshot(&self, snapshot: &ResourceSnapshot) -> PressureLevel;
}

/// Interval that reacts to pressure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveInterval {
    base: Duration,
    min: Duration,
    max: Duration,
    current: Duration,
}

impl AdaptiveInterval {
    pub fn new(base: Duration, min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        let base = base.clamp(min, max);
        Self {
            base,
            min,
            max,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Move the interval for the next cycle:
    /// critical jumps to the minimum, high halves, moderate returns to base
    /// and normal stretches by half again.
    pub fn adjust(&mut self, level: PressureLevel) -> Duration {
        self.current = match level {
            PressureLevel::Critical => self.min,
            PressureLevel::High => (self.current / 2).max(self.min),
            PressureLevel::Moderate => self.base,
            PressureLevel::Normal => (self.current * 3 / 2).min(self.max),
        };
        self.current
    }
}

/// The sampling loop; consumed by [`MonitorLoop::spawn`]
pub struct MonitorLoop {
    detector: Arc<ResourceDetector>,
    observer: Option<Arc<dyn CycleObserver>>,
    interval: AdaptiveInterval,
    current_ms: Arc<AtomicU64>,
    metrics: FleetMetrics,
}

impl MonitorLoop {
    pub fn new(detector: Arc<ResourceDetector>, interval: AdaptiveInterval) -> Self {
        Self {
            detector,
            observer: None,
            current_ms: Arc::new(AtomicU64::new(interval.current().as_millis() as u64)),
            interval,
            metrics: FleetMetrics::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run until a shutdown signal arrives. A cycle already in progress is
    /// finished before the loop exits.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.interval.current().as_millis() as u64,
            "Starting monitoring loop"
        );

        let mut delay = Duration::ZERO;
        let mut cycles = 0u64;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let start = Instant::now();
                    let snapshot = self.detector.detect_all().await;
                    let level = match &self.observer {
                        Some(observer) => observer.on_snapshot(&snapshot).await,
                        None => PressureLevel::Normal,
                    };

                    let next = self.interval.adjust(level);
                    self.current_ms.store(next.as_millis() as u64, Ordering::Relaxed);
                    self.metrics.set_monitor_interval(next.as_millis() as u64);
                    cycles += 1;

                    // Sleep only for what is left of the interval
                    delay = next.saturating_sub(start.elapsed());

                    if cycles % 12 == 0 {
                        debug!(
                            cycles,
                            level = %level,
                            next_interval_ms = next.as_millis() as u64,
                            "Monitoring cycle complete"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    info!(cycles, "Shutting down monitoring loop");
                    break;
                }
            }
        }
    }

    /// Spawn onto the runtime and return a handle for stopping it
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let current_ms = self.current_ms.clone();
        let task = tokio::spawn(self.run(shutdown_rx));
        MonitorHandle {
            shutdown_tx,
            task,
            current_ms,
        }
    }
}

/// Handle to a running loop
pub struct MonitorHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
    current_ms: Arc<AtomicU64>,
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("current_interval", &self.current_interval())
            .finish()
    }
}

impl MonitorHandle {
    /// Interval chosen for the next cycle
    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.current_ms.load(Ordering::Relaxed))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop and wait up to `timeout` for it to finish its cycle.
    /// Returns false if the loop had to be aborted.
    pub async fn stop(self, timeout: Duration) -> bool {
        // Err means the loop already exited
        let _ = self.shutdown_tx.send(());

        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Monitoring loop ended abnormally");
                true
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Monitoring loop did not stop in time, aborting"
                );
                task.abort();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_interval_bounds() {
        let mut interval = AdaptiveInterval::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        assert_eq!(interval.current(), Duration::from_secs(5));

        assert_eq!(interval.adjust(PressureLevel::High), Duration::from_millis(2500));
        assert_eq!(interval.adjust(PressureLevel::High), Duration::from_millis(1250));
        assert_eq!(interval.adjust(PressureLevel::High), Duration::from_secs(1));
        assert_eq!(interval.adjust(PressureLevel::Moderate), Duration::from_secs(5));
        assert_eq!(interval.adjust(PressureLevel::Critical), Duration::from_secs(1));

        for _ in 0..20 {
            interval.adjust(PressureLevel::Normal);
        }
        assert_eq!(interval.current(), Duration::from_secs(60));
    }

    #[test]
    fn test_base_clamped_into_bounds() {
        let interval = AdaptiveInterval::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        assert_eq!(interval.current(), Duration::from_secs(1));
    }
}
