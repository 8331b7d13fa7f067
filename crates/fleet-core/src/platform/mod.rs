//! Host capacity sampling behind a uniform interface
//!
//! One adapter exists per OS family. The right one is chosen once, at
//! startup, by [`detect_platform`]; callers only ever see the
//! [`PlatformAdapter`] trait. Each adapter tries a primary query path and
//! falls back to a secondary one before reporting an error.

mod command;
mod linux;
mod macos;
mod windows;

pub use command::{parse_df, run_command};
pub use linux::LinuxAdapter;
pub use macos::MacOsAdapter;
pub use windows::WindowsAdapter;

use crate::error::PlatformError;
use crate::models::{CpuSample, Dimension, DiskSample, MemorySample, NetworkSample};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// OS family an adapter samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Linux,
    MacOs,
    Windows,
    Unknown,
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformKind::Linux => write!(f, "linux"),
            PlatformKind::MacOs => write!(f, "macos"),
            PlatformKind::Windows => write!(f, "windows"),
            PlatformKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A normalized reading for a single dimension
#[derive(Debug, Clone, PartialEq)]
pub enum RawReading {
    Cpu(CpuSample),
    Memory(MemorySample),
    Disk(Vec<DiskSample>),
    Network(Vec<NetworkSample>),
}

impl RawReading {
    pub fn dimension(&self) -> Dimension {
        match self {
            RawReading::Cpu(_) => Dimension::Cpu,
            RawReading::Memory(_) => Dimension::Memory,
            RawReading::Disk(_) => Dimension::Disk,
            RawReading::Network(_) => Dimension::Network,
        }
    }
}

/// Trait for OS-specific capacity sampling
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// OS family this adapter targets
    fn platform(&self) -> PlatformKind;

    /// Whether this adapter can sample on the running host
    fn is_supported(&self) -> bool;

    /// Interval at which sampling is cheap enough to run continuously
    fn preferred_polling_interval(&self) -> Duration;

    /// Sample one dimension
    async fn sample(&self, dimension: Dimension) -> Result<RawReading, PlatformError>;
}

/// Pick the adapter for the OS this binary was built for
pub fn detect_platform(command_timeout: Duration) -> Arc<dyn PlatformAdapter> {
    if cfg!(target_os = "linux") {
        info!("Detected Linux, using procfs adapter");
        Arc::new(LinuxAdapter::new().with_command_timeout(command_timeout))
    } else if cfg!(target_os = "macos") {
        info!("Detected macOS, using sysctl/vm_stat adapter");
        Arc::new(MacOsAdapter::new(command_timeout))
    } else if cfg!(target_os = "windows") {
        info!("Detected Windows, using wmic/PowerShell adapter");
        Arc::new(WindowsAdapter::new(command_timeout))
    } else {
        warn!(
            os = std::env::consts::OS,
            "No platform adapter for this OS, sampling will be unavailable"
        );
        Arc::new(UnsupportedAdapter)
    }
}

/// Adapter for hosts with no sampling support
pub struct UnsupportedAdapter;

#[async_trait]
impl PlatformAdapter for UnsupportedAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Unknown
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn preferred_polling_interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn sample(&self, dimension: Dimension) -> Result<RawReading, PlatformError> {
        Err(PlatformError::Unsupported {
            platform: std::env::consts::OS.to_string(),
            what: dimension.to_string(),
        })
    }
}

/// Run `primary`, and only if it fails run `secondary`.
///
/// When both fail the secondary error is returned, since it describes the
/// last thing that was tried.
pub(crate) async fn with_fallback<T, P, S>(
    what: &str,
    primary: P,
    secondary: S,
) -> Result<T, PlatformError>
where
    P: Future<Output = Result<T, PlatformError>>,
    S: Future<Output = Result<T, PlatformError>>,
{
    match primary.await {
        Ok(value) => Ok(value),
        Err(primary_err) => {
            debug!(what, error = %primary_err, "Primary query failed, trying secondary path");
            secondary.await.map_err(|secondary_err| {
                warn!(
                    what,
                    primary = %primary_err,
                    secondary = %secondary_err,
                    "Both query paths failed"
                );
                secondary_err
            })
        }
    }
}

/// Percent of `used` in `total`, zero when total is zero
pub(crate) fn percent_of(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    }
}

/// Logical core count as seen by the standard library
pub(crate) fn available_cores() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// CPU usage estimated from the one-minute load average
pub(crate) fn usage_from_load(load_1m: f64, cores: u32) -> f64 {
    if cores == 0 {
        return 0.0;
    }
    (load_1m / cores as f64 * 100.0).clamp(0.0, 100.0)
}
