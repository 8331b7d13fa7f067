//! Linux sampling via procfs
//!
//! Primary sources:
//! - /proc/stat and /proc/loadavg for CPU
//! - /proc/meminfo for memory
//! - `df -kP` for filesystems
//! - /proc/net/dev for interface counters
//!
//! Secondary sources are load-average derived CPU usage, `free -m`,
//! `df -k` and /sys/class/net statistics.

use super::{
    available_cores, parse_df, percent_of, run_command, usage_from_load, with_fallback,
    PlatformAdapter, PlatformKind, RawReading,
};
use crate::error::PlatformError;
use crate::models::{CpuSample, Dimension, DiskSample, MemorySample, NetworkSample};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::fs;

/// Aggregate CPU jiffies from the first line of /proc/stat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_total(&self) -> u64 {
        self.idle + self.iowait
    }

    /// Busy percent between `previous` and `self`, or since boot without one
    pub fn usage_since(&self, previous: Option<&CpuTimes>) -> f64 {
        let (total, idle) = match previous {
            Some(prev) => (
                self.total().saturating_sub(prev.total()),
                self.idle_total().saturating_sub(prev.idle_total()),
            ),
            None => (self.total(), self.idle_total()),
        };
        if total == 0 {
            return 0.0;
        }
        percent_of(total.saturating_sub(idle), total)
    }
}

/// Sampler for Linux hosts
pub struct LinuxAdapter {
    proc_root: PathBuf,
    sys_root: PathBuf,
    command_timeout: Duration,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl Default for LinuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxAdapter {
    pub fn new() -> Self {
        Self::with_roots("/proc", "/sys")
    }

    /// Create an adapter reading from custom roots (for testing)
    pub fn with_roots(proc_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
            command_timeout: Duration::from_secs(5),
            last_cpu: Mutex::new(None),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    async fn read(&self, path: &Path) -> Result<String, PlatformError> {
        fs::read_to_string(path).await.map_err(|source| PlatformError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Parse the aggregate `cpu` line and count per-core lines
    pub fn parse_stat(content: &str) -> Result<(CpuTimes, u32), PlatformError> {
        let mut times = None;
        let mut cores = 0u32;

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("cpu") => {
                    let values: Vec<u64> = parts.filter_map(|p| p.parse().ok()).collect();
                    if values.len() < 4 {
                        return Err(PlatformError::parse("/proc/stat", "incomplete cpu line"));
                    }
                    let at = |i: usize| values.get(i).copied().unwrap_or(0);
                    times = Some(CpuTimes {
                        user: at(0),
                        nice: at(1),
                        system: at(2),
                        idle: at(3),
                        iowait: at(4),
                        irq: at(5),
                        softirq: at(6),
                        steal: at(7),
                    });
                }
                Some(label) if label.starts_with("cpu") => cores += 1,
                _ => {}
            }
        }

        let times = times.ok_or_else(|| PlatformError::parse("/proc/stat", "missing cpu line"))?;
        Ok((times, cores.max(1)))
    }

    /// Parse /proc/loadavg into the three averages and the total task count
    pub fn parse_loadavg(content: &str) -> Result<([f64; 3], u32), PlatformError> {
        let parts: Vec<&str> = content.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(PlatformError::parse("/proc/loadavg", "expected three averages"));
        }

        let mut load = [0.0; 3];
        for (i, slot) in load.iter_mut().enumerate() {
            *slot = parts[i]
                .parse()
                .map_err(|e| PlatformError::parse("/proc/loadavg", format!("{}", e)))?;
        }

        // Fourth field is "running/total"
        let processes = parts
            .get(3)
            .and_then(|field| field.split('/').nth(1))
            .and_then(|total| total.parse().ok())
            .unwrap_or(0);

        Ok((load, processes))
    }

    /// Parse /proc/meminfo into a map of kB values
    pub fn parse_meminfo(content: &str) -> HashMap<String, u64> {
        content
            .lines()
            .filter_map(|line| {
                let (key, rest) = line.split_once(':')?;
                let value = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
                Some((key.trim().to_string(), value))
            })
            .collect()
    }

    /// Build a memory sample from meminfo values (kB)
    pub fn memory_from_meminfo(info: &HashMap<String, u64>) -> Result<MemorySample, PlatformError> {
        let total_kb = *info
            .get("MemTotal")
            .ok_or_else(|| PlatformError::parse("/proc/meminfo", "missing MemTotal"))?;
        let buffers_kb = info.get("Buffers").copied().unwrap_or(0);
        let cached_kb = info.get("Cached").copied().unwrap_or(0);
        // Older kernels lack MemAvailable
        let available_kb = info.get("MemAvailable").copied().unwrap_or_else(|| {
            info.get("MemFree").copied().unwrap_or(0) + buffers_kb + cached_kb
        });

        let used_kb = total_kb.saturating_sub(available_kb);
        Ok(MemorySample {
            total_mb: total_kb / 1024,
            used_mb: used_kb / 1024,
            free_mb: available_kb / 1024,
            percent: percent_of(used_kb, total_kb),
            buffers: buffers_kb / 1024,
            cached: cached_kb / 1024,
        })
    }

    /// Parse the `Mem:` line of `free -m`
    pub fn parse_free(content: &str) -> Result<MemorySample, PlatformError> {
        let line = content
            .lines()
            .find(|l| l.starts_with("Mem:"))
            .ok_or_else(|| PlatformError::parse("free -m", "missing Mem: line"))?;
        let values: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect();
        if values.len() < 3 {
            return Err(PlatformError::parse("free -m", "incomplete Mem: line"));
        }

        // total used free shared buff/cache available
        let total = values[0];
        let available = values.get(5).copied().unwrap_or(values[2]);
        let used = total.saturating_sub(available);
        Ok(MemorySample {
            total_mb: total,
            used_mb: used,
            free_mb: available,
            percent: percent_of(used, total),
            buffers: 0,
            cached: values.get(4).copied().unwrap_or(0),
        })
    }

    /// Parse /proc/net/dev, skipping loopback
    pub fn parse_net_dev(content: &str) -> Vec<NetworkSample> {
        content
            .lines()
            .skip(2)
            .filter_map(|line| {
                let (iface, stats) = line.split_once(':')?;
                let iface = iface.trim();
                if iface == "lo" {
                    return None;
                }
                let values: Vec<u64> = stats
                    .split_whitespace()
                    .filter_map(|v| v.parse().ok())
                    .collect();
                // rx: bytes packets errs drop fifo frame compressed multicast, then tx
                if values.len() < 9 {
                    return None;
                }
                Some(NetworkSample {
                    iface: iface.to_string(),
                    bytes_in: values[0],
                    bytes_out: values[8],
                })
            })
            .collect()
    }

    async fn cpu_from_proc(&self) -> Result<CpuSample, PlatformError> {
        let stat = self.read(&self.proc_root.join("stat")).await?;
        let (times, cores) = Self::parse_stat(&stat)?;
        let loadavg = self.read(&self.proc_root.join("loadavg")).await?;
        let (load_average, process_count) = Self::parse_loadavg(&loadavg)?;

        let usage_percent = {
            let mut last = self
                .last_cpu
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let usage = times.usage_since(last.as_ref());
            *last = Some(times);
            usage
        };

        Ok(CpuSample {
            cores,
            usage_percent,
            load_average,
            process_count,
        })
    }

    async fn cpu_from_load(&self) -> Result<CpuSample, PlatformError> {
        let loadavg = self.read(&self.proc_root.join("loadavg")).await?;
        let (load_average, process_count) = Self::parse_loadavg(&loadavg)?;
        let cores = match run_command("nproc", &[], self.command_timeout).await {
            Ok(out) => out.trim().parse().unwrap_or_else(|_| available_cores()),
            Err(_) => available_cores(),
        };

        Ok(CpuSample {
            cores,
            usage_percent: usage_from_load(load_average[0], cores),
            load_average,
            process_count,
        })
    }

    async fn memory_from_proc(&self) -> Result<MemorySample, PlatformError> {
        let content = self.read(&self.proc_root.join("meminfo")).await?;
        Self::memory_from_meminfo(&Self::parse_meminfo(&content))
    }

    async fn memory_from_free(&self) -> Result<MemorySample, PlatformError> {
        let out = run_command("free", &["-m"], self.command_timeout).await?;
        Self::parse_free(&out)
    }

    async fn disks_from_df(&self, args: &[&str]) -> Result<Vec<DiskSample>, PlatformError> {
        let out = run_command("df", args, self.command_timeout).await?;
        parse_df(&out)
    }

    async fn network_from_proc(&self) -> Result<Vec<NetworkSample>, PlatformError> {
        let content = self.read(&self.proc_root.join("net/dev")).await?;
        Ok(Self::parse_net_dev(&content))
    }

    async fn network_from_sys(&self) -> Result<Vec<NetworkSample>, PlatformError> {
        let net_root = self.sys_root.join("class/net");
        let mut entries = fs::read_dir(&net_root)
            .await
            .map_err(|source| PlatformError::Io {
                path: net_root.display().to_string(),
                source,
            })?;

        let mut samples = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let iface = entry.file_name().to_string_lossy().to_string();
            if iface == "lo" {
                continue;
            }
            let stats = entry.path().join("statistics");
            let rx = self.read(&stats.join("rx_bytes")).await;
            let tx = self.read(&stats.join("tx_bytes")).await;
            if let (Ok(rx), Ok(tx)) = (rx, tx) {
                samples.push(NetworkSample {
                    iface,
                    bytes_in: rx.trim().parse().unwrap_or(0),
                    bytes_out: tx.trim().parse().unwrap_or(0),
                });
            }
        }
        samples.sort_by(|a, b| a.iface.cmp(&b.iface));
        Ok(samples)
    }
}

#[async_trait]
impl PlatformAdapter for LinuxAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Linux
    }

    fn is_supported(&self) -> bool {
        self.proc_root.join("stat").exists()
    }

    fn preferred_polling_interval(&self) -> Duration {
        // procfs reads are cheap
        Duration::from_secs(5)
    }

    async fn sample(&self, dimension: Dimension) -> Result<RawReading, PlatformError> {
        match dimension {
            Dimension::Cpu => with_fallback("cpu", self.cpu_from_proc(), self.cpu_from_load())
                .await
                .map(RawReading::Cpu),
            Dimension::Memory => {
                with_fallback("memory", self.memory_from_proc(), self.memory_from_free())
                    .await
                    .map(RawReading::Memory)
            }
            Dimension::Disk => with_fallback(
                "disk",
                self.disks_from_df(&["-kP"]),
                self.disks_from_df(&["-k"]),
            )
            .await
            .map(RawReading::Disk),
            Dimension::Network => {
                with_fallback("network", self.network_from_proc(), self.network_from_sys())
                    .await
                    .map(RawReading::Network)
            }
        }
    }
}
