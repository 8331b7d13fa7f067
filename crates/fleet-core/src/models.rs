//! Core data models shared by every component

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A resource dimension that is sampled, classified and allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Cpu,
        Dimension::Memory,
        Dimension::Disk,
        Dimension::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Cpu => "cpu",
            Dimension::Memory => "memory",
            Dimension::Disk => "disk",
            Dimension::Network => "network",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Dimension::Cpu),
            "memory" | "mem" => Ok(Dimension::Memory),
            "disk" => Ok(Dimension::Disk),
            "network" | "net" => Ok(Dimension::Network),
            other => Err(format!(
                "unknown dimension '{}', expected one of cpu, memory, disk, network",
                other
            )),
        }
    }
}

/// CPU section of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuSample {
    pub cores: u32,
    pub usage_percent: f64,
    pub load_average: [f64; 3],
    pub process_count: u32,
}

/// Memory section of a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    #[serde(rename = "totalMB")]
    pub total_mb: u64,
    #[serde(rename = "usedMB")]
    pub used_mb: u64,
    #[serde(rename = "freeMB")]
    pub free_mb: u64,
    pub percent: f64,
    pub buffers: u64,
    pub cached: u64,
}

/// One mounted filesystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSample {
    #[serde(rename = "totalKB")]
    pub total_kb: u64,
    #[serde(rename = "usedKB")]
    pub used_kb: u64,
    #[serde(rename = "freeKB")]
    pub free_kb: u64,
    pub percent: f64,
    pub filesystem: String,
    pub mount_point: String,
}

/// Cumulative byte counters for one interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSample {
    pub iface: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Normalized, immutable view of host capacity at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuSample,
    pub memory: MemorySample,
    pub disk: Vec<DiskSample>,
    pub network: Vec<NetworkSample>,
    /// Link utilization derived from counter deltas between samples
    pub network_percent: f64,
    /// Dimensions whose values were carried over from the last good sample
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stale: Vec<Dimension>,
}

impl ResourceSnapshot {
    /// Utilization percent of one dimension. Disk reports the fullest mount.
    pub fn percent(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Cpu => self.cpu.usage_percent,
            Dimension::Memory => self.memory.percent,
            Dimension::Disk => self
                .disk
                .iter()
                .map(|d| d.percent)
                .fold(0.0, f64::max),
            Dimension::Network => self.network_percent,
        }
    }

    pub fn is_stale(&self, dimension: Dimension) -> bool {
        self.stale.contains(&dimension)
    }

    pub fn total_bytes_in(&self) -> u64 {
        self.network.iter().map(|n| n.bytes_in).sum()
    }

    pub fn total_bytes_out(&self) -> u64 {
        self.network.iter().map(|n| n.bytes_out).sum()
    }
}

/// Integer capacity vector used by the allocator.
///
/// CPU is expressed in percent of one core (800 = eight cores), memory and
/// disk in MB and bandwidth in Mbps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVector {
    #[serde(default)]
    pub cpu: u64,
    #[serde(default, rename = "memoryMB")]
    pub memory_mb: u64,
    #[serde(default, rename = "diskMB")]
    pub disk_mb: u64,
    #[serde(default)]
    pub bandwidth_mbps: u64,
}

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector {
        cpu: 0,
        memory_mb: 0,
        disk_mb: 0,
        bandwidth_mbps: 0,
    };

    pub fn new(cpu: u64, memory_mb: u64) -> Self {
        Self {
            cpu,
            memory_mb,
            ..Self::ZERO
        }
    }

    pub fn with_disk(mut self, disk_mb: u64) -> Self {
        self.disk_mb = disk_mb;
        self
    }

    pub fn with_bandwidth(mut self, bandwidth_mbps: u64) -> Self {
        self.bandwidth_mbps = bandwidth_mbps;
        self
    }

    pub fn get(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Cpu => self.cpu,
            Dimension::Memory => self.memory_mb,
            Dimension::Disk => self.disk_mb,
            Dimension::Network => self.bandwidth_mbps,
        }
    }

    pub fn set(&mut self, dimension: Dimension, value: u64) {
        match dimension {
            Dimension::Cpu => self.cpu = value,
            Dimension::Memory => self.memory_mb = value,
            Dimension::Disk => self.disk_mb = value,
            Dimension::Network => self.bandwidth_mbps = value,
        }
    }

    pub fn is_zero(&self) -> bool {
        Dimension::ALL.iter().all(|d| self.get(*d) == 0)
    }

    pub fn saturating_add(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = *self;
        for d in Dimension::ALL {
            out.set(d, self.get(d).saturating_add(other.get(d)));
        }
        out
    }

    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = *self;
        for d in Dimension::ALL {
            out.set(d, self.get(d).saturating_sub(other.get(d)));
        }
        out
    }

    /// True when every dimension of `self` fits inside `other`
    pub fn fits_within(&self, other: &ResourceVector) -> bool {
        Dimension::ALL.iter().all(|d| self.get(*d) <= other.get(*d))
    }

    /// Scale every dimension by `factor`, rounding down
    pub fn scaled(&self, factor: f64) -> ResourceVector {
        let factor = factor.max(0.0);
        let mut out = *self;
        for d in Dimension::ALL {
            out.set(d, (self.get(d) as f64 * factor).floor() as u64);
        }
        out
    }

    /// Per-dimension deficit of `self` against `available`, listing only short dimensions
    pub fn shortage_against(&self, available: &ResourceVector) -> Shortage {
        let mut shortage = Shortage::default();
        for d in Dimension::ALL {
            let requested = self.get(d);
            let free = available.get(d);
            if requested > free {
                shortage.insert(d, requested - free);
            }
        }
        shortage
    }
}

/// Per-dimension amount by which a request exceeds what is available.
///
/// Only dimensions that are actually short appear, so a rejected request
/// reports the complete set of deficits and nothing else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shortage(BTreeMap<Dimension, u64>);

impl Shortage {
    pub fn insert(&mut self, dimension: Dimension, amount: u64) {
        let entry = self.0.entry(dimension).or_insert(0);
        *entry = (*entry).max(amount);
    }

    pub fn get(&self, dimension: Dimension) -> Option<u64> {
        self.0.get(&dimension).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn dimensions(&self) -> impl Iterator<Item = Dimension> + '_ {
        self.0.keys().copied()
    }

    /// Merge another shortage, keeping the larger deficit per dimension
    pub fn merge(&mut self, other: &Shortage) {
        for (d, amount) in &other.0 {
            self.insert(*d, *amount);
        }
    }

    /// Sum of deficits, used to rank how close a pool came to fitting
    pub fn magnitude(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn as_vector(&self) -> ResourceVector {
        let mut v = ResourceVector::ZERO;
        for (d, amount) in &self.0 {
            v.set(*d, *amount);
        }
        v
    }
}

impl fmt::Display for Shortage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(d, amount)| format!("{}: {}", d, amount))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Quality-of-service class derived from request vs. limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QosClass {
    /// No request: first to be throttled or evicted
    BestEffort,
    /// Request below limit
    Burstable,
    /// Request equals limit: preempted last
    Guaranteed,
}

impl QosClass {
    /// Classify a request against an optional limit. A missing limit means the
    /// request is the limit.
    pub fn classify(request: &ResourceVector, limit: Option<&ResourceVector>) -> QosClass {
        if request.is_zero() {
            return QosClass::BestEffort;
        }
        match limit {
            None => QosClass::Guaranteed,
            Some(limit) if limit == request => QosClass::Guaranteed,
            Some(_) => QosClass::Burstable,
        }
    }

    /// Lower rank is preempted first
    pub fn preemption_rank(&self) -> u8 {
        match self {
            QosClass::BestEffort => 0,
            QosClass::Burstable => 1,
            QosClass::Guaranteed => 2,
        }
    }
}

impl fmt::Display for QosClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QosClass::BestEffort => write!(f, "BestEffort"),
            QosClass::Burstable => write!(f, "Burstable"),
            QosClass::Guaranteed => write!(f, "Guaranteed"),
        }
    }
}

/// Direction label for a time series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}
