//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::error::PlatformError;
use fleet_core::lifecycle::{AgentRuntime, LaunchSpec, ProbeResult};
use fleet_core::platform::{PlatformAdapter, PlatformKind, RawReading};
use fleet_core::{
    CpuSample, Dimension, DiskSample, MemorySample, NetworkSample, ResourceSnapshot,
};
use std::sync::Mutex;
use std::time::Duration;

pub fn cpu_sample(percent: f64) -> CpuSample {
    CpuSample {
        cores: 8,
        usage_percent: percent,
        load_average: [percent / 100.0 * 8.0; 3],
        process_count: 150,
    }
}

pub fn memory_sample(percent: f64) -> MemorySample {
    let total_mb = 16_384;
    let used_mb = (total_mb as f64 * percent / 100.0) as u64;
    MemorySample {
        total_mb,
        used_mb,
        free_mb: total_mb - used_mb,
        percent,
        buffers: 0,
        cached: 0,
    }
}

pub fn disk_sample(percent: f64) -> Vec<DiskSample> {
    let total_kb = 200_000_000;
    let used_kb = (total_kb as f64 * percent / 100.0) as u64;
    vec![DiskSample {
        total_kb,
        used_kb,
        free_kb: total_kb - used_kb,
        percent,
        filesystem: "/dev/nvme0n1p1".to_string(),
        mount_point: "/".to_string(),
    }]
}

/// Snapshot with the given CPU and memory percent and a quiet disk/network
pub fn snapshot(timestamp: DateTime<Utc>, cpu: f64, memory: f64) -> ResourceSnapshot {
    ResourceSnapshot {
        timestamp,
        cpu: cpu_sample(cpu),
        memory: memory_sample(memory),
        disk: disk_sample(30.0),
        network: vec![],
        network_percent: 0.0,
        stale: vec![],
    }
}

/// Eight cores, 16 GB host whose CPU and memory readings can be changed
pub struct FakeHost {
    cpu: Mutex<f64>,
    memory: Mutex<f64>,
}

impl FakeHost {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self {
            cpu: Mutex::new(cpu),
            memory: Mutex::new(memory),
        }
    }

    pub fn set_cpu(&self, percent: f64) {
        *self.cpu.lock().unwrap() = percent;
    }

    pub fn set_memory(&self, percent: f64) {
        *self.memory.lock().unwrap() = percent;
    }
}

#[async_trait]
impl PlatformAdapter for FakeHost {
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
            Dimension::Cpu => RawReading::Cpu(cpu_sample(*self.cpu.lock().unwrap())),
            Dimension::Memory => RawReading::Memory(memory_sample(*self.memory.lock().unwrap())),
            Dimension::Disk => RawReading::Disk(disk_sample(30.0)),
            Dimension::Network => RawReading::Network(vec![NetworkSample {
                iface: "eth0".to_string(),
                bytes_in: 0,
                bytes_out: 0,
            }]),
        })
    }
}

/// Runtime whose probes all return the same, adjustable result
pub struct FakeRuntime {
    probe: Mutex<ProbeResult>,
    launched: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            probe: Mutex::new(ProbeResult::healthy()),
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn report_utilization(&self, cpu: f64, memory: f64) {
        *self.probe.lock().unwrap() = ProbeResult {
            healthy: true,
            cpu_percent: Some(cpu),
            memory_percent: Some(memory),
            message: None,
        };
    }

    pub fn launched(&self) -> usize {
        self.launched.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentRuntime for FakeRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<()> {
        self.launched.lock().unwrap().push(spec.agent_id.clone());
        Ok(())
    }

    async fn terminate(&self, _agent_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn probe(&self, _agent_id: &str) -> anyhow::Result<ProbeResult> {
        Ok(self.probe.lock().unwrap().clone())
    }
}
