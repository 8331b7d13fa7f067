//! Scripted doubles shared by unit tests

use crate::error::PlatformError;
use crate::models::{
    CpuSample, Dimension, DiskSample, MemorySample, NetworkSample, ResourceSnapshot,
};
use crate::lifecycle::{AgentRuntime, LaunchSpec, ProbeResult};
use crate::platform::{PlatformAdapter, PlatformKind, RawReading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub fn cpu(percent: f64) -> CpuSample {
    CpuSample {
        cores: 8,
        usage_percent: percent,
        load_average: [percent / 100.0 * 8.0; 3],
        process_count: 200,
    }
}

pub fn memory(percent: f64) -> MemorySample {
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

pub fn disk(percent: f64) -> Vec<DiskSample> {
    let total_kb = 100_000_000;
    let used_kb = (total_kb as f64 * percent / 100.0) as u64;
    vec![DiskSample {
        total_kb,
        used_kb,
        free_kb: total_kb - used_kb,
        percent,
        filesystem: "/dev/sda1".to_string(),
        mount_point: "/".to_string(),
    }]
}

pub fn network(bytes_in: u64, bytes_out: u64) -> Vec<NetworkSample> {
    vec![NetworkSample {
        iface: "eth0".to_string(),
        bytes_in,
        bytes_out,
    }]
}

/// Snapshot with the given percents; network percent is taken verbatim
pub fn snapshot_at(
    timestamp: DateTime<Utc>,
    cpu_pct: f64,
    mem_pct: f64,
    disk_pct: f64,
    net_pct: f64,
) -> ResourceSnapshot {
    ResourceSnapshot {
        timestamp,
        cpu: cpu(cpu_pct),
        memory: memory(mem_pct),
        disk: disk(disk_pct),
        network: network(0, 0),
        network_percent: net_pct,
        stale: vec![],
    }
}

pub fn snapshot(cpu_pct: f64, mem_pct: f64, disk_pct: f64, net_pct: f64) -> ResourceSnapshot {
    snapshot_at(Utc::now(), cpu_pct, mem_pct, disk_pct, net_pct)
}

/// Adapter that replays queued readings, then repeats a default per dimension
pub struct ScriptedAdapter {
    queued: Mutex<HashMap<Dimension, VecDeque<Result<RawReading, PlatformError>>>>,
    defaults: Mutex<HashMap<Dimension, RawReading>>,
}

impl ScriptedAdapter {
    /// Quiet host: 25% CPU, 50% memory, 40% disk, idle network
    pub fn healthy() -> Self {
        let mut defaults = HashMap::new();
        defaults.insert(Dimension::Cpu, RawReading::Cpu(cpu(25.0)));
        defaults.insert(Dimension::Memory, RawReading::Memory(memory(50.0)));
        defaults.insert(Dimension::Disk, RawReading::Disk(disk(40.0)));
        defaults.insert(Dimension::Network, RawReading::Network(network(0, 0)));
        Self {
            queued: Mutex::new(HashMap::new()),
            defaults: Mutex::new(defaults),
        }
    }

    pub fn push(&self, dimension: Dimension, reading: Result<RawReading, PlatformError>) {
        self.queued
            .lock()
            .unwrap()
            .entry(dimension)
            .or_default()
            .push_back(reading);
    }

    pub fn fail(&self, dimension: Dimension) {
        self.push(
            dimension,
            Err(PlatformError::command_failed("scripted", "injected failure")),
        );
    }

    pub fn set_default(&self, reading: RawReading) {
        self.defaults
            .lock()
            .unwrap()
            .insert(reading.dimension(), reading);
    }

    pub fn remove_default(&self, dimension: Dimension) {
        self.defaults.lock().unwrap().remove(&dimension);
    }
}

#[async_trait]
impl PlatformAdapter for ScriptedAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Linux
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn preferred_polling_interval(&self) -> Duration {
        Duration::from_millis(10)
    }

    async fn sample(&self, dimension: Dimension) -> Result<RawReading, PlatformError> {
        if let Some(next) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&dimension)
            .and_then(|q| q.pop_front())
        {
            return next;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(&dimension)
            .cloned()
            .ok_or_else(|| PlatformError::command_failed("scripted", "no reading configured"))
    }
}

/// Runtime double. Launched agents probe with their scripted results first,
/// then with the default.
pub struct ScriptedRuntime {
    launched: Mutex<Vec<String>>,
    terminated: Mutex<Vec<String>>,
    scripts: Mutex<HashMap<String, VecDeque<ProbeResult>>>,
    default_probe: Mutex<ProbeResult>,
    failing_launches: Mutex<bool>,
}

impl ScriptedRuntime {
    pub fn healthy() -> Self {
        Self {
            launched: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
            scripts: Mutex::new(HashMap::new()),
            default_probe: Mutex::new(ProbeResult::healthy()),
            failing_launches: Mutex::new(false),
        }
    }

    pub fn script(&self, agent_id: &str, probes: Vec<ProbeResult>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_default()
            .extend(probes);
    }

    pub fn set_default(&self, probe: ProbeResult) {
        *self.default_probe.lock().unwrap() = probe;
    }

    pub fn fail_launches(&self, failing: bool) {
        *self.failing_launches.lock().unwrap() = failing;
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    fn is_live(&self, agent_id: &str) -> bool {
        self.launched.lock().unwrap().iter().any(|a| a == agent_id)
            && !self.terminated.lock().unwrap().iter().any(|a| a == agent_id)
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<()> {
        if *self.failing_launches.lock().unwrap() {
            anyhow::bail!("launch refused for {}", spec.agent_id);
        }
        self.launched.lock().unwrap().push(spec.agent_id.clone());
        self.terminated.lock().unwrap().retain(|a| a != &spec.agent_id);
        Ok(())
    }

    async fn terminate(&self, agent_id: &str) -> anyhow::Result<()> {
        self.terminated.lock().unwrap().push(agent_id.to_string());
        Ok(())
    }

    async fn probe(&self, agent_id: &str) -> anyhow::Result<ProbeResult> {
        if !self.is_live(agent_id) {
            anyhow::bail!("agent {} is not running", agent_id);
        }
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(agent_id)
            .and_then(VecDeque::pop_front);
        Ok(scripted.unwrap_or_else(|| self.default_probe.lock().unwrap().clone()))
    }
}
