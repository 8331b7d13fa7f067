//! Agent specs, instances and health policy

use crate::allocator::AllocationRequest;
use crate::buffer::Timestamped;
use crate::error::{FleetError, FleetResult};
use crate::models::{QosClass, ResourceVector};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Template an agent type is created from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    #[serde(rename = "type")]
    pub agent_type: String,
    pub requirements: ResourceVector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceVector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<QosClass>,
    /// Pool labels the agent needs
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub specializations: Vec<String>,
    /// Program and arguments; agents without one are managed externally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl AgentSpec {
    pub fn new(agent_type: impl Into<String>, requirements: ResourceVector) -> Self {
        Self {
            agent_type: agent_type.into(),
            requirements,
            limits: None,
            qos: None,
            capabilities: Vec::new(),
            specializations: Vec::new(),
            command: None,
            scope: None,
        }
    }

    pub fn with_limits(mut self, limits: ResourceVector) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_qos(mut self, qos: QosClass) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn qos_class(&self) -> QosClass {
        self.qos
            .unwrap_or_else(|| QosClass::classify(&self.requirements, self.limits.as_ref()))
    }

    /// Request the allocator sees for one instance of this spec
    pub fn allocation_request(&self, owner: &str, pool: Option<&str>) -> AllocationRequest {
        AllocationRequest {
            owner: owner.to_string(),
            resources: self.requirements,
            limits: self.limits,
            qos: self.qos,
            scope: self.scope.clone(),
            pool: pool.map(str::to_string),
            capabilities: self.capabilities.clone(),
        }
    }

    pub(crate) fn validate(&self) -> FleetResult<()> {
        if self.agent_type.trim().is_empty() {
            return Err(FleetError::invalid_request("agent type must not be empty"));
        }
        if matches!(&self.command, Some(c) if c.is_empty()) {
            return Err(FleetError::invalid_request(format!(
                "agent type '{}' has an empty command",
                self.agent_type
            )));
        }
        Ok(())
    }
}

/// Per-instance changes applied on top of a spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentOverrides {
    pub requirements: Option<ResourceVector>,
    pub limits: Option<ResourceVector>,
    pub qos: Option<QosClass>,
    pub capabilities: Option<Vec<String>>,
    pub command: Option<Vec<String>>,
    pub scope: Option<String>,
    /// Place the allocation in this pool
    pub pool: Option<String>,
}

impl AgentOverrides {
    pub fn apply(&self, spec: &AgentSpec) -> AgentSpec {
        let mut out = spec.clone();
        if let Some(r) = self.requirements {
            out.requirements = r;
        }
        if let Some(l) = self.limits {
            out.limits = Some(l);
        }
        if let Some(q) = self.qos {
            out.qos = Some(q);
        }
        if let Some(c) = &self.capabilities {
            out.capabilities = c.clone();
        }
        if let Some(c) = &self.command {
            out.command = Some(c.clone());
        }
        if let Some(s) = &self.scope {
            out.scope = Some(s.clone());
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Ready,
    Active,
    Degraded,
    Unhealthy,
    Stopped,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 6] = [
        AgentStatus::Pending,
        AgentStatus::Ready,
        AgentStatus::Active,
        AgentStatus::Degraded,
        AgentStatus::Unhealthy,
        AgentStatus::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Ready => "ready",
            AgentStatus::Active => "active",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Unhealthy => "unhealthy",
            AgentStatus::Stopped => "stopped",
        }
    }

    /// Launched and probed at least once
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            AgentStatus::Ready | AgentStatus::Active | AgentStatus::Degraded
        )
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, AgentStatus::Ready | AgentStatus::Active)
    }

    /// Lower is removed first on scale-down
    pub(crate) fn removal_rank(&self) -> u8 {
        match self {
            AgentStatus::Stopped => 0,
            AgentStatus::Unhealthy => 1,
            AgentStatus::Pending => 2,
            AgentStatus::Degraded => 3,
            AgentStatus::Ready => 4,
            AgentStatus::Active => 5,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an agent is probed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckPolicy {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive failed probes before an agent is unhealthy
    pub failure_threshold: u32,
    /// Consecutive good probes before a degraded agent recovers
    pub success_threshold: u32,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            timeout_ms: 2_000,
            failure_threshold: 3,
            success_threshold: 1,
        }
    }
}

impl HealthCheckPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> FleetResult<()> {
        if self.interval_ms == 0 {
            return Err(FleetError::config(
                "lifecycle.health_check.interval_ms",
                "must be positive",
            ));
        }
        if self.timeout_ms == 0 || self.timeout_ms > self.interval_ms {
            return Err(FleetError::config(
                "lifecycle.health_check.timeout_ms",
                "must be positive and no longer than the interval",
            ));
        }
        if self.failure_threshold == 0 {
            return Err(FleetError::config(
                "lifecycle.health_check.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(FleetError::config(
                "lifecycle.health_check.success_threshold",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Utilization reported by or probed from an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtilizationSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl Timestamped for UtilizationSample {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaCounts {
    pub current: u32,
    pub desired: u32,
    pub healthy: u32,
}

/// Serializable view of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInstance {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<String>,
    /// Instance the replica group was scaled from
    pub group_id: String,
    pub replicas: ReplicaCounts,
    pub qos_class: QosClass,
    pub resources: ResourceVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    pub last_activity: DateTime<Utc>,
    /// Most recent utilization sample
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization: Option<UtilizationSample>,
}
