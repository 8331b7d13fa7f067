//! Agent lifecycle manager
//!
//! Owns every agent record and drives agents through an [`AgentRuntime`].
//! Capacity always comes from the [`ResourceAllocator`]: an agent is placed
//! (allocated) before it is launched, and its allocation is released when it
//! stops. Records live in a `DashMap`; no map guard is held across `.await`.

use super::agent::{
    AgentInstance, AgentOverrides, AgentSpec, AgentStatus, HealthCheckPolicy, ReplicaCounts,
    UtilizationSample,
};
use super::channels::{ChannelHub, DeliveryReport, Message};
use super::recommendations::{recommend, AgentRecommendation, RecommendationInput};
use super::runtime::{AgentRuntime, LaunchSpec, ProbeResult};
use super::scaling::{ScaleDirection, ScaleRequest, ScaleResult};
use crate::allocator::{RepairSummary, ResourceAllocator};
use crate::buffer::RingBuffer;
use crate::config::LifecycleConfig;
use crate::error::{FleetError, FleetResult};
use crate::models::{QosClass, ResourceVector};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::optimizer::{ActionType, PlanAction};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Probe cadence while waiting for a freshly launched agent
const READY_POLL: Duration = Duration::from_millis(250);
/// Upper bound on the health sweep tick
const SWEEP_TICK: Duration = Duration::from_secs(1);
/// Samples averaged for recommendations
const RECOMMENDATION_WINDOW: usize = 12;
/// Owner prefix marking allocations held by managed agents
const OWNER_PREFIX: &str = "agent:";

fn owner_of(agent_id: &str) -> String {
    format!("{}{}", OWNER_PREFIX, agent_id)
}

struct AgentRecord {
    spec: AgentSpec,
    status: AgentStatus,
    created_at: DateTime<Utc>,
    allocation_id: Option<String>,
    /// Pool holding the current allocation
    pool: Option<String>,
    /// Pool the agent was asked to run in
    pool_hint: Option<String>,
    group_id: String,
    last_activity: DateTime<Utc>,
    policy: HealthCheckPolicy,
    failures: u32,
    successes: u32,
    last_checked: Option<Instant>,
    utilization: RingBuffer<UtilizationSample>,
}

impl AgentRecord {
    fn observe(&mut self, probe: &ProbeResult) {
        if probe.cpu_percent.is_none() && probe.memory_percent.is_none() {
            return;
        }
        let sample = UtilizationSample {
            timestamp: Utc::now(),
            cpu_percent: probe.cpu_percent.unwrap_or(0.0),
            memory_percent: probe.memory_percent.unwrap_or(0.0),
        };
        self.push_sample(sample);
    }

    fn push_sample(&mut self, sample: UtilizationSample) {
        if sample.cpu_percent >= 1.0 {
            self.last_activity = sample.timestamp;
        }
        self.utilization.push(sample);
    }
}

#[derive(Debug, Default)]
struct Group {
    desired: u32,
    members: Vec<String>,
}

/// What one health sweep did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSweep {
    pub checked: usize,
    pub degraded: Vec<String>,
    /// `(old, new)` pairs
    pub replaced: Vec<(String, String)>,
    /// Unhealthy agents whose replacement failed
    pub failed: Vec<String>,
}

impl HealthSweep {
    pub fn is_quiet(&self) -> bool {
        self.degraded.is_empty() && self.replaced.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreemptionResult {
    pub stopped: Vec<String>,
    pub freed: ResourceVector,
    /// Whether some pool can now fit the request
    pub satisfied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub target: String,
    pub success: bool,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<ScaleResult>,
}

pub struct AgentManager {
    specs: RwLock<BTreeMap<String, AgentSpec>>,
    agents: DashMap<String, AgentRecord>,
    groups: DashMap<String, Group>,
    in_flight: DashMap<String, Arc<AsyncMutex<()>>>,
    /// Owners allocated for but not yet recorded
    placing: DashSet<String>,
    allocator: Arc<ResourceAllocator>,
    runtime: Arc<dyn AgentRuntime>,
    channels: ChannelHub,
    config: RwLock<LifecycleConfig>,
    metrics: FleetMetrics,
    logger: StructuredLogger,
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("agents", &self.agents.len())
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl AgentManager {
    pub fn new(
        config: LifecycleConfig,
        allocator: Arc<ResourceAllocator>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Self {
        Self {
            specs: RwLock::new(BTreeMap::new()),
            agents: DashMap::new(),
            groups: DashMap::new(),
            in_flight: DashMap::new(),
            placing: DashSet::new(),
            allocator,
            runtime,
            channels: ChannelHub::new(config.mailbox_capacity),
            config: RwLock::new(config),
            metrics: FleetMetrics::new(),
            logger: StructuredLogger::new("fleet"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> LifecycleConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Swap in new settings. Existing agents keep their health policy.
    pub fn set_config(&self, config: LifecycleConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn register_spec(&self, spec: AgentSpec) -> FleetResult<()> {
        spec.validate()?;
        debug!(agent_type = %spec.agent_type, "Agent spec registered");
        self.specs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(spec.agent_type.clone(), spec);
        Ok(())
    }

    pub fn agent_types(&self) -> Vec<String> {
        self.specs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn spec_for(&self, agent_type: &str) -> FleetResult<AgentSpec> {
        let specs = self.specs.read().unwrap_or_else(|p| p.into_inner());
        specs
            .get(agent_type)
            .cloned()
            .ok_or_else(|| FleetError::UnknownAgentType {
                agent_type: agent_type.to_string(),
                known: specs.keys().cloned().collect(),
            })
    }

    pub fn list_agents(&self) -> Vec<AgentInstance> {
        let mut ids: Vec<(DateTime<Utc>, String)> = self
            .agents
            .iter()
            .map(|r| (r.created_at, r.key().clone()))
            .collect();
        ids.sort();
        ids.into_iter().filter_map(|(_, id)| self.view(&id)).collect()
    }

    pub fn get_agent(&self, id: &str) -> FleetResult<AgentInstance> {
        self.view(id)
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))
    }

    pub fn agent_spec(&self, id: &str) -> FleetResult<AgentSpec> {
        self.agents
            .get(id)
            .map(|r| r.spec.clone())
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))
    }

    /// Samples recorded for `id`, limited to `window` when given
    pub fn utilization_history(
        &self,
        id: &str,
        window: Option<Duration>,
    ) -> FleetResult<Vec<UtilizationSample>> {
        let record = self
            .agents
            .get(id)
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
        Ok(match window
            .and_then(|w| chrono::Duration::from_std(w).ok())
            .and_then(|w| Utc::now().checked_sub_signed(w))
        {
            Some(cutoff) => record.utilization.since(cutoff).cloned().collect(),
            None => record.utilization.to_vec(),
        })
    }

    pub fn group_members(&self, group_id: &str) -> Vec<String> {
        self.groups
            .get(group_id)
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }

    pub fn status_counts(&self) -> BTreeMap<AgentStatus, usize> {
        let mut counts: BTreeMap<AgentStatus, usize> =
            AgentStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for record in self.agents.iter() {
            *counts.entry(record.status).or_default() += 1;
        }
        counts
    }

    fn view(&self, id: &str) -> Option<AgentInstance> {
        let (mut instance, group_id) = {
            let r = self.agents.get(id)?;
            let instance = AgentInstance {
                id: id.to_string(),
                agent_type: r.spec.agent_type.clone(),
                status: r.status,
                created_at: r.created_at,
                allocation_id: r.allocation_id.clone(),
                group_id: r.group_id.clone(),
                replicas: ReplicaCounts::default(),
                qos_class: r.spec.qos_class(),
                resources: r.spec.requirements,
                pool: r.pool.clone(),
                last_activity: r.last_activity,
                utilization: r.utilization.latest().cloned(),
            };
            (instance, r.group_id.clone())
        };

        let (members, desired) = match self.groups.get(&group_id) {
            Some(g) => (g.members.clone(), g.desired),
            None => (vec![id.to_string()], 1),
        };
        let healthy = members
            .iter()
            .filter(|m| self.agents.get(*m).map_or(false, |r| r.status.is_healthy()))
            .count();
        instance.replicas = ReplicaCounts {
            current: members.len() as u32,
            desired,
            healthy: healthy as u32,
        };
        Some(instance)
    }

    fn refresh_gauges(&self) {
        for (status, count) in self.status_counts() {
            self.metrics.set_agents(status.as_str(), count as i64);
        }
    }

    /// Claim the operation slot for `key`
    pub(super) fn claim(&self, key: &str, agent_id: &str) -> FleetResult<OwnedMutexGuard<()>> {
        let slot = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        slot.try_lock_owned()
            .map_err(|_| FleetError::OperationInProgress(agent_id.to_string()))
    }

    fn group_of(&self, id: &str) -> FleetResult<String> {
        self.agents
            .get(id)
            .map(|r| r.group_id.clone())
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))
    }

    fn set_status(&self, id: &str, status: AgentStatus) {
        if let Some(mut r) = self.agents.get_mut(id) {
            r.status = status;
        }
        self.refresh_gauges();
    }

    /// Allocate capacity for a new agent of `agent_type`. The agent is left
    /// pending; the allocator's shortage is returned unchanged on failure.
    pub fn create_agent(
        &self,
        agent_type: &str,
        overrides: Option<&AgentOverrides>,
    ) -> FleetResult<AgentInstance> {
        let base = self.spec_for(agent_type)?;
        let (spec, pool) = match overrides {
            Some(o) => (o.apply(&base), o.pool.clone()),
            None => (base, None),
        };
        spec.validate()?;
        let id = self.place(spec, pool, None)?;
        self.get_agent(&id)
    }

    fn place(&self, spec: AgentSpec, pool: Option<String>, group: Option<&str>) -> FleetResult<String> {
        let simple = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", spec.agent_type, &simple[..8]);
        let owner = owner_of(&id);
        self.placing.insert(owner.clone());
        let allocation = self
            .allocator
            .allocate(&spec.allocation_request(&owner, pool.as_deref()));
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                self.placing.remove(&owner);
                return Err(e);
            }
        };

        let now = Utc::now();
        let config = self.config();
        let group_id = group.map(str::to_string).unwrap_or_else(|| id.clone());
        info!(
            agent_id = %id,
            agent_type = %spec.agent_type,
            pool = %allocation.pool,
            allocation_id = %allocation.id,
            "Agent placed"
        );
        self.agents.insert(
            id.clone(),
            AgentRecord {
                spec,
                status: AgentStatus::Pending,
                created_at: now,
                allocation_id: Some(allocation.id),
                pool: Some(allocation.pool),
                pool_hint: pool,
                group_id: group_id.clone(),
                last_activity: now,
                policy: config.health_check.clone(),
                failures: 0,
                successes: 0,
                last_checked: None,
                utilization: RingBuffer::new(config.utilization_history),
            },
        );
        self.placing.remove(&owner);
        {
            let mut g = self.groups.entry(group_id).or_default();
            g.members.push(id.clone());
            if group.is_none() {
                g.desired = 1;
            }
        }
        self.refresh_gauges();
        Ok(id)
    }

    pub async fn destroy_agent(&self, id: &str) -> FleetResult<()> {
        let _slot = self.claim(id, id)?;
        self.destroy_inner(id).await
    }

    async fn destroy_inner(&self, id: &str) -> FleetResult<()> {
        self.stop_inner(id).await?;
        let Some((_, record)) = self.agents.remove(id) else {
            return Err(FleetError::AgentNotFound(id.to_string()));
        };

        let empty = match self.groups.get_mut(&record.group_id) {
            Some(mut g) => {
                g.members.retain(|m| m != id);
                g.desired = g.desired.min(g.members.len() as u32);
                g.members.is_empty()
            }
            None => false,
        };
        if empty {
            self.groups.remove_if(&record.group_id, |_, g| g.members.is_empty());
        }
        self.channels.remove_subscriber(id);
        self.in_flight.remove(id);
        self.refresh_gauges();
        info!(agent_id = %id, "Agent destroyed");
        Ok(())
    }

    /// Register every spec and place one agent per spec. Either all agents
    /// are placed or none are.
    pub async fn deploy_agents(&self, specs: Vec<AgentSpec>) -> FleetResult<Vec<AgentInstance>> {
        for spec in &specs {
            spec.validate()?;
        }

        let mut placed = Vec::with_capacity(specs.len());
        for spec in specs {
            self.register_spec(spec.clone())?;
            match self.place(spec, None, None) {
                Ok(id) => placed.push(id),
                Err(e) => {
                    self.roll_back(&placed).await;
                    return Err(e);
                }
            }
        }
        Ok(placed.iter().filter_map(|id| self.view(id)).collect())
    }

    /// [`deploy_agents`](Self::deploy_agents), then start each agent and wait
    /// for it to become ready
    pub async fn deploy_and_start(&self, specs: Vec<AgentSpec>) -> FleetResult<Vec<AgentInstance>> {
        let deployed = self.deploy_agents(specs).await?;
        let ids: Vec<String> = deployed.into_iter().map(|a| a.id).collect();
        for id in &ids {
            if let Err(e) = self.start_inner(id).await {
                self.roll_back(&ids).await;
                return Err(e);
            }
        }
        Ok(ids.iter().filter_map(|id| self.view(id)).collect())
    }

    async fn roll_back(&self, ids: &[String]) {
        for id in ids {
            if let Err(e) = self.destroy_inner(id).await {
                warn!(agent_id = %id, error = %e, "Rollback could not destroy agent");
            }
        }
    }

    pub async fn start_agent(&self, id: &str) -> FleetResult<AgentInstance> {
        let _slot = self.claim(id, id)?;
        self.start_inner(id).await
    }

    async fn start_inner(&self, id: &str) -> FleetResult<AgentInstance> {
        let (spec, status, allocation, pool_hint) = {
            let r = self
                .agents
                .get(id)
                .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
            (r.spec.clone(), r.status, r.allocation_id.clone(), r.pool_hint.clone())
        };
        if status.is_running() {
            return self.get_agent(id);
        }

        if allocation.is_none() {
            let allocation = self
                .allocator
                .allocate(&spec.allocation_request(&owner_of(id), pool_hint.as_deref()))?;
            match self.agents.get_mut(id) {
                Some(mut r) => {
                    r.allocation_id = Some(allocation.id);
                    r.pool = Some(allocation.pool);
                    r.status = AgentStatus::Pending;
                }
                None => {
                    self.allocator.release(&allocation.id);
                    return Err(FleetError::AgentNotFound(id.to_string()));
                }
            }
        }

        let launch = LaunchSpec {
            agent_id: id.to_string(),
            agent_type: spec.agent_type.clone(),
            command: spec.command.clone(),
        };
        if let Err(e) = self.runtime.launch(&launch).await {
            self.set_status(id, AgentStatus::Unhealthy);
            return Err(FleetError::AgentUnhealthy {
                id: id.to_string(),
                reason: format!("launch failed: {:#}", e),
            });
        }

        self.wait_ready(id).await?;
        info!(agent_id = %id, agent_type = %spec.agent_type, "Agent ready");
        self.get_agent(id)
    }

    async fn probe(&self, id: &str, policy: &HealthCheckPolicy) -> Result<ProbeResult, String> {
        match tokio::time::timeout(policy.timeout(), self.runtime.probe(id)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => Err(format!("probe timed out after {}ms", policy.timeout_ms)),
        }
    }

    async fn wait_ready(&self, id: &str) -> FleetResult<()> {
        let policy = self
            .agents
            .get(id)
            .map(|r| r.policy.clone())
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
        let timeout = self.config().ready_timeout();
        let deadline = Instant::now() + timeout;
        let poll = policy.interval().min(READY_POLL);

        let mut successes = 0;
        let mut last_reason = "no probe completed".to_string();
        loop {
            match self.probe(id, &policy).await {
                Ok(result) if result.healthy => {
                    successes += 1;
                    let mut r = self
                        .agents
                        .get_mut(id)
                        .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
                    r.observe(&result);
                    if successes >= policy.success_threshold {
                        r.status = AgentStatus::Ready;
                        r.failures = 0;
                        r.successes = 0;
                        r.last_checked = Some(Instant::now());
                        drop(r);
                        self.refresh_gauges();
                        return Ok(());
                    }
                }
                Ok(result) => {
                    successes = 0;
                    last_reason = result
                        .message
                        .unwrap_or_else(|| "probe reported unhealthy".to_string());
                }
                Err(reason) => {
                    successes = 0;
                    last_reason = reason;
                }
            }
            if Instant::now() + poll > deadline {
                break;
            }
            tokio::time::sleep(poll).await;
        }

        self.set_status(id, AgentStatus::Unhealthy);
        Err(FleetError::AgentUnhealthy {
            id: id.to_string(),
            reason: format!("not ready within {}ms: {}", timeout.as_millis(), last_reason),
        })
    }

    pub async fn stop_agent(&self, id: &str) -> FleetResult<AgentInstance> {
        let _slot = self.claim(id, id)?;
        self.stop_inner(id).await?;
        self.get_agent(id)
    }

    /// Terminate the agent and release its allocation. The record stays.
    async fn stop_inner(&self, id: &str) -> FleetResult<()> {
        let (status, allocation) = {
            let r = self
                .agents
                .get(id)
                .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
            (r.status, r.allocation_id.clone())
        };
        if status == AgentStatus::Stopped && allocation.is_none() {
            return Ok(());
        }

        if status != AgentStatus::Pending {
            if let Err(e) = self.runtime.terminate(id).await {
                warn!(agent_id = %id, error = %format!("{:#}", e), "Runtime failed to terminate agent");
            }
        }
        if let Some(allocation) = &allocation {
            self.allocator.release(allocation);
        }
        if let Some(mut r) = self.agents.get_mut(id) {
            r.status = AgentStatus::Stopped;
            r.allocation_id = None;
            r.pool = None;
            r.failures = 0;
            r.successes = 0;
        }
        self.refresh_gauges();
        debug!(agent_id = %id, "Agent stopped");
        Ok(())
    }

    pub fn configure_health_check(&self, id: &str, policy: HealthCheckPolicy) -> FleetResult<()> {
        policy.validate()?;
        let mut r = self
            .agents
            .get_mut(id)
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
        r.policy = policy;
        Ok(())
    }

    /// Probe one agent and apply the outcome to its status
    pub async fn run_health_check(&self, id: &str) -> FleetResult<AgentStatus> {
        let (policy, status) = self
            .agents
            .get(id)
            .map(|r| (r.policy.clone(), r.status))
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
        if matches!(status, AgentStatus::Pending | AgentStatus::Stopped) {
            return Ok(status);
        }

        let outcome = self.probe(id, &policy).await;
        let next = {
            let mut r = self
                .agents
                .get_mut(id)
                .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
            r.last_checked = Some(Instant::now());
            match outcome {
                Ok(result) if result.healthy => {
                    r.observe(&result);
                    r.failures = 0;
                    r.successes += 1;
                    r.status = match r.status {
                        AgentStatus::Ready => AgentStatus::Active,
                        AgentStatus::Degraded | AgentStatus::Unhealthy
                            if r.successes >= policy.success_threshold =>
                        {
                            AgentStatus::Active
                        }
                        other => other,
                    };
                }
                failed => {
                    let reason = match failed {
                        Ok(result) => result.message.unwrap_or_default(),
                        Err(reason) => reason,
                    };
                    r.successes = 0;
                    r.failures += 1;
                    r.status = if r.failures >= policy.failure_threshold {
                        AgentStatus::Unhealthy
                    } else {
                        AgentStatus::Degraded
                    };
                    debug!(
                        agent_id = %id,
                        failures = r.failures,
                        reason = %reason,
                        "Health check failed"
                    );
                }
            }
            r.status
        };
        if next != status {
            info!(agent_id = %id, from = %status, to = %next, "Agent status changed");
            self.refresh_gauges();
        }
        Ok(next)
    }

    /// Replace `id` with a fresh agent in the same group. The caller sees
    /// `AgentUnhealthy` only when the replacement could not be started.
    pub async fn replace_unhealthy(&self, id: &str) -> FleetResult<AgentInstance> {
        let _slot = self.claim(id, id)?;
        self.replace_inner(id).await
    }

    async fn replace_inner(&self, id: &str) -> FleetResult<AgentInstance> {
        let (spec, group, pool_hint) = self
            .agents
            .get(id)
            .map(|r| (r.spec.clone(), r.group_id.clone(), r.pool_hint.clone()))
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;

        let new_id = match self.place(spec.clone(), pool_hint.clone(), Some(&group)) {
            Ok(new_id) => new_id,
            Err(FleetError::InsufficientResources { .. }) => {
                // Hand the old agent's capacity to its replacement
                self.stop_inner(id).await?;
                self.place(spec, pool_hint, Some(&group))
                    .map_err(|e| FleetError::AgentUnhealthy {
                        id: id.to_string(),
                        reason: e.to_string(),
                    })?
            }
            Err(e) => {
                return Err(FleetError::AgentUnhealthy {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        if let Err(e) = self.start_inner(&new_id).await {
            self.roll_back(std::slice::from_ref(&new_id)).await;
            return Err(FleetError::AgentUnhealthy {
                id: id.to_string(),
                reason: e.to_string(),
            });
        }
        self.destroy_inner(id).await?;
        self.logger.log_agent_replaced(id, &new_id);
        self.get_agent(&new_id)
    }

    /// Probe every agent whose check interval has elapsed and replace the
    /// ones that turned unhealthy. Agents busy with another operation are
    /// skipped until the next sweep.
    pub async fn check_health(&self) -> HealthSweep {
        let now = Instant::now();
        let due: Vec<String> = self
            .agents
            .iter()
            .filter(|r| !matches!(r.status, AgentStatus::Pending | AgentStatus::Stopped))
            .filter(|r| {
                r.last_checked
                    .map_or(true, |at| now.duration_since(at) >= r.policy.interval())
            })
            .map(|r| r.key().clone())
            .collect();

        let mut sweep = HealthSweep::default();
        for id in due {
            let Ok(_slot) = self.claim(&id, &id) else {
                continue;
            };
            sweep.checked += 1;
            match self.run_health_check(&id).await {
                Ok(AgentStatus::Degraded) => sweep.degraded.push(id),
                Ok(AgentStatus::Unhealthy) => match self.replace_inner(&id).await {
                    Ok(new) => sweep.replaced.push((id, new.id)),
                    Err(e) => {
                        warn!(agent_id = %id, error = %e, "Unhealthy agent could not be replaced");
                        sweep.failed.push(id);
                    }
                },
                Ok(_) => {}
                Err(e) => debug!(agent_id = %id, error = %e, "Health check skipped"),
            }
        }
        sweep
    }

    /// Run [`check_health`](Self::check_health) in the background until
    /// `shutdown` fires
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let tick = manager.config().health_check.interval().min(SWEEP_TICK);
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("Health monitor stopping");
                        break;
                    }
                    _ = tokio::time::sleep(tick) => {
                        let sweep = manager.check_health().await;
                        if !sweep.is_quiet() {
                            info!(
                                checked = sweep.checked,
                                degraded = sweep.degraded.len(),
                                replaced = sweep.replaced.len(),
                                failed = sweep.failed.len(),
                                "Health sweep finished"
                            );
                        }
                    }
                }
            }
        })
    }

    pub fn record_utilization(&self, id: &str, sample: UtilizationSample) -> FleetResult<()> {
        let mut r = self
            .agents
            .get_mut(id)
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
        r.push_sample(sample);
        Ok(())
    }

    pub fn get_agent_recommendations(&self, id: &str) -> FleetResult<Vec<AgentRecommendation>> {
        let config = self.config();
        let r = self
            .agents
            .get(id)
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
        let samples: Vec<UtilizationSample> =
            r.utilization.last_n(RECOMMENDATION_WINDOW).cloned().collect();
        Ok(recommend(&RecommendationInput {
            status: r.status,
            requirements: r.spec.requirements,
            samples: &samples,
            cpu_target: config.cpu_target_percent,
            memory_target: config.memory_target_percent,
        }))
    }

    /// Scale the replica group `id` belongs to. A failed scale-up removes the
    /// replicas it created, so the count is unchanged on failure.
    pub async fn scale_agent(&self, id: &str, request: ScaleRequest) -> FleetResult<ScaleResult> {
        let started = Instant::now();
        let group_id = self.group_of(id)?;
        let _slot = self.claim(&format!("group:{}", group_id), id)?;

        let members = self.group_members(&group_id);
        let from = members.len() as u32;
        let target = request.target(from)?;
        let mut result = ScaleResult {
            success: true,
            from_replicas: from,
            to_replicas: from,
            requested_replicas: target,
            reason: None,
            shortage: None,
            duration_ms: 0,
            added: Vec::new(),
            removed: Vec::new(),
        };

        if target > from {
            let (spec, pool_hint) = self
                .agents
                .get(id)
                .map(|r| (r.spec.clone(), r.pool_hint.clone()))
                .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
            for _ in from..target {
                match self.add_replica(&spec, pool_hint.clone(), &group_id).await {
                    Ok(new_id) => result.added.push(new_id),
                    Err(e) => {
                        let added = std::mem::take(&mut result.added);
                        self.roll_back(&added).await;
                        result.success = false;
                        result.shortage = e.shortage().cloned();
                        result.reason = Some(e.to_string());
                        break;
                    }
                }
            }
            if result.success {
                result.to_replicas = target;
            }
        } else if target < from {
            let needed = (from - target) as usize;
            let mut failures = Vec::new();
            // Replicas with another operation in flight are passed over
            for victim in self.pick_victims(&members, members.len()) {
                if result.removed.len() == needed {
                    break;
                }
                let Ok(_victim_slot) = self.claim(&victim, &victim) else {
                    failures.push(format!("{}: operation in progress", victim));
                    continue;
                };
                match self.destroy_inner(&victim).await {
                    Ok(()) => result.removed.push(victim),
                    Err(e) => failures.push(format!("{}: {}", victim, e)),
                }
            }
            result.to_replicas = from - result.removed.len() as u32;
            if result.removed.len() < needed {
                result.success = false;
                result.reason = Some(format!(
                    "removed {} of {} replicas ({})",
                    result.removed.len(),
                    needed,
                    failures.join("; ")
                ));
            }
        }

        if result.success || target < from {
            if let Some(mut g) = self.groups.get_mut(&group_id) {
                g.desired = result.to_replicas;
            }
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.inc_scale_operations(result.success);
        self.logger.log_agent_scaled(
            id,
            result.from_replicas,
            result.to_replicas,
            result.success,
            result.duration_ms,
        );
        Ok(result)
    }

    async fn add_replica(
        &self,
        spec: &AgentSpec,
        pool: Option<String>,
        group_id: &str,
    ) -> FleetResult<String> {
        let config = self.config();
        let mut backoff = config.scale_backoff();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.place(spec.clone(), pool.clone(), Some(group_id)) {
                Ok(new_id) => {
                    return match self.start_inner(&new_id).await {
                        Ok(_) => Ok(new_id),
                        Err(e) => {
                            self.roll_back(std::slice::from_ref(&new_id)).await;
                            Err(e)
                        }
                    };
                }
                Err(e @ FleetError::InsufficientResources { .. })
                    if attempt <= config.scale_max_retries =>
                {
                    debug!(
                        group = %group_id,
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Replica placement short, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Least healthy first, then least recently active
    fn pick_victims(&self, members: &[String], count: usize) -> Vec<String> {
        let mut ranked: Vec<(u8, DateTime<Utc>, String)> = members
            .iter()
            .filter_map(|m| {
                self.agents
                    .get(m)
                    .map(|r| (r.status.removal_rank(), r.last_activity, m.clone()))
            })
            .collect();
        ranked.sort();
        ranked.into_iter().take(count).map(|(_, _, id)| id).collect()
    }

    /// Stop agents in QoS order (BestEffort, Burstable, then Guaranteed)
    /// until some pool can fit `needed`
    pub async fn preempt(&self, needed: &ResourceVector) -> PreemptionResult {
        let mut result = PreemptionResult {
            stopped: Vec::new(),
            freed: ResourceVector::ZERO,
            satisfied: self.fits(needed),
        };
        if result.satisfied {
            return result;
        }

        let mut candidates: Vec<(u8, DateTime<Utc>, String)> = self
            .agents
            .iter()
            .filter(|r| r.allocation_id.is_some())
            .map(|r| {
                (
                    r.spec.qos_class().preemption_rank(),
                    r.last_activity,
                    r.key().clone(),
                )
            })
            .collect();
        candidates.sort();

        for (_, _, id) in candidates {
            let Ok(_slot) = self.claim(&id, &id) else {
                continue;
            };
            // Throttling may have shrunk the allocation below the requirements
            let resources = self
                .agents
                .get(&id)
                .and_then(|r| r.allocation_id.clone())
                .and_then(|alloc| self.allocator.get(&alloc))
                .map(|a| a.resources)
                .unwrap_or(ResourceVector::ZERO);
            if self.stop_inner(&id).await.is_err() {
                continue;
            }
            info!(agent_id = %id, "Agent preempted");
            result.freed = result.freed.saturating_add(&resources);
            result.stopped.push(id);
            if self.fits(needed) {
                result.satisfied = true;
                break;
            }
        }
        result
    }

    fn fits(&self, needed: &ResourceVector) -> bool {
        self.allocator
            .available_resources()
            .iter()
            .any(|p| needed.fits_within(&p.free))
    }

    pub fn qos_of(&self, id: &str) -> FleetResult<QosClass> {
        self.agents
            .get(id)
            .map(|r| r.spec.qos_class())
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))
    }

    /// Move `id` to `pool`: start a replacement there, then destroy the
    /// original. The original keeps running if the replacement fails.
    pub async fn migrate_agent(&self, id: &str, pool: &str) -> FleetResult<AgentInstance> {
        let _slot = self.claim(id, id)?;
        let (spec, group) = self
            .agents
            .get(id)
            .map(|r| (r.spec.clone(), r.group_id.clone()))
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;

        let new_id = self.place(spec, Some(pool.to_string()), Some(&group))?;
        if let Err(e) = self.start_inner(&new_id).await {
            self.roll_back(std::slice::from_ref(&new_id)).await;
            return Err(e);
        }
        self.destroy_inner(id).await?;
        info!(old_id = %id, new_id = %new_id, pool = %pool, "Agent migrated");
        self.get_agent(&new_id)
    }

    /// Apply one optimizer action
    pub async fn execute_action(&self, action: &PlanAction) -> FleetResult<ActionOutcome> {
        let target = action.target.clone();
        let outcome = match action.action_type {
            ActionType::Scale => {
                let request = ScaleRequest {
                    direction: action.params.direction.unwrap_or(ScaleDirection::Up),
                    replicas: Some(action.params.replicas.unwrap_or(1)),
                };
                let scaled = self.scale_agent(&target, request).await?;
                ActionOutcome {
                    action_type: action.action_type,
                    target,
                    success: scaled.success,
                    detail: format!(
                        "replicas {} -> {}",
                        scaled.from_replicas, scaled.to_replicas
                    ),
                    scale: Some(scaled),
                }
            }
            ActionType::Consolidate => {
                let group = self.group_of(&target)?;
                if self.group_members(&group).len() > 1 {
                    let scaled = self.scale_agent(&target, ScaleRequest::down(1)).await?;
                    ActionOutcome {
                        action_type: action.action_type,
                        target,
                        success: scaled.success,
                        detail: format!("removed {}", scaled.removed.join(", ")),
                        scale: Some(scaled),
                    }
                } else {
                    self.stop_agent(&target).await?;
                    ActionOutcome {
                        action_type: action.action_type,
                        target,
                        success: true,
                        detail: "stopped idle agent and released its allocation".to_string(),
                        scale: None,
                    }
                }
            }
            ActionType::Migrate => {
                let pool = action.params.pool.as_deref().ok_or_else(|| {
                    FleetError::invalid_request("migrate action requires a destination pool")
                })?;
                let moved = self.migrate_agent(&target, pool).await?;
                ActionOutcome {
                    action_type: action.action_type,
                    target,
                    success: true,
                    detail: format!("replaced by {} in pool {}", moved.id, pool),
                    scale: None,
                }
            }
        };
        Ok(outcome)
    }

    /// Reconcile agent records with the allocator: release agent-owned
    /// allocations no record claims, repair pool drift, and stop running
    /// agents whose allocation vanished and cannot be re-acquired
    pub async fn reconcile(&self) -> RepairSummary {
        let live: HashSet<String> = self
            .agents
            .iter()
            .filter(|r| r.allocation_id.is_some())
            .map(|r| owner_of(r.key()))
            .collect();
        let claimed: HashSet<String> = self
            .agents
            .iter()
            .filter_map(|r| r.allocation_id.clone())
            .collect();
        let orphans = self.allocator.reap_orphans(|a| {
            a.owner.starts_with(OWNER_PREFIX)
                && !self.placing.contains(&a.owner)
                && (!live.contains(&a.owner) || !claimed.contains(&a.id))
        });

        let mut summary = self.allocator.repair_state();
        summary.orphans_released += orphans.len();

        let lost: Vec<String> = self
            .agents
            .iter()
            .filter(|r| {
                r.allocation_id
                    .as_ref()
                    .map_or(false, |a| self.allocator.get(a).is_none())
            })
            .map(|r| r.key().clone())
            .collect();
        for id in lost {
            let Some((spec, pool_hint)) = self
                .agents
                .get(&id)
                .map(|r| (r.spec.clone(), r.pool_hint.clone()))
            else {
                continue;
            };
            match self
                .allocator
                .allocate(&spec.allocation_request(&owner_of(&id), pool_hint.as_deref()))
            {
                Ok(allocation) => {
                    if let Some(mut r) = self.agents.get_mut(&id) {
                        r.allocation_id = Some(allocation.id);
                        r.pool = Some(allocation.pool);
                    }
                    warn!(agent_id = %id, "Re-acquired lost allocation");
                }
                Err(e) => {
                    warn!(agent_id = %id, error = %e, "Lost allocation, stopping agent");
                    if let Some(mut r) = self.agents.get_mut(&id) {
                        r.allocation_id = None;
                    }
                    if let Err(e) = self.stop_inner(&id).await {
                        warn!(agent_id = %id, error = %e, "Could not stop agent");
                    }
                }
            }
        }
        summary
    }

    pub fn channels(&self) -> &ChannelHub {
        &self.channels
    }

    pub fn create_channel(&self, name: &str) -> FleetResult<()> {
        self.channels.create_channel(name)
    }

    pub fn send_message(
        &self,
        channel: &str,
        from: &str,
        to: &str,
        payload: serde_json::Value,
    ) -> FleetResult<DeliveryReport> {
        self.touch(from)?;
        self.channels.send_message(channel, to, Some(from), payload)
    }

    pub fn broadcast(
        &self,
        channel: &str,
        from: Option<&str>,
        payload: serde_json::Value,
    ) -> FleetResult<DeliveryReport> {
        if let Some(from) = from {
            self.touch(from)?;
        }
        self.channels.broadcast(channel, from, payload)
    }

    /// Subscribe a managed agent to `channel`
    pub fn on_message(&self, channel: &str, agent_id: &str) -> FleetResult<mpsc::Receiver<Message>> {
        if !self.agents.contains_key(agent_id) {
            return Err(FleetError::AgentNotFound(agent_id.to_string()));
        }
        self.channels.subscribe(channel, agent_id)
    }

    fn touch(&self, id: &str) -> FleetResult<()> {
        let mut r = self
            .agents
            .get_mut(id)
            .ok_or_else(|| FleetError::AgentNotFound(id.to_string()))?;
        r.last_activity = Utc::now();
        Ok(())
    }
}
