//! Resource allocation
//!
//! The allocator owns every pool ledger. Requests are all-or-nothing: a
//! request either fits completely in one pool (after quota and policy
//! checks) or is rejected with the full per-dimension shortage. Each pool is
//! guarded by its own fair mutex: callers waiting on one pool are served in
//! arrival order and never wait on another pool. No lock is held across I/O.
//!
//! Lock order is schedules, then pool ledgers in pool order, then scope usage.

mod pool;
mod quota;
mod report;
mod reservation;


pub use pool::{PoolSummary, UtilizationPoint};
pub use quota::{PolicyRule, Quota};
pub use report::{AllocationReport, PoolReport, PoolTotals, QuotaUsage};
pub use reservation::{RecurrenceSpec, RecurringSchedule};

use crate::buffer::RingBuffer;
use crate::config::{AllocatorConfig, PoolSpec};
use crate::error::{FleetError, FleetResult};
use crate::models::{QosClass, ResourceVector, Shortage};
use crate::observability::{FleetMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{FairMutex, FairMutexGuard};
use pool::PoolLedger;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Released and expired ids remembered so repeated releases stay no-ops
const TOMBSTONES: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationState {
    Reserved,
    Committed,
    Released,
}

/// Capacity held for one owner in one pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub id: String,
    pub owner: String,
    pub pool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub resources: ResourceVector,
    pub qos: QosClass,
    pub state: AllocationState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Recurring schedule that placed this reservation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

/// What a caller asks the allocator for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    pub owner: String,
    pub resources: ResourceVector,
    /// Burst ceiling; drives QoS classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceVector>,
    /// Explicit class, overriding classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<QosClass>,
    /// Quota scope charged for the allocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Restrict placement to one pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    /// Labels the chosen pool must carry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl AllocationRequest {
    pub fn new(owner: impl Into<String>, resources: ResourceVector) -> Self {
        Self {
            owner: owner.into(),
            resources,
            limits: None,
            qos: None,
            scope: None,
            pool: None,
            capabilities: Vec::new(),
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

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn qos_class(&self) -> QosClass {
        self.qos
            .unwrap_or_else(|| QosClass::classify(&self.resources, self.limits.as_ref()))
    }
}

/// Result of a release or cancel. Every variant is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released,
    AlreadyReleased,
    Expired,
    NotFound,
}

/// What [`ResourceAllocator::repair_state`] corrected
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairSummary {
    pub pools_repaired: Vec<String>,
    pub expired_released: usize,
    pub orphans_released: usize,
}

impl RepairSummary {
    pub fn is_empty(&self) -> bool {
        self.pools_repaired.is_empty() && self.expired_released == 0 && self.orphans_released == 0
    }
}

/// What [`ResourceAllocator::throttle`] reclaimed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleSummary {
    pub fraction: f64,
    pub affected: Vec<String>,
    pub reclaimed: ResourceVector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tombstone {
    Released,
    Expired,
}

struct Tombstones {
    order: RingBuffer<String>,
    state: HashMap<String, Tombstone>,
}

impl Tombstones {
    fn new() -> Self {
        Self {
            order: RingBuffer::new(TOMBSTONES),
            state: HashMap::new(),
        }
    }

    fn bury(&mut self, id: &str, how: Tombstone) {
        if self.state.insert(id.to_string(), how).is_none() {
            if let Some(evicted) = self.order.push(id.to_string()) {
                self.state.remove(&evicted);
            }
        }
    }

    fn get(&self, id: &str) -> Option<Tombstone> {
        self.state.get(id).copied()
    }
}

struct PoolHandle {
    id: String,
    labels: BTreeSet<String>,
    ledger: Arc<FairMutex<PoolLedger>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Multi-pool allocator
pub struct ResourceAllocator {
    pools: RwLock<Vec<PoolHandle>>,
    /// Allocation id to pool id
    index: DashMap<String, String>,
    scopes: Mutex<HashMap<String, ResourceVector>>,
    quotas: RwLock<BTreeMap<String, Quota>>,
    policies: RwLock<Vec<PolicyRule>>,
    schedules: Mutex<BTreeMap<String, RecurringSchedule>>,
    tombstones: Mutex<Tombstones>,
    default_ttl: Duration,
    history_size: usize,
    metrics: FleetMetrics,
    logger: StructuredLogger,
}

impl std::fmt::Debug for ResourceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAllocator")
            .field("pools", &self.pool_ids())
            .field("allocations", &self.index.len())
            .finish()
    }
}

impl ResourceAllocator {
    /// Create an allocator with the configured pools and quotas
    pub fn new(config: &AllocatorConfig) -> FleetResult<Self> {
        let allocator = Self {
            pools: RwLock::new(Vec::new()),
            index: DashMap::new(),
            scopes: Mutex::new(HashMap::new()),
            quotas: RwLock::new(BTreeMap::new()),
            policies: RwLock::new(Vec::new()),
            schedules: Mutex::new(BTreeMap::new()),
            tombstones: Mutex::new(Tombstones::new()),
            default_ttl: Duration::from_secs(config.default_reservation_ttl_secs.max(1)),
            history_size: config.utilization_history,
            metrics: FleetMetrics::new(),
            logger: StructuredLogger::new("fleet"),
        };

        for pool in &config.pools {
            allocator.ensure_pool(pool)?;
        }
        for quota in &config.quotas {
            allocator.set_quota(&quota.scope, quota.limits)?;
        }
        Ok(allocator)
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Create a pool, or resize and relabel an existing one. A pool cannot
    /// shrink below the capacity currently held in it.
    pub fn ensure_pool(&self, spec: &PoolSpec) -> FleetResult<()> {
        self.ensure_pools(std::slice::from_ref(spec))
    }

    /// Create or resize several pools as one change. Every resize is checked
    /// against the capacity in use before any pool is touched, so a pool
    /// that cannot shrink leaves all of them as they were.
    pub fn ensure_pools(&self, specs: &[PoolSpec]) -> FleetResult<()> {
        let mut seen = BTreeSet::new();
        for spec in specs {
            if spec.id.trim().is_empty() {
                return Err(FleetError::config("allocator.pools", "pool id must not be empty"));
            }
            if !seen.insert(spec.id.as_str()) {
                return Err(FleetError::config(
                    "allocator.pools",
                    format!("duplicate pool id '{}'", spec.id),
                ));
            }
        }

        let mut pools = self.pools.write().unwrap_or_else(|p| p.into_inner());
        // Ledgers are locked in pool order and held from the check to the resize
        let mut existing: Vec<(usize, &PoolSpec, Arc<FairMutex<PoolLedger>>)> = specs
            .iter()
            .filter_map(|spec| {
                pools
                    .iter()
                    .position(|h| h.id == spec.id)
                    .map(|i| (i, spec, pools[i].ledger.clone()))
            })
            .collect();
        existing.sort_by_key(|(i, _, _)| *i);

        {
            let mut guards: Vec<(&PoolSpec, FairMutexGuard<'_, PoolLedger>)> = existing
                .iter()
                .map(|(_, spec, ledger)| (*spec, ledger.lock()))
                .collect();

            for (spec, ledger) in &guards {
                let overflow = ledger.in_use().shortage_against(&spec.capacity);
                if !overflow.is_empty() {
                    return Err(FleetError::config(
                        "allocator.pools",
                        format!(
                            "pool '{}' cannot shrink below capacity in use, over by {}",
                            spec.id, overflow
                        ),
                    ));
                }
            }
            for (spec, ledger) in guards.iter_mut() {
                ledger.resize(spec.capacity).map_err(|overflow| {
                    FleetError::config(
                        "allocator.pools",
                        format!("pool '{}' over by {}", spec.id, overflow),
                    )
                })?;
                ledger.labels = spec.labels.iter().cloned().collect();
                info!(pool = %spec.id, total = ?spec.capacity, "Pool resized");
            }
        }

        for spec in specs {
            let labels: BTreeSet<String> = spec.labels.iter().cloned().collect();
            if let Some(handle) = pools.iter_mut().find(|h| h.id == spec.id) {
                handle.labels = labels;
                continue;
            }
            let ledger = PoolLedger::new(
                spec.id.clone(),
                spec.capacity,
                spec.labels.iter().cloned(),
                self.history_size,
            );
            pools.push(PoolHandle {
                id: spec.id.clone(),
                labels,
                ledger: Arc::new(FairMutex::new(ledger)),
            });
            info!(pool = %spec.id, total = ?spec.capacity, labels = ?spec.labels, "Pool created");
        }
        Ok(())
    }

    pub fn pool_ids(&self) -> Vec<String> {
        self.pools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|h| h.id.clone())
            .collect()
    }

    pub fn has_pools(&self) -> bool {
        !self
            .pools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty()
    }

    fn ledgers(&self) -> Vec<(String, Arc<FairMutex<PoolLedger>>)> {
        self.pools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|h| (h.id.clone(), h.ledger.clone()))
            .collect()
    }

    fn ledger(&self, pool: &str) -> Option<Arc<FairMutex<PoolLedger>>> {
        self.pools
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|h| h.id == pool)
            .map(|h| h.ledger.clone())
    }

    /// Pools a request may be placed in, in configuration order
    fn candidates(
        &self,
        request: &AllocationRequest,
    ) -> FleetResult<Vec<(String, Arc<FairMutex<PoolLedger>>)>> {
        let pools = self.pools.read().unwrap_or_else(|p| p.into_inner());
        if pools.is_empty() {
            return Err(FleetError::invalid_request("no pools are configured"));
        }

        if let Some(wanted) = &request.pool {
            if !pools.iter().any(|h| &h.id == wanted) {
                let ids: Vec<&str> = pools.iter().map(|h| h.id.as_str()).collect();
                return Err(FleetError::invalid_choice(
                    format!("unknown pool '{}'", wanted),
                    "pool must name a configured pool",
                    &ids,
                ));
            }
        }

        let matching: Vec<(String, Arc<FairMutex<PoolLedger>>)> = pools
            .iter()
            .filter(|h| request.pool.as_ref().map_or(true, |p| p == &h.id))
            .filter(|h| request.capabilities.iter().all(|c| h.labels.contains(c)))
            .map(|h| (h.id.clone(), h.ledger.clone()))
            .collect();

        if matching.is_empty() {
            let offered: BTreeSet<&str> = pools
                .iter()
                .flat_map(|h| h.labels.iter().map(|l| l.as_str()))
                .collect();
            let offered: Vec<&str> = offered.into_iter().collect();
            return Err(FleetError::invalid_choice(
                format!(
                    "no pool offers capabilities [{}]",
                    request.capabilities.join(", ")
                ),
                "capabilities must be labels carried by a pool",
                &offered,
            ));
        }
        Ok(matching)
    }

    fn insufficient(
        &self,
        request: &AllocationRequest,
        reason: String,
        shortage: Shortage,
    ) -> FleetError {
        self.metrics.inc_allocation_rejections();
        self.logger
            .log_allocation_rejected(&request.owner, &reason, &shortage);
        FleetError::InsufficientResources { reason, shortage }
    }

    fn scope_usage(&self, scope: &str) -> ResourceVector {
        lock(&self.scopes).get(scope).copied().unwrap_or_default()
    }

    fn credit_scope(&self, allocation: &Allocation, amount: &ResourceVector) {
        if let Some(scope) = &allocation.scope {
            let mut scopes = lock(&self.scopes);
            if let Some(used) = scopes.get_mut(scope) {
                *used = used.saturating_sub(amount);
            }
        }
    }

    fn update_gauge(&self) {
        self.metrics.set_active_allocations(self.index.len() as i64);
    }

    /// Run every check and debit one pool, or fail with the full shortage
    fn place(
        &self,
        request: &AllocationRequest,
        state: AllocationState,
        expires_at: Option<DateTime<Utc>>,
        schedule: Option<String>,
    ) -> FleetResult<Allocation> {
        if request.owner.trim().is_empty() {
            return Err(FleetError::invalid_request("owner must not be empty"));
        }

        let policies = self
            .policies
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        if let Some(rule) = policies
            .iter()
            .find(|r| r.denies(request.scope.as_deref()))
        {
            self.metrics.inc_allocation_rejections();
            return Err(FleetError::invalid_request(format!(
                "scope '{}' is denied by policy '{}'",
                request.scope.as_deref().unwrap_or_default(),
                rule.name()
            )));
        }

        let mut excess = Shortage::default();
        let mut violated = Vec::new();
        for rule in &policies {
            if let Some(over) = rule.per_request_excess(&request.resources) {
                excess.merge(&over);
                violated.push(rule.name().to_string());
            }
        }
        if !excess.is_empty() {
            return Err(self.insufficient(
                request,
                format!("request exceeds policy {}", violated.join(", ")),
                excess,
            ));
        }

        let quota = request.scope.as_ref().and_then(|s| {
            self.quotas
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .get(s)
                .cloned()
        });

        let candidates = self.candidates(request)?;
        let single = candidates.len() == 1;
        let mut closest: Option<(String, Shortage)> = None;

        for (pool_id, ledger) in candidates {
            let mut ledger = ledger.lock();
            let available = ledger
                .free
                .saturating_sub(&quota::headroom(&policies, &pool_id));
            let short = request.resources.shortage_against(&available);
            if !short.is_empty() {
                let closer = closest
                    .as_ref()
                    .map_or(true, |(_, best)| short.magnitude() < best.magnitude());
                if closer {
                    closest = Some((pool_id, short));
                }
                continue;
            }

            let mut scopes = lock(&self.scopes);
            if let (Some(quota), Some(scope)) = (&quota, &request.scope) {
                let used = scopes.get(scope).copied().unwrap_or_default();
                let over = quota.shortage(&used, &request.resources);
                if !over.is_empty() {
                    drop(scopes);
                    drop(ledger);
                    return Err(self.insufficient(
                        request,
                        format!("quota for scope '{}' exceeded", scope),
                        over,
                    ));
                }
            }

            let allocation = Allocation {
                id: format!("alloc-{}", Uuid::new_v4().simple()),
                owner: request.owner.clone(),
                pool: pool_id.clone(),
                scope: request.scope.clone(),
                resources: request.resources,
                qos: request.qos_class(),
                state,
                created_at: Utc::now(),
                expires_at,
                schedule: schedule.clone(),
            };
            if let Err(short) = ledger.hold(allocation.clone(), &available) {
                drop(scopes);
                drop(ledger);
                return Err(self.insufficient(
                    request,
                    format!("pool '{}' cannot satisfy request", pool_id),
                    short,
                ));
            }
            if let Some(scope) = &request.scope {
                let used = scopes.entry(scope.clone()).or_default();
                *used = used.saturating_add(&request.resources);
            }
            drop(scopes);
            drop(ledger);

            self.index.insert(allocation.id.clone(), pool_id);
            self.update_gauge();
            debug!(
                id = %allocation.id,
                owner = %allocation.owner,
                pool = %allocation.pool,
                state = ?allocation.state,
                qos = %allocation.qos,
                "Capacity placed"
            );
            return Ok(allocation);
        }

        let Some((pool_id, mut shortage)) = closest else {
            return Err(FleetError::Internal(anyhow::anyhow!(
                "no candidate pool was evaluated"
            )));
        };
        if let (Some(quota), Some(scope)) = (&quota, &request.scope) {
            shortage.merge(&quota.shortage(&self.scope_usage(scope), &request.resources));
        }
        let reason = if single {
            format!("pool '{}' cannot satisfy request", pool_id)
        } else {
            format!("no pool can satisfy request, closest is '{}'", pool_id)
        };
        Err(self.insufficient(request, reason, shortage))
    }

    /// Allocate committed capacity, all or nothing
    pub fn allocate(&self, request: &AllocationRequest) -> FleetResult<Allocation> {
        self.place(request, AllocationState::Committed, None, None)
    }

    /// Hold capacity for `ttl` (or the default TTL) pending a commit
    pub fn reserve(
        &self,
        request: &AllocationRequest,
        ttl: Option<Duration>,
    ) -> FleetResult<Allocation> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| FleetError::invalid_request("reservation ttl is too large"))?;
        self.place(
            request,
            AllocationState::Reserved,
            Some(Utc::now() + ttl),
            None,
        )
    }

    /// Turn a reservation into a committed allocation. Committing twice is
    /// a no-op.
    pub fn commit(&self, id: &str) -> FleetResult<Allocation> {
        let Some(pool_id) = self.index.get(id).map(|e| e.value().clone()) else {
            return Err(match lock(&self.tombstones).get(id) {
                Some(Tombstone::Expired) => FleetError::ReservationExpired(id.to_string()),
                _ => FleetError::ReservationNotFound(id.to_string()),
            });
        };
        let ledger = self
            .ledger(&pool_id)
            .ok_or_else(|| FleetError::ReservationNotFound(id.to_string()))?;

        let now = Utc::now();
        let mut guard = ledger.lock();
        let lapsed = guard
            .entries
            .get(id)
            .map(|a| {
                a.state == AllocationState::Reserved && a.expires_at.map_or(false, |at| at <= now)
            })
            .unwrap_or(false);
        if lapsed {
            let expired = guard.release(id);
            drop(guard);
            if let Some(allocation) = expired {
                self.retire(&allocation, Tombstone::Expired);
            }
            return Err(FleetError::ReservationExpired(id.to_string()));
        }

        let committed = guard
            .commit(id)
            .cloned()
            .ok_or_else(|| FleetError::ReservationNotFound(id.to_string()))?;
        debug!(id = %id, pool = %pool_id, "Reservation committed");
        Ok(committed)
    }

    /// Bookkeeping after an allocation leaves its ledger
    fn retire(&self, allocation: &Allocation, how: Tombstone) {
        self.credit_scope(allocation, &allocation.resources);
        self.index.remove(&allocation.id);
        lock(&self.tombstones).bury(&allocation.id, how);
        self.update_gauge();
    }

    fn outcome_for_missing(&self, id: &str) -> ReleaseOutcome {
        match lock(&self.tombstones).get(id) {
            Some(Tombstone::Released) => ReleaseOutcome::AlreadyReleased,
            Some(Tombstone::Expired) => ReleaseOutcome::Expired,
            None => ReleaseOutcome::NotFound,
        }
    }

    /// Return an allocation or reservation to its pool. Unknown and already
    /// released ids are a no-op.
    pub fn release(&self, id: &str) -> ReleaseOutcome {
        let Some(pool_id) = self.index.get(id).map(|e| e.value().clone()) else {
            return self.outcome_for_missing(id);
        };
        let released = self.ledger(&pool_id).and_then(|l| l.lock().release(id));

        match released {
            Some(allocation) => {
                self.retire(&allocation, Tombstone::Released);
                debug!(id = %id, pool = %pool_id, "Capacity released");
                ReleaseOutcome::Released
            }
            None => {
                self.index.remove(id);
                self.outcome_for_missing(id)
            }
        }
    }

    /// Cancel a reservation or a recurring schedule.
    ///
    /// Cancelling a committed allocation is refused; use
    /// [`ResourceAllocator::release`] for those.
    pub fn cancel_reservation(&self, id: &str) -> FleetResult<ReleaseOutcome> {
        let schedule = lock(&self.schedules).remove(id);
        if let Some(schedule) = schedule {
            if let Some(active) = &schedule.active_reservation {
                self.release(active);
            }
            info!(schedule = %id, "Recurring reservation cancelled");
            return Ok(ReleaseOutcome::Released);
        }

        if let Some(allocation) = self.get(id) {
            if allocation.state == AllocationState::Committed {
                return Err(FleetError::invalid_request(format!(
                    "allocation {} is committed, release it instead",
                    id
                )));
            }
        }
        Ok(self.release(id))
    }

    /// Register a repeating reservation window. Windows are placed by
    /// [`ResourceAllocator::activate_recurring`].
    pub fn reserve_recurring(&self, spec: RecurrenceSpec) -> FleetResult<RecurringSchedule> {
        if spec.request.owner.trim().is_empty() {
            return Err(FleetError::invalid_request("owner must not be empty"));
        }
        if spec.every_secs == 0 || spec.window_secs == 0 {
            return Err(FleetError::invalid_request(
                "recurrence period and window must be positive",
            ));
        }
        if spec.window_secs > spec.every_secs {
            return Err(FleetError::invalid_request(
                "recurrence window must not be longer than its period",
            ));
        }
        // Reject requests that could never be placed
        self.candidates(&spec.request)?;

        let schedule = RecurringSchedule::new(format!("sched-{}", Uuid::new_v4().simple()), spec);
        lock(&self.schedules).insert(schedule.id.clone(), schedule.clone());
        info!(
            schedule = %schedule.id,
            owner = %schedule.spec.request.owner,
            every_secs = schedule.spec.every_secs,
            window_secs = schedule.spec.window_secs,
            "Recurring reservation registered"
        );
        Ok(schedule)
    }

    pub fn recurring_schedules(&self) -> Vec<RecurringSchedule> {
        lock(&self.schedules).values().cloned().collect()
    }

    /// Place reservations for every window open at `now`. Returns the ids of
    /// the reservations placed.
    pub fn activate_recurring(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut placed = Vec::new();
        let mut schedules = lock(&self.schedules);

        for schedule in schedules.values_mut() {
            if let Some(active) = &schedule.active_reservation {
                if !self.index.contains_key(active) {
                    schedule.active_reservation = None;
                }
            }
            let Some(closes) = schedule.take_due(now) else {
                continue;
            };

            match self.place(
                &schedule.spec.request,
                AllocationState::Reserved,
                Some(closes),
                Some(schedule.id.clone()),
            ) {
                Ok(allocation) => {
                    schedule.active_reservation = Some(allocation.id.clone());
                    schedule.windows_placed += 1;
                    placed.push(allocation.id);
                }
                Err(e) => {
                    schedule.windows_missed += 1;
                    warn!(schedule = %schedule.id, error = %e, "Recurring window could not be placed");
                }
            }
        }
        placed
    }

    /// Release every reservation whose TTL lapsed at or before `now`
    pub fn expire_reservations(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut expired = Vec::new();
        for (pool_id, ledger) in self.ledgers() {
            let released: Vec<Allocation> = {
                let mut ledger = ledger.lock();
                let ids = ledger.lapsed(now);
                ids.iter().filter_map(|id| ledger.release(id)).collect()
            };
            for allocation in released {
                self.retire(&allocation, Tombstone::Expired);
                debug!(id = %allocation.id, pool = %pool_id, "Reservation expired");
                expired.push(allocation.id);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired reservations released");
        }
        expired
    }

    /// Free capacity per pool
    pub fn available_resources(&self) -> Vec<PoolSummary> {
        self.ledgers()
            .into_iter()
            .map(|(_, l)| l.lock().summary())
            .collect()
    }

    pub fn pool(&self, id: &str) -> Option<PoolSummary> {
        self.ledger(id).map(|l| l.lock().summary())
    }

    /// Every reservation and committed allocation, oldest first
    pub fn active_allocations(&self) -> Vec<Allocation> {
        let mut out: Vec<Allocation> = self
            .ledgers()
            .into_iter()
            .flat_map(|(_, l)| l.lock().entries.values().cloned().collect::<Vec<_>>())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn get(&self, id: &str) -> Option<Allocation> {
        let pool_id = self.index.get(id).map(|e| e.value().clone())?;
        let ledger = self.ledger(&pool_id)?;
        let found = ledger.lock().entries.get(id).cloned();
        found
    }

    pub fn allocations_for(&self, owner: &str) -> Vec<Allocation> {
        self.active_allocations()
            .into_iter()
            .filter(|a| a.owner == owner)
            .collect()
    }

    /// Set the ceiling for a scope; zero dimensions are unlimited
    pub fn set_quota(&self, scope: &str, limits: ResourceVector) -> FleetResult<()> {
        if scope.trim().is_empty() {
            return Err(FleetError::config("allocator.quotas", "scope must not be empty"));
        }
        self.quotas
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                scope.to_string(),
                Quota {
                    scope: scope.to_string(),
                    limits,
                },
            );
        info!(scope = %scope, limits = ?limits, "Quota set");
        Ok(())
    }

    pub fn remove_quota(&self, scope: &str) -> bool {
        self.quotas
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(scope)
            .is_some()
    }

    pub fn quotas(&self) -> Vec<Quota> {
        self.quotas
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Add a policy rule, replacing any rule with the same name
    pub fn set_policy(&self, rule: PolicyRule) -> FleetResult<()> {
        if rule.name().trim().is_empty() {
            return Err(FleetError::invalid_request("policy name must not be empty"));
        }
        let mut policies = self.policies.write().unwrap_or_else(|p| p.into_inner());
        match policies.iter_mut().find(|r| r.name() == rule.name()) {
            Some(existing) => *existing = rule,
            None => policies.push(rule),
        }
        Ok(())
    }

    pub fn remove_policy(&self, name: &str) -> bool {
        let mut policies = self.policies.write().unwrap_or_else(|p| p.into_inner());
        let before = policies.len();
        policies.retain(|r| r.name() != name);
        policies.len() != before
    }

    pub fn policies(&self) -> Vec<PolicyRule> {
        self.policies
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Append a utilization point to every pool's history
    pub fn sample_utilization(&self, now: DateTime<Utc>) {
        for (_, ledger) in self.ledgers() {
            ledger.lock().record_utilization(now);
        }
    }

    pub fn generate_report(&self) -> AllocationReport {
        let mut pools = Vec::new();
        let mut totals = PoolTotals::default();
        let mut by_qos: BTreeMap<String, usize> = BTreeMap::new();
        let mut consistent = true;

        for (_, ledger) in self.ledgers() {
            let ledger = ledger.lock();
            let summary = ledger.summary();
            totals.add(&summary);
            consistent &= ledger.check().is_ok();
            for allocation in ledger.entries.values() {
                *by_qos.entry(report::qos_key(allocation.qos)).or_default() += 1;
            }
            pools.push(PoolReport::build(summary, ledger.history.iter()));
        }

        let quotas = self
            .quotas()
            .into_iter()
            .map(|q| QuotaUsage {
                used: self.scope_usage(&q.scope),
                scope: q.scope,
                limits: q.limits,
            })
            .collect();

        AllocationReport {
            generated_at: Utc::now(),
            pools,
            totals,
            quotas,
            by_qos,
            recurring_schedules: lock(&self.schedules).len(),
            consistent,
        }
    }

    fn drift(&self) -> Vec<FleetError> {
        let mut found = Vec::new();
        let mut indexed: HashSet<String> = HashSet::new();

        for (pool_id, ledger) in self.ledgers() {
            let ledger = ledger.lock();
            if let Err(detail) = ledger.check() {
                found.push(FleetError::StateDriftDetected {
                    pool: pool_id.clone(),
                    detail,
                });
            }
            for id in ledger.entries.keys() {
                match self.index.get(id).map(|e| e.value().clone()) {
                    Some(p) if p == pool_id => {}
                    _ => found.push(FleetError::StateDriftDetected {
                        pool: pool_id.clone(),
                        detail: format!("allocation {} is missing from the index", id),
                    }),
                }
                indexed.insert(id.clone());
            }
        }

        for entry in self.index.iter() {
            if !indexed.contains(entry.key()) {
                found.push(FleetError::StateDriftDetected {
                    pool: entry.value().clone(),
                    detail: format!("index entry {} has no allocation", entry.key()),
                });
            }
        }
        found
    }

    /// Check every pool's accounting identity and the allocation index.
    /// Drift is logged; callers repair with [`ResourceAllocator::repair_state`].
    pub fn validate_state(&self) -> bool {
        let drift = self.drift();
        for e in &drift {
            warn!(event = "state_drift_detected", error = %e, "Allocator drift detected");
        }
        drift.is_empty()
    }

    /// Rebuild drifted ledgers from their records, drop dangling index
    /// entries, release lapsed reservations and recount scope usage
    pub fn repair_state(&self) -> RepairSummary {
        let mut summary = RepairSummary {
            expired_released: self.expire_reservations(Utc::now()).len(),
            ..Default::default()
        };

        let mut live: HashMap<String, String> = HashMap::new();
        let mut usage: HashMap<String, ResourceVector> = HashMap::new();
        for (pool_id, ledger) in self.ledgers() {
            let mut ledger = ledger.lock();
            if ledger.check().is_err() {
                ledger.rebuild();
                summary.pools_repaired.push(pool_id.clone());
            }
            for allocation in ledger.entries.values() {
                live.insert(allocation.id.clone(), pool_id.clone());
                if let Some(scope) = &allocation.scope {
                    let used = usage.entry(scope.clone()).or_default();
                    *used = used.saturating_add(&allocation.resources);
                }
            }
        }

        let dangling: Vec<String> = self
            .index
            .iter()
            .filter(|e| live.get(e.key()) != Some(e.value()))
            .map(|e| e.key().clone())
            .collect();
        for id in &dangling {
            self.index.remove(id);
            if !live.contains_key(id) {
                summary.orphans_released += 1;
            }
        }
        for (id, pool_id) in live {
            self.index.insert(id, pool_id);
        }
        *lock(&self.scopes) = usage;
        self.update_gauge();

        if !summary.is_empty() {
            self.metrics.inc_state_repairs();
            self.logger.log_state_repaired(&summary);
        }
        summary
    }

    /// Shrink every non-Guaranteed committed allocation by `fraction` of its
    /// size, BestEffort first, and credit the pools
    pub fn throttle(&self, fraction: f64) -> FleetResult<ThrottleSummary> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(FleetError::invalid_request(format!(
                "throttle fraction must be within (0, 1], got {}",
                fraction
            )));
        }

        let mut affected = Vec::new();
        let mut reclaimed = ResourceVector::ZERO;
        for (_, ledger) in self.ledgers() {
            let mut credits = Vec::new();
            {
                let mut ledger = ledger.lock();
                for (id, resources, _) in ledger.throttle_candidates() {
                    let taken = ledger.shrink(&id, &resources.scaled(fraction));
                    if taken.is_zero() {
                        continue;
                    }
                    if let Some(allocation) = ledger.entries.get(&id) {
                        credits.push((allocation.clone(), taken));
                    }
                    reclaimed = reclaimed.saturating_add(&taken);
                    affected.push(id);
                }
            }
            for (allocation, taken) in credits {
                self.credit_scope(&allocation, &taken);
            }
        }

        let summary = ThrottleSummary {
            fraction,
            affected,
            reclaimed,
        };
        if !summary.affected.is_empty() {
            self.logger.log_throttle(&summary);
        }
        Ok(summary)
    }

    /// Release committed allocations that `is_orphan` selects. Reservations
    /// are left to their TTL.
    pub fn reap_orphans(&self, is_orphan: impl Fn(&Allocation) -> bool) -> Vec<String> {
        let orphans: Vec<String> = self
            .active_allocations()
            .into_iter()
            .filter(|a| a.state == AllocationState::Committed && is_orphan(a))
            .map(|a| a.id)
            .collect();

        for id in &orphans {
            self.release(id);
        }
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "Released allocations with no live owner");
        }
        orphans
    }
}
