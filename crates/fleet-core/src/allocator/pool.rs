//! Pool ledger
//!
//! A pool tracks `total`, `free`, `reserved` and `allocated` capacity plus
//! the allocations that account for the last two. Every mutation keeps
//! `free + reserved + allocated == total`; [`PoolLedger::check`] verifies it
//! and [`PoolLedger::rebuild`] restores it from the allocation records.

use super::{Allocation, AllocationState};
use crate::buffer::{RingBuffer, Timestamped};
use crate::models::{Dimension, QosClass, ResourceVector, Shortage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Share of capacity in use at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtilizationPoint {
    pub timestamp: DateTime<Utc>,
    pub percents: BTreeMap<Dimension, f64>,
}

impl Timestamped for UtilizationPoint {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Read-only view of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub id: String,
    pub labels: Vec<String>,
    pub total: ResourceVector,
    pub free: ResourceVector,
    pub reserved: ResourceVector,
    pub allocated: ResourceVector,
    pub allocations: usize,
    /// Percent of each dimension held by reservations and allocations
    pub utilization: BTreeMap<Dimension, f64>,
}

#[derive(Debug)]
pub(crate) struct PoolLedger {
    pub(super) id: String,
    pub(super) labels: BTreeSet<String>,
    pub(super) total: ResourceVector,
    pub(super) free: ResourceVector,
    pub(super) reserved: ResourceVector,
    pub(super) allocated: ResourceVector,
    pub(super) entries: BTreeMap<String, Allocation>,
    pub(super) history: RingBuffer<UtilizationPoint>,
}

impl PoolLedger {
    pub(super) fn new(
        id: impl Into<String>,
        total: ResourceVector,
        labels: impl IntoIterator<Item = String>,
        history: usize,
    ) -> Self {
        Self {
            id: id.into(),
            labels: labels.into_iter().collect(),
            total,
            free: total,
            reserved: ResourceVector::ZERO,
            allocated: ResourceVector::ZERO,
            entries: BTreeMap::new(),
            history: RingBuffer::new(history),
        }
    }

    pub(super) fn in_use(&self) -> ResourceVector {
        self.reserved.saturating_add(&self.allocated)
    }

    /// Debit `allocation` if it fits in `available`, which may be tighter
    /// than `free` when a headroom policy applies
    pub(super) fn hold(
        &mut self,
        allocation: Allocation,
        available: &ResourceVector,
    ) -> Result<(), Shortage> {
        let shortage = allocation.resources.shortage_against(available);
        if !shortage.is_empty() {
            return Err(shortage);
        }

        self.free = self.free.saturating_sub(&allocation.resources);
        match allocation.state {
            AllocationState::Reserved => {
                self.reserved = self.reserved.saturating_add(&allocation.resources)
            }
            _ => self.allocated = self.allocated.saturating_add(&allocation.resources),
        }
        self.entries.insert(allocation.id.clone(), allocation);
        Ok(())
    }

    /// Move a reservation into the allocated bucket
    pub(super) fn commit(&mut self, id: &str) -> Option<&Allocation> {
        let entry = self.entries.get_mut(id)?;
        if entry.state == AllocationState::Reserved {
            entry.state = AllocationState::Committed;
            entry.expires_at = None;
            self.reserved = self.reserved.saturating_sub(&entry.resources);
            self.allocated = self.allocated.saturating_add(&entry.resources);
        }
        Some(entry)
    }

    /// Remove an allocation and credit its capacity back
    pub(super) fn release(&mut self, id: &str) -> Option<Allocation> {
        let mut entry = self.entries.remove(id)?;
        match entry.state {
            AllocationState::Reserved => {
                self.reserved = self.reserved.saturating_sub(&entry.resources)
            }
            _ => self.allocated = self.allocated.saturating_sub(&entry.resources),
        }
        self.free = self.free.saturating_add(&entry.resources);
        entry.state = AllocationState::Released;
        Some(entry)
    }

    /// Shrink a committed allocation by `by`, returning what was reclaimed
    pub(super) fn shrink(&mut self, id: &str, by: &ResourceVector) -> ResourceVector {
        let Some(entry) = self.entries.get_mut(id) else {
            return ResourceVector::ZERO;
        };
        if entry.state != AllocationState::Committed {
            return ResourceVector::ZERO;
        }
        let reclaimed = ResourceVector {
            cpu: by.cpu.min(entry.resources.cpu),
            memory_mb: by.memory_mb.min(entry.resources.memory_mb),
            disk_mb: by.disk_mb.min(entry.resources.disk_mb),
            bandwidth_mbps: by.bandwidth_mbps.min(entry.resources.bandwidth_mbps),
        };
        entry.resources = entry.resources.saturating_sub(&reclaimed);
        self.allocated = self.allocated.saturating_sub(&reclaimed);
        self.free = self.free.saturating_add(&reclaimed);
        reclaimed
    }

    /// Reservations whose TTL has lapsed at `now`
    pub(super) fn lapsed(&self, now: DateTime<Utc>) -> Vec<String> {
        self.entries
            .values()
            .filter(|a| a.state == AllocationState::Reserved)
            .filter(|a| a.expires_at.map_or(false, |at| at <= now))
            .map(|a| a.id.clone())
            .collect()
    }

    /// Committed allocations that may be throttled, BestEffort first
    pub(super) fn throttle_candidates(&self) -> Vec<(String, ResourceVector, QosClass)> {
        let mut out: Vec<&Allocation> = self
            .entries
            .values()
            .filter(|a| a.state == AllocationState::Committed && a.qos != QosClass::Guaranteed)
            .collect();
        out.sort_by(|a, b| {
            a.qos
                .preemption_rank()
                .cmp(&b.qos.preemption_rank())
                .then(b.created_at.cmp(&a.created_at))
        });
        out.into_iter()
            .map(|a| (a.id.clone(), a.resources, a.qos))
            .collect()
    }

    /// Verify the accounting identity and that the buckets match the records
    pub(super) fn check(&self) -> Result<(), String> {
        let accounted = self.free.saturating_add(&self.in_use());
        if accounted != self.total {
            return Err(format!(
                "free + reserved + allocated = {:?}, total = {:?}",
                accounted, self.total
            ));
        }

        let (reserved, allocated) = self.recount();
        if reserved != self.reserved {
            return Err(format!(
                "reserved bucket {:?} does not match records {:?}",
                self.reserved, reserved
            ));
        }
        if allocated != self.allocated {
            return Err(format!(
                "allocated bucket {:?} does not match records {:?}",
                self.allocated, allocated
            ));
        }
        Ok(())
    }

    fn recount(&self) -> (ResourceVector, ResourceVector) {
        let mut reserved = ResourceVector::ZERO;
        let mut allocated = ResourceVector::ZERO;
        for entry in self.entries.values() {
            match entry.state {
                AllocationState::Reserved => reserved = reserved.saturating_add(&entry.resources),
                AllocationState::Committed => {
                    allocated = allocated.saturating_add(&entry.resources)
                }
                AllocationState::Released => {}
            }
        }
        (reserved, allocated)
    }

    /// Recompute every bucket from the allocation records.
    ///
    /// Records never exceed the total because resizing refuses to shrink
    /// below what is in use.
    pub(super) fn rebuild(&mut self) {
        self.entries
            .retain(|_, a| a.state != AllocationState::Released);
        let (reserved, allocated) = self.recount();
        self.reserved = reserved;
        self.allocated = allocated;
        self.free = self.total.saturating_sub(&reserved.saturating_add(&allocated));
    }

    /// Change the total. Fails with the overflow when records would no
    /// longer fit.
    pub(super) fn resize(&mut self, total: ResourceVector) -> Result<(), Shortage> {
        let in_use = self.in_use();
        let overflow = in_use.shortage_against(&total);
        if !overflow.is_empty() {
            return Err(overflow);
        }
        self.total = total;
        self.free = total.saturating_sub(&in_use);
        Ok(())
    }

    pub(super) fn utilization(&self) -> BTreeMap<Dimension, f64> {
        let in_use = self.in_use();
        Dimension::ALL
            .iter()
            .filter(|d| self.total.get(**d) > 0)
            .map(|d| {
                let percent = in_use.get(*d) as f64 / self.total.get(*d) as f64 * 100.0;
                (*d, percent)
            })
            .collect()
    }

    pub(super) fn record_utilization(&mut self, now: DateTime<Utc>) {
        let percents = self.utilization();
        self.history.push(UtilizationPoint {
            timestamp: now,
            percents,
        });
    }

    pub(super) fn summary(&self) -> PoolSummary {
        PoolSummary {
            id: self.id.clone(),
            labels: self.labels.iter().cloned().collect(),
            total: self.total,
            free: self.free,
            reserved: self.reserved,
            allocated: self.allocated,
            allocations: self.entries.len(),
            utilization: self.utilization(),
        }
    }
}
