//! Allocation report

use super::pool::{PoolSummary, UtilizationPoint};
use crate::detector::trend_of;
use crate::models::{Dimension, QosClass, ResourceVector, Trend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolReport {
    #[serde(flatten)]
    pub summary: PoolSummary,
    /// Highest utilization seen in the retained history
    pub peak: BTreeMap<Dimension, f64>,
    pub average: BTreeMap<Dimension, f64>,
    pub trend: BTreeMap<Dimension, Trend>,
    pub samples: usize,
}

impl PoolReport {
    pub(super) fn build<'a>(
        summary: PoolSummary,
        history: impl Iterator<Item = &'a UtilizationPoint>,
    ) -> Self {
        let points: Vec<&UtilizationPoint> = history.collect();
        let mut peak = BTreeMap::new();
        let mut average = BTreeMap::new();
        let mut trend = BTreeMap::new();

        for d in Dimension::ALL {
            let series: Vec<(f64, f64)> = points
                .iter()
                .filter_map(|p| {
                    p.percents
                        .get(&d)
                        .map(|v| (p.timestamp.timestamp_millis() as f64 / 1_000.0, *v))
                })
                .collect();
            if series.is_empty() {
                continue;
            }
            let max = series.iter().map(|(_, v)| *v).fold(0.0, f64::max);
            let mean = series.iter().map(|(_, v)| *v).sum::<f64>() / series.len() as f64;
            peak.insert(d, max);
            average.insert(d, mean);
            trend.insert(d, trend_of(&series));
        }

        Self {
            summary,
            peak,
            average,
            trend,
            samples: points.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub scope: String,
    pub limits: ResourceVector,
    pub used: ResourceVector,
}

/// Point-in-time report over every pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationReport {
    pub generated_at: DateTime<Utc>,
    pub pools: Vec<PoolReport>,
    pub totals: PoolTotals,
    pub quotas: Vec<QuotaUsage>,
    pub by_qos: BTreeMap<String, usize>,
    pub recurring_schedules: usize,
    /// Whether every pool satisfied the accounting identity
    pub consistent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolTotals {
    pub total: ResourceVector,
    pub free: ResourceVector,
    pub reserved: ResourceVector,
    pub allocated: ResourceVector,
    pub allocations: usize,
}

impl PoolTotals {
    pub(super) fn add(&mut self, summary: &PoolSummary) {
        self.total = self.total.saturating_add(&summary.total);
        self.free = self.free.saturating_add(&summary.free);
        self.reserved = self.reserved.saturating_add(&summary.reserved);
        self.allocated = self.allocated.saturating_add(&summary.allocated);
        self.allocations += summary.allocations;
    }
}

pub(super) fn qos_key(qos: QosClass) -> String {
    qos.to_string()
}
