//! Cluster analysis
//!
//! [`analyze`] is a pure function over a point-in-time view of the fleet so
//! it can be exercised without live components.

use super::plan::{ActionParams, ActionType, PlanAction};
use crate::allocator::PoolSummary;
use crate::config::OptimizationConfig;
use crate::detector::ExhaustionForecast;
use crate::lifecycle::{AgentInstance, AgentStatus, ScaleDirection, UtilizationSample};
use crate::models::{Dimension, ResourceVector};
use crate::pressure::{PressureLevel, PressureReading, ThresholdSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Forecasts closer than this are reported as issues
const FORECAST_HORIZON_SECS: f64 = 3_600.0;
/// Forecasts closer than this are critical
const FORECAST_CRITICAL_SECS: f64 = 600.0;
/// A pool under this utilization in every dimension can take migrations
const REBALANCE_CEILING: f64 = 50.0;
/// Agent utilization treated as critical overload
const AGENT_CRITICAL: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    HostOverload,
    PoolSaturated,
    AgentOverload,
    AgentUnhealthy,
    ExhaustionForecast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub kind: IssueKind,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<Dimension>,
    pub level: PressureLevel,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sustained_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    Consolidation,
    Rebalance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub kind: OpportunityKind,
    pub target: String,
    pub detail: String,
    /// Capacity the opportunity would hand back
    pub reclaimable: ResourceVector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite_pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall: Option<PressureLevel>,
    pub issues: Vec<Issue>,
    pub opportunities: Vec<Opportunity>,
    /// Candidate actions, lowest risk first
    pub recommendations: Vec<PlanAction>,
}

/// One agent and its utilization samples, oldest first
#[derive(Debug, Clone)]
pub struct AgentView {
    pub instance: AgentInstance,
    pub samples: Vec<UtilizationSample>,
}

pub struct AnalysisInput<'a> {
    pub now: DateTime<Utc>,
    pub latest: Option<&'a PressureReading>,
    /// How long host pressure has stayed high or critical
    pub sustained: Option<Duration>,
    pub forecasts: &'a [ExhaustionForecast],
    pub pools: &'a [PoolSummary],
    pub agents: &'a [AgentView],
    pub thresholds: &'a ThresholdSet,
    pub config: &'a OptimizationConfig,
}

/// Whether `holds` is true for every sample in the trailing `window`,
/// including the sample already in force when the window opened
pub(crate) fn sustained(
    samples: &[UtilizationSample],
    now: DateTime<Utc>,
    window: Duration,
    holds: impl Fn(&UtilizationSample) -> bool,
) -> bool {
    let Ok(window) = chrono::Duration::from_std(window) else {
        return false;
    };
    let Some(cutoff) = now.checked_sub_signed(window) else {
        return false;
    };
    let Some(at_cutoff) = samples.iter().rev().find(|s| s.timestamp <= cutoff) else {
        return false;
    };
    holds(at_cutoff)
        && samples
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .all(|s| holds(s))
}

fn pool_level(pool: &PoolSummary, thresholds: &ThresholdSet) -> Option<(Dimension, f64, PressureLevel)> {
    pool.utilization
        .iter()
        .map(|(d, pct)| (*d, *pct, thresholds.classify(*d, *pct)))
        .max_by(|a, b| a.2.cmp(&b.2).then(a.1.total_cmp(&b.1)))
}

fn peak_utilization(pool: &PoolSummary) -> f64 {
    pool.utilization.values().copied().fold(0.0, f64::max)
}

pub fn analyze(input: &AnalysisInput<'_>) -> Analysis {
    let config = input.config;
    let mut issues = Vec::new();
    let mut opportunities = Vec::new();
    let mut actions: Vec<PlanAction> = Vec::new();

    if let (Some(reading), Some(sustained)) = (input.latest, input.sustained) {
        if reading.overall.is_elevated() && sustained >= config.debounce() {
            let dimension = reading
                .levels
                .iter()
                .max_by_key(|(_, l)| **l)
                .map(|(d, _)| *d);
            issues.push(Issue {
                kind: IssueKind::HostOverload,
                target: "host".to_string(),
                dimension,
                level: reading.overall,
                detail: format!(
                    "Host pressure {} for {}s (composite {:.2})",
                    reading.overall,
                    sustained.as_secs(),
                    reading.composite_score
                ),
                sustained_secs: Some(sustained.as_secs()),
            });
        }
    }

    for forecast in input.forecasts {
        if forecast.seconds_remaining > FORECAST_HORIZON_SECS {
            continue;
        }
        issues.push(Issue {
            kind: IssueKind::ExhaustionForecast,
            target: "host".to_string(),
            dimension: Some(forecast.dimension),
            level: if forecast.seconds_remaining <= FORECAST_CRITICAL_SECS {
                PressureLevel::Critical
            } else {
                PressureLevel::High
            },
            detail: format!(
                "{} forecast to reach 100% in {:.0}s (now {:.1}%)",
                forecast.dimension, forecast.seconds_remaining, forecast.current_percent
            ),
            sustained_secs: None,
        });
    }

    let mut saturated = Vec::new();
    for pool in input.pools {
        let Some((dimension, percent, level)) = pool_level(pool, input.thresholds) else {
            continue;
        };
        if !level.is_elevated() {
            continue;
        }
        issues.push(Issue {
            kind: IssueKind::PoolSaturated,
            target: pool.id.clone(),
            dimension: Some(dimension),
            level,
            detail: format!("Pool {} has {:.1}% of its {} committed", pool.id, percent, dimension),
            sustained_secs: None,
        });
        saturated.push(pool.id.clone());
    }

    for agent in input.agents {
        let instance = &agent.instance;
        match instance.status {
            AgentStatus::Unhealthy | AgentStatus::Degraded => {
                issues.push(Issue {
                    kind: IssueKind::AgentUnhealthy,
                    target: instance.id.clone(),
                    dimension: None,
                    level: if instance.status == AgentStatus::Unhealthy {
                        PressureLevel::High
                    } else {
                        PressureLevel::Moderate
                    },
                    detail: format!("Agent {} is {}", instance.id, instance.status),
                    sustained_secs: None,
                });
                continue;
            }
            status if !status.is_running() => continue,
            _ => {}
        }

        let overload = config.overload_percent;
        let hot = sustained(&agent.samples, input.now, config.debounce(), |s| {
            s.cpu_percent >= overload || s.memory_percent >= overload
        });
        if hot {
            if let Some(latest) = agent.samples.last() {
                let (dimension, percent) = if latest.cpu_percent >= latest.memory_percent {
                    (Dimension::Cpu, latest.cpu_percent)
                } else {
                    (Dimension::Memory, latest.memory_percent)
                };
                issues.push(Issue {
                    kind: IssueKind::AgentOverload,
                    target: instance.id.clone(),
                    dimension: Some(dimension),
                    level: if percent >= AGENT_CRITICAL {
                        PressureLevel::Critical
                    } else {
                        PressureLevel::High
                    },
                    detail: format!(
                        "Agent {} at {:.0}% {} for at least {}s",
                        instance.id,
                        percent,
                        dimension,
                        config.debounce_secs
                    ),
                    sustained_secs: Some(config.debounce_secs),
                });
                actions.push(
                    PlanAction::new(
                        ActionType::Scale,
                        instance.id.clone(),
                        format!(
                            "Add a replica to {} to relieve sustained {} load",
                            instance.id, dimension
                        ),
                    )
                    .with_params(ActionParams {
                        direction: Some(ScaleDirection::Up),
                        replicas: Some(1),
                        pool: None,
                    }),
                );
            }
            continue;
        }

        let floor = config.consolidation_floor_percent;
        let idle = sustained(&agent.samples, input.now, config.consolidation_window(), |s| {
            s.cpu_percent < floor && s.memory_percent < floor
        });
        if idle {
            opportunities.push(Opportunity {
                kind: OpportunityKind::Consolidation,
                target: instance.id.clone(),
                detail: format!(
                    "Agent {} below {:.0}% utilization for {}s",
                    instance.id, floor, config.consolidation_window_secs
                ),
                reclaimable: instance.resources,
            });
            actions.push(PlanAction::new(
                ActionType::Consolidate,
                instance.id.clone(),
                format!("Consolidate idle agent {} and release its capacity", instance.id),
            ));
        }
    }

    for source in &saturated {
        if let Some((agent, destination)) = migration_for(source, &saturated, input) {
            opportunities.push(Opportunity {
                kind: OpportunityKind::Rebalance,
                target: source.clone(),
                detail: format!("Move {} from {} to {}", agent.id, source, destination),
                reclaimable: agent.resources,
            });
            actions.push(
                PlanAction::new(
                    ActionType::Migrate,
                    agent.id.clone(),
                    format!("Migrate {} from saturated pool {} to {}", agent.id, source, destination),
                )
                .with_params(ActionParams {
                    direction: None,
                    replicas: None,
                    pool: Some(destination),
                }),
            );
        }
    }

    let mut seen = BTreeSet::new();
    actions.retain(|a| seen.insert((a.action_type, a.target.clone())));
    actions.sort_by(|a, b| a.risk.cmp(&b.risk).then_with(|| a.target.cmp(&b.target)));

    Analysis {
        generated_at: input.now,
        composite_pressure: input.latest.map(|r| r.composite_score),
        overall: input.latest.map(|r| r.overall),
        issues,
        opportunities,
        recommendations: actions,
    }
}

/// Largest running agent in `source` and the roomiest unsaturated pool that
/// fits it
fn migration_for<'a>(
    source: &str,
    saturated: &[String],
    input: &'a AnalysisInput<'_>,
) -> Option<(&'a AgentInstance, String)> {
    let mut movable: Vec<&AgentInstance> = input
        .agents
        .iter()
        .map(|a| &a.instance)
        .filter(|a| a.status.is_running() && a.pool.as_deref() == Some(source))
        .collect();
    movable.sort_by(|a, b| b.resources.cpu.cmp(&a.resources.cpu).then(a.id.cmp(&b.id)));

    for agent in movable {
        let destination = input
            .pools
            .iter()
            .filter(|p| p.id != source && !saturated.contains(&p.id))
            .filter(|p| peak_utilization(p) < REBALANCE_CEILING)
            .filter(|p| agent.resources.fits_within(&p.free))
            .max_by_key(|p| p.free.cpu);
        if let Some(destination) = destination {
            return Some((agent, destination.id.clone()));
        }
    }
    None
}
