//! Per-agent advisory recommendations
//!
//! Recommendations compare an agent's recent average utilization with the
//! configured targets. They are advice only; nothing here changes state.

use super::agent::{AgentStatus, UtilizationSample};
use crate::models::{Dimension, ResourceVector};
use serde::{Deserialize, Serialize};

/// Deviations under this many points are left alone
const DEADBAND: f64 = 5.0;
/// Deviations of at least this many points are reported with high confidence
const STRONG_DEVIATION: f64 = 10.0;
/// Utilization this far under target suggests shrinking the request
const SHRINK_MARGIN: f64 = 30.0;
/// CPU at or above this share means one replica is not enough
const SATURATED: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    ResourceAdjustment,
    ScaleOut,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactDirection {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impact {
    pub performance: ImpactDirection,
    pub cost: ImpactDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecommendation {
    #[serde(rename = "type")]
    pub kind: RecommendationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<Dimension>,
    pub message: String,
    pub reasoning: String,
    pub impact: Impact,
    pub confidence: f64,
    /// Suggested resource request after the adjustment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested: Option<ResourceVector>,
}

/// What a recommendation pass looks at
#[derive(Debug, Clone)]
pub struct RecommendationInput<'a> {
    pub status: AgentStatus,
    pub requirements: ResourceVector,
    pub samples: &'a [UtilizationSample],
    pub cpu_target: f64,
    pub memory_target: f64,
}

fn confidence(deviation: f64) -> f64 {
    if deviation.abs() >= STRONG_DEVIATION {
        0.8
    } else {
        0.6
    }
}

fn average(samples: &[UtilizationSample], pick: fn(&UtilizationSample) -> f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().map(pick).sum::<f64>() / samples.len() as f64)
}

/// Resize `current` so that `observed` utilization would land on `target`
fn resize(current: u64, observed: f64, target: f64) -> u64 {
    if target <= 0.0 {
        return current;
    }
    ((current as f64) * observed / target).ceil().max(1.0) as u64
}

fn adjust(
    dimension: Dimension,
    observed: f64,
    target: f64,
    requirements: &ResourceVector,
) -> Option<AgentRecommendation> {
    let deviation = observed - target;
    let current = requirements.get(dimension);
    if current == 0 {
        return None;
    }

    let mut suggested = *requirements;
    if deviation >= DEADBAND {
        suggested.set(dimension, resize(current, observed, target));
        Some(AgentRecommendation {
            kind: RecommendationType::ResourceAdjustment,
            dimension: Some(dimension),
            message: format!(
                "Increase {} allocation from {} to {}",
                dimension,
                current,
                suggested.get(dimension)
            ),
            reasoning: format!(
                "Average {} utilization {:.1}% is {:.1} points above the {:.0}% target",
                dimension, observed, deviation, target
            ),
            impact: Impact {
                performance: ImpactDirection::Positive,
                cost: ImpactDirection::Negative,
            },
            confidence: confidence(deviation),
            suggested: Some(suggested),
        })
    } else if -deviation >= SHRINK_MARGIN {
        suggested.set(dimension, resize(current, observed, target));
        Some(AgentRecommendation {
            kind: RecommendationType::ResourceAdjustment,
            dimension: Some(dimension),
            message: format!(
                "Reduce {} allocation from {} to {}",
                dimension,
                current,
                suggested.get(dimension)
            ),
            reasoning: format!(
                "Average {} utilization {:.1}% is {:.1} points below the {:.0}% target",
                dimension, observed, -deviation, target
            ),
            impact: Impact {
                performance: ImpactDirection::Neutral,
                cost: ImpactDirection::Positive,
            },
            confidence: confidence(deviation),
            suggested: Some(suggested),
        })
    } else {
        None
    }
}

pub fn recommend(input: &RecommendationInput<'_>) -> Vec<AgentRecommendation> {
    let mut out = Vec::new();

    if matches!(input.status, AgentStatus::Unhealthy | AgentStatus::Degraded) {
        out.push(AgentRecommendation {
            kind: RecommendationType::Replace,
            dimension: None,
            message: "Replace the agent with a fresh instance".to_string(),
            reasoning: format!("Agent is {} after failed health checks", input.status),
            impact: Impact {
                performance: ImpactDirection::Positive,
                cost: ImpactDirection::Neutral,
            },
            confidence: if input.status == AgentStatus::Unhealthy {
                0.8
            } else {
                0.6
            },
            suggested: None,
        });
    }

    let cpu = average(input.samples, |s| s.cpu_percent);
    let memory = average(input.samples, |s| s.memory_percent);

    if let Some(cpu) = cpu {
        out.extend(adjust(
            Dimension::Cpu,
            cpu,
            input.cpu_target,
            &input.requirements,
        ));
        if cpu >= SATURATED {
            out.push(AgentRecommendation {
                kind: RecommendationType::ScaleOut,
                dimension: Some(Dimension::Cpu),
                message: "Add a replica".to_string(),
                reasoning: format!("Average CPU utilization {:.1}% is saturated", cpu),
                impact: Impact {
                    performance: ImpactDirection::Positive,
                    cost: ImpactDirection::Negative,
                },
                confidence: 0.6,
                suggested: None,
            });
        }
    }
    if let Some(memory) = memory {
        out.extend(adjust(
            Dimension::Memory,
            memory,
            input.memory_target,
            &input.requirements,
        ));
    }
    out
}
