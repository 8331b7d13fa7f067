use super::Strategy;
use crate::lifecycle::ScaleDirection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Migrate,
    Scale,
    Consolidate,
}

impl ActionType {
    pub const ALL: [ActionType; 3] = [ActionType::Migrate, ActionType::Scale, ActionType::Consolidate];

    pub fn risk(&self) -> Risk {
        match self {
            ActionType::Migrate => Risk::High,
            ActionType::Scale => Risk::Medium,
            ActionType::Consolidate => Risk::Low,
        }
    }

    pub fn estimated_duration_secs(&self) -> u64 {
        match self {
            ActionType::Migrate => 120,
            ActionType::Scale => 60,
            ActionType::Consolidate => 30,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Migrate => "migrate",
            ActionType::Scale => "scale",
            ActionType::Consolidate => "consolidate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactSource {
    Historical,
    #[default]
    Heuristic,
}

/// Expected change in utilization, in percentage points. Negative is relief.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedImpact {
    pub cpu_delta_percent: f64,
    pub memory_delta_percent: f64,
    pub source: ImpactSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActionParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<ScaleDirection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    /// Destination pool for migrations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Agent the action applies to
    pub target: String,
    pub description: String,
    pub impact: ExpectedImpact,
    pub risk: Risk,
    pub estimated_duration_secs: u64,
    #[serde(default)]
    pub params: ActionParams,
}

impl PlanAction {
    pub fn new(
        action_type: ActionType,
        target: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            action_type,
            target: target.into(),
            description: description.into(),
            impact: ExpectedImpact::default(),
            risk: action_type.risk(),
            estimated_duration_secs: action_type.estimated_duration_secs(),
            params: ActionParams::default(),
        }
    }

    pub fn with_params(mut self, params: ActionParams) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedOutcomes {
    pub cpu_delta_percent: f64,
    pub memory_delta_percent: f64,
    pub issues_addressed: usize,
    /// Candidate actions dropped because the strategy does not admit their risk
    pub actions_filtered: usize,
}

/// Advisory plan. Nothing in it runs until an action is executed explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationPlan {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub strategy: Strategy,
    pub actions: Vec<PlanAction>,
    pub expected_outcomes: ExpectedOutcomes,
}
