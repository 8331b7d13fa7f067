//! Fleet optimizer
//!
//! Periodically analyzes detector, pressure, allocator and agent state and
//! turns the findings into advisory [`OptimizationPlan`]s. Plans are never
//! applied here; executing an action is an explicit call into the
//! [`AgentManager`](crate::lifecycle::AgentManager).

mod analysis;
mod plan;


pub use analysis::{
    analyze, Analysis, AgentView, AnalysisInput, Issue, IssueKind, Opportunity, OpportunityKind,
};
pub use plan::{
    ActionParams, ActionType, ExpectedImpact, ExpectedOutcomes, ImpactSource, OptimizationPlan,
    PlanAction, Risk,
};

use crate::allocator::ResourceAllocator;
use crate::buffer::{RingBuffer, Timestamped};
use crate::config::OptimizationConfig;
use crate::detector::ResourceDetector;
use crate::error::FleetError;
use crate::lifecycle::AgentManager;
use crate::models::Dimension;
use crate::observability::StructuredLogger;
use crate::pressure::PressureDetector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Observed outcomes remembered per action type
const OUTCOME_HISTORY: usize = 50;

/// How aggressive generated plans may be
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

impl Strategy {
    pub const CHOICES: [&'static str; 3] = ["conservative", "balanced", "aggressive"];

    /// Highest risk a plan under this strategy may contain
    pub fn max_risk(&self) -> Risk {
        match self {
            Strategy::Conservative => Risk::Low,
            Strategy::Balanced => Risk::Medium,
            Strategy::Aggressive => Risk::High,
        }
    }

    /// Replicas added per scale action
    pub fn scale_step(&self) -> u32 {
        match self {
            Strategy::Aggressive => 2,
            _ => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Conservative => "conservative",
            Strategy::Balanced => "balanced",
            Strategy::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Ok(Strategy::Conservative),
            "balanced" => Ok(Strategy::Balanced),
            "aggressive" => Ok(Strategy::Aggressive),
            other => Err(FleetError::invalid_choice(
                format!("unknown strategy '{}'", other),
                "resource optimize --strategy conservative|balanced|aggressive",
                &Self::CHOICES,
            )),
        }
    }
}

/// Utilization change measured after an action ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedImpact {
    pub timestamp: DateTime<Utc>,
    pub cpu_delta_percent: f64,
    pub memory_delta_percent: f64,
}

impl ObservedImpact {
    pub fn new(cpu_delta_percent: f64, memory_delta_percent: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_delta_percent,
            memory_delta_percent,
        }
    }
}

impl Timestamped for ObservedImpact {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Default impact when no outcome of the same type has been recorded
fn heuristic(action_type: ActionType) -> ExpectedImpact {
    let (cpu, memory) = match action_type {
        ActionType::Migrate => (-10.0, -10.0),
        ActionType::Scale => (-15.0, -5.0),
        ActionType::Consolidate => (5.0, 5.0),
    };
    ExpectedImpact {
        cpu_delta_percent: cpu,
        memory_delta_percent: memory,
        source: ImpactSource::Heuristic,
    }
}

pub struct Optimizer {
    config: RwLock<OptimizationConfig>,
    detector: Arc<ResourceDetector>,
    pressure: Arc<PressureDetector>,
    allocator: Arc<ResourceAllocator>,
    agents: Arc<AgentManager>,
    predictive: AtomicBool,
    outcomes: Mutex<HashMap<ActionType, RingBuffer<ObservedImpact>>>,
    last_plan: Mutex<Option<OptimizationPlan>>,
    logger: StructuredLogger,
}

impl Optimizer {
    pub fn new(
        config: OptimizationConfig,
        detector: Arc<ResourceDetector>,
        pressure: Arc<PressureDetector>,
        allocator: Arc<ResourceAllocator>,
        agents: Arc<AgentManager>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            detector,
            pressure,
            allocator,
            agents,
            predictive: AtomicBool::new(true),
            outcomes: Mutex::new(HashMap::new()),
            last_plan: Mutex::new(None),
            logger: StructuredLogger::new("fleet"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> OptimizationConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn set_config(&self, config: OptimizationConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    /// Include exhaustion forecasts in analysis
    pub fn set_predictive(&self, enabled: bool) {
        self.predictive.store(enabled, Ordering::Relaxed);
    }

    pub fn analyze(&self) -> Analysis {
        let config = self.config();
        let now = Utc::now();
        let latest = self.pressure.latest();
        let sustained = self.pressure.sustained_elevated();
        let forecasts: Vec<_> = if self.predictive.load(Ordering::Relaxed) {
            Dimension::ALL
                .iter()
                .filter_map(|d| self.detector.predict_exhaustion(*d))
                .collect()
        } else {
            Vec::new()
        };
        let pools = self.allocator.available_resources();
        let agents: Vec<AgentView> = self
            .agents
            .list_agents()
            .into_iter()
            .map(|instance| AgentView {
                samples: self
                    .agents
                    .utilization_history(&instance.id, None)
                    .unwrap_or_default(),
                instance,
            })
            .collect();
        let thresholds = self.pressure.thresholds();

        let mut analysis = analyze(&AnalysisInput {
            now,
            latest: latest.as_ref(),
            sustained,
            forecasts: &forecasts,
            pools: &pools,
            agents: &agents,
            thresholds: &thresholds,
            config: &config,
        });
        for action in &mut analysis.recommendations {
            action.impact = self.estimate(action.action_type);
        }
        debug!(
            issues = analysis.issues.len(),
            opportunities = analysis.opportunities.len(),
            "Analysis complete"
        );
        analysis
    }

    /// Build a plan from a fresh analysis. `None` uses the configured strategy.
    pub fn generate_plan(&self, strategy: Option<Strategy>) -> OptimizationPlan {
        let strategy = strategy.unwrap_or_else(|| self.config().strategy);
        let analysis = self.analyze();
        let plan = plan_from(&analysis, strategy);
        self.logger
            .log_plan_generated(&plan.id, strategy.as_str(), plan.actions.len());
        *self.last_plan.lock().unwrap_or_else(|p| p.into_inner()) = Some(plan.clone());
        plan
    }

    pub fn last_plan(&self) -> Option<OptimizationPlan> {
        self.last_plan
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Remember what an executed action actually did, for later estimates
    pub fn record_outcome(&self, action_type: ActionType, impact: ObservedImpact) {
        self.outcomes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(action_type)
            .or_insert_with(|| RingBuffer::new(OUTCOME_HISTORY))
            .push(impact);
    }

    /// Mean of recorded outcomes for `action_type`, else the heuristic default
    pub fn estimate(&self, action_type: ActionType) -> ExpectedImpact {
        let outcomes = self.outcomes.lock().unwrap_or_else(|p| p.into_inner());
        match outcomes.get(&action_type) {
            Some(history) if !history.is_empty() => {
                let n = history.len() as f64;
                ExpectedImpact {
                    cpu_delta_percent: history.iter().map(|o| o.cpu_delta_percent).sum::<f64>() / n,
                    memory_delta_percent: history
                        .iter()
                        .map(|o| o.memory_delta_percent)
                        .sum::<f64>()
                        / n,
                    source: ImpactSource::Historical,
                }
            }
            _ => heuristic(action_type),
        }
    }
}

/// Keep the actions `strategy` admits, apply its scale step and total the
/// expected outcome
pub fn plan_from(analysis: &Analysis, strategy: Strategy) -> OptimizationPlan {
    let candidates = analysis.recommendations.len();
    let mut actions: Vec<PlanAction> = analysis
        .recommendations
        .iter()
        .filter(|a| a.risk <= strategy.max_risk())
        .cloned()
        .collect();
    for action in &mut actions {
        if action.action_type == ActionType::Scale {
            action.params.replicas = Some(strategy.scale_step());
        }
    }
    actions.sort_by(|a, b| a.risk.cmp(&b.risk).then_with(|| a.target.cmp(&b.target)));

    let addressed = analysis
        .issues
        .iter()
        .filter(|i| actions.iter().any(|a| a.target == i.target))
        .count();
    let expected_outcomes = ExpectedOutcomes {
        cpu_delta_percent: actions.iter().map(|a| a.impact.cpu_delta_percent).sum(),
        memory_delta_percent: actions.iter().map(|a| a.impact.memory_delta_percent).sum(),
        issues_addressed: addressed,
        actions_filtered: candidates - actions.len(),
    };

    OptimizationPlan {
        id: format!("plan-{}", Uuid::new_v4().simple()),
        timestamp: Utc::now(),
        strategy,
        actions,
        expected_outcomes,
    }
}
