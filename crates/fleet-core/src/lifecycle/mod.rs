//! Agent lifecycle management
//!
//! Deploys, starts, stops, health-checks and scales agents. Agents are
//! external processes driven through an [`AgentRuntime`]; their capacity is
//! accounted in the [`ResourceAllocator`](crate::allocator::ResourceAllocator).

mod agent;
mod channels;
mod manager;
mod recommendations;
mod runtime;
mod scaling;

#[cfg(test)]
mod tests;

pub use agent::{
    AgentInstance, AgentOverrides, AgentSpec, AgentStatus, HealthCheckPolicy, ReplicaCounts,
    UtilizationSample,
};
pub use channels::{ChannelHub, DeliveryReport, Message};
pub use manager::{ActionOutcome, AgentManager, HealthSweep, PreemptionResult};
pub use recommendations::{
    AgentRecommendation, Impact, ImpactDirection, RecommendationType,
};
pub use runtime::{AgentRuntime, LaunchSpec, ProbeResult, ProcessRuntime};
pub use scaling::{ScaleDirection, ScaleRequest, ScaleResult};
