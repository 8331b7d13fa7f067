//! Resource management core for a fleet of agents on one host
//!
//! This crate provides:
//! - Per-platform sampling of CPU, memory, disk and network
//! - Tiered pressure classification with edge-triggered alerts
//! - Multi-pool capacity allocation with quotas and reservations
//! - Agent lifecycle, health checks and scaling
//! - Advisory optimization plans
//! - Health checks and observability

pub mod allocator;
pub mod buffer;
pub mod config;
pub mod controller;
pub mod detector;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod optimizer;
pub mod platform;
pub mod pressure;

#[cfg(test)]
pub(crate) mod test_support;

pub use allocator::ResourceAllocator;
pub use config::FleetConfig;
pub use controller::{FleetController, FleetStatus, HistoryReport, MonitorStatus};
pub use detector::ResourceDetector;
pub use error::{ErrorKind, ErrorResponse, FleetError, FleetResult, PlatformError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use lifecycle::AgentManager;
pub use models::*;
pub use observability::{FleetMetrics, StructuredLogger};
pub use optimizer::Optimizer;
pub use platform::{detect_platform, PlatformAdapter, PlatformKind};
pub use pressure::{PressureDetector, PressureLevel};
