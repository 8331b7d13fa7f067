//! Component health for the daemon's liveness and readiness probes
//!
//! Each fleet component reports into a shared [`HealthRegistry`]; the
//! overall status is the worst status any component reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working with reduced fidelity, e.g. stale samples
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        !matches!(self, ComponentStatus::Unhealthy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            checked_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across `components`; healthy when there are none
    pub fn overall(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const DETECTOR: &str = "detector";
    pub const ALLOCATOR: &str = "allocator";
    pub const LIFECYCLE: &str = "lifecycle";
    pub const OPTIMIZER: &str = "optimizer";

    pub const ALL: [&str; 4] = [DETECTOR, ALLOCATOR, LIFECYCLE, OPTIMIZER];
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every fleet component registered as healthy
    pub async fn for_fleet() -> Self {
        let registry = Self::new();
        for name in components::ALL {
            registry.register(name).await;
        }
        registry
    }

    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        HealthResponse {
            status: HealthResponse::overall(&components),
            components,
        }
    }

    /// Ready once startup finished and no component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("fleet controller still starting".to_string()),
            };
        }
        let health = self.health().await;
        if let Some((name, c)) = health
            .components
            .iter()
            .find(|(_, c)| c.status == ComponentStatus::Unhealthy)
        {
            return ReadinessResponse {
                ready: false,
                reason: Some(format!(
                    "{} unhealthy: {}",
                    name,
                    c.message.as_deref().unwrap_or("no detail")
                )),
            };
        }
        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}
