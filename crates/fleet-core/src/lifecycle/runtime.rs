//! Agent runtime interface
//!
//! The lifecycle manager never touches agent processes directly. It drives
//! them through [`AgentRuntime`]; [`ProcessRuntime`] spawns local processes
//! and tests inject a scripted double.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Everything a runtime needs to launch one agent
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub agent_id: String,
    pub agent_type: String,
    pub command: Option<Vec<String>>,
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            cpu_percent: None,
            memory_percent: None,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            cpu_percent: None,
            memory_percent: None,
            message: Some(message.into()),
        }
    }
}

/// Agent runtime interface
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Launch an agent
    async fn launch(&self, spec: &LaunchSpec) -> Result<()>;

    /// Stop an agent. Terminating an unknown agent succeeds.
    async fn terminate(&self, agent_id: &str) -> Result<()>;

    /// Check an agent's health
    async fn probe(&self, agent_id: &str) -> Result<ProbeResult>;
}

/// How long a terminated process gets to exit after the kill signal
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Runtime that spawns each agent as a local child process.
///
/// Agents whose spec has no command are tracked as externally managed and
/// always probe healthy.
pub struct ProcessRuntime {
    children: DashMap<String, Child>,
    external: DashSet<String>,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self {
            children: DashMap::new(),
            external: DashSet::new(),
        }
    }

    pub fn running(&self) -> usize {
        self.children.len() + self.external.len()
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        let Some(command) = &spec.command else {
            self.external.insert(spec.agent_id.clone());
            debug!(agent_id = %spec.agent_id, "Registered externally managed agent");
            return Ok(());
        };
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("empty command for agent {}", spec.agent_id))?;

        let child = Command::new(program)
            .args(args)
            .env("FLEET_AGENT_ID", &spec.agent_id)
            .env("FLEET_AGENT_TYPE", &spec.agent_type)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{}` for agent {}", program, spec.agent_id))?;

        info!(
            agent_id = %spec.agent_id,
            pid = child.id().unwrap_or_default(),
            program = %program,
            "Agent process launched"
        );
        self.children.insert(spec.agent_id.clone(), child);
        Ok(())
    }

    async fn terminate(&self, agent_id: &str) -> Result<()> {
        if self.external.remove(agent_id).is_some() {
            return Ok(());
        }
        let Some((_, mut child)) = self.children.remove(agent_id) else {
            return Ok(());
        };

        child
            .start_kill()
            .with_context(|| format!("failed to signal agent {}", agent_id))?;
        match tokio::time::timeout(KILL_WAIT, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(agent_id = %agent_id, status = %status, "Agent process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(e).with_context(|| format!("failed to reap agent {}", agent_id)),
            Err(_) => {
                warn!(agent_id = %agent_id, "Agent process did not exit after kill");
                Ok(())
            }
        }
    }

    async fn probe(&self, agent_id: &str) -> Result<ProbeResult> {
        if self.external.contains(agent_id) {
            return Ok(ProbeResult::healthy());
        }
        let mut child = self
            .children
            .get_mut(agent_id)
            .ok_or_else(|| anyhow!("agent {} is not running", agent_id))?;

        Ok(match child.try_wait() {
            Ok(None) => ProbeResult::healthy(),
            Ok(Some(status)) => ProbeResult::unhealthy(format!("process exited with {}", status)),
            Err(e) => ProbeResult::unhealthy(format!("failed to poll process: {}", e)),
        })
    }
}
