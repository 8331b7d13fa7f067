//! Error taxonomy shared by the fleet components
//!
//! Every user-visible failure pairs a human-readable message with a stable
//! machine-readable kind so callers can self-correct.

use crate::models::Shortage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the platform adapters
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("sampling {what} is not supported on {platform}")]
    Unsupported { platform: String, what: String },

    #[error("command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("failed to parse {source_name}: {reason}")]
    Parse { source_name: String, reason: String },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl PlatformError {
    pub fn parse(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        PlatformError::Parse {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        PlatformError::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Collapse into the two kinds callers are told about
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlatformError::Unsupported { .. } => ErrorKind::PlatformUnsupported,
            _ => ErrorKind::CommandFailed,
        }
    }
}

/// Machine-readable error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PlatformUnsupported,
    CommandFailed,
    InsufficientResources,
    ReservationNotFound,
    ReservationExpired,
    StateDriftDetected,
    AgentNotFound,
    AgentUnhealthy,
    UnknownAgentType,
    OperationInProgress,
    ConfigurationInvalid,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PlatformUnsupported => "platform_unsupported",
            ErrorKind::CommandFailed => "command_failed",
            ErrorKind::InsufficientResources => "insufficient_resources",
            ErrorKind::ReservationNotFound => "reservation_not_found",
            ErrorKind::ReservationExpired => "reservation_expired",
            ErrorKind::StateDriftDetected => "state_drift_detected",
            ErrorKind::AgentNotFound => "agent_not_found",
            ErrorKind::AgentUnhealthy => "agent_unhealthy",
            ErrorKind::UnknownAgentType => "unknown_agent_type",
            ErrorKind::OperationInProgress => "operation_in_progress",
            ErrorKind::ConfigurationInvalid => "configuration_invalid",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Domain errors surfaced by the allocator, lifecycle manager and controller
#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("insufficient resources: {reason} (short by {shortage})")]
    InsufficientResources { reason: String, shortage: Shortage },

    #[error("reservation {0} not found")]
    ReservationNotFound(String),

    #[error("reservation {0} has expired")]
    ReservationExpired(String),

    #[error("allocator state drift detected in pool {pool}: {detail}")]
    StateDriftDetected { pool: String, detail: String },

    #[error("agent {0} not found")]
    AgentNotFound(String),

    #[error("agent {id} is unhealthy and could not be replaced: {reason}")]
    AgentUnhealthy { id: String, reason: String },

    #[error("unknown agent type '{agent_type}'")]
    UnknownAgentType {
        agent_type: String,
        known: Vec<String>,
    },

    #[error("an operation is already in progress for agent {0}")]
    OperationInProgress(String),

    #[error("invalid configuration for '{field}': {reason}")]
    ConfigurationInvalid { field: String, reason: String },

    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        usage: Option<String>,
        accepted: Vec<String>,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FleetError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        FleetError::ConfigurationInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        FleetError::InvalidRequest {
            message: message.into(),
            usage: None,
            accepted: Vec::new(),
        }
    }

    pub fn invalid_choice(
        message: impl Into<String>,
        usage: impl Into<String>,
        accepted: &[&str],
    ) -> Self {
        FleetError::InvalidRequest {
            message: message.into(),
            usage: Some(usage.into()),
            accepted: accepted.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Platform(e) => e.kind(),
            FleetError::InsufficientResources { .. } => ErrorKind::InsufficientResources,
            FleetError::ReservationNotFound(_) => ErrorKind::ReservationNotFound,
            FleetError::ReservationExpired(_) => ErrorKind::ReservationExpired,
            FleetError::StateDriftDetected { .. } => ErrorKind::StateDriftDetected,
            FleetError::AgentNotFound(_) => ErrorKind::AgentNotFound,
            FleetError::AgentUnhealthy { .. } => ErrorKind::AgentUnhealthy,
            FleetError::UnknownAgentType { .. } => ErrorKind::UnknownAgentType,
            FleetError::OperationInProgress(_) => ErrorKind::OperationInProgress,
            FleetError::ConfigurationInvalid { .. } => ErrorKind::ConfigurationInvalid,
            FleetError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            FleetError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Shortage carried by an InsufficientResources error
    pub fn shortage(&self) -> Option<&Shortage> {
        match self {
            FleetError::InsufficientResources { shortage, .. } => Some(shortage),
            _ => None,
        }
    }

    /// Render as the `{error, message, ...context}` shape
    pub fn to_response(&self) -> ErrorResponse {
        let mut context = Map::new();
        match self {
            FleetError::InsufficientResources { reason, shortage } => {
                context.insert("reason".to_string(), json!(reason));
                context.insert("shortage".to_string(), json!(shortage));
            }
            FleetError::ReservationNotFound(id) | FleetError::ReservationExpired(id) => {
                context.insert("reservationId".to_string(), json!(id));
            }
            FleetError::AgentNotFound(id) | FleetError::OperationInProgress(id) => {
                context.insert("agentId".to_string(), json!(id));
            }
            FleetError::AgentUnhealthy { id, reason } => {
                context.insert("agentId".to_string(), json!(id));
                context.insert("reason".to_string(), json!(reason));
            }
            FleetError::UnknownAgentType { agent_type, known } => {
                context.insert("agentType".to_string(), json!(agent_type));
                context.insert("acceptedValues".to_string(), json!(known));
            }
            FleetError::ConfigurationInvalid { field, .. } => {
                context.insert("field".to_string(), json!(field));
            }
            FleetError::StateDriftDetected { pool, .. } => {
                context.insert("pool".to_string(), json!(pool));
            }
            FleetError::InvalidRequest {
                usage, accepted, ..
            } => {
                if let Some(usage) = usage {
                    context.insert("usage".to_string(), json!(usage));
                }
                if !accepted.is_empty() {
                    context.insert("acceptedValues".to_string(), json!(accepted));
                }
            }
            FleetError::Platform(_) | FleetError::Internal(_) => {}
        }

        ErrorResponse {
            error: self.kind(),
            message: self.to_string(),
            context,
        }
    }
}

/// Serialized error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorKind,
    pub message: String,
    #[serde(flatten)]
    pub context: Map<String, Value>,
}

pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Dimension;

    #[test]
    fn test_insufficient_resources_response_carries_shortage() {
        let mut shortage = Shortage::default();
        shortage.insert(Dimension::Cpu, 100);

        let err = FleetError::InsufficientResources {
            reason: "pool local cannot satisfy request".to_string(),
            shortage,
        };
        let body = serde_json::to_value(err.to_response()).unwrap();

        assert_eq!(body["error"], "insufficient_resources");
        assert_eq!(body["shortage"]["cpu"], 100);
        assert!(body["message"].as_str().unwrap().contains("insufficient"));
    }

    #[test]
    fn test_invalid_choice_lists_accepted_values() {
        let err = FleetError::invalid_choice(
            "unknown strategy 'fast'",
            "resource optimize --strategy <conservative|balanced|aggressive>",
            &["conservative", "balanced", "aggressive"],
        );
        let body = serde_json::to_value(err.to_response()).unwrap();

        assert_eq!(body["error"], "invalid_request");
        assert_eq!(body["acceptedValues"].as_array().unwrap().len(), 3);
        assert!(body["usage"].as_str().is_some());
    }

    #[test]
    fn test_platform_error_kinds() {
        let unsupported = PlatformError::Unsupported {
            platform: "linux".to_string(),
            what: "gpu".to_string(),
        };
        assert_eq!(unsupported.kind(), ErrorKind::PlatformUnsupported);
        assert_eq!(
            PlatformError::command_failed("df", "exit 1").kind(),
            ErrorKind::CommandFailed
        );
    }
}
