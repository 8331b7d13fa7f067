use crate::error::{FleetError, FleetResult};
use crate::models::Shortage;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
    To,
}

impl ScaleDirection {
    pub const CHOICES: [&'static str; 3] = ["up", "down", "to"];
}

impl FromStr for ScaleDirection {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(ScaleDirection::Up),
            "down" => Ok(ScaleDirection::Down),
            "to" => Ok(ScaleDirection::To),
            other => Err(FleetError::invalid_choice(
                format!("unknown scale direction '{}'", other),
                "agent scale <id> up|down|to <n>",
                &Self::CHOICES,
            )),
        }
    }
}

/// `up` and `down` move by `replicas` (default 1), `to` sets the count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub direction: ScaleDirection,
    #[serde(default)]
    pub replicas: Option<u32>,
}

impl ScaleRequest {
    pub fn up(by: u32) -> Self {
        Self {
            direction: ScaleDirection::Up,
            replicas: Some(by),
        }
    }

    pub fn down(by: u32) -> Self {
        Self {
            direction: ScaleDirection::Down,
            replicas: Some(by),
        }
    }

    pub fn to(replicas: u32) -> Self {
        Self {
            direction: ScaleDirection::To,
            replicas: Some(replicas),
        }
    }

    /// Replica count this request asks for, starting from `current`
    pub fn target(&self, current: u32) -> FleetResult<u32> {
        let target = match self.direction {
            ScaleDirection::Up => current.saturating_add(self.replicas.unwrap_or(1)),
            ScaleDirection::Down => current.saturating_sub(self.replicas.unwrap_or(1)),
            ScaleDirection::To => self.replicas.ok_or_else(|| {
                FleetError::invalid_choice(
                    "scale to requires a replica count",
                    "agent scale <id> to <n>",
                    &[],
                )
            })?,
        };
        if target == 0 {
            return Err(FleetError::invalid_request(
                "a replica group cannot scale below one replica; destroy the agent instead",
            ));
        }
        Ok(target)
    }
}

/// Outcome of a scale operation. On failure `to_replicas` equals
/// `from_replicas`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleResult {
    pub success: bool,
    pub from_replicas: u32,
    pub to_replicas: u32,
    pub requested_replicas: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortage: Option<Shortage>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_targets() {
        assert_eq!(ScaleRequest::to(3).target(2).unwrap(), 3);
        assert_eq!(ScaleRequest::up(2).target(2).unwrap(), 4);
        assert_eq!(ScaleRequest::down(1).target(2).unwrap(), 1);

        let default_step = ScaleRequest {
            direction: ScaleDirection::Up,
            replicas: None,
        };
        assert_eq!(default_step.target(1).unwrap(), 2);
    }

    #[test]
    fn test_scale_to_zero_rejected() {
        let err = ScaleRequest::to(0).target(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert!(ScaleRequest::down(5).target(2).is_err());
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("UP".parse::<ScaleDirection>().unwrap(), ScaleDirection::Up);
        let err = "sideways".parse::<ScaleDirection>().unwrap_err();
        match err {
            FleetError::InvalidRequest { accepted, .. } => assert_eq!(accepted.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }
}
