//! Edge-triggered pressure alerts with cool-down de-duplication
//!
//! An alert fires only when the overall level rises past a tier boundary.
//! Repeated rises to the same tier inside the cool-down window are
//! suppressed, so a value oscillating around a cutoff does not produce an
//! alert storm. Timing uses reading timestamps rather than the wall clock so
//! batch classification of historical snapshots behaves the same as live
//! classification.

use super::{PressureLevel, PressureReading};
use crate::models::Dimension;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A fired alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressureAlert {
    pub timestamp: DateTime<Utc>,
    pub previous: PressureLevel,
    pub level: PressureLevel,
    pub composite_score: f64,
    /// Dimensions at the new overall level
    pub dimensions: Vec<Dimension>,
}

/// Alert state machine
#[derive(Debug)]
pub struct Alerter {
    cooldown: Duration,
    last_level: PressureLevel,
    last_fired: HashMap<PressureLevel, DateTime<Utc>>,
    suppressed: u64,
}

impl Alerter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_level: PressureLevel::Normal,
            last_fired: HashMap::new(),
            suppressed: 0,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    /// Number of rising edges swallowed by the cool-down
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed
    }

    /// Feed a reading; returns an alert when one should fire
    pub fn evaluate(&mut self, reading: &PressureReading) -> Option<PressureAlert> {
        let previous = self.last_level;
        self.last_level = reading.overall;

        if reading.overall <= previous || reading.overall == PressureLevel::Normal {
            return None;
        }

        if self.in_cooldown(reading.overall, reading.timestamp) {
            self.suppressed += 1;
            return None;
        }

        self.last_fired.insert(reading.overall, reading.timestamp);
        self.prune(reading.timestamp);

        Some(PressureAlert {
            timestamp: reading.timestamp,
            previous,
            level: reading.overall,
            composite_score: reading.composite_score,
            dimensions: reading.dimensions_at(reading.overall),
        })
    }

    fn in_cooldown(&self, level: PressureLevel, at: DateTime<Utc>) -> bool {
        match self.last_fired.get(&level) {
            Some(fired) => match (at - *fired).to_std() {
                Ok(elapsed) => elapsed < self.cooldown,
                // Reading older than the last alert
                Err(_) => true,
            },
            None => false,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cooldown = self.cooldown;
        self.last_fired.retain(|_, fired| {
            (now - *fired)
                .to_std()
                .map(|elapsed| elapsed < cooldown)
                .unwrap_or(true)
        });
    }
}
