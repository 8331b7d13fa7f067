//! Mitigation hints derived from a pressure reading

use super::{PressureLevel, PressureReading};
use crate::models::Dimension;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationKind {
    /// Sample more often and watch the trend
    Observe,
    /// Shrink non-Guaranteed allocations
    Throttle,
    /// Remove replicas, BestEffort first
    ScaleDown,
    /// Move work to a pool with headroom
    Migrate,
    /// Free disk space
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MitigationAction {
    pub dimension: Dimension,
    pub level: PressureLevel,
    pub kind: MitigationKind,
    pub description: String,
    /// Lower runs first
    pub priority: u8,
}

/// Suggest actions for every dimension above normal, most severe first.
///
/// Throttling is always offered before scale-down or migration so the
/// cheapest remedy is tried first.
pub fn mitigation_actions(reading: &PressureReading) -> Vec<MitigationAction> {
    let mut actions = Vec::new();

    for (dimension, level) in &reading.levels {
        let percent = reading.percents.get(dimension).copied().unwrap_or(0.0);
        let severity = 3 - level.rank();
        let push = |actions: &mut Vec<MitigationAction>, kind, step: u8, description: String| {
            actions.push(MitigationAction {
                dimension: *dimension,
                level: *level,
                kind,
                description,
                priority: severity * 10 + step,
            });
        };

        match (level, dimension) {
            (PressureLevel::Normal, _) => {}
            (PressureLevel::Moderate, _) => push(
                &mut actions,
                MitigationKind::Observe,
                0,
                format!("{} at {:.1}%, shorten the sampling interval and watch the trend", dimension, percent),
            ),
            (_, Dimension::Disk) => {
                push(
                    &mut actions,
                    MitigationKind::Cleanup,
                    0,
                    format!("disk at {:.1}%, remove temporary files and rotate logs", percent),
                );
                if *level == PressureLevel::Critical {
                    push(
                        &mut actions,
                        MitigationKind::Migrate,
                        1,
                        "move disk-heavy agents to a pool with free storage".to_string(),
                    );
                }
            }
            (_, _) => {
                push(
                    &mut actions,
                    MitigationKind::Throttle,
                    0,
                    format!(
                        "{} at {:.1}%, throttle BestEffort then Burstable allocations",
                        dimension, percent
                    ),
                );
                if *level == PressureLevel::Critical {
                    push(
                        &mut actions,
                        MitigationKind::ScaleDown,
                        1,
                        format!("scale down BestEffort replicas to relieve {}", dimension),
                    );
                    push(
                        &mut actions,
                        MitigationKind::Migrate,
                        2,
                        format!("migrate {}-heavy agents to a pool with headroom", dimension),
                    );
                }
            }
        }
    }

    actions.sort_by_key(|a| a.priority);
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn reading(levels: &[(Dimension, PressureLevel, f64)]) -> PressureReading {
        let mut lv = BTreeMap::new();
        let mut pc = BTreeMap::new();
        for (d, l, p) in levels {
            lv.insert(*d, *l);
            pc.insert(*d, *p);
        }
        let overall = lv.values().copied().max().unwrap_or(PressureLevel::Normal);
        PressureReading {
            timestamp: Utc::now(),
            levels: lv,
            percents: pc,
            composite_score: 0.5,
            overall,
        }
    }

    #[test]
    fn test_normal_reading_has_no_actions() {
        let r = reading(&[(Dimension::Cpu, PressureLevel::Normal, 10.0)]);
        assert!(mitigation_actions(&r).is_empty());
    }

    #[test]
    fn test_critical_cpu_throttles_before_scaling() {
        let r = reading(&[
            (Dimension::Cpu, PressureLevel::Critical, 95.0),
            (Dimension::Memory, PressureLevel::Moderate, 72.0),
        ]);
        let actions = mitigation_actions(&r);
        let kinds: Vec<MitigationKind> = actions.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                MitigationKind::Throttle,
                MitigationKind::ScaleDown,
                MitigationKind::Migrate,
                MitigationKind::Observe,
            ]
        );
    }

    #[test]
    fn test_disk_pressure_suggests_cleanup() {
        let r = reading(&[(Dimension::Disk, PressureLevel::High, 88.0)]);
        let actions = mitigation_actions(&r);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, MitigationKind::Cleanup);
    }
}
