//! Tier cutoffs and composite weights

use crate::error::{FleetError, FleetResult};
use crate::models::Dimension;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pressure tier, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Normal,
    Moderate,
    High,
    Critical,
}

impl PressureLevel {
    /// Contribution of this tier to the composite score
    pub fn score(&self) -> f64 {
        match self {
            PressureLevel::Normal => 0.2,
            PressureLevel::Moderate => 0.5,
            PressureLevel::High => 0.8,
            PressureLevel::Critical => 1.0,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            PressureLevel::Normal => 0,
            PressureLevel::Moderate => 1,
            PressureLevel::High => 2,
            PressureLevel::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Moderate => "moderate",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }

    /// High or critical
    pub fn is_elevated(&self) -> bool {
        *self >= PressureLevel::High
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Percent cutoffs for one dimension. A value at or above a cutoff is in
/// that tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierThresholds {
    pub moderate: f64,
    pub high: f64,
    pub critical: f64,
}

impl TierThresholds {
    pub const fn new(moderate: f64, high: f64, critical: f64) -> Self {
        Self {
            moderate,
            high,
            critical,
        }
    }

    /// Highest tier whose cutoff is at or below `percent`
    pub fn classify(&self, percent: f64) -> PressureLevel {
        if percent >= self.critical {
            PressureLevel::Critical
        } else if percent >= self.high {
            PressureLevel::High
        } else if percent >= self.moderate {
            PressureLevel::Moderate
        } else {
            PressureLevel::Normal
        }
    }

    /// Cutoff for a tier. Normal starts at zero.
    pub fn cutoff(&self, level: PressureLevel) -> f64 {
        match level {
            PressureLevel::Normal => 0.0,
            PressureLevel::Moderate => self.moderate,
            PressureLevel::High => self.high,
            PressureLevel::Critical => self.critical,
        }
    }

    pub fn validate(&self, dimension: Dimension) -> FleetResult<()> {
        for (tier, value) in [
            ("moderate", self.moderate),
            ("high", self.high),
            ("critical", self.critical),
        ] {
            if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                return Err(FleetError::config(
                    format!("pressure.thresholds.{}.{}", dimension, tier),
                    format!("{} is outside [0, 100]", value),
                ));
            }
        }
        if !(self.moderate < self.high && self.high < self.critical) {
            return Err(FleetError::config(
                format!("pressure.thresholds.{}", dimension),
                format!(
                    "tiers must ascend strictly (moderate {} < high {} < critical {})",
                    self.moderate, self.high, self.critical
                ),
            ));
        }
        Ok(())
    }
}

/// Cutoffs for every dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSet {
    pub cpu: TierThresholds,
    pub memory: TierThresholds,
    pub disk: TierThresholds,
    pub network: TierThresholds,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            cpu: TierThresholds::new(60.0, 75.0, 90.0),
            memory: TierThresholds::new(70.0, 85.0, 95.0),
            disk: TierThresholds::new(75.0, 85.0, 95.0),
            network: TierThresholds::new(60.0, 80.0, 95.0),
        }
    }
}

impl ThresholdSet {
    pub fn get(&self, dimension: Dimension) -> &TierThresholds {
        match dimension {
            Dimension::Cpu => &self.cpu,
            Dimension::Memory => &self.memory,
            Dimension::Disk => &self.disk,
            Dimension::Network => &self.network,
        }
    }

    pub fn set(&mut self, dimension: Dimension, tiers: TierThresholds) {
        match dimension {
            Dimension::Cpu => self.cpu = tiers,
            Dimension::Memory => self.memory = tiers,
            Dimension::Disk => self.disk = tiers,
            Dimension::Network => self.network = tiers,
        }
    }

    pub fn classify(&self, dimension: Dimension, percent: f64) -> PressureLevel {
        self.get(dimension).classify(percent)
    }

    pub fn validate(&self) -> FleetResult<()> {
        for dimension in Dimension::ALL {
            self.get(dimension).validate(dimension)?;
        }
        Ok(())
    }
}

/// Composite score weights. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DimensionWeights {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network: f64,
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            cpu: 0.3,
            memory: 0.3,
            disk: 0.2,
            network: 0.2,
        }
    }
}

impl DimensionWeights {
    const SUM_TOLERANCE: f64 = 1e-6;

    pub fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Cpu => self.cpu,
            Dimension::Memory => self.memory,
            Dimension::Disk => self.disk,
            Dimension::Network => self.network,
        }
    }

    pub fn validate(&self) -> FleetResult<()> {
        for dimension in Dimension::ALL {
            let w = self.get(dimension);
            if !w.is_finite() || !(0.0..=1.0).contains(&w) {
                return Err(FleetError::config(
                    format!("pressure.weights.{}", dimension),
                    format!("{} is outside [0, 1]", w),
                ));
            }
        }
        let sum: f64 = Dimension::ALL.iter().map(|d| self.get(*d)).sum();
        if (sum - 1.0).abs() > Self::SUM_TOLERANCE {
            return Err(FleetError::config(
                "pressure.weights",
                format!("weights must sum to 1.0, got {:.4}", sum),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_series_classification() {
        let tiers = ThresholdSet::default().cpu;
        let levels: Vec<PressureLevel> = [30.0, 45.0, 60.0, 75.0, 90.0]
            .iter()
            .map(|v| tiers.classify(*v))
            .collect();
        assert_eq!(
            levels,
            vec![
                PressureLevel::Normal,
                PressureLevel::Normal,
                PressureLevel::Moderate,
                PressureLevel::High,
                PressureLevel::Critical,
            ]
        );
    }

    #[test]
    fn test_level_ordering_and_scores() {
        assert!(PressureLevel::Critical > PressureLevel::High);
        assert!(PressureLevel::High.is_elevated());
        assert!(!PressureLevel::Moderate.is_elevated());
        assert_eq!(PressureLevel::Normal.score(), 0.2);
        assert_eq!(PressureLevel::Critical.score(), 1.0);
    }

    #[test]
    fn test_thresholds_must_ascend() {
        let bad = TierThresholds::new(80.0, 70.0, 90.0);
        assert!(bad.validate(Dimension::Cpu).is_err());
        let equal = TierThresholds::new(70.0, 70.0, 90.0);
        assert!(equal.validate(Dimension::Cpu).is_err());
    }

    #[test]
    fn test_thresholds_out_of_range() {
        let err = TierThresholds::new(50.0, 70.0, 101.0)
            .validate(Dimension::Memory)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConfigurationInvalid);
        assert!(err.to_string().contains("memory"));
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        assert!(DimensionWeights::default().validate().is_ok());
        let skewed = DimensionWeights {
            cpu: 0.5,
            ..Default::default()
        };
        assert!(skewed.validate().is_err());
    }
}
