//! Linear trend fitting over percent series
//!
//! Points are `(seconds, percent)` pairs. Timestamps are normalized against
//! the first point before fitting to keep the sums well conditioned.

use crate::models::Trend;

/// Minimum points before a fit means anything
pub const MIN_POINTS: usize = 3;

/// Slope (percent per second) below which a series counts as flat
const STABLE_SLOPE: f64 = 0.001;

/// Least-squares fit of a series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    /// Percent per second
    pub slope: f64,
    /// Fitted value at the first point's time
    pub intercept: f64,
    /// Coefficient of determination
    pub r_squared: f64,
}

impl LinearFit {
    /// Fit `points`; `None` with fewer than [`MIN_POINTS`] or no time spread
    pub fn fit(points: &[(f64, f64)]) -> Option<LinearFit> {
        if points.len() < MIN_POINTS {
            return None;
        }

        let n = points.len() as f64;
        let t0 = points[0].0;

        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_xy = 0.0;
        let mut sum_xx = 0.0;
        for (t, y) in points {
            let x = t - t0;
            sum_x += x;
            sum_y += y;
            sum_xy += x * y;
            sum_xx += x * x;
        }

        let denominator = n * sum_xx - sum_x * sum_x;
        if denominator.abs() < f64::EPSILON {
            return None;
        }

        let slope = (n * sum_xy - sum_x * sum_y) / denominator;
        let intercept = (sum_y - slope * sum_x) / n;

        let mean_y = sum_y / n;
        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        for (t, y) in points {
            let predicted = slope * (t - t0) + intercept;
            ss_res += (y - predicted).powi(2);
            ss_tot += (y - mean_y).powi(2);
        }
        let r_squared = if ss_tot.abs() < f64::EPSILON {
            // A flat series is fitted perfectly by a flat line
            1.0
        } else {
            (1.0 - ss_res / ss_tot).max(0.0)
        };

        Some(LinearFit {
            slope,
            intercept,
            r_squared,
        })
    }

    /// Seconds after the last point until the fit reaches `target`.
    /// `None` when the slope is not positive.
    pub fn seconds_until(&self, points: &[(f64, f64)], target: f64) -> Option<f64> {
        if self.slope <= 0.0 {
            return None;
        }
        let (t0, _) = points.first()?;
        let (t_last, _) = points.last()?;
        let x_last = t_last - t0;
        let current = self.slope * x_last + self.intercept;
        if current >= target {
            return Some(0.0);
        }
        Some((target - current) / self.slope)
    }

    pub fn trend(&self) -> Trend {
        if self.slope > STABLE_SLOPE {
            Trend::Increasing
        } else if self.slope < -STABLE_SLOPE {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

/// Trend label for a series; short series are stable
pub fn trend_of(points: &[(f64, f64)]) -> Trend {
    LinearFit::fit(points)
        .map(|f| f.trend())
        .unwrap_or(Trend::Stable)
}

/// Mean of the trailing `window` values
pub fn moving_average(values: &[f64], window: usize) -> Option<f64> {
    if values.is_empty() || window == 0 {
        return None;
    }
    let tail = &values[values.len().saturating_sub(window)..];
    Some(tail.iter().sum::<f64>() / tail.len() as f64)
}
