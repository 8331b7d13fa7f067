//! Recurring pressure windows
//!
//! Readings at high or critical pressure are bucketed by UTC hour of day. An
//! hour with at least [`MIN_OCCURRENCES`] such readings is reported as a
//! recurring window.

use super::{PressureLevel, PressureReading};
use crate::models::Dimension;
use chrono::Timelike;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Readings needed before an hour counts as a pattern
pub const MIN_OCCURRENCES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PressurePattern {
    /// Hour of day (UTC) the window starts
    pub hour: u32,
    pub occurrences: usize,
    pub peak_level: PressureLevel,
    /// Dimension most often elevated in this window
    pub dominant_dimension: Dimension,
    pub average_composite: f64,
}

#[derive(Default)]
struct Bucket {
    occurrences: usize,
    peak: Option<PressureLevel>,
    composite_sum: f64,
    dimension_hits: BTreeMap<Dimension, usize>,
}

/// Find hour-of-day windows with recurring elevated pressure
pub fn find_patterns<'a>(
    readings: impl IntoIterator<Item = &'a PressureReading>,
) -> Vec<PressurePattern> {
    let mut buckets: BTreeMap<u32, Bucket> = BTreeMap::new();

    for reading in readings {
        if !reading.overall.is_elevated() {
            continue;
        }
        let bucket = buckets.entry(reading.timestamp.hour()).or_default();
        bucket.occurrences += 1;
        bucket.composite_sum += reading.composite_score;
        bucket.peak = Some(bucket.peak.map_or(reading.overall, |p| p.max(reading.overall)));
        for (dimension, level) in &reading.levels {
            if level.is_elevated() {
                *bucket.dimension_hits.entry(*dimension).or_insert(0) += 1;
            }
        }
    }

    buckets
        .into_iter()
        .filter(|(_, b)| b.occurrences >= MIN_OCCURRENCES)
        .filter_map(|(hour, b)| {
            // Ties go to the first dimension in declaration order
            let dominant = b
                .dimension_hits
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                .map(|(d, _)| *d)?;
            Some(PressurePattern {
                hour,
                occurrences: b.occurrences,
                peak_level: b.peak.unwrap_or(PressureLevel::High),
                dominant_dimension: dominant,
                average_composite: b.composite_sum / b.occurrences as f64,
            })
        })
        .collect()
}
