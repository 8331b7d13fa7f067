//! Recurring reservation schedules
//!
//! A schedule holds a request and a repeating window. When a window opens
//! the allocator places a reservation that lives for the window's length;
//! windows missed while the process was busy are skipped, not replayed.

use super::AllocationRequest;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a caller asks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceSpec {
    pub request: AllocationRequest,
    /// Opening of the first window
    pub first_start: DateTime<Utc>,
    /// Time between window openings
    pub every_secs: u64,
    /// Length of each window
    pub window_secs: u64,
}

impl RecurrenceSpec {
    pub fn every(&self) -> Duration {
        Duration::from_secs(self.every_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// A registered schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringSchedule {
    pub id: String,
    pub spec: RecurrenceSpec,
    pub next_start: DateTime<Utc>,
    /// Reservation placed for the window that is currently open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_reservation: Option<String>,
    pub windows_placed: u64,
    pub windows_missed: u64,
}

impl RecurringSchedule {
    pub fn new(id: String, spec: RecurrenceSpec) -> Self {
        Self {
            id,
            next_start: spec.first_start,
            spec,
            active_reservation: None,
            windows_placed: 0,
            windows_missed: 0,
        }
    }

    /// The window open at `now`, if one is due. Advances `next_start` past
    /// `now` and returns when the window closes.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now < self.next_start {
            return None;
        }
        let every = ChronoDuration::seconds(self.spec.every_secs.max(1) as i64);
        let window = ChronoDuration::seconds(self.spec.window_secs as i64);

        let mut start = self.next_start;
        while start + every <= now {
            start += every;
            self.windows_missed += 1;
        }
        self.next_start = start + every;

        let closes = start + window;
        if closes <= now {
            // The latest window already closed
            self.windows_missed += 1;
            return None;
        }
        Some(closes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceVector;

    fn schedule(first_start: DateTime<Utc>) -> RecurringSchedule {
        RecurringSchedule::new(
            "sched-1".to_string(),
            RecurrenceSpec {
                request: AllocationRequest::new("batch", ResourceVector::new(100, 1_024)),
                first_start,
                every_secs: 3_600,
                window_secs: 600,
            },
        )
    }

    #[test]
    fn test_window_opens_once() {
        let start = Utc::now();
        let mut s = schedule(start);

        assert!(s.take_due(start - ChronoDuration::seconds(1)).is_none());

        let closes = s.take_due(start + ChronoDuration::seconds(10)).unwrap();
        assert_eq!(closes, start + ChronoDuration::seconds(600));
        assert_eq!(s.next_start, start + ChronoDuration::seconds(3_600));

        // Same window is not placed twice
        assert!(s.take_due(start + ChronoDuration::seconds(20)).is_none());
    }

    #[test]
    fn test_missed_windows_are_skipped() {
        let start = Utc::now();
        let mut s = schedule(start);

        // Two and a bit periods later, inside the third window
        let now = start + ChronoDuration::seconds(7_200 + 60);
        let closes = s.take_due(now).unwrap();
        assert_eq!(closes, start + ChronoDuration::seconds(7_200 + 600));
        assert_eq!(s.windows_missed, 2);
        assert_eq!(s.next_start, start + ChronoDuration::seconds(10_800));
    }

    #[test]
    fn test_closed_window_is_not_placed() {
        let start = Utc::now();
        let mut s = schedule(start);
        assert!(s.take_due(start + ChronoDuration::seconds(700)).is_none());
        assert_eq!(s.windows_missed, 1);
    }
}
