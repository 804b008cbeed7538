//! The fixed retry ladder: a pure function from retry index and anchor clock
//! to the next scheduled instant.

#[cfg(test)]
#[path = "retry/proptests.rs"]
mod proptests;

use crate::clock;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

/// Default length of the retry ladder; attempt_index must stay below this.
pub const MAX_ATTEMPTS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    Immediate,
    Delay,
    NextOccurrenceOfHour,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryDecision {
    pub kind: DelayKind,
    pub scheduled_at: DateTime<Utc>,
}

/// `next(i, now)`: given the retry index `i` (0-based, counts retries past
/// the initial attempt, so `i` equals the attempt-index the *failing* call
/// just completed) and anchor clock `now`, returns the next scheduled
/// instant per the fixed ladder. Pure: same inputs always produce the same
/// output, and `i` is expected to be in `0..MAX_ATTEMPTS - 1` (callers check
/// [`is_exhausted`] first).
pub fn next(i: i64, now: DateTime<Utc>, civil_tz: Tz) -> RetryDecision {
    match i {
        0 | 2 | 4 | 6 | 8 => RetryDecision {
            kind: DelayKind::Immediate,
            scheduled_at: now,
        },
        1 => RetryDecision {
            kind: DelayKind::Delay,
            scheduled_at: now + Duration::hours(1),
        },
        3 => RetryDecision {
            kind: DelayKind::NextOccurrenceOfHour,
            scheduled_at: clock::next_occurrence_of_hour(now, 9, civil_tz),
        },
        5 => RetryDecision {
            kind: DelayKind::NextOccurrenceOfHour,
            scheduled_at: clock::next_occurrence_of_hour(now, 14, civil_tz),
        },
        7 => RetryDecision {
            kind: DelayKind::NextOccurrenceOfHour,
            scheduled_at: clock::next_occurrence_of_hour(now, 19, civil_tz),
        },
        other => panic!("retry index {other} out of range 0..=8"),
    }
}

/// A forced-immediate override for callers re-attempting after a transient
/// infrastructure error (bypasses the ladder table entirely).
pub fn forced_immediate(now: DateTime<Utc>) -> RetryDecision {
    RetryDecision {
        kind: DelayKind::Immediate,
        scheduled_at: now,
    }
}

/// Whether `attempt_index` has exhausted the ladder: no further retry should
/// be scheduled and a terminal observability event should fire instead.
pub fn is_exhausted(attempt_index: i64) -> bool {
    attempt_index >= MAX_ATTEMPTS - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Rome;

    #[test]
    fn ladder_matches_table() {
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(next(0, t, Rome).kind, DelayKind::Immediate);
        assert_eq!(next(1, t, Rome).kind, DelayKind::Delay);
        assert_eq!(next(2, t, Rome).kind, DelayKind::Immediate);
        assert_eq!(next(3, t, Rome).kind, DelayKind::NextOccurrenceOfHour);
        assert_eq!(next(4, t, Rome).kind, DelayKind::Immediate);
        assert_eq!(next(5, t, Rome).kind, DelayKind::NextOccurrenceOfHour);
        assert_eq!(next(6, t, Rome).kind, DelayKind::Immediate);
        assert_eq!(next(7, t, Rome).kind, DelayKind::NextOccurrenceOfHour);
        assert_eq!(next(8, t, Rome).kind, DelayKind::Immediate);
    }

    #[test]
    fn immediate_decisions_use_anchor_clock_unchanged() {
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(next(0, t, Rome).scheduled_at, t);
    }

    #[test]
    fn delay_decision_adds_one_hour() {
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(next(1, t, Rome).scheduled_at, t + Duration::hours(1));
    }

    #[test]
    fn exhaustion_boundary() {
        assert!(!is_exhausted(8));
        assert!(is_exhausted(9));
        assert!(is_exhausted(10));
    }
}
