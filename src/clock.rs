//! UTC <-> civil time zone arithmetic for the retry ladder's wall-clock-anchored slots.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Smallest instant strictly after `now` whose wall-clock hour in `tz` equals
/// `hour` (minute 0). If `now` is already at or past `hour:00` today, returns
/// the next day's occurrence.
pub fn next_occurrence_of_hour(now: DateTime<Utc>, hour: u32, tz: Tz) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    let mut candidate_date = local_now.date_naive();

    loop {
        if let Some(naive) = candidate_date.and_hms_opt(hour, 0, 0) {
            if let Some(candidate) = tz.from_local_datetime(&naive).earliest() {
                if candidate > local_now {
                    return candidate.with_timezone(&Utc);
                }
            }
        }
        candidate_date += Duration::days(1);
    }
}

/// Whether `now`'s wall-clock hour in `tz` falls in `[start_hour, end_hour)`.
pub fn is_within_operating_hours(now: DateTime<Utc>, tz: Tz, start_hour: u32, end_hour: u32) -> bool {
    let hour = now.with_timezone(&tz).hour();
    (start_hour..end_hour).contains(&hour)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Rome;

    #[test]
    fn next_occurrence_after_target_rolls_to_tomorrow() {
        let t = Utc.with_ymd_and_hms(2025, 3, 14, 10, 15, 0).unwrap();
        let next = next_occurrence_of_hour(t, 9, Rome);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 15, 8, 0, 0).unwrap());
    }

    #[test]
    fn next_occurrence_exactly_at_target_rolls_forward_24h() {
        // 2025-03-14 08:00:00Z is exactly 09:00 Rome (UTC+1 that date).
        let t = Utc.with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap();
        let next = next_occurrence_of_hour(t, 9, Rome);
        assert_eq!(next, t + Duration::hours(24));
    }

    #[test]
    fn next_occurrence_before_target_same_day() {
        let t = Utc.with_ymd_and_hms(2025, 3, 14, 6, 0, 0).unwrap();
        let next = next_occurrence_of_hour(t, 9, Rome);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap());
    }

    #[test]
    fn operating_hours_boundaries() {
        let morning = Utc.with_ymd_and_hms(2025, 3, 14, 7, 30, 0).unwrap(); // 08:30 Rome
        let evening = Utc.with_ymd_and_hms(2025, 3, 14, 19, 30, 0).unwrap(); // 20:30 Rome
        assert!(is_within_operating_hours(morning, Rome, 8, 20));
        assert!(!is_within_operating_hours(evening, Rome, 8, 20));
    }
}
