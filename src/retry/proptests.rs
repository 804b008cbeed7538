//! Property-based tests for the retry ladder's purity and monotonicity laws.

use super::*;
use chrono::TimeZone;
use chrono_tz::Europe::Rome;
use proptest::prelude::*;

fn arb_instant() -> impl Strategy<Value = DateTime<Utc>> {
    (2020i32..2035, 1u32..=12, 1u32..=28, 0u32..24, 0u32..60).prop_map(|(y, m, d, h, min)| {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    })
}

fn arb_ladder_index() -> impl Strategy<Value = i64> {
    (0i64..=8)
}

proptest! {
    #[test]
    fn next_is_pure(i in arb_ladder_index(), t in arb_instant()) {
        let a = next(i, t, Rome);
        let b = next(i, t, Rome);
        prop_assert_eq!(a.kind, b.kind);
        prop_assert_eq!(a.scheduled_at, b.scheduled_at);
    }

    #[test]
    fn delay_kind_is_monotone_in_t(t1 in arb_instant(), t2 in arb_instant()) {
        let (lo, hi) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
        let a = next(1, lo, Rome);
        let b = next(1, hi, Rome);
        prop_assert!(a.scheduled_at <= b.scheduled_at);
    }

    #[test]
    fn next_occurrence_of_hour_is_monotone_in_t(
        i in prop_oneof![Just(3i64), Just(5), Just(7)],
        t1 in arb_instant(),
        t2 in arb_instant(),
    ) {
        let (lo, hi) = if t1 <= t2 { (t1, t2) } else { (t2, t1) };
        let a = next(i, lo, Rome);
        let b = next(i, hi, Rome);
        prop_assert!(a.scheduled_at <= b.scheduled_at);
    }

    #[test]
    fn next_occurrence_of_hour_is_always_strictly_after_anchor(
        i in prop_oneof![Just(3i64), Just(5), Just(7)],
        t in arb_instant(),
    ) {
        let decision = next(i, t, Rome);
        prop_assert!(decision.scheduled_at > t);
    }

    #[test]
    fn immediate_kind_returns_anchor_unchanged(
        i in prop_oneof![Just(0i64), Just(2), Just(4), Just(6), Just(8)],
        t in arb_instant(),
    ) {
        let decision = next(i, t, Rome);
        prop_assert_eq!(decision.scheduled_at, t);
    }
}
