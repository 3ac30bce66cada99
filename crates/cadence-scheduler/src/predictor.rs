//! Next-execution prediction for scheduling patterns.
//!
//! The search rolls calendar fields forward (month, day, hour, minute) using
//! each field's matcher rather than probing every minute, so sparse patterns
//! such as "once a year" resolve in a handful of steps. Each alternative is
//! solved independently and the earliest candidate wins.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{Result, SchedulerError};
use crate::matcher::{days_in_month, is_leap_year, ValueMatcher};
use crate::pattern::{SchedulingPattern, SubPattern};

/// Years searched ahead before an alternative is declared unsatisfiable.
/// Leap-day patterns pinned to a weekday can take 28 years to recur.
const SEARCH_HORIZON_YEARS: i32 = 400;

/// Earliest minute strictly after `from` that matches `pattern`.
///
/// Seconds and sub-seconds of `from` are dropped first, so the result is
/// always minute-aligned. Fails only when no alternative can ever match
/// (e.g. `0 0 30 2 *`).
pub fn next_matching_instant(
    pattern: &SchedulingPattern,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let start = truncate_to_minute(from) + Duration::minutes(1);
    if pattern.matches(start) {
        return Ok(start);
    }

    pattern
        .alternatives()
        .iter()
        .filter_map(|alt| next_for_alternative(alt, start))
        .min()
        .ok_or_else(|| SchedulerError::invalid_pattern(pattern.as_str(), "pattern never matches"))
}

/// Streaming predictor yielding successive matches of one pattern.
///
/// Holds its position between calls, so use one instance per stream and
/// [`next_matching_instant`] for single-shot queries.
#[derive(Debug, Clone)]
pub struct Predictor {
    pattern: SchedulingPattern,
    time: DateTime<Utc>,
}

impl Predictor {
    pub fn new(pattern: SchedulingPattern, start: DateTime<Utc>) -> Self {
        Self {
            pattern,
            time: start,
        }
    }

    /// Advance to the next match and return it.
    pub fn next_matching_instant(&mut self) -> Result<DateTime<Utc>> {
        let next = next_matching_instant(&self.pattern, self.time)?;
        self.time = next;
        Ok(next)
    }

    pub fn pattern(&self) -> &SchedulingPattern {
        &self.pattern
    }
}

impl Iterator for Predictor {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_matching_instant().ok()
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    Utc.timestamp_opt(secs - secs.rem_euclid(60), 0)
        .single()
        .unwrap_or(t)
}

/// Roll `start` forward to the earliest instant satisfying one alternative.
fn next_for_alternative(alt: &SubPattern, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut year = start.year();
    let mut month = start.month();
    let mut day = start.day();
    let mut hour = start.hour();
    let mut minute = start.minute();
    let limit = year + SEARCH_HORIZON_YEARS;

    loop {
        if year > limit {
            return None;
        }

        match first_match(&alt.month, month, 12) {
            None => {
                year += 1;
                month = 1;
                day = 1;
                hour = 0;
                minute = 0;
                continue;
            }
            Some(m) if m != month => {
                month = m;
                day = 1;
                hour = 0;
                minute = 0;
            }
            Some(_) => {}
        }

        // Day-of-month and weekday are re-evaluated against this exact
        // month and year so short months and the L rule resolve correctly.
        let leap = is_leap_year(year);
        let last = days_in_month(month, leap);
        let found = (day..=last).find(|&d| {
            alt.day_of_month.matches_day(d, month, leap)
                && weekday(year, month, d).is_some_and(|w| alt.day_of_week.matches(w))
        });
        match found {
            None => {
                (year, month) = next_month(year, month);
                day = 1;
                hour = 0;
                minute = 0;
                continue;
            }
            Some(d) if d != day => {
                day = d;
                hour = 0;
                minute = 0;
            }
            Some(_) => {}
        }

        match first_match(&alt.hour, hour, 23) {
            None => {
                (year, month, day) = next_day(year, month, day);
                hour = 0;
                minute = 0;
                continue;
            }
            Some(h) if h != hour => {
                hour = h;
                minute = 0;
            }
            Some(_) => {}
        }

        match first_match(&alt.minute, minute, 59) {
            None => {
                minute = 0;
                if hour == 23 {
                    (year, month, day) = next_day(year, month, day);
                    hour = 0;
                } else {
                    hour += 1;
                }
            }
            Some(m) => return Utc.with_ymd_and_hms(year, month, day, hour, m, 0).single(),
        }
    }
}

fn first_match(matcher: &ValueMatcher, from: u32, max: u32) -> Option<u32> {
    (from..=max).find(|v| matcher.matches(*v))
}

fn weekday(year: i32, month: u32, day: u32) -> Option<u32> {
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.weekday().num_days_from_sunday())
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn next_day(year: i32, month: u32, day: u32) -> (i32, u32, u32) {
    if day >= days_in_month(month, is_leap_year(year)) {
        let (y, m) = next_month(year, month);
        (y, m, 1)
    } else {
        (year, month, day + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn next(pattern: &str, from: DateTime<Utc>) -> DateTime<Utc> {
        let p = SchedulingPattern::parse(pattern).unwrap();
        next_matching_instant(&p, from).unwrap()
    }

    /// Minute-by-minute reference search, only usable for dense patterns.
    fn brute_force(p: &SchedulingPattern, from: DateTime<Utc>) -> DateTime<Utc> {
        let mut t = truncate_to_minute(from) + Duration::minutes(1);
        for _ in 0..200_000 {
            if p.matches(t) {
                return t;
            }
            t += Duration::minutes(1);
        }
        panic!("no match within search window for {p}");
    }

    #[test]
    fn every_fifteen_minutes_from_ten_past_seven() {
        assert_eq!(next("*/15 * * * *", at(2026, 3, 10, 10, 7)), at(2026, 3, 10, 10, 15));
    }

    #[test]
    fn result_is_strictly_after_a_matching_start() {
        assert_eq!(next("*/15 * * * *", at(2026, 3, 10, 10, 15)), at(2026, 3, 10, 10, 30));
    }

    #[test]
    fn seconds_are_truncated() {
        let from = Utc.with_ymd_and_hms(2026, 3, 10, 10, 14, 59).unwrap()
            + Duration::milliseconds(500);
        assert_eq!(next("*/15 * * * *", from), at(2026, 3, 10, 10, 15));
        assert_eq!(next("* * * * *", from), at(2026, 3, 10, 10, 15));
    }

    #[test]
    fn weekday_months_skip_summer_gap_and_weekend() {
        // 2025-07-05 is a Saturday; 2025-09-01 is a Monday.
        let from = at(2025, 7, 5, 10, 0);
        assert_eq!(from.weekday(), Weekday::Sat);
        let got = next("0 3 * jan-jun,sep-dec mon-fri", from);
        assert_eq!(got, at(2025, 9, 1, 3, 0));
        assert_eq!(got.weekday(), Weekday::Mon);
    }

    #[test]
    fn day_thirty_one_skips_short_months() {
        assert_eq!(next("0 0 31 * *", at(2026, 4, 1, 0, 0)), at(2026, 5, 31, 0, 0));
        assert_eq!(next("0 0 31 * *", at(2026, 5, 31, 0, 0)), at(2026, 7, 31, 0, 0));
    }

    #[test]
    fn leap_day_rolls_to_next_leap_year() {
        assert_eq!(next("0 0 29 2 *", at(2025, 3, 1, 0, 0)), at(2028, 2, 29, 0, 0));
    }

    #[test]
    fn last_day_follows_leap_years() {
        assert_eq!(next("0 0 L 2 *", at(2024, 2, 28, 12, 0)), at(2024, 2, 29, 0, 0));
        assert_eq!(next("0 0 L 2 *", at(2025, 2, 1, 0, 0)), at(2025, 2, 28, 0, 0));
        assert_eq!(next("0 0 L * *", at(2026, 4, 15, 0, 0)), at(2026, 4, 30, 0, 0));
        assert_eq!(next("0 0 L * *", at(2026, 4, 30, 0, 0)), at(2026, 5, 31, 0, 0));
    }

    #[test]
    fn leap_day_on_a_weekday_is_found_far_ahead() {
        let got = next("0 0 29 2 mon", at(2026, 1, 1, 0, 0));
        assert_eq!((got.month(), got.day()), (2, 29));
        assert_eq!(got.weekday(), Weekday::Mon);
    }

    #[test]
    fn impossible_date_is_an_error() {
        let p = SchedulingPattern::parse("0 0 30 2 *").unwrap();
        let err = next_matching_instant(&p, at(2026, 1, 1, 0, 0)).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedulingPattern { .. }));
    }

    #[test]
    fn earliest_alternative_wins() {
        let pattern = "0 12 * * * | 30 6 * * *";
        assert_eq!(next(pattern, at(2026, 1, 1, 7, 0)), at(2026, 1, 1, 12, 0));
        assert_eq!(next(pattern, at(2026, 1, 1, 13, 0)), at(2026, 1, 2, 6, 30));
    }

    #[test]
    fn impossible_alternative_does_not_hide_a_possible_one() {
        assert_eq!(next("0 0 30 2 * | 0 1 * * *", at(2026, 1, 1, 0, 0)), at(2026, 1, 1, 1, 0));
    }

    #[test]
    fn year_rollover() {
        assert_eq!(next("0 0 1 1 *", at(2026, 12, 31, 23, 59)), at(2027, 1, 1, 0, 0));
        assert_eq!(next("59 23 31 12 *", at(2026, 12, 31, 23, 59)), at(2027, 12, 31, 23, 59));
    }

    #[test]
    fn agrees_with_brute_force_on_dense_patterns() {
        let patterns = [
            "*/7 * * * *",
            "5 */3 * * *",
            "0,30 9-17 * * mon-fri",
            "15 22-2 * * *",
            "0 0 * * sat,sun",
            "45 23 L * *",
            "0 8 1,15 * * | 0 20 * * wed",
            "10-20/5 4 * * 0",
        ];
        let starts = [
            at(2026, 1, 1, 0, 0),
            at(2026, 2, 27, 23, 58),
            at(2028, 2, 28, 22, 10),
            at(2026, 10, 18, 13, 37),
            at(2026, 12, 31, 23, 59),
        ];
        for text in patterns {
            let p = SchedulingPattern::parse(text).unwrap();
            for from in starts {
                assert_eq!(
                    next_matching_instant(&p, from).unwrap(),
                    brute_force(&p, from),
                    "pattern {text} from {from}"
                );
            }
        }
    }

    #[test]
    fn predictor_stream_is_strictly_increasing_and_matching() {
        for text in ["*/15 * * * *", "0 3 * jan-jun,sep-dec mon-fri", "0 0 L * *", "0 12 1 */3 *"] {
            let p = SchedulingPattern::parse(text).unwrap();
            let predictor = Predictor::new(p.clone(), at(2026, 10, 18, 13, 37));
            let mut previous = at(2026, 10, 18, 13, 37);
            for t in predictor.take(50) {
                assert!(t > previous, "{text}: {t} not after {previous}");
                assert_eq!(t.second(), 0);
                assert_eq!(t.nanosecond(), 0);
                assert!(p.matches(t), "{text}: {t} does not match");
                previous = t;
            }
        }
    }

    #[test]
    fn predictor_stops_on_unsatisfiable_pattern() {
        let p = SchedulingPattern::parse("0 0 31 4 *").unwrap();
        let mut predictor = Predictor::new(p, at(2026, 1, 1, 0, 0));
        assert!(predictor.next().is_none());
    }
}
