//! Per-field predicates for scheduling patterns.
//!
//! A [`ValueMatcher`] answers one question: does this calendar field value
//! satisfy the parsed rule? Matchers are immutable once built, so a parsed
//! pattern can be shared freely between threads.

use std::collections::BTreeSet;

/// Predicate over a single calendar field (minute, hour, day, month, weekday).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueMatcher {
    /// The field was `*`.
    AlwaysTrue,
    /// Explicit values expanded from lists, ranges and steps.
    IntSet(BTreeSet<u32>),
    /// Day-of-month values plus the optional `L` (last day of month) rule.
    DayOfMonthSet { days: BTreeSet<u32>, last_day: bool },
}

impl ValueMatcher {
    /// Test a field value against the literal rule.
    ///
    /// For [`ValueMatcher::DayOfMonthSet`] this ignores the `L` rule, which
    /// needs the month and year; use [`ValueMatcher::matches_day`] for days.
    pub fn matches(&self, value: u32) -> bool {
        match self {
            ValueMatcher::AlwaysTrue => true,
            ValueMatcher::IntSet(values) => values.contains(&value),
            ValueMatcher::DayOfMonthSet { days, .. } => days.contains(&value),
        }
    }

    /// Test a day-of-month value in the context of its month and year.
    ///
    /// Matches when the day is listed literally, or when the `L` rule is set
    /// and `day` is the true last day of `month` (leap-year aware).
    pub fn matches_day(&self, day: u32, month: u32, leap_year: bool) -> bool {
        match self {
            ValueMatcher::DayOfMonthSet { days, last_day } => {
                days.contains(&day) || (*last_day && day == days_in_month(month, leap_year))
            }
            other => other.matches(day),
        }
    }

    pub fn is_always_true(&self) -> bool {
        matches!(self, ValueMatcher::AlwaysTrue)
    }
}

/// Gregorian leap-year rule.
pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Number of days in `month` (1..=12).
pub fn days_in_month(month: u32, leap_year: bool) -> u32 {
    match month {
        2 if leap_year => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}
