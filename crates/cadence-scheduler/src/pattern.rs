//! Cron-style scheduling patterns.
//!
//! A pattern is one or more alternatives, each with five whitespace-separated
//! fields: `minute hour day-of-month month day-of-week`. Alternatives are
//! joined with `|`, or with a comma directly after the fifth field
//! (`"0 3 * * *,30 4 * * *"`). An instant matches the pattern if it matches
//! any alternative; within one alternative all five fields must match.
//!
//! Field syntax: `*`, `n`, `a-b`, `*/n`, `a-b/n`, `a/n`, and comma lists of
//! those. Months accept `jan`..`dec`, weekdays `sun`..`sat` (0 and 7 are both
//! Sunday). The day-of-month field also accepts `L` for the last day of the
//! month.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::error::{Result, SchedulerError};
use crate::matcher::{is_leap_year, ValueMatcher};

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl Field {
    const ALL: [Field; 5] = [
        Field::Minute,
        Field::Hour,
        Field::DayOfMonth,
        Field::Month,
        Field::DayOfWeek,
    ];

    fn name(self) -> &'static str {
        match self {
            Field::Minute => "minute",
            Field::Hour => "hour",
            Field::DayOfMonth => "day-of-month",
            Field::Month => "month",
            Field::DayOfWeek => "day-of-week",
        }
    }

    /// Inclusive bounds accepted in the pattern text.
    fn bounds(self) -> (u32, u32) {
        match self {
            Field::Minute => (0, 59),
            Field::Hour => (0, 23),
            Field::DayOfMonth => (1, 31),
            Field::Month => (1, 12),
            Field::DayOfWeek => (0, 7),
        }
    }

    /// Bounds that `*` expands to. Differs from `bounds` only for weekdays,
    /// where 7 is an alias of 0.
    fn wildcard_bounds(self) -> (u32, u32) {
        match self {
            Field::DayOfWeek => (0, 6),
            other => other.bounds(),
        }
    }

    fn parse_value(self, token: &str) -> std::result::Result<u32, String> {
        if let Ok(n) = token.parse::<u32>() {
            let (min, max) = self.bounds();
            if n < min || n > max {
                return Err(format!(
                    "{} value {n} out of range {min}-{max}",
                    self.name()
                ));
            }
            return Ok(n);
        }
        let lower = token.to_ascii_lowercase();
        let named = match self {
            Field::Month => MONTH_NAMES
                .iter()
                .position(|m| *m == lower)
                .map(|i| i as u32 + 1),
            Field::DayOfWeek => WEEKDAY_NAMES
                .iter()
                .position(|d| *d == lower)
                .map(|i| i as u32),
            _ => None,
        };
        named.ok_or_else(|| format!("invalid {} value '{token}'", self.name()))
    }
}

/// One full five-field alternative of a [`SchedulingPattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubPattern {
    pub minute: ValueMatcher,
    pub hour: ValueMatcher,
    pub day_of_month: ValueMatcher,
    pub month: ValueMatcher,
    pub day_of_week: ValueMatcher,
}

impl SubPattern {
    fn parse(fields: &[String], pattern: &str) -> Result<Self> {
        let mut matchers = Vec::with_capacity(5);
        for (field, text) in Field::ALL.iter().zip(fields) {
            let matcher = parse_field(*field, text)
                .map_err(|reason| SchedulerError::invalid_pattern(pattern, reason))?;
            matchers.push(matcher);
        }
        let mut it = matchers.into_iter();
        // five fields are guaranteed by split_alternatives
        match (it.next(), it.next(), it.next(), it.next(), it.next()) {
            (Some(minute), Some(hour), Some(day_of_month), Some(month), Some(day_of_week)) => {
                Ok(Self {
                    minute,
                    hour,
                    day_of_month,
                    month,
                    day_of_week,
                })
            }
            _ => Err(SchedulerError::invalid_pattern(pattern, "expected 5 fields")),
        }
    }

    /// Test the calendar fields of a date-time. `weekday` counts from Sunday = 0.
    pub fn matches_fields(
        &self,
        year: i32,
        month: u32,
        day: u32,
        hour: u32,
        minute: u32,
        weekday: u32,
    ) -> bool {
        self.minute.matches(minute)
            && self.hour.matches(hour)
            && self.day_of_month.matches_day(day, month, is_leap_year(year))
            && self.month.matches(month)
            && self.day_of_week.matches(weekday)
    }

    pub fn matches(&self, instant: DateTime<Utc>) -> bool {
        self.matches_fields(
            instant.year(),
            instant.month(),
            instant.day(),
            instant.hour(),
            instant.minute(),
            instant.weekday().num_days_from_sunday(),
        )
    }
}

/// A parsed, immutable scheduling pattern.
#[derive(Debug, Clone)]
pub struct SchedulingPattern {
    text: String,
    alternatives: Vec<SubPattern>,
}

impl SchedulingPattern {
    /// Parse pattern text. Any malformed field fails the whole pattern.
    pub fn parse(text: &str) -> Result<Self> {
        let alternatives = split_alternatives(text)?
            .iter()
            .map(|fields| SubPattern::parse(fields, text))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            text: text.trim().to_string(),
            alternatives,
        })
    }

    /// Check pattern text without keeping the result.
    pub fn validate(text: &str) -> Result<()> {
        Self::parse(text).map(|_| ())
    }

    /// True if the instant (minute precision) matches any alternative.
    pub fn matches(&self, instant: DateTime<Utc>) -> bool {
        self.alternatives.iter().any(|alt| alt.matches(instant))
    }

    pub fn alternatives(&self) -> &[SubPattern] {
        &self.alternatives
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for SchedulingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for SchedulingPattern {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Break pattern text into alternatives of exactly five field tokens.
fn split_alternatives(text: &str) -> Result<Vec<Vec<String>>> {
    let mut alternatives = Vec::new();

    for chunk in text.split('|') {
        let tokens: Vec<&str> = chunk.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(SchedulerError::invalid_pattern(text, "empty pattern"));
        }

        let mut current: Vec<String> = Vec::with_capacity(5);
        for (i, token) in tokens.iter().enumerate() {
            current.push((*token).to_string());
            if current.len() < 5 {
                continue;
            }
            let more_follow = i + 1 < tokens.len();
            if more_follow {
                // The fifth token must carry the comma that starts the next alternative.
                let fifth = current.pop().unwrap_or_default();
                let Some(pos) = fifth.rfind(',') else {
                    return Err(SchedulerError::invalid_pattern(
                        text,
                        format!("expected 5 fields, found extra token after '{fifth}'"),
                    ));
                };
                let (head, rest) = (&fifth[..pos], &fifth[pos + 1..]);
                if head.is_empty() {
                    return Err(SchedulerError::invalid_pattern(text, "empty day-of-week field"));
                }
                current.push(head.to_string());
                alternatives.push(std::mem::take(&mut current));
                if !rest.is_empty() {
                    current.push(rest.to_string());
                }
            } else {
                alternatives.push(std::mem::take(&mut current));
            }
        }

        if !current.is_empty() {
            return Err(SchedulerError::invalid_pattern(
                text,
                format!("expected 5 fields, got {}", current.len()),
            ));
        }
    }

    Ok(alternatives)
}

fn parse_field(field: Field, text: &str) -> std::result::Result<ValueMatcher, String> {
    if text == "*" {
        return Ok(ValueMatcher::AlwaysTrue);
    }

    let mut values = BTreeSet::new();
    let mut last_day = false;

    for part in text.split(',') {
        if part.is_empty() {
            return Err(format!("empty element in {} field '{text}'", field.name()));
        }
        if field == Field::DayOfMonth && part.eq_ignore_ascii_case("l") {
            last_day = true;
            continue;
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in {} field", field.name()))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", field.name()));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (from, to) = if range == "*" {
            field.wildcard_bounds()
        } else if let Some((a, b)) = range.split_once('-') {
            if a.is_empty() || b.is_empty() {
                return Err(format!("malformed range '{range}' in {} field", field.name()));
            }
            (field.parse_value(a)?, field.parse_value(b)?)
        } else {
            let v = field.parse_value(range)?;
            if part.contains('/') {
                (v, field.wildcard_bounds().1)
            } else {
                (v, v)
            }
        };

        expand(field, from, to, step, &mut values);
    }

    if field == Field::DayOfWeek && values.remove(&7) {
        values.insert(0);
    }

    Ok(match field {
        Field::DayOfMonth => ValueMatcher::DayOfMonthSet {
            days: values,
            last_day,
        },
        _ => ValueMatcher::IntSet(values),
    })
}

/// Insert `from..=to` stepping by `step`, wrapping past the field maximum when
/// `from > to` (e.g. hours `22-2`). Weekdays wrap over seven days, with 7
/// read as Sunday.
fn expand(field: Field, mut from: u32, mut to: u32, step: u32, values: &mut BTreeSet<u32>) {
    let (min, mut max) = field.bounds();
    if field == Field::DayOfWeek {
        if from == 7 {
            from = 0;
            if to == 7 {
                to = 0;
            }
        }
        max = 6;
    }
    let span = if from <= to {
        to - from
    } else {
        (max - from) + 1 + (to - min)
    };
    let width = max - min + 1;
    let mut offset = 0;
    while offset <= span {
        let v = min + (from - min + offset) % width;
        values.insert(v);
        offset += step;
    }
}
