//! Recurrence rules for scheduled tasks.
//!
//! An [`Interval`] turns a reference time (usually the moment a task last
//! finished) into the time the task should run next. Rules are stored in the
//! registry in their textual form, e.g. `30s`, `daily@03:30`,
//! `weekly@mon 03:30` or `cron:0 */5 * * * *`.

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * 60;
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Errors produced while building an [`Interval`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalParseError {
    #[error("interval is empty")]
    Empty,
    #[error("interval period must be at least one second")]
    ZeroPeriod,
    #[error("invalid period '{0}', expected <number><s|m|h|d>")]
    InvalidPeriod(String),
    #[error("invalid time of day '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("invalid weekday '{0}'")]
    InvalidWeekday(String),
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("cron expression '{0}' has no upcoming occurrence")]
    ExhaustedCron(String),
}

/// A parsed cron expression (seconds field included).
#[derive(Clone)]
pub struct CronRule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronRule {
    pub fn parse(expression: &str) -> Result<Self, IntervalParseError> {
        let expression = expression.trim();
        let schedule =
            cron::Schedule::from_str(expression).map_err(|e| IntervalParseError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        if schedule.upcoming(Utc).next().is_none() {
            return Err(IntervalParseError::ExhaustedCron(expression.to_string()));
        }
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl fmt::Debug for CronRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronRule").field(&self.expression).finish()
    }
}

impl PartialEq for CronRule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for CronRule {}

/// Rule computing the next execution time of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    /// Fixed period after the reference time.
    Every(Duration),
    /// Once a day at the given UTC time.
    Daily { at: NaiveTime },
    /// Once a week on the given day at the given UTC time.
    Weekly { weekday: Weekday, at: NaiveTime },
    /// Calendar rule expressed as a cron expression.
    Cron(CronRule),
}

impl Interval {
    /// Fixed period rule. Periods are kept at whole-second precision.
    pub fn every(period: Duration) -> Result<Self, IntervalParseError> {
        if period.as_secs() == 0 {
            return Err(IntervalParseError::ZeroPeriod);
        }
        Ok(Interval::Every(Duration::from_secs(period.as_secs())))
    }

    pub fn every_secs(secs: u64) -> Result<Self, IntervalParseError> {
        Self::every(Duration::from_secs(secs))
    }

    pub fn daily(hour: u32, minute: u32) -> Result<Self, IntervalParseError> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| IntervalParseError::InvalidTime(format!("{hour:02}:{minute:02}")))?;
        Ok(Interval::Daily { at })
    }

    pub fn weekly(weekday: Weekday, hour: u32, minute: u32) -> Result<Self, IntervalParseError> {
        let at = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| IntervalParseError::InvalidTime(format!("{hour:02}:{minute:02}")))?;
        Ok(Interval::Weekly { weekday, at })
    }

    pub fn cron(expression: &str) -> Result<Self, IntervalParseError> {
        CronRule::parse(expression).map(Interval::Cron)
    }

    /// Time of the next execution strictly after `last`.
    pub fn next(&self, last: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Interval::Every(period) => {
                let delta = TimeDelta::from_std(*period).unwrap_or(TimeDelta::MAX);
                last.checked_add_signed(delta)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            Interval::Daily { at } => {
                let candidate = last.date_naive().and_time(*at).and_utc();
                if candidate > last {
                    candidate
                } else {
                    candidate + TimeDelta::days(1)
                }
            }
            Interval::Weekly { weekday, at } => {
                let days_ahead = (i64::from(weekday.num_days_from_monday())
                    - i64::from(last.weekday().num_days_from_monday()))
                .rem_euclid(7);
                let candidate = (last.date_naive() + TimeDelta::days(days_ahead))
                    .and_time(*at)
                    .and_utc();
                if candidate > last {
                    candidate
                } else {
                    candidate + TimeDelta::days(7)
                }
            }
            // A cron rule that ran out of occurrences keeps the task alive on a daily cadence.
            Interval::Cron(rule) => rule
                .next_after(last)
                .unwrap_or_else(|| last + TimeDelta::days(1)),
        }
    }
}

fn parse_period(s: &str) -> Result<Duration, IntervalParseError> {
    let invalid = || IntervalParseError::InvalidPeriod(s.to_string());
    let unit_at = s.len().checked_sub(1).ok_or_else(invalid)?;
    if !s.is_char_boundary(unit_at) {
        return Err(invalid());
    }
    let (value, unit) = s.split_at(unit_at);
    let value: u64 = value.parse().map_err(|_| invalid())?;
    let multiplier = match unit {
        "s" => 1,
        "m" => SECS_PER_MINUTE,
        "h" => SECS_PER_HOUR,
        "d" => SECS_PER_DAY,
        _ => return Err(invalid()),
    };
    let secs = value.checked_mul(multiplier).ok_or_else(invalid)?;
    Ok(Duration::from_secs(secs))
}

fn parse_time_of_day(s: &str) -> Result<NaiveTime, IntervalParseError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|_| IntervalParseError::InvalidTime(s.to_string()))
}

fn weekday_label(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

impl FromStr for Interval {
    type Err = IntervalParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(IntervalParseError::Empty);
        }

        if let Some(expression) = s.strip_prefix("cron:") {
            return Interval::cron(expression);
        }
        if let Some(time) = s.strip_prefix("daily@") {
            return Ok(Interval::Daily {
                at: parse_time_of_day(time)?,
            });
        }
        if let Some(rest) = s.strip_prefix("weekly@") {
            let (day, time) = rest
                .trim()
                .split_once(' ')
                .ok_or_else(|| IntervalParseError::InvalidTime(rest.to_string()))?;
            let weekday = Weekday::from_str(day)
                .map_err(|_| IntervalParseError::InvalidWeekday(day.to_string()))?;
            return Ok(Interval::Weekly {
                weekday,
                at: parse_time_of_day(time)?,
            });
        }

        Interval::every(parse_period(s)?)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Every(period) => {
                let secs = period.as_secs();
                if secs % SECS_PER_DAY == 0 {
                    write!(f, "{}d", secs / SECS_PER_DAY)
                } else if secs % SECS_PER_HOUR == 0 {
                    write!(f, "{}h", secs / SECS_PER_HOUR)
                } else if secs % SECS_PER_MINUTE == 0 {
                    write!(f, "{}m", secs / SECS_PER_MINUTE)
                } else {
                    write!(f, "{}s", secs)
                }
            }
            Interval::Daily { at } => write!(f, "daily@{}", at.format("%H:%M")),
            Interval::Weekly { weekday, at } => {
                write!(f, "weekly@{} {}", weekday_label(*weekday), at.format("%H:%M"))
            }
            Interval::Cron(rule) => write!(f, "cron:{}", rule.expression()),
        }
    }
}

impl TryFrom<String> for Interval {
    type Error = IntervalParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(interval: Interval) -> Self {
        interval.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parse_periods() {
        assert_eq!(
            "30s".parse::<Interval>().unwrap(),
            Interval::Every(Duration::from_secs(30))
        );
        assert_eq!(
            "15m".parse::<Interval>().unwrap(),
            Interval::Every(Duration::from_secs(900))
        );
        assert_eq!(
            "2h".parse::<Interval>().unwrap(),
            Interval::Every(Duration::from_secs(7200))
        );
        assert_eq!(
            " 1d ".parse::<Interval>().unwrap(),
            Interval::Every(Duration::from_secs(86400))
        );
    }

    #[test]
    fn test_rejects_invalid_rules() {
        assert_eq!("".parse::<Interval>(), Err(IntervalParseError::Empty));
        assert_eq!("0s".parse::<Interval>(), Err(IntervalParseError::ZeroPeriod));
        assert!(matches!(
            "10x".parse::<Interval>(),
            Err(IntervalParseError::InvalidPeriod(_))
        ));
        assert!(matches!(
            "s".parse::<Interval>(),
            Err(IntervalParseError::InvalidPeriod(_))
        ));
        assert!(matches!(
            "daily@25:00".parse::<Interval>(),
            Err(IntervalParseError::InvalidTime(_))
        ));
        assert!(matches!(
            "weekly@someday 10:00".parse::<Interval>(),
            Err(IntervalParseError::InvalidWeekday(_))
        ));
        assert!(matches!(
            "cron:not a cron".parse::<Interval>(),
            Err(IntervalParseError::InvalidCron { .. })
        ));
        assert!(Interval::every(Duration::ZERO).is_err());
        assert!(Interval::every(Duration::from_millis(500)).is_err());
        assert_eq!(
            Interval::every(Duration::from_millis(1500)).unwrap(),
            Interval::every_secs(1).unwrap()
        );
    }

    #[test]
    fn test_display_round_trips() {
        for text in [
            "45s",
            "90s",
            "5m",
            "3h",
            "2d",
            "daily@03:30",
            "weekly@fri 22:05",
            "cron:0 */5 * * * *",
        ] {
            let interval: Interval = text.parse().unwrap();
            assert_eq!(interval.to_string(), text);
            assert_eq!(interval.to_string().parse::<Interval>().unwrap(), interval);
        }
        // Normalized to the largest whole unit
        assert_eq!("120s".parse::<Interval>().unwrap().to_string(), "2m");
    }

    #[test]
    fn test_every_adds_period() {
        let interval = Interval::every_secs(10).unwrap();
        let t0 = at(2024, 5, 1, 12, 0, 11);
        assert_eq!(interval.next(t0), at(2024, 5, 1, 12, 0, 21));
    }

    #[test]
    fn test_daily_next_occurrence() {
        let interval = Interval::daily(3, 30).unwrap();
        // Before today's slot
        assert_eq!(
            interval.next(at(2024, 5, 1, 1, 0, 0)),
            at(2024, 5, 1, 3, 30, 0)
        );
        // Exactly on the slot moves to tomorrow
        assert_eq!(
            interval.next(at(2024, 5, 1, 3, 30, 0)),
            at(2024, 5, 2, 3, 30, 0)
        );
        // After the slot
        assert_eq!(
            interval.next(at(2024, 12, 31, 23, 0, 0)),
            at(2025, 1, 1, 3, 30, 0)
        );
    }

    #[test]
    fn test_weekly_next_occurrence() {
        // 2024-05-01 is a Wednesday
        let interval = Interval::weekly(Weekday::Mon, 8, 0).unwrap();
        assert_eq!(
            interval.next(at(2024, 5, 1, 9, 0, 0)),
            at(2024, 5, 6, 8, 0, 0)
        );

        let same_day = Interval::weekly(Weekday::Wed, 10, 0).unwrap();
        assert_eq!(
            same_day.next(at(2024, 5, 1, 9, 0, 0)),
            at(2024, 5, 1, 10, 0, 0)
        );
        assert_eq!(
            same_day.next(at(2024, 5, 1, 10, 0, 0)),
            at(2024, 5, 8, 10, 0, 0)
        );
    }

    #[test]
    fn test_cron_next_occurrence() {
        let interval = Interval::cron("0 */5 * * * *").unwrap();
        assert_eq!(
            interval.next(at(2024, 5, 1, 12, 2, 0)),
            at(2024, 5, 1, 12, 5, 0)
        );
        assert_eq!(
            interval.next(at(2024, 5, 1, 12, 5, 0)),
            at(2024, 5, 1, 12, 10, 0)
        );
    }

    #[test]
    fn test_next_is_strictly_after_reference() {
        let rules = [
            Interval::every_secs(1).unwrap(),
            Interval::every_secs(86400 * 30).unwrap(),
            Interval::daily(0, 0).unwrap(),
            Interval::daily(23, 59).unwrap(),
            Interval::weekly(Weekday::Sun, 0, 0).unwrap(),
            Interval::cron("0 0 0 * * *").unwrap(),
        ];
        let mut reference = at(2023, 12, 31, 0, 0, 0);
        for step in 0..200 {
            for rule in &rules {
                let next = rule.next(reference);
                assert!(next > reference, "{rule} did not advance from {reference}");
            }
            reference += TimeDelta::minutes(37 * step + 13);
        }
    }

    #[test]
    fn test_serde_uses_textual_form() {
        let interval = Interval::daily(4, 15).unwrap();
        let json = serde_json::to_string(&interval).unwrap();
        assert_eq!(json, "\"daily@04:15\"");
        let back: Interval = serde_json::from_str(&json).unwrap();
        assert_eq!(back, interval);
        assert!(serde_json::from_str::<Interval>("\"0m\"").is_err());
    }
}
