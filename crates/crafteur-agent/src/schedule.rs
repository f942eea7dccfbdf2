//! Trigger expressions: classic 5-field cron, `@daily`-style descriptors and
//! `@every <duration>`.
//!
//! Cron matching and next-occurrence search are done by `croner` against wall-clock
//! time in the zone of the `after` argument; the scheduler passes host local time.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Timelike};
use croner::Cron;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid trigger expression {expr:?}: {reason}")]
pub struct ScheduleError {
    pub expr: String,
    pub reason: String,
}

impl ScheduleError {
    fn new(expr: &str, reason: impl Into<String>) -> Self {
        Self {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron(CronSchedule),
    /// Fixed delay between firings, whole seconds only.
    Every(Duration),
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(ScheduleError::new(expr, "empty expression"));
        }

        if let Some(rest) = trimmed.strip_prefix("@every") {
            // `@everyday` is not a thing; require whitespace after the keyword.
            if !rest.starts_with(char::is_whitespace) {
                return Err(ScheduleError::new(expr, "expected `@every <duration>`"));
            }
            let d = humantime::parse_duration(rest.trim())
                .map_err(|e| ScheduleError::new(expr, format!("bad duration: {e}")))?;
            let secs = d.as_secs().max(1);
            return Ok(Schedule::Every(Duration::from_secs(secs)));
        }

        let fields = if trimmed.starts_with('@') {
            match trimmed.to_ascii_lowercase().as_str() {
                "@yearly" | "@annually" => "0 0 1 1 *",
                "@monthly" => "0 0 1 * *",
                "@weekly" => "0 0 * * 0",
                "@daily" | "@midnight" => "0 0 * * *",
                "@hourly" => "0 * * * *",
                _ => return Err(ScheduleError::new(expr, "unknown descriptor")),
            }
        } else {
            trimmed
        };

        CronSchedule::parse_fields(fields)
            .map(Schedule::Cron)
            .map_err(|reason| ScheduleError::new(expr, reason))
    }

    /// First firing strictly after `after`, or `None` if the expression never matches again.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match self {
            Schedule::Every(d) => {
                let base = after.clone().with_nanosecond(0)?;
                base.checked_add_signed(ChronoDuration::from_std(*d).ok()?)
            }
            Schedule::Cron(cron) => cron.next_after(after),
        }
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

/// Field name and largest value, in expression order.
const FIELDS: [(&str, u32); 5] = [
    ("minute", 59),
    ("hour", 23),
    ("day-of-month", 31),
    ("month", 12),
    ("day-of-week", 7),
];

/// A parsed 5-field cron expression. Two schedules are equal when their
/// normalized expressions are.
#[derive(Clone)]
pub struct CronSchedule {
    expr: String,
    cron: Arc<Cron>,
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expr).finish()
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl Eq for CronSchedule {}

impl CronSchedule {
    fn parse_fields(expr: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!("expected 5 fields, found {}", fields.len()));
        }
        for (raw, (name, max)) in fields.iter().zip(FIELDS) {
            check_field(raw, name, max)?;
        }

        // Names are matched case-insensitively and `?` is a plain wildcard.
        let normalized = fields
            .iter()
            .map(|f| if *f == "?" { "*".to_string() } else { f.to_ascii_uppercase() })
            .collect::<Vec<_>>()
            .join(" ");
        let cron = Cron::new(&normalized).parse().map_err(|e| e.to_string())?;
        Ok(Self {
            expr: normalized,
            cron: Arc::new(cron),
        })
    }

    fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.cron.find_next_occurrence(after, false).ok()
    }
}

/// Shape checks on one field: no empty list items, steps within the field's range
/// and ranges written low to high. Values and names are left to the cron parser.
fn check_field(raw: &str, name: &str, max: u32) -> Result<(), String> {
    for item in raw.split(',') {
        if item.is_empty() {
            return Err(format!("empty {name} item"));
        }
        let range = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("bad {name} step {step:?}"))?;
                if step == 0 || step > max {
                    return Err(format!("{name} step must be in 1..={max}"));
                }
                range
            }
            None => item,
        };
        if let Some((lo, hi)) = range.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                if lo > hi {
                    return Err(format!("{name} range {lo}-{hi} is reversed"));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDateTime, Utc};

    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn next(expr: &str, from: &str) -> Option<DateTime<Utc>> {
        Schedule::parse(expr).unwrap().next_after(&at(from))
    }

    #[test]
    fn steps_and_strictly_after() {
        assert_eq!(next("*/15 * * * *", "2024-01-01 10:07:30"), Some(at("2024-01-01 10:15:00")));
        assert_eq!(next("*/15 * * * *", "2024-01-01 10:15:00"), Some(at("2024-01-01 10:30:00")));
        assert_eq!(next("*/15 * * * *", "2024-01-01 23:50:00"), Some(at("2024-01-02 00:00:00")));
        assert_eq!(next("0 8-18/5 * * *", "2024-01-01 09:00:00"), Some(at("2024-01-01 13:00:00")));
    }

    #[test]
    fn descriptors_expand_to_cron() {
        assert_eq!(next("@yearly", "2024-03-01 00:00:00"), Some(at("2025-01-01 00:00:00")));
        assert_eq!(next("@monthly", "2024-01-31 12:00:00"), Some(at("2024-02-01 00:00:00")));
        assert_eq!(next("@daily", "2024-12-31 23:59:59"), Some(at("2025-01-01 00:00:00")));
        assert_eq!(next("@hourly", "2024-01-01 10:00:00"), Some(at("2024-01-01 11:00:00")));
        // 2024-06-05 is a Wednesday.
        assert_eq!(next("@weekly", "2024-06-05 08:00:00"), Some(at("2024-06-09 00:00:00")));
        assert_eq!(
            Schedule::parse("@midnight").unwrap(),
            Schedule::parse("0 0 * * *").unwrap()
        );
    }

    #[test]
    fn weekday_names_and_ranges() {
        // Friday morning, after the 08:30 slot.
        assert_eq!(
            next("30 8 * * MON-FRI", "2024-05-31 09:00:00"),
            Some(at("2024-06-03 08:30:00"))
        );
        assert_eq!(next("0 9 * jan,Jul *", "2024-02-10 00:00:00"), Some(at("2024-07-01 09:00:00")));
    }

    #[test]
    fn seven_is_sunday() {
        // 2024-09-02 is a Monday.
        assert_eq!(next("0 12 * * 7", "2024-09-02 00:00:00"), Some(at("2024-09-08 12:00:00")));
        assert_eq!(next("0 12 * * SUN", "2024-09-02 00:00:00"), Some(at("2024-09-08 12:00:00")));
    }

    #[test]
    fn restricted_day_fields_match_either() {
        // The 10th (a Tuesday) comes before the next Friday.
        assert_eq!(next("0 0 10 * FRI", "2024-09-07 00:00:00"), Some(at("2024-09-10 00:00:00")));
        // With day-of-week unrestricted only the date counts.
        assert_eq!(next("0 0 10 * *", "2024-09-11 00:00:00"), Some(at("2024-10-10 00:00:00")));
    }

    #[test]
    fn rare_and_impossible_dates() {
        assert_eq!(next("0 0 29 2 *", "2024-03-01 00:00:00"), Some(at("2028-02-29 00:00:00")));
        assert_eq!(next("0 0 30 2 *", "2024-01-01 00:00:00"), None);
    }

    #[test]
    fn every_is_whole_seconds_from_now() {
        let from = at("2024-01-01 10:00:00") + ChronoDuration::milliseconds(500);
        let s = Schedule::parse("@every 90s").unwrap();
        assert_eq!(s, Schedule::Every(Duration::from_secs(90)));
        assert_eq!(s.next_after(&from), Some(at("2024-01-01 10:01:30")));

        assert_eq!(
            Schedule::parse("@every 500ms").unwrap(),
            Schedule::Every(Duration::from_secs(1))
        );
        assert_eq!(
            Schedule::parse("@every 1h 30m").unwrap(),
            Schedule::Every(Duration::from_secs(5400))
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            "not-a-cron",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "5-1 * * * *",
            "*/0 * * * *",
            "1/4294967295 * * * *",
            "*/99999999999 * * * *",
            "1,,2 * * * *",
            "* * * FOO *",
            "@fortnightly",
            "@every",
            "@every soon",
        ] {
            let err = Schedule::parse(bad).unwrap_err();
            assert_eq!(err.expr, bad);
        }
    }

    #[test]
    fn error_message_names_expression() {
        let err = "not-a-cron".parse::<Schedule>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid trigger expression \"not-a-cron\": expected 5 fields, found 1"
        );
        let err = Schedule::parse("1/4294967295 * * * *").unwrap_err();
        assert_eq!(err.reason, "minute step must be in 1..=59");
    }
}
