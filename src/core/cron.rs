//! Five-field cron expressions.
//!
//! Supports `*`, lists, ranges, steps and month/weekday names. Day-of-week
//! accepts 0-7 with both 0 and 7 meaning Sunday. When both day-of-month and
//! day-of-week are restricted, a day matches if either field does.

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike,
};
use std::fmt;
use std::str::FromStr;

/// How far ahead `next_after` searches before giving up on a schedule that
/// can never fire (e.g. `0 0 30 2 *`).
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), found {0}")]
    FieldCount(usize),
    #[error("invalid {field} field `{value}`: {reason}")]
    Field {
        field: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value the names start counting from (months are 1-based, weekdays 0-based).
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    names_base: 1,
};
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &WEEKDAY_NAMES,
    names_base: 0,
};

/// A parsed cron schedule. Each field is a bitset of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        let mut days_of_week = parse_field(fields[4], DAY_OF_WEEK)?;
        // Fold 7 (Sunday) onto 0.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], MINUTE)?,
            hours: parse_field(fields[1], HOUR)?,
            days_of_month: parse_field(fields[2], DAY_OF_MONTH)?,
            months: parse_field(fields[3], MONTH)?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    /// The normalized expression (fields separated by single spaces).
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the schedule fires during the minute containing `t`.
    pub fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        let local = t.naive_local();
        self.matches_naive(&local)
    }

    /// The first fire time strictly after `after`, or `None` if the schedule
    /// never fires within the search horizon.
    ///
    /// Wall-clock minutes skipped by a DST gap are skipped; an ambiguous
    /// minute fires at its earliest instant.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let start = after
            .naive_local()
            .with_second(0)?
            .with_nanosecond(0)?
            + Duration::minutes(1);
        let limit = start + Duration::days(SEARCH_HORIZON_DAYS);

        let mut t = start;
        while t <= limit {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(t.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }

            match tz.from_local_datetime(&t).earliest() {
                Some(candidate) if candidate > *after => return Some(candidate),
                _ => t += Duration::minutes(1),
            }
        }

        None
    }

    fn matches_naive(&self, t: &NaiveDateTime) -> bool {
        bit(self.minutes, t.minute())
            && bit(self.hours, t.hour())
            && bit(self.months, t.month())
            && self.day_matches(t.date())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn bit(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn parse_field(raw: &str, spec: FieldSpec) -> Result<u64, CronError> {
    let err = |reason: String| CronError::Field {
        field: spec.name,
        value: raw.to_string(),
        reason,
    };

    let mut set = 0u64;
    for item in raw.split(',') {
        if item.is_empty() {
            return Err(err("empty list item".into()));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| err(format!("step `{}` is not a number", step)))?;
                if step == 0 {
                    return Err(err("step must be at least 1".into()));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec).map_err(&err)?, parse_value(b, spec).map_err(&err)?)
        } else {
            let v = parse_value(range, spec).map_err(&err)?;
            // `5/15` means "from 5 to the end, every 15".
            if step.is_some() { (v, spec.max) } else { (v, v) }
        };

        if lo > hi {
            return Err(err(format!("range {}-{} is reversed", lo, hi)));
        }

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            set |= 1u64 << v;
        }
    }

    Ok(set)
}

fn parse_value(raw: &str, spec: FieldSpec) -> Result<u32, String> {
    let lower = raw.to_ascii_lowercase();
    let value = match spec.names.iter().position(|n| *n == lower) {
        Some(idx) => idx as u32 + spec.names_base,
        None => raw
            .parse::<u32>()
            .map_err(|_| format!("`{}` is not a number", raw))?,
    };

    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} is out of range {}-{}",
            value, spec.min, spec.max
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn daily_schedule_fires_next_day_after_passing() {
        let cron = CronSchedule::parse("0 4 * * *").unwrap();
        assert_eq!(
            cron.next_after(&at("2024-03-10T03:59:30Z")),
            Some(at("2024-03-10T04:00:00Z"))
        );
        assert_eq!(
            cron.next_after(&at("2024-03-10T04:00:00Z")),
            Some(at("2024-03-11T04:00:00Z"))
        );
    }

    #[test]
    fn steps_ranges_and_lists() {
        let cron = CronSchedule::parse("*/15 9-17 * * mon-fri").unwrap();
        // Saturday 2024-03-09 -> Monday 09:00
        assert_eq!(
            cron.next_after(&at("2024-03-09T12:00:00Z")),
            Some(at("2024-03-11T09:00:00Z"))
        );
        assert_eq!(
            cron.next_after(&at("2024-03-11T09:00:00Z")),
            Some(at("2024-03-11T09:15:00Z"))
        );

        let list = CronSchedule::parse("5,35 0 * * *").unwrap();
        assert_eq!(
            list.next_after(&at("2024-01-01T00:06:00Z")),
            Some(at("2024-01-01T00:35:00Z"))
        );
    }

    #[test]
    fn restricted_day_fields_are_or_joined() {
        // 13th of the month OR any Friday.
        let cron = CronSchedule::parse("0 0 13 * 5").unwrap();
        // 2024-03-08 is a Friday.
        assert!(cron.matches(&at("2024-03-08T00:00:00Z")));
        // 2024-03-13 is a Wednesday.
        assert!(cron.matches(&at("2024-03-13T00:00:00Z")));
        assert!(!cron.matches(&at("2024-03-12T00:00:00Z")));
    }

    #[test]
    fn unrestricted_day_of_week_does_not_widen_day_of_month() {
        let cron = CronSchedule::parse("0 0 1 * *").unwrap();
        assert!(cron.matches(&at("2024-05-01T00:00:00Z")));
        assert!(!cron.matches(&at("2024-05-02T00:00:00Z")));
    }

    #[test]
    fn sunday_is_zero_or_seven() {
        let zero = CronSchedule::parse("0 0 * * 0").unwrap();
        let seven = CronSchedule::parse("0 0 * * 7").unwrap();
        let sun = CronSchedule::parse("0 0 * * SUN").unwrap();
        // 2024-03-10 is a Sunday.
        let sunday = at("2024-03-10T00:00:00Z");
        assert!(zero.matches(&sunday));
        assert!(seven.matches(&sunday));
        assert!(sun.matches(&sunday));
    }

    #[test]
    fn month_names_and_year_rollover() {
        let cron = CronSchedule::parse("30 2 1 jan *").unwrap();
        assert_eq!(
            cron.next_after(&at("2024-06-15T00:00:00Z")),
            Some(at("2025-01-01T02:30:00Z"))
        );
    }

    #[test]
    fn impossible_schedule_never_fires() {
        let cron = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(cron.next_after(&at("2024-01-01T00:00:00Z")), None);
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(CronSchedule::parse("bogus"), Err(CronError::FieldCount(1)));
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("* 24 * * *").is_err());
        assert!(CronSchedule::parse("* * 0 * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("10-5 * * * *").is_err());
        assert!(CronSchedule::parse("* * * foo *").is_err());
        assert!(CronSchedule::parse("1,,2 * * * *").is_err());
    }

    #[test]
    fn normalizes_whitespace() {
        let cron = CronSchedule::parse("  0   4 *  * * ").unwrap();
        assert_eq!(cron.as_str(), "0 4 * * *");
    }
}
