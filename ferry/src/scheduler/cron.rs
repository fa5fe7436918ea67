//! Cron expressions with an optional timezone.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

use crate::{Error, Result};

/// Fire times are looked up in batches of this size while catching up.
const CATCH_UP_BATCH: usize = 1024;

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed schedule.
///
/// Accepts standard 5-field cron (`min hour dom mon dow`), where day-of-week
/// runs `0-7` with Sunday as both 0 and 7, as well as the seconds-first
/// 6/7-field form of the `cron` crate, which keeps that crate's `1-7`
/// Sunday-first numbering. Names such as `MON-FRI` work in both.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: cron::Schedule,
    timezone: Tz,
}

impl CronSchedule {
    pub fn parse(expression: &str, timezone: Option<&str>) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => format!(
                "0 {} {}",
                fields[..4].join(" "),
                standard_day_of_week(fields[4], expression)?
            ),
            6 | 7 => fields.join(" "),
            _ => {
                return Err(Error::validation(format!(
                    "cron expression '{}' must have 5, 6 or 7 fields",
                    expression
                )));
            }
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            Error::validation(format!("invalid cron expression '{}': {}", expression, e))
        })?;
        let timezone = match timezone {
            Some(name) => name.parse::<Tz>().map_err(|_| {
                Error::validation(format!("'{}' is not a valid IANA timezone", name))
            })?,
            None => chrono_tz::UTC,
        };
        Ok(Self { schedule, timezone })
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// The latest fire time in `(after, until]`.
    ///
    /// Several missed fire times collapse into the most recent one.
    pub fn latest_due(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut cursor = after;
        let mut latest = None;
        loop {
            let mut advanced = false;
            for fire in self
                .schedule
                .after(&cursor.with_timezone(&self.timezone))
                .take(CATCH_UP_BATCH)
            {
                let fire = fire.with_timezone(&Utc);
                if fire > until {
                    return latest;
                }
                latest = Some(fire);
                advanced = true;
            }
            match latest {
                Some(last) if advanced => cursor = last,
                _ => return latest,
            }
        }
    }
}

/// Spell out a standard day-of-week field with day names.
///
/// Numeric values, ranges and steps are expanded into a name list. Anything
/// else is left for the `cron` crate to accept or reject.
fn standard_day_of_week(field: &str, expression: &str) -> Result<String> {
    let invalid = || {
        Error::validation(format!(
            "invalid day-of-week '{}' in cron expression '{}'",
            field, expression
        ))
    };
    let day = |s: &str| s.parse::<usize>().ok().filter(|d| *d <= 7);

    let mut names: Vec<String> = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step.parse::<usize>().map_err(|_| invalid())?)),
            None => (item, None),
        };
        let range = match (base, step) {
            ("*" | "?", None) => None,
            ("*" | "?", Some(_)) => Some((0, 6)),
            _ => match base.split_once('-') {
                Some((start, end)) => day(start).zip(day(end)),
                None => day(base).map(|d| (d, if step.is_some() { 6 } else { d })),
            },
        };
        let Some((start, end)) = range else {
            names.push(item.to_string());
            continue;
        };
        let step = step.unwrap_or(1);
        if start > end || step == 0 {
            return Err(invalid());
        }
        for d in (start..=end).step_by(step) {
            let name = WEEKDAYS[d % 7].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Ok(names.join(","))
}
