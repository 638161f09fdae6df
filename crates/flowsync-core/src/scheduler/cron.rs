//! Standard 5-field cron parser and evaluator (spec.md §4.12, §6).
//!
//! Fields: `minute hour dayOfMonth month dayOfWeek`, supporting `*`, specific
//! values, ranges (`a-b`), lists (`a,b,c`), and steps (`*/n`, `a-b/n`).
//! `dayOfWeek` uses 0 = Sunday.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::error::FlowSyncError;

const MAX_LOOKAHEAD_DAYS: i64 = 366;

#[derive(Debug, Clone)]
pub struct CronSchedule {
    minute: HashSet<u32>,
    hour: HashSet<u32>,
    day_of_month: HashSet<u32>,
    month: HashSet<u32>,
    day_of_week: HashSet<u32>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, FlowSyncError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(FlowSyncError::Validation(vec![format!(
                "cron expression must have 5 fields, got {}: {expression:?}",
                fields.len()
            )]));
        }

        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_field(fields[4], 0, 6)?,
        })
    }

    pub fn should_run(&self, now: DateTime<Utc>) -> bool {
        self.minute.contains(&now.minute())
            && self.hour.contains(&now.hour())
            && self.day_of_month.contains(&now.day())
            && self.month.contains(&now.month())
            && self.day_of_week.contains(&now.weekday().num_days_from_sunday())
    }

    /// Walks forward minute-by-minute from `from` looking for the next match,
    /// capped at `MAX_LOOKAHEAD_DAYS`. Returns `None` if nothing matches
    /// within the cap.
    pub fn next_run_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = truncate_to_minute(from) + Duration::minutes(1);
        let limit = from + Duration::days(MAX_LOOKAHEAD_DAYS);
        let mut candidate = start;
        while candidate <= limit {
            if self.should_run(candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive()
        .and_hms_opt(t.hour(), t.minute(), 0)
        .unwrap()
        .and_utc()
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<HashSet<u32>, FlowSyncError> {
    let mut values = HashSet::new();
    for token in field.split(',') {
        values.extend(parse_token(token, min, max)?);
    }
    if values.is_empty() {
        return Err(FlowSyncError::Validation(vec![format!("cron field {field:?} matched no values")]));
    }
    Ok(values)
}

fn parse_token(token: &str, min: u32, max: u32) -> Result<Vec<u32>, FlowSyncError> {
    let invalid = || FlowSyncError::Validation(vec![format!("invalid cron field token {token:?}")]);

    if token == "*" {
        return Ok((min..=max).collect());
    }

    if let Some(step_str) = token.strip_prefix("*/") {
        let step: u32 = step_str.parse().map_err(|_| invalid())?;
        if step == 0 {
            return Err(invalid());
        }
        return Ok((min..=max).step_by(step as usize).collect());
    }

    if let Some((range, step_str)) = token.split_once('/') {
        let (a, b) = parse_range(range, min, max).ok_or_else(invalid)?;
        let step: u32 = step_str.parse().map_err(|_| invalid())?;
        if step == 0 {
            return Err(invalid());
        }
        return Ok((a..=b).step_by(step as usize).collect());
    }

    if let Some((a, b)) = parse_range(token, min, max) {
        return Ok((a..=b).collect());
    }

    let value: u32 = token.parse().map_err(|_| invalid())?;
    if value < min || value > max {
        return Err(invalid());
    }
    Ok(vec![value])
}

fn parse_range(token: &str, min: u32, max: u32) -> Option<(u32, u32)> {
    let (a, b) = token.split_once('-')?;
    let a: u32 = a.parse().ok()?;
    let b: u32 = b.parse().ok()?;
    if a > b || a < min || b > max {
        return None;
    }
    Some((a, b))
}
