//! Cron schedule evaluation.
//!
//! Task schedules use the standard 5-field syntax
//! (`minute hour day-of-month month day-of-week`). The `cron` crate expects a
//! leading seconds field and numbers weekdays from Sunday = 1, so expressions
//! are normalized before they are handed to it.
//!
//! When both day-of-month and day-of-week are restricted, standard cron fires
//! on days matching either field while the crate requires both. Such
//! expressions are evaluated as two schedules whose firings are merged.

pub mod describe;

pub use describe::describe;

use std::str::FromStr;

use chrono::{DateTime, Duration, TimeZone, Utc};
use cron::Schedule as CronSchedule;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule is empty")]
    Empty,

    #[error("invalid cron expression '{expr}': {reason}")]
    Invalid { expr: String, reason: String },
}

impl ScheduleError {
    fn invalid(expr: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            expr: expr.to_string(),
            reason: reason.into(),
        }
    }
}

/// Look-back windows tried in order when searching for the previous firing.
/// Dense schedules resolve in the first window; the last one covers
/// leap-day schedules.
const SEARCH_WINDOWS_HOURS: [i64; 6] = [1, 24, 24 * 8, 24 * 32, 24 * 367, 24 * 366 * 5];

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// A validated 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    fields: [String; 5],
    /// One schedule, or two (day-of-month only, day-of-week only) when the
    /// day fields are ORed.
    schedules: Vec<CronSchedule>,
}

impl CronExpr {
    /// Parse a 5-field expression or one of the `@hourly`-style aliases.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(ScheduleError::Empty);
        }

        let expanded = if trimmed.starts_with('@') {
            expand_alias(trimmed).ok_or_else(|| ScheduleError::invalid(trimmed, "unknown alias"))?
        } else {
            trimmed
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ScheduleError::invalid(
                trimmed,
                format!(
                    "expected 5 fields (minute hour day-of-month month day-of-week), found {}",
                    parts.len()
                ),
            ));
        }

        let weekday = normalize_weekday_field(parts[4])
            .map_err(|reason| ScheduleError::invalid(trimmed, reason))?;
        let month = normalize_names(parts[3]);
        let build = |dom: &str, dow: &str| {
            let six_field = format!("0 {} {} {} {} {}", parts[0], parts[1], dom, month, dow);
            CronSchedule::from_str(&six_field)
                .map_err(|e| ScheduleError::invalid(trimmed, e.to_string()))
        };

        let schedules = if days_ored(parts[2], parts[4]) {
            vec![build(parts[2], "*")?, build("*", &weekday)?]
        } else {
            vec![build(parts[2], &weekday)?]
        };

        Ok(Self {
            source: trimmed.to_string(),
            fields: [
                parts[0].to_string(),
                parts[1].to_string(),
                parts[2].to_string(),
                parts[3].to_string(),
                parts[4].to_string(),
            ],
            schedules,
        })
    }

    /// The expression as written by the user.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The five standard fields, with aliases expanded.
    pub fn fields(&self) -> &[String; 5] {
        &self.fields
    }

    /// Whether a day matches when either day field matches, as in
    /// standard cron when both are restricted.
    pub fn days_ored(&self) -> bool {
        self.schedules.len() > 1
    }

    /// Most recent firing at or before `before`, in `before`'s time zone.
    pub fn last_at_or_before<Tz: TimeZone>(&self, before: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        for hours in SEARCH_WINDOWS_HOURS {
            let start = before.clone() - Duration::hours(hours);
            let last = self
                .schedules
                .iter()
                .filter_map(|schedule| schedule.after(&start).take_while(|t| t <= before).last())
                .max();
            if last.is_some() {
                return last;
            }
        }
        None
    }

    /// First firing strictly after `after`.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(after).next())
            .min()
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

/// Most recent scheduled firing at or before `before`.
///
/// The schedule is evaluated in the time zone of `before`. `Ok(None)` means
/// the schedule has not fired within the search horizon; an unparseable
/// expression is always an error.
pub fn last_occurrence_before<Tz: TimeZone>(
    schedule: &str,
    before: &DateTime<Tz>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let expr = CronExpr::parse(schedule)?;
    Ok(expr.last_at_or_before(before).map(|t| t.with_timezone(&Utc)))
}

/// Next scheduled firing strictly after `after`.
pub fn next_occurrence_after<Tz: TimeZone>(
    schedule: &str,
    after: &DateTime<Tz>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let expr = CronExpr::parse(schedule)?;
    Ok(expr.next_after(after).map(|t| t.with_timezone(&Utc)))
}

/// A day field starting with `*` counts as unrestricted, as in Vixie cron.
fn days_ored(dom: &str, dow: &str) -> bool {
    let restricted = |f: &str| !(f.starts_with('*') || f == "?");
    restricted(dom) && restricted(dow)
}

fn expand_alias(alias: &str) -> Option<&'static str> {
    match alias.to_ascii_lowercase().as_str() {
        "@hourly" => Some("0 * * * *"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@monthly" => Some("0 0 1 * *"),
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        _ => None,
    }
}

/// `JAN` / `jan` -> `Jan`, the casing the `cron` crate accepts.
fn normalize_names(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut word = String::new();
    for c in field.chars().chain(std::iter::once(',')) {
        if c.is_ascii_alphabetic() {
            word.push(c);
            continue;
        }
        if !word.is_empty() {
            let lower = word.to_ascii_lowercase();
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.extend(chars);
            }
            word.clear();
        }
        out.push(c);
    }
    out.pop();
    out
}

/// Rewrite numeric weekdays (0-7, Sunday = 0 or 7) as names.
/// Step values after `/` are left numeric.
fn normalize_weekday_field(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };

        let base = match base.split_once('-') {
            Some((from, to)) => {
                let from = weekday_name(from)?;
                let to_num = to.parse::<u32>().ok();
                let to = weekday_name(to)?;
                // `5-7` has to become `Fri-Sat,Sun`; the crate rejects wrapping ranges.
                if to_num == Some(7) && from != "Sun" && step.is_none() {
                    items.push(format!("{from}-Sat"));
                    "Sun".to_string()
                } else {
                    format!("{from}-{to}")
                }
            }
            None => weekday_name(base)?,
        };

        match step {
            Some(step) => items.push(format!("{base}/{step}")),
            None => items.push(base),
        }
    }
    Ok(items.join(","))
}

fn weekday_name(token: &str) -> Result<String, String> {
    if token == "*" || token == "?" {
        return Ok("*".to_string());
    }
    if let Ok(n) = token.parse::<usize>() {
        return match n {
            0..=6 => Ok(WEEKDAYS[n].to_string()),
            7 => Ok("Sun".to_string()),
            _ => Err(format!("day-of-week {n} out of range 0-7")),
        };
    }
    Ok(normalize_names(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_rejects_empty_and_wrong_field_count() {
        assert!(matches!(CronExpr::parse("  "), Err(ScheduleError::Empty)));
        assert!(matches!(
            CronExpr::parse("* * * *"),
            Err(ScheduleError::Invalid { .. })
        ));
        assert!(matches!(
            CronExpr::parse("0 0 * * * *"),
            Err(ScheduleError::Invalid { .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("0 25 * * *").is_err());
        assert!(CronExpr::parse("0 0 * * 9").is_err());
        assert!(CronExpr::parse("@fortnightly").is_err());
    }

    #[test]
    fn test_invalid_expression_is_an_error_not_none() {
        let now = utc(2024, 3, 6, 12, 0, 0);
        assert!(last_occurrence_before("not a cron", &now).is_err());
    }

    #[test]
    fn test_hourly_last_occurrence() {
        let now = utc(2024, 3, 6, 12, 34, 56);
        let last = last_occurrence_before("0 * * * *", &now).unwrap();
        assert_eq!(last, Some(utc(2024, 3, 6, 12, 0, 0)));
    }

    #[test]
    fn test_occurrence_at_exact_boundary_is_included() {
        let now = utc(2024, 3, 6, 12, 0, 0);
        let last = last_occurrence_before("0 * * * *", &now).unwrap();
        assert_eq!(last, Some(now));
    }

    #[test]
    fn test_weekly_numeric_weekday_is_standard_cron() {
        // 2024-03-06 is a Wednesday; `1` must mean Monday.
        let now = utc(2024, 3, 6, 8, 0, 0);
        let last = last_occurrence_before("30 9 * * 1", &now).unwrap();
        assert_eq!(last, Some(utc(2024, 3, 4, 9, 30, 0)));
    }

    #[test]
    fn test_sunday_as_zero_and_seven() {
        let now = utc(2024, 3, 6, 8, 0, 0);
        let zero = last_occurrence_before("0 0 * * 0", &now).unwrap();
        let seven = last_occurrence_before("0 0 * * 7", &now).unwrap();
        assert_eq!(zero, Some(utc(2024, 3, 3, 0, 0, 0)));
        assert_eq!(zero, seven);
    }

    #[test]
    fn test_weekday_range_ending_on_seven() {
        // Fri-Sun: the most recent before Wednesday is Sunday.
        let now = utc(2024, 3, 6, 8, 0, 0);
        let last = last_occurrence_before("0 12 * * 5-7", &now).unwrap();
        assert_eq!(last, Some(utc(2024, 3, 3, 12, 0, 0)));
    }

    #[test]
    fn test_yearly_schedule_looks_back_across_months() {
        let now = utc(2024, 3, 6, 8, 0, 0);
        let last = last_occurrence_before("@yearly", &now).unwrap();
        assert_eq!(last, Some(utc(2024, 1, 1, 0, 0, 0)));
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let now = utc(2024, 3, 6, 8, 0, 0);
        let last = last_occurrence_before("0 9 * JAN mon", &now).unwrap();
        assert_eq!(last, Some(utc(2024, 1, 29, 9, 0, 0)));
    }

    #[test]
    fn test_evaluated_in_callers_time_zone() {
        // 09:00 at UTC+2 is 07:00 UTC.
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 3, 6, 10, 0, 0).unwrap();
        let last = last_occurrence_before("0 9 * * *", &now).unwrap();
        assert_eq!(last, Some(utc(2024, 3, 6, 7, 0, 0)));
    }

    #[test]
    fn test_next_occurrence_is_strictly_after() {
        let now = utc(2024, 3, 6, 12, 0, 0);
        let next = next_occurrence_after("0 * * * *", &now).unwrap();
        assert_eq!(next, Some(utc(2024, 3, 6, 13, 0, 0)));
    }

    #[test]
    fn test_restricted_day_fields_fire_on_either() {
        // 1st of the month OR any Monday; 2024-03-04 is a Monday.
        let now = utc(2024, 3, 6, 12, 0, 0);
        let last = last_occurrence_before("0 0 1 * 1", &now).unwrap();
        assert_eq!(last, Some(utc(2024, 3, 4, 0, 0, 0)));

        let next = next_occurrence_after("0 0 1 * 1", &now).unwrap();
        assert_eq!(next, Some(utc(2024, 3, 11, 0, 0, 0)));

        // Day-of-month wins when it is the closer match.
        let now = utc(2024, 3, 2, 12, 0, 0);
        let last = last_occurrence_before("0 0 1 * 1", &now).unwrap();
        assert_eq!(last, Some(utc(2024, 3, 1, 0, 0, 0)));
        assert!(CronExpr::parse("0 0 1 * 1").unwrap().days_ored());
    }

    #[test]
    fn test_wildcard_day_field_keeps_and_semantics() {
        let expr = CronExpr::parse("0 0 */2 * 1").unwrap();
        assert!(!expr.days_ored());
        assert!(!CronExpr::parse("0 0 1 * *").unwrap().days_ored());
    }

    #[test]
    fn test_fields_expand_aliases() {
        let expr = CronExpr::parse("@daily").unwrap();
        assert_eq!(expr.source(), "@daily");
        assert_eq!(expr.fields()[0], "0");
        assert_eq!(expr.fields()[1], "0");
        assert_eq!(expr.fields()[4], "*");
    }
}
