//! Translate cron fields into launchd `StartCalendarInterval` entries.
//!
//! launchd has no step or range syntax: each entry is a dictionary of fixed
//! values with missing keys acting as wildcards. Restricted cron fields are
//! therefore expanded and combined into one entry per combination. When both
//! day fields are restricted cron ORs them, so `Day` and `Weekday` entries
//! are emitted separately instead of combined.

use crate::schedule::CronExpr;

/// More entries than this is almost certainly a mistake (`*/1 * ...`).
const MAX_ENTRIES: usize = 512;

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// One `StartCalendarInterval` dictionary. `None` means "every".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalendarInterval {
    pub minute: Option<u32>,
    pub hour: Option<u32>,
    pub day: Option<u32>,
    pub month: Option<u32>,
    pub weekday: Option<u32>,
}

impl CalendarInterval {
    /// `(key, value)` pairs in launchd's key names.
    pub fn keys(&self) -> Vec<(&'static str, u32)> {
        [
            ("Minute", self.minute),
            ("Hour", self.hour),
            ("Day", self.day),
            ("Month", self.month),
            ("Weekday", self.weekday),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect()
    }
}

/// Expand a cron expression into calendar intervals.
pub fn intervals(expr: &CronExpr) -> Result<Vec<CalendarInterval>, String> {
    let [minute, hour, dom, month, dow] = expr.fields();

    let minutes = expand(minute, 0, 59, &[])?;
    let hours = expand(hour, 0, 23, &[])?;
    let days = expand(dom, 1, 31, &[])?;
    let months = expand(month, 1, 12, &MONTHS)?;
    let weekdays = expand(dow, 0, 7, &DAYS)?.map(|mut v| {
        // launchd accepts 7 but 0 keeps the set canonical.
        for d in v.iter_mut() {
            if *d == 7 {
                *d = 0;
            }
        }
        v.sort_unstable();
        v.dedup();
        v
    });

    let base = [minutes.as_ref(), hours.as_ref(), months.as_ref()]
        .into_iter()
        .map(|f| f.map_or(1, Vec::len))
        .try_fold(1usize, |acc, n| acc.checked_mul(n));
    let (n_days, n_weekdays) = (
        days.as_ref().map_or(1, Vec::len),
        weekdays.as_ref().map_or(1, Vec::len),
    );
    let per_day = if expr.days_ored() {
        n_days + n_weekdays
    } else {
        n_days * n_weekdays
    };
    let count = base
        .and_then(|b| b.checked_mul(per_day))
        .unwrap_or(usize::MAX);
    if count > MAX_ENTRIES {
        return Err(format!(
            "expands to {count} calendar entries (limit {MAX_ENTRIES})"
        ));
    }

    let mut out = vec![CalendarInterval::default()];
    out = product(out, &minutes, |i, v| i.minute = v);
    out = product(out, &hours, |i, v| i.hour = v);
    out = product(out, &months, |i, v| i.month = v);

    if expr.days_ored() {
        let mut by_day = product(out.clone(), &days, |i, v| i.day = v);
        by_day.extend(product(out, &weekdays, |i, v| i.weekday = v));
        return Ok(by_day);
    }

    out = product(out, &days, |i, v| i.day = v);
    out = product(out, &weekdays, |i, v| i.weekday = v);
    Ok(out)
}

fn product(
    acc: Vec<CalendarInterval>,
    values: &Option<Vec<u32>>,
    set: impl Fn(&mut CalendarInterval, Option<u32>),
) -> Vec<CalendarInterval> {
    let Some(values) = values else {
        return acc;
    };
    let mut out = Vec::with_capacity(acc.len() * values.len());
    for base in &acc {
        for v in values {
            let mut next = *base;
            set(&mut next, Some(*v));
            out.push(next);
        }
    }
    out
}

/// `None` for an unrestricted field, else the sorted set of values.
fn expand(field: &str, min: u32, max: u32, names: &[&str]) -> Result<Option<Vec<u32>>, String> {
    if field == "*" || field == "?" {
        return Ok(None);
    }

    let value = |token: &str| -> Result<u32, String> {
        let lower = token.to_ascii_lowercase();
        let n = match names.iter().position(|n| lower.starts_with(n)) {
            Some(idx) => idx as u32 + if min == 1 { 1 } else { 0 },
            None => token
                .parse::<u32>()
                .map_err(|_| format!("unrecognized value '{token}'"))?,
        };
        if n < min || n > max {
            return Err(format!("value {n} out of range {min}-{max}"));
        }
        Ok(n)
    };

    let mut values = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((b, s)) => {
                let step: u32 = s.parse().map_err(|_| format!("invalid step '{s}'"))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (b, step)
            }
            None => (item, 1),
        };

        let (from, to) = if base == "*" {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            (value(a)?, value(b)?)
        } else if step > 1 {
            (value(base)?, max)
        } else {
            let v = value(base)?;
            (v, v)
        };

        if from > to {
            return Err(format!("descending range {from}-{to}"));
        }
        values.extend((from..=to).step_by(step as usize));
    }

    values.sort_unstable();
    values.dedup();
    Ok(Some(values))
}
