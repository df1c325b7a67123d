//! Human-readable summaries of common cron shapes.

use super::CronExpr;

const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// Describe a schedule in plain words, e.g. "every hour" or
/// "every Monday at 09:30".
///
/// Returns `None` for invalid expressions and for shapes that do not
/// summarize cleanly; callers show the raw expression instead.
pub fn describe(schedule: &str) -> Option<String> {
    let expr = CronExpr::parse(schedule).ok()?;
    let [minute, hour, dom, month, dow] = expr.fields();
    describe_fields(minute, hour, dom, month, dow)
}

fn describe_fields(minute: &str, hour: &str, dom: &str, month: &str, dow: &str) -> Option<String> {
    let any = |f: &str| f == "*";

    // Sub-daily shapes.
    if any(dom) && any(month) && any(dow) {
        if any(minute) && any(hour) {
            return Some("every minute".to_string());
        }
        if let (Some(step), true) = (step_of(minute), any(hour)) {
            return Some(plural(step, "minute"));
        }
        if let (Some(m), true) = (number(minute, 59), any(hour)) {
            return Some(if m == 0 {
                "every hour".to_string()
            } else {
                format!("every hour at :{m:02}")
            });
        }
        if let (Some(m), Some(step)) = (number(minute, 59), step_of(hour)) {
            let base = plural(step, "hour");
            return Some(if m == 0 { base } else { format!("{base} at :{m:02}") });
        }
    }

    let m = number(minute, 59)?;
    let h = number(hour, 23)?;
    let at = format!("{h:02}:{m:02}");

    match (any(dom), any(month), any(dow)) {
        (true, true, true) => Some(format!("every day at {at}")),
        (true, true, false) => Some(format!("{} at {at}", describe_weekdays(dow)?)),
        (false, true, true) => {
            let d = number(dom, 31)?;
            Some(format!("every month on day {d} at {at}"))
        }
        (false, false, true) => {
            let d = number(dom, 31)?;
            let mo = month_index(month)?;
            Some(format!("every year on {} {d} at {at}", MONTH_NAMES[mo]))
        }
        _ => None,
    }
}

fn describe_weekdays(dow: &str) -> Option<String> {
    match dow.to_ascii_lowercase().as_str() {
        "1-5" | "mon-fri" => return Some("every weekday".to_string()),
        "0,6" | "6,0" | "6,7" | "sat,sun" | "sun,sat" | "6-7" | "sat-sun" => {
            return Some("every weekend".to_string());
        }
        _ => {}
    }
    let day = weekday_index(dow)?;
    Some(format!("every {}", DAY_NAMES[day]))
}

fn plural(n: u32, unit: &str) -> String {
    if n == 1 {
        format!("every {unit}")
    } else {
        format!("every {n} {unit}s")
    }
}

fn step_of(field: &str) -> Option<u32> {
    field.strip_prefix("*/")?.parse().ok()
}

fn number(field: &str, max: u32) -> Option<u32> {
    field.parse().ok().filter(|n| *n <= max)
}

fn weekday_index(field: &str) -> Option<usize> {
    if let Some(n) = number(field, 7) {
        return Some(n as usize % 7);
    }
    let lower = field.to_ascii_lowercase();
    DAY_NAMES
        .iter()
        .position(|name| name[..3].eq_ignore_ascii_case(&lower))
}

fn month_index(field: &str) -> Option<usize> {
    if let Some(n) = number(field, 12) {
        return n.checked_sub(1).map(|i| i as usize);
    }
    let lower = field.to_ascii_lowercase();
    MONTH_NAMES
        .iter()
        .position(|name| name[..3].eq_ignore_ascii_case(&lower))
}
