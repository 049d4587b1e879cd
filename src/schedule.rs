//! Schedule expressions: classical 5-field cron, 6-field cron with a leading
//! seconds field, the `@`-descriptors, and fixed intervals via `@every`.
//!
//! Firing instants are computed in the process-local time zone. Skipped
//! firings are never backfilled; callers ask for the next instant strictly
//! after a reference instant and rearm from there.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::error::{Error, Result};

/// Field names of the normalized 6-field form, used in parse errors.
const FIELD_NAMES: [&str; 6] = [
    "seconds",
    "minute",
    "hour",
    "day of month",
    "month",
    "day of week",
];

/// A parsed schedule, ready to produce firing instants.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Cron expression, normalized to the 6-field seconds-first form.
    Cron {
        expr: String,
        inner: cron::Schedule,
    },
    /// Fixed interval measured from the previous firing.
    Every(Duration),
}

impl Schedule {
    /// Parse a schedule expression.
    ///
    /// Accepted forms:
    /// - `@every <duration>` where the duration is integer `h`/`m`/`s` parts
    ///   (`"@every 90s"`, `"@every 1h30m"`)
    /// - descriptors: `@yearly`/`@annually`, `@monthly`, `@weekly`,
    ///   `@daily`/`@midnight`, `@hourly`
    /// - 5 fields (minute hour dom month dow), firing at second 0
    /// - 6 fields with a leading seconds field
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(invalid(expr, "expression is empty"));
        }

        if let Some(rest) = trimmed.strip_prefix("@every") {
            let dur = parse_duration(rest.trim()).map_err(|reason| invalid(expr, &reason))?;
            if dur.is_zero() {
                return Err(invalid(expr, "@every duration must be positive"));
            }
            return Ok(Schedule::Every(dur));
        }

        // Offset between the caller's field numbering and the normalized
        // 6-field form: 1 when we prepend the implicit seconds field.
        let mut offset = 0usize;
        let fields: Vec<String> = if let Some(stripped) = trimmed.strip_prefix('@') {
            let Some(descriptor) = expand_descriptor(stripped) else {
                return Err(invalid(expr, &format!("unknown descriptor @{stripped}")));
            };
            descriptor.split_whitespace().map(str::to_string).collect()
        } else {
            let raw: Vec<&str> = trimmed.split_whitespace().collect();
            match raw.len() {
                5 => {
                    offset = 1;
                    std::iter::once("0")
                        .chain(raw)
                        .map(str::to_string)
                        .collect()
                }
                6 => raw.iter().map(|f| f.to_string()).collect(),
                n => {
                    return Err(invalid(expr, &format!("expected 5 or 6 fields, got {n}")));
                }
            }
        };

        for (i, field) in fields.iter().enumerate() {
            if let Some(c) = field
                .chars()
                .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '*' | ',' | '-' | '/' | '?'))
            {
                return Err(invalid(
                    expr,
                    &format!(
                        "field {} ({}) contains invalid character {c:?}",
                        i.saturating_sub(offset),
                        FIELD_NAMES[i]
                    ),
                ));
            }
        }

        // The underlying parser numbers days of week 1-7 starting at Sunday;
        // classical cron uses 0-6 (and 7 as Sunday). Rewriting numeric days
        // to names sidesteps the mismatch entirely.
        let mut normalized = fields;
        normalized[5] = rewrite_day_of_week(&normalized[5]);
        let normalized = normalized.join(" ");

        let inner = match cron::Schedule::from_str(&normalized) {
            Ok(inner) => inner,
            Err(e) => return Err(invalid(expr, &locate_bad_field(&normalized, offset, e))),
        };

        Ok(Schedule::Cron {
            expr: normalized,
            inner,
        })
    }

    /// Next firing instant strictly after `after`, in local time.
    /// `None` when the schedule has no future firings.
    pub fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        match self {
            Schedule::Cron { inner, .. } => inner.after(&after).next(),
            Schedule::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron { expr, .. } => f.write_str(expr),
            Schedule::Every(interval) => write!(f, "@every {}", format_duration(*interval)),
        }
    }
}

fn invalid(expr: &str, reason: &str) -> Error {
    Error::Schedule {
        expr: expr.to_string(),
        reason: reason.to_string(),
    }
}

fn expand_descriptor(name: &str) -> Option<&'static str> {
    match name {
        "yearly" | "annually" => Some("0 0 0 1 1 *"),
        "monthly" => Some("0 0 0 1 * *"),
        "weekly" => Some("0 0 0 * * SUN"),
        "daily" | "midnight" => Some("0 0 0 * * *"),
        "hourly" => Some("0 0 * * * *"),
        _ => None,
    }
}

/// Rewrite numeric day-of-week values (0-7, both 0 and 7 meaning Sunday) to
/// three-letter names. Step divisors after `/` are left untouched.
fn rewrite_day_of_week(field: &str) -> String {
    const NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

    let name_for = |tok: &str| -> String {
        match tok.parse::<usize>() {
            Ok(n) if n <= 7 => NAMES[n % 7].to_string(),
            _ => tok.to_string(),
        }
    };

    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((r, s)) => (r, Some(s)),
                None => (item, None),
            };
            let range = range
                .split('-')
                .map(&name_for)
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(s) => format!("{range}/{s}"),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Pin a cron parse failure to a single field when one field alone is at
/// fault, so the error can name it.
fn locate_bad_field(normalized: &str, offset: usize, err: cron::error::Error) -> String {
    let fields: Vec<&str> = normalized.split_whitespace().collect();
    for (i, field) in fields.iter().enumerate() {
        let mut probe: Vec<&str> = vec!["*"; 6];
        probe[i] = field;
        if cron::Schedule::from_str(&probe.join(" ")).is_err() {
            return format!(
                "field {} ({}) is invalid: {field:?}",
                i.saturating_sub(offset),
                FIELD_NAMES[i]
            );
        }
    }
    err.to_string()
}

/// Parse a duration written as integer `h`/`m`/`s` parts, e.g. `"90s"`,
/// `"1h30m"`. At least one part is required.
pub(crate) fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if s.is_empty() {
        return Err("duration is empty".to_string());
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(format!("expected a number before {c:?} in duration {s:?}"));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("number out of range in duration {s:?}"))?;
        digits.clear();
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(format!("unknown unit {c:?} in duration {s:?}, expected h, m or s")),
        };
        total = total
            .checked_add(value.checked_mul(unit).ok_or("duration overflows")?)
            .ok_or("duration overflows")?;
    }
    if !digits.is_empty() {
        return Err(format!("missing unit after {digits:?} in duration {s:?}"));
    }

    Ok(Duration::from_secs(total))
}

/// Format a duration as its shortest `h`/`m`/`s` spelling; inverse of
/// [`parse_duration`].
pub(crate) fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn parses_five_field_expression() {
        let s = Schedule::parse("*/5 * * * *").unwrap();
        assert_eq!(s.to_string(), "0 */5 * * * *");
    }

    #[test]
    fn parses_six_field_expression() {
        let s = Schedule::parse("30 */5 * * * *").unwrap();
        assert_eq!(s.to_string(), "30 */5 * * * *");
    }

    #[test]
    fn five_field_fires_at_second_zero() {
        let s = Schedule::parse("* * * * *").unwrap();
        let from = Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 10).unwrap();
        let next = s.next_after(from).unwrap();
        assert_eq!(next.second(), 0);
        assert_eq!(next.minute(), 1);
    }

    #[test]
    fn descriptors_expand() {
        for (descriptor, expanded) in [
            ("@yearly", "0 0 0 1 1 *"),
            ("@annually", "0 0 0 1 1 *"),
            ("@monthly", "0 0 0 1 * *"),
            ("@weekly", "0 0 0 * * SUN"),
            ("@daily", "0 0 0 * * *"),
            ("@midnight", "0 0 0 * * *"),
            ("@hourly", "0 0 * * * *"),
        ] {
            let s = Schedule::parse(descriptor).unwrap();
            assert_eq!(s.to_string(), expanded, "{descriptor}");
        }
    }

    #[test]
    fn unknown_descriptor_is_rejected() {
        let err = Schedule::parse("@fortnightly").unwrap_err();
        assert!(err.to_string().contains("unknown descriptor"));
    }

    #[test]
    fn every_parses_compound_durations() {
        match Schedule::parse("@every 1h30m").unwrap() {
            Schedule::Every(d) => assert_eq!(d, Duration::from_secs(5400)),
            other => panic!("expected Every, got {other:?}"),
        }
        match Schedule::parse("@every 90s").unwrap() {
            Schedule::Every(d) => assert_eq!(d, Duration::from_secs(90)),
            other => panic!("expected Every, got {other:?}"),
        }
    }

    #[test]
    fn every_rejects_bad_durations() {
        assert!(Schedule::parse("@every").is_err());
        assert!(Schedule::parse("@every 5x").is_err());
        assert!(Schedule::parse("@every h").is_err());
        assert!(Schedule::parse("@every 10").is_err());
        assert!(Schedule::parse("@every 0s").is_err());
    }

    #[test]
    fn every_advances_by_interval() {
        let s = Schedule::parse("@every 90s").unwrap();
        let from = Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let next = s.next_after(from).unwrap();
        assert_eq!((next - from).num_seconds(), 90);
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        let err = Schedule::parse("* * *").unwrap_err();
        assert!(err.to_string().contains("expected 5 or 6 fields, got 3"));
    }

    #[test]
    fn bad_field_error_names_the_field() {
        let err = Schedule::parse("* 99 * * *").unwrap_err().to_string();
        assert!(err.contains("field 1"), "{err}");
        assert!(err.contains("hour"), "{err}");
    }

    #[test]
    fn invalid_character_error_names_the_field() {
        let err = Schedule::parse("* * * * mon!tue").unwrap_err().to_string();
        assert!(err.contains("field 4"), "{err}");
        assert!(err.contains("day of week"), "{err}");
    }

    #[test]
    fn numeric_days_of_week_follow_classical_cron() {
        // 0 and 7 are both Sunday; 1-5 is Monday through Friday.
        let s = Schedule::parse("0 0 * * 1-5").unwrap();
        assert_eq!(s.to_string(), "0 0 0 * * MON-FRI");
        let s = Schedule::parse("0 0 * * 0").unwrap();
        assert_eq!(s.to_string(), "0 0 0 * * SUN");
        let s = Schedule::parse("0 0 * * 7").unwrap();
        assert_eq!(s.to_string(), "0 0 0 * * SUN");
        // A Friday.
        let friday = Local.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
        let weekday = Schedule::parse("0 12 * * 1-5").unwrap();
        let next = weekday.next_after(friday).unwrap();
        assert_eq!(next.hour(), 12);
        assert_eq!(next.date_naive(), friday.date_naive());
    }

    #[test]
    fn step_divisor_in_day_of_week_is_preserved() {
        let s = Schedule::parse("0 0 * * 1-5/2").unwrap();
        assert_eq!(s.to_string(), "0 0 0 * * MON-FRI/2");
    }

    #[test]
    fn next_is_strictly_after_reference() {
        let s = Schedule::parse("0 * * * * *").unwrap();
        let on_the_minute = Local.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap();
        let next = s.next_after(on_the_minute).unwrap();
        assert!(next > on_the_minute);
        assert_eq!(next.minute(), 6);
    }

    #[test]
    fn reparse_yields_identical_firing_sequence() {
        for expr in ["*/7 3 * * *", "15 */2 * * * *", "@weekly", "@every 2h5m"] {
            let first = Schedule::parse(expr).unwrap();
            let second = Schedule::parse(&first.to_string()).unwrap();
            let mut from = Local.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
            for _ in 0..5 {
                let a = first.next_after(from).unwrap();
                let b = second.next_after(from).unwrap();
                assert_eq!(a, b, "{expr}");
                from = a;
            }
        }
    }

    #[test]
    fn duration_round_trips() {
        for (text, canonical) in [("90s", "1m30s"), ("1h30m", "1h30m"), ("3600s", "1h")] {
            let d = parse_duration(text).unwrap();
            assert_eq!(format_duration(d), canonical);
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
    }
}
