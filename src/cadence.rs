//! Cadence expressions
//!
//! A policy's `schedule` string is parsed into a [`Cadence`], which answers
//! "when does this fire next?". Supported forms:
//!
//! - keywords: `hourly`, `daily`, `weekly` and `@hourly`, `@daily`,
//!   `@midnight`, `@weekly`
//! - fixed intervals: `every 15m`, `every 6h`, `every 2d` (units `ms`, `s`,
//!   `m`, `h`, `d`)
//! - the common five-field cron shapes: `M H * * *` (daily), `M * * * *`
//!   (hourly), `M H * * D` (weekly), `*/N * * * *` (every N minutes) and
//!   `0 */N * * *` (every N hours)
//!
//! Anything else is reported as a [`ScheduleParseWarning`];
//! [`Cadence::parse_or_default`] then falls back to a default cadence instead
//! of failing.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc, Weekday};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

/// Longest accepted fixed interval
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 86_400);

lazy_static! {
    static ref EVERY: Regex = Regex::new(r"^every\s+(\d+)\s*(ms|s|m|h|d)$").unwrap();
}

/// A cadence expression could not be interpreted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unrecognised schedule '{expression}': {reason}")]
pub struct ScheduleParseWarning {
    /// The expression as written
    pub expression: String,
    /// What was wrong with it
    pub reason: String,
}

impl ScheduleParseWarning {
    fn new(expression: &str, reason: impl Into<String>) -> Self {
        Self {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// A parsed recurring trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed interval measured from the previous fire time
    Every(Duration),
    /// Every hour at `minute`
    Hourly { minute: u32 },
    /// Every day at `hour:minute` UTC
    Daily { hour: u32, minute: u32 },
    /// Every week on `weekday` at `hour:minute` UTC
    Weekly { weekday: Weekday, hour: u32, minute: u32 },
}

impl Cadence {
    /// Midnight UTC every day
    pub fn daily() -> Self {
        Cadence::Daily { hour: 0, minute: 0 }
    }

    /// Parse a cadence expression
    pub fn parse(expression: &str) -> Result<Self, ScheduleParseWarning> {
        let expr = expression.trim().to_ascii_lowercase();

        match expr.as_str() {
            "hourly" | "@hourly" => return Ok(Cadence::Hourly { minute: 0 }),
            "daily" | "@daily" | "@midnight" => return Ok(Cadence::daily()),
            "weekly" | "@weekly" => {
                return Ok(Cadence::Weekly {
                    weekday: Weekday::Sun,
                    hour: 0,
                    minute: 0,
                })
            }
            _ => {}
        }

        if let Some(caps) = EVERY.captures(&expr) {
            let amount: u64 = caps[1]
                .parse()
                .map_err(|_| ScheduleParseWarning::new(expression, "interval is too large"))?;
            if amount == 0 {
                return Err(ScheduleParseWarning::new(expression, "interval must be positive"));
            }
            let duration = match &caps[2] {
                "ms" => Duration::from_millis(amount),
                "s" => Duration::from_secs(amount),
                "m" => Duration::from_secs(amount.saturating_mul(60)),
                "h" => Duration::from_secs(amount.saturating_mul(3_600)),
                _ => Duration::from_secs(amount.saturating_mul(86_400)),
            };
            if duration > MAX_INTERVAL {
                return Err(ScheduleParseWarning::new(
                    expression,
                    "interval is longer than 366 days",
                ));
            }
            return Ok(Cadence::Every(duration));
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() == 5 {
            return parse_cron(expression, &fields);
        }

        Err(ScheduleParseWarning::new(expression, "unsupported cadence expression"))
    }

    /// Parse an expression, falling back to `default` with a logged warning
    pub fn parse_or_default(
        expression: &str,
        default: Cadence,
    ) -> (Cadence, Option<ScheduleParseWarning>) {
        match Cadence::parse(expression) {
            Ok(cadence) => (cadence, None),
            Err(warning) => {
                warn!(
                    schedule = %warning.expression,
                    reason = %warning.reason,
                    fallback = %default,
                    "ScheduleParseWarning: using default cadence"
                );
                (default, Some(warning))
            }
        }
    }

    /// First fire time strictly after `from`
    ///
    /// `Every` intervals are clamped to [`MAX_INTERVAL`].
    pub fn next_fire_time(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Cadence::Every(d) => {
                let step = ChronoDuration::from_std(d.min(MAX_INTERVAL))
                    .unwrap_or_else(|_| ChronoDuration::days(1));
                from.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
            Cadence::Hourly { minute } => {
                let candidate = at(from, from.hour(), minute);
                if candidate > from {
                    candidate
                } else {
                    candidate + ChronoDuration::hours(1)
                }
            }
            Cadence::Daily { hour, minute } => {
                let candidate = at(from, hour, minute);
                if candidate > from {
                    candidate
                } else {
                    candidate + ChronoDuration::days(1)
                }
            }
            Cadence::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let days_ahead = (7 + weekday.num_days_from_monday() as i64
                    - from.weekday().num_days_from_monday() as i64)
                    % 7;
                let candidate = at(from, hour, minute) + ChronoDuration::days(days_ahead);
                if candidate > from {
                    candidate
                } else {
                    candidate + ChronoDuration::days(7)
                }
            }
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Every(d) => write!(f, "every {:?}", d),
            Cadence::Hourly { minute } => write!(f, "hourly at :{:02}", minute),
            Cadence::Daily { hour, minute } => write!(f, "daily at {:02}:{:02}", hour, minute),
            Cadence::Weekly {
                weekday,
                hour,
                minute,
            } => write!(f, "weekly on {} at {:02}:{:02}", weekday, hour, minute),
        }
    }
}

/// Next fire time of `schedule` after `from`, using `default` when the
/// expression cannot be parsed
pub fn next_fire_time(schedule: &str, from: DateTime<Utc>, default: Cadence) -> DateTime<Utc> {
    Cadence::parse_or_default(schedule, default)
        .0
        .next_fire_time(from)
}

/// `from`'s date at `hour:minute:00`
fn at(from: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    from.date_naive()
        .and_hms_opt(hour, minute, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(from)
}

fn parse_cron(expression: &str, fields: &[&str]) -> Result<Cadence, ScheduleParseWarning> {
    let unsupported = || ScheduleParseWarning::new(expression, "unsupported cron shape");
    let (minute, hour, dom, month, dow) = (fields[0], fields[1], fields[2], fields[3], fields[4]);

    if dom != "*" || month != "*" {
        return Err(unsupported());
    }

    // */N * * * *
    if let Some(step) = minute.strip_prefix("*/") {
        if hour != "*" || dow != "*" {
            return Err(unsupported());
        }
        let n = parse_bounded(expression, step, 1, 59)?;
        return Ok(Cadence::Every(Duration::from_secs(n as u64 * 60)));
    }

    let minute = parse_bounded(expression, minute, 0, 59)?;

    // M */N * * *
    if let Some(step) = hour.strip_prefix("*/") {
        if dow != "*" || minute != 0 {
            return Err(unsupported());
        }
        let n = parse_bounded(expression, step, 1, 23)?;
        return Ok(Cadence::Every(Duration::from_secs(n as u64 * 3_600)));
    }

    if hour == "*" {
        if dow != "*" {
            return Err(unsupported());
        }
        return Ok(Cadence::Hourly { minute });
    }

    let hour = parse_bounded(expression, hour, 0, 23)?;
    if dow == "*" {
        return Ok(Cadence::Daily { hour, minute });
    }

    let weekday = match parse_bounded(expression, dow, 0, 7)? {
        1 => Weekday::Mon,
        2 => Weekday::Tue,
        3 => Weekday::Wed,
        4 => Weekday::Thu,
        5 => Weekday::Fri,
        6 => Weekday::Sat,
        _ => Weekday::Sun,
    };
    Ok(Cadence::Weekly {
        weekday,
        hour,
        minute,
    })
}

fn parse_bounded(
    expression: &str,
    field: &str,
    min: u32,
    max: u32,
) -> Result<u32, ScheduleParseWarning> {
    let value: u32 = field.parse().map_err(|_| {
        ScheduleParseWarning::new(expression, format!("'{}' is not a number", field))
    })?;
    if value < min || value > max {
        return Err(ScheduleParseWarning::new(
            expression,
            format!("'{}' is outside {}..={}", field, min, max),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_keywords() {
        assert_eq!(Cadence::parse("daily").unwrap(), Cadence::daily());
        assert_eq!(Cadence::parse("@midnight").unwrap(), Cadence::daily());
        assert_eq!(Cadence::parse("Hourly").unwrap(), Cadence::Hourly { minute: 0 });
        assert_eq!(
            Cadence::parse("weekly").unwrap(),
            Cadence::Weekly {
                weekday: Weekday::Sun,
                hour: 0,
                minute: 0
            }
        );
    }

    #[test]
    fn test_every_intervals() {
        assert_eq!(
            Cadence::parse("every 15m").unwrap(),
            Cadence::Every(Duration::from_secs(900))
        );
        assert_eq!(
            Cadence::parse("every 100ms").unwrap(),
            Cadence::Every(Duration::from_millis(100))
        );
        assert!(Cadence::parse("every 0h").is_err());
    }

    #[test]
    fn test_huge_interval_is_rejected() {
        let err = Cadence::parse("every 100000000d").unwrap_err();
        assert_eq!(err.expression, "every 100000000d");
        assert!(Cadence::parse("every 99999999999999999999999s").is_err());
        assert!(Cadence::parse("every 366d").is_ok());
        assert!(Cadence::parse("every 367d").is_err());

        let (cadence, warning) = Cadence::parse_or_default("every 100000000d", Cadence::daily());
        assert_eq!(cadence, Cadence::daily());
        assert!(warning.is_some());
    }

    #[test]
    fn test_next_fire_time_never_overflows() {
        let from = ts("2024-03-10T12:00:00Z");
        let cadence = Cadence::Every(Duration::from_secs(u64::MAX / 2));
        assert_eq!(
            cadence.next_fire_time(from),
            from + ChronoDuration::from_std(MAX_INTERVAL).unwrap()
        );
        assert_eq!(
            cadence.next_fire_time(DateTime::<Utc>::MAX_UTC),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[test]
    fn test_cron_shapes() {
        assert_eq!(
            Cadence::parse("0 2 * * *").unwrap(),
            Cadence::Daily { hour: 2, minute: 0 }
        );
        assert_eq!(Cadence::parse("30 * * * *").unwrap(), Cadence::Hourly { minute: 30 });
        assert_eq!(
            Cadence::parse("15 3 * * 1").unwrap(),
            Cadence::Weekly {
                weekday: Weekday::Mon,
                hour: 3,
                minute: 15
            }
        );
        assert_eq!(
            Cadence::parse("*/5 * * * *").unwrap(),
            Cadence::Every(Duration::from_secs(300))
        );
        assert_eq!(
            Cadence::parse("0 */6 * * *").unwrap(),
            Cadence::Every(Duration::from_secs(6 * 3_600))
        );
        assert!(Cadence::parse("0 2 1 * *").is_err());
        assert!(Cadence::parse("61 2 * * *").is_err());
    }

    #[test]
    fn test_unparseable_falls_back_with_warning() {
        let (cadence, warning) = Cadence::parse_or_default("whenever", Cadence::daily());
        assert_eq!(cadence, Cadence::daily());
        let warning = warning.unwrap();
        assert_eq!(warning.expression, "whenever");

        let (cadence, warning) = Cadence::parse_or_default("hourly", Cadence::daily());
        assert_eq!(cadence, Cadence::Hourly { minute: 0 });
        assert!(warning.is_none());
    }

    #[test]
    fn test_next_fire_daily() {
        let cadence = Cadence::Daily { hour: 2, minute: 0 };
        assert_eq!(
            cadence.next_fire_time(ts("2024-03-10T01:00:00Z")),
            ts("2024-03-10T02:00:00Z")
        );
        // Exactly at the fire time moves to the next day
        assert_eq!(
            cadence.next_fire_time(ts("2024-03-10T02:00:00Z")),
            ts("2024-03-11T02:00:00Z")
        );
    }

    #[test]
    fn test_next_fire_hourly() {
        let cadence = Cadence::Hourly { minute: 30 };
        assert_eq!(
            cadence.next_fire_time(ts("2024-03-10T23:45:00Z")),
            ts("2024-03-11T00:30:00Z")
        );
    }

    #[test]
    fn test_next_fire_weekly() {
        // 2024-03-10 is a Sunday
        let cadence = Cadence::Weekly {
            weekday: Weekday::Mon,
            hour: 3,
            minute: 0,
        };
        assert_eq!(
            cadence.next_fire_time(ts("2024-03-10T12:00:00Z")),
            ts("2024-03-11T03:00:00Z")
        );
        assert_eq!(
            cadence.next_fire_time(ts("2024-03-11T04:00:00Z")),
            ts("2024-03-18T03:00:00Z")
        );
    }

    #[test]
    fn test_next_fire_time_free_function() {
        let from = ts("2024-03-10T12:00:00Z");
        assert_eq!(
            next_fire_time("every 90s", from, Cadence::daily()),
            ts("2024-03-10T12:01:30Z")
        );
        assert_eq!(
            next_fire_time("nonsense", from, Cadence::daily()),
            ts("2024-03-11T00:00:00Z")
        );
    }
}
