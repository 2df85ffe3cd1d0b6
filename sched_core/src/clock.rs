//! Pure time utilities: "now", and "next fire time after T for expression E in zone Z".
//!
//! Delegates cron-syntax parsing to the `cron` crate (a black box per the
//! design spec's non-goals) but normalizes both 5-field and 6-field
//! (with-seconds) expressions before handing them to it, since `cron`
//! requires the seconds field.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// Current instant, UTC.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Pad a 5-field cron expression (minute hour day month weekday) with a
/// leading seconds field so the `cron` crate, which requires six fields,
/// accepts it. 6-field-with-seconds expressions pass through unchanged.
fn normalize(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

fn parse(expression: &str) -> Result<Schedule> {
    let normalized = normalize(expression);
    Schedule::from_str(&normalized)
        .map_err(|e| Error::InvalidScheduleError(format!("{}: {}", expression, e)))
}

/// Validate a cron expression without computing a fire time.
pub fn validate(expression: &str) -> Result<()> {
    parse(expression).map(|_| ())
}

/// The next instant, strictly after `after`, at which `expression` fires in
/// `zone`. Returns `InvalidScheduleError` if the expression does not parse.
pub fn next_fire(expression: &str, after: DateTime<Utc>, zone: Tz) -> Result<DateTime<Utc>> {
    let schedule = parse(expression)?;
    let after_in_zone = after.with_timezone(&zone);
    schedule
        .after(&after_in_zone)
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            Error::InvalidScheduleError(format!(
                "schedule '{}' has no upcoming fire after {}",
                expression, after
            ))
        })
}

/// The next `n` fire instants after `after`, strictly increasing.
pub fn upcoming_fires(
    expression: &str,
    after: DateTime<Utc>,
    zone: Tz,
    n: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let schedule = parse(expression)?;
    let after_in_zone = after.with_timezone(&zone);
    let fires: Vec<DateTime<Utc>> = schedule
        .after(&after_in_zone)
        .take(n)
        .map(|dt| dt.with_timezone(&Utc))
        .collect();
    if fires.is_empty() && n > 0 {
        return Err(Error::InvalidScheduleError(format!(
            "schedule '{}' has no upcoming fires",
            expression
        )));
    }
    Ok(fires)
}

/// The system's local time zone, used when a job does not pin one.
///
/// `chrono_tz` has no notion of "the process's local zone" (unlike
/// `chrono::Local`), so callers that truly need the OS zone should resolve
/// it themselves (e.g. via the `iana-time-zone` crate) and pass it in; this
/// default exists so `nextFire` always has *some* zone to reason in.
pub fn default_zone() -> Tz {
    Tz::UTC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_expressions() {
        assert!(validate("not a cron expression").is_err());
        assert!(validate("").is_err());
    }

    #[test]
    fn accepts_five_and_six_field_forms() {
        assert!(validate("*/5 * * * *").is_ok());
        assert!(validate("*/5 * * * * *").is_ok());
    }

    #[test]
    fn next_fire_is_strictly_after_input() {
        let now = Utc.with_ymd_and_hms(2026, 7, 26, 12, 0, 0).unwrap();
        let fire = next_fire("0 * * * * *", now, Tz::UTC).unwrap();
        assert!(fire > now);
    }

    #[test]
    fn next_fire_sequence_is_strictly_increasing() {
        let mut t = Utc.with_ymd_and_hms(2026, 7, 26, 12, 0, 0).unwrap();
        for _ in 0..5 {
            let next = next_fire("*/5 * * * * *", t, Tz::UTC).unwrap();
            assert!(next > t);
            t = next;
        }
    }

    #[test]
    fn upcoming_fires_returns_requested_count() {
        let now = Utc.with_ymd_and_hms(2026, 7, 26, 12, 0, 0).unwrap();
        let fires = upcoming_fires("0 * * * * *", now, Tz::UTC, 3).unwrap();
        assert_eq!(fires.len(), 3);
        assert!(fires[0] < fires[1]);
        assert!(fires[1] < fires[2]);
    }

    #[test]
    fn invalid_schedule_error_on_bad_expression() {
        let now = Utc::now();
        assert!(next_fire("garbage", now, Tz::UTC).is_err());
    }
}
