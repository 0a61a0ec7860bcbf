//! ABOUTME: Clock & Cron Evaluator (C1) - seven-field cron parsing and next-fire computation
//! ABOUTME: Used both at dispatch time and to derive task deadlines

use chrono::{DateTime, Utc};
use cron::Schedule;
use cronmesh_core::{Error, Result};
use std::str::FromStr;

/// Parses `expr` and returns the first instant strictly greater than `from` at which it
/// fires (§4.1). Rejects malformed expressions with `Error::BadRequest`.
pub fn next(expr: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = parse(expr)?;
    schedule
        .after(&from)
        .next()
        .ok_or_else(|| Error::BadRequest(format!("cron expression '{}' has no upcoming fire time", expr)))
}

/// Validates a cron expression without computing a fire time.
pub fn validate(expr: &str) -> Result<()> {
    parse(expr).map(|_| ())
}

fn parse(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr).map_err(|e| Error::BadRequest(format!("invalid cron expression '{}': {}", expr, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_returns_first_fire_strictly_after_reference() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 11, 59, 0).unwrap();
        let fire = next("0 0 12 * * * *", from).unwrap();
        assert_eq!(fire, Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn next_on_exact_fire_instant_skips_to_the_following_one() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let fire = next("0 0 12 * * * *", from).unwrap();
        assert_eq!(fire, Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap());
    }

    #[test]
    fn every_second_expression_fires_each_second() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let fire = next("* * * * * * *", from).unwrap();
        assert_eq!(fire, from + chrono::Duration::seconds(1));
    }

    #[test]
    fn malformed_expression_is_rejected() {
        let from = Utc::now();
        let result = next("not a cron expression", from);
        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[test]
    fn validate_accepts_well_formed_expressions() {
        assert!(validate("0 */10 * * * *").is_ok());
        assert!(validate("0 0 1 * * *").is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        assert!(validate("0 0 99 * * *").is_err());
    }
}
