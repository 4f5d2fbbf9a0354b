//! Cron expression parsing and next-run computation.
//!
//! Expressions have 5 fields (`minute hour day month weekday`) or 6
//! (`second minute hour day month weekday`). A field is `*`, `*/N`
//! (matches when `value % N == 0`), or a literal integer. Weekday 0 is
//! Sunday. Ranges and comma lists are not supported.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};

/// Forward-search bound for [`CronExpression::next_run`] (24 hours at
/// one-second resolution).
const MAX_SEARCH_STEPS: u32 = 86_400;

/// One parsed cron field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    /// `*`
    Any,
    /// `*/N`
    Step(u32),
    /// Literal integer.
    Exact(u32),
}

impl Field {
    fn parse(token: &str) -> JobResult<Self> {
        if token == "*" {
            return Ok(Field::Any);
        }
        if let Some(step) = token.strip_prefix("*/") {
            let n: u32 = step
                .parse()
                .map_err(|_| JobError::InvalidCron(format!("bad step field: {}", token)))?;
            if n == 0 {
                return Err(JobError::InvalidCron(format!("zero step field: {}", token)));
            }
            return Ok(Field::Step(n));
        }
        let value: u32 = token
            .parse()
            .map_err(|_| JobError::InvalidCron(format!("bad field: {}", token)))?;
        Ok(Field::Exact(value))
    }

    fn matches(self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step(n) => value % n == 0,
            Field::Exact(v) => value == v,
        }
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    second: Option<Field>,
    minute: Field,
    hour: Field,
    day: Field,
    month: Field,
    weekday: Field,
}

impl CronExpression {
    /// Parse an expression. Anything other than 5 or 6 fields is an
    /// error.
    pub fn parse(expr: &str) -> JobResult<Self> {
        let tokens: Vec<&str> = expr.split_whitespace().collect();

        let (second, rest): (Option<Field>, &[&str]) = match tokens.len() {
            5 => (None, &tokens[..]),
            6 => (Some(Field::parse(tokens[0])?), &tokens[1..]),
            n => {
                return Err(JobError::InvalidCron(format!(
                    "expected 5 or 6 fields, got {}: {:?}",
                    n, expr
                )))
            }
        };

        Ok(Self {
            second,
            minute: Field::parse(rest[0])?,
            hour: Field::parse(rest[1])?,
            day: Field::parse(rest[2])?,
            month: Field::parse(rest[3])?,
            weekday: Field::parse(rest[4])?,
        })
    }

    /// Resolution of this expression: one second for 6-field
    /// expressions, one minute otherwise.
    fn unit(&self) -> ChronoDuration {
        if self.second.is_some() {
            ChronoDuration::seconds(1)
        } else {
            ChronoDuration::minutes(1)
        }
    }

    /// True when the instant matches every field.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        let second_ok = match self.second {
            Some(field) => field.matches(t.second()),
            None => true,
        };
        second_ok
            && self.minute.matches(t.minute())
            && self.hour.matches(t.hour())
            && self.day.matches(t.day())
            && self.month.matches(t.month())
            && self.weekday.matches(t.weekday().num_days_from_sunday())
    }

    /// First matching instant strictly after `from`, searching one
    /// unit at a time for at most 86 400 steps. Exhaustion is an
    /// error.
    pub fn next_run(&self, from: DateTime<Utc>) -> JobResult<DateTime<Utc>> {
        let unit = self.unit();
        let mut t = truncate_to(from, self.second.is_some()) + unit;

        for _ in 0..MAX_SEARCH_STEPS {
            if self.matches(t) {
                return Ok(t);
            }
            t += unit;
        }

        Err(JobError::InvalidCron(
            "no matching instant within the search window".to_string(),
        ))
    }
}

/// Pure next-run computation over a textual expression.
pub fn next_run(expr: &str, from: DateTime<Utc>) -> JobResult<DateTime<Utc>> {
    CronExpression::parse(expr)?.next_run(from)
}

/// Drops sub-second precision, and seconds too for minute-resolution
/// expressions.
fn truncate_to(t: DateTime<Utc>, keep_seconds: bool) -> DateTime<Utc> {
    let t = t.with_nanosecond(0).unwrap_or(t);
    if keep_seconds {
        t
    } else {
        t.with_second(0).unwrap_or(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_field_count_validation() {
        assert!(CronExpression::parse("* * * * *").is_ok());
        assert!(CronExpression::parse("* * * * * *").is_ok());
        assert!(CronExpression::parse("* * * *").is_err());
        assert!(CronExpression::parse("* * * * * * *").is_err());
        assert!(CronExpression::parse("").is_err());
    }

    #[test]
    fn test_bad_tokens_rejected() {
        assert!(CronExpression::parse("a * * * *").is_err());
        assert!(CronExpression::parse("*/0 * * * *").is_err());
        assert!(CronExpression::parse("*/x * * * *").is_err());
        assert!(CronExpression::parse("1-5 * * * *").is_err());
        assert!(CronExpression::parse("1,5 * * * *").is_err());
    }

    #[test]
    fn test_step_matches_on_modulo() {
        let expr = CronExpression::parse("*/15 * * * *").unwrap();
        assert!(expr.matches(at(2024, 3, 1, 9, 0, 0)));
        assert!(expr.matches(at(2024, 3, 1, 9, 45, 0)));
        assert!(!expr.matches(at(2024, 3, 1, 9, 7, 0)));
    }

    #[test]
    fn test_exact_and_weekday_fields() {
        // 2024-03-03 is a Sunday.
        let expr = CronExpression::parse("30 8 * * 0").unwrap();
        assert!(expr.matches(at(2024, 3, 3, 8, 30, 0)));
        assert!(!expr.matches(at(2024, 3, 4, 8, 30, 0)));
        assert!(!expr.matches(at(2024, 3, 3, 8, 31, 0)));
    }

    #[test]
    fn test_next_run_minute_resolution() {
        let expr = CronExpression::parse("*/5 * * * *").unwrap();
        let from = at(2024, 3, 1, 9, 2, 33);
        let next = expr.next_run(from).unwrap();
        assert_eq!(next, at(2024, 3, 1, 9, 5, 0));
    }

    #[test]
    fn test_next_run_second_resolution() {
        let expr = CronExpression::parse("*/1 * * * * *").unwrap();
        let from = at(2024, 3, 1, 9, 2, 33);
        let next = expr.next_run(from).unwrap();
        assert_eq!(next, at(2024, 3, 1, 9, 2, 34));
    }

    #[test]
    fn test_next_run_strictly_advances_at_fixed_point() {
        let expr = CronExpression::parse("* * * * *").unwrap();
        let t0 = at(2024, 3, 1, 9, 0, 0);
        let t1 = expr.next_run(t0).unwrap();
        let t2 = expr.next_run(t1).unwrap();
        assert!(t1 > t0);
        assert!(t2 > t1);
    }

    #[test]
    fn test_next_run_exhaustion_errors() {
        // April 31st never exists, and the search window ends before
        // the next April.
        let expr = CronExpression::parse("0 0 31 4 *").unwrap();
        let from = at(2024, 4, 1, 0, 0, 0);
        assert!(expr.next_run(from).is_err());
    }

    #[test]
    fn test_next_run_crosses_midnight() {
        let expr = CronExpression::parse("0 3 * * *").unwrap();
        let from = at(2024, 3, 1, 22, 15, 0);
        assert_eq!(expr.next_run(from).unwrap(), at(2024, 3, 2, 3, 0, 0));
    }

    #[test]
    fn test_textual_helper() {
        let from = at(2024, 3, 1, 9, 0, 0);
        assert_eq!(
            next_run("*/10 * * * * *", from).unwrap(),
            at(2024, 3, 1, 9, 0, 10)
        );
        assert!(next_run("nope", from).is_err());
    }
}
