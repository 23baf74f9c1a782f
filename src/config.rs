//! Job options, environment snapshot and duration parsing

use crate::error::{MigrationError, Result};
use chrono::Duration;
use std::collections::BTreeMap;
use thiserror::Error;

/// Batch size used when none is given (or zero is given).
pub const DEFAULT_BATCH_SIZE: u64 = 1_000_000;

/// Snapshot of job-specific environment variables.
///
/// Captured once at startup so jobs never read the process environment
/// behind the caller's back.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Capture every unicode environment variable of the current process.
    pub fn from_process() -> Self {
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect()
    }

    /// Look up a variable, treating an empty value as set.
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Look up a variable, treating an empty value as unset.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.var(key).filter(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Options shared by every job, as resolved by the CLI.
#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    /// Target database name
    pub database: String,
    /// Target collection, for jobs that operate on one
    pub collection: Option<String>,
    /// Maximum number of documents a job may touch at once
    pub batch_size: Option<u64>,
    /// Job-specific parameters
    pub env: Environment,
}

impl MigrationOptions {
    /// Problems with the options every job needs.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.database.is_empty() {
            problems.push("database name not specified".to_string());
        }
        problems
    }

    /// The collection name, recording a problem if it is missing.
    pub fn require_collection(&self, problems: &mut Vec<String>) -> String {
        match self.collection.as_deref().filter(|c| !c.is_empty()) {
            Some(collection) => collection.to_string(),
            None => {
                problems.push("collection name not specified".to_string());
                String::new()
            }
        }
    }

    /// A required environment variable, recording a problem if it is missing.
    pub fn require_env(&self, key: &str, problems: &mut Vec<String>) -> Option<&str> {
        let value = self.env.var(key);
        if value.is_none() {
            problems.push(format!("expected environment variable '{}' was not specified", key));
        }
        value
    }

    /// The configured batch size, or [`DEFAULT_BATCH_SIZE`] when unset or zero.
    pub fn batch_size_or_default(&self) -> u64 {
        match self.batch_size {
            Some(size) if size > 0 => size,
            _ => DEFAULT_BATCH_SIZE,
        }
    }

    /// An optional non-negative limit from the environment, recording a
    /// problem if it is malformed or too large for a query limit.
    pub fn limit(&self, key: &str, problems: &mut Vec<String>) -> Option<i64> {
        let raw = self.env.non_empty(key)?;
        let parsed = raw
            .parse::<u64>()
            .map_err(|e| e.to_string())
            .and_then(|limit| i64::try_from(limit).map_err(|e| e.to_string()));
        match parsed {
            Ok(limit) => Some(limit),
            Err(e) => {
                problems.push(format!(
                    "parsing limit '{}' from env var '{}': {}",
                    raw, key, e
                ));
                None
            }
        }
    }

    /// Finish validation: fail with every recorded problem, if any.
    pub fn resolve(problems: Vec<String>) -> Result<()> {
        if problems.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::InvalidOptions(problems))
        }
    }
}

/// Why a duration string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,
    #[error("invalid number in duration")]
    InvalidNumber,
    #[error("missing unit in duration")]
    MissingUnit,
    #[error("unknown unit '{0}' in duration")]
    UnknownUnit(String),
    #[error("duration out of range")]
    Overflow,
}

/// Parse a duration such as `24h`, `1h30m`, `1.5h` or `250ms`.
///
/// Accepts an optional sign followed by one or more `<number><unit>` terms,
/// where the number may carry a fraction and the unit is one of
/// `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`. A bare `0` is also accepted.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, DurationError> {
    let (negative, mut rest) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };

    if rest == "0" {
        return Ok(Duration::zero());
    }
    if rest.is_empty() {
        return Err(DurationError::Empty);
    }

    let mut total: i128 = 0;
    while !rest.is_empty() {
        let int_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let int_part = &rest[..int_end];
        rest = &rest[int_end..];

        let mut frac_part = "";
        if let Some(after_dot) = rest.strip_prefix('.') {
            let frac_end = after_dot
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(after_dot.len());
            frac_part = &after_dot[..frac_end];
            rest = &after_dot[frac_end..];
        }
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(DurationError::InvalidNumber);
        }

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let scale: i128 = match unit {
            "" => return Err(DurationError::MissingUnit),
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 60 * 60 * 1_000_000_000,
            other => return Err(DurationError::UnknownUnit(other.to_string())),
        };

        let whole: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| DurationError::Overflow)?
        };
        let mut nanos = whole.checked_mul(scale).ok_or(DurationError::Overflow)?;

        if !frac_part.is_empty() {
            // Digits past nanosecond precision of an hour cannot matter.
            let digits = &frac_part[..frac_part.len().min(18)];
            let numerator: i128 = digits.parse().map_err(|_| DurationError::InvalidNumber)?;
            nanos += numerator * scale / 10i128.pow(digits.len() as u32);
        }

        total = total.checked_add(nanos).ok_or(DurationError::Overflow)?;
        if total > i64::MAX as i128 {
            return Err(DurationError::Overflow);
        }
    }

    let nanos = if negative { -total } else { total };
    Ok(Duration::nanoseconds(nanos as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::hours(24));
        assert_eq!(parse_duration("1m").unwrap(), Duration::minutes(1));
        assert_eq!(parse_duration("90s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::milliseconds(250));
        assert_eq!(parse_duration("3us").unwrap(), Duration::microseconds(3));
        assert_eq!(parse_duration("3µs").unwrap(), Duration::microseconds(3));
        assert_eq!(parse_duration("7ns").unwrap(), Duration::nanoseconds(7));
    }

    #[test]
    fn test_parse_compound_and_fractional() {
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::minutes(90)
        );
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration(".5s").unwrap(), Duration::milliseconds(500));
        assert_eq!(parse_duration("-2m").unwrap(), Duration::minutes(-2));
        assert_eq!(parse_duration("+2m").unwrap(), Duration::minutes(2));
        assert_eq!(parse_duration("0").unwrap(), Duration::zero());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(parse_duration(""), Err(DurationError::Empty));
        assert_eq!(parse_duration("10"), Err(DurationError::MissingUnit));
        assert_eq!(
            parse_duration("not_a_duration"),
            Err(DurationError::InvalidNumber)
        );
        assert_eq!(
            parse_duration("3d"),
            Err(DurationError::UnknownUnit("d".to_string()))
        );
        assert_eq!(parse_duration("."), Err(DurationError::InvalidNumber));
        assert_eq!(
            parse_duration("9999999999999999999h"),
            Err(DurationError::Overflow)
        );
    }

    #[test]
    fn test_batch_size_defaults() {
        let mut opts = MigrationOptions::default();
        assert_eq!(opts.batch_size_or_default(), DEFAULT_BATCH_SIZE);
        opts.batch_size = Some(0);
        assert_eq!(opts.batch_size_or_default(), DEFAULT_BATCH_SIZE);
        opts.batch_size = Some(10);
        assert_eq!(opts.batch_size_or_default(), 10);
    }

    #[test]
    fn test_validate_collects_problems() {
        let opts = MigrationOptions::default();
        let mut problems = opts.validate();
        opts.require_collection(&mut problems);
        opts.require_env("GOAL_TTL", &mut problems);

        assert_eq!(
            problems,
            vec![
                "database name not specified".to_string(),
                "collection name not specified".to_string(),
                "expected environment variable 'GOAL_TTL' was not specified".to_string(),
            ]
        );
    }

    #[test]
    fn test_limit_parsing() {
        let opts = MigrationOptions {
            env: [("PROJECT_LIMIT", "25"), ("EVENT_LIMIT", "many")]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let mut problems = Vec::new();
        assert_eq!(opts.limit("PROJECT_LIMIT", &mut problems), Some(25));
        assert_eq!(opts.limit("MISSING_LIMIT", &mut problems), None);
        assert!(problems.is_empty());

        assert_eq!(opts.limit("EVENT_LIMIT", &mut problems), None);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("parsing limit 'many' from env var 'EVENT_LIMIT'"));

        let err = MigrationOptions::resolve(problems).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidOptions(ref p) if p.len() == 1));
        assert!(MigrationOptions::resolve(Vec::new()).is_ok());
    }

    #[test]
    fn test_limit_beyond_query_range_is_rejected() {
        let opts = MigrationOptions {
            env: [
                ("PROJECT_LIMIT", "9223372036854775807"),
                ("EVENT_LIMIT", "9223372036854775808"),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        let mut problems = Vec::new();
        assert_eq!(opts.limit("PROJECT_LIMIT", &mut problems), Some(i64::MAX));
        assert!(problems.is_empty());

        assert_eq!(opts.limit("EVENT_LIMIT", &mut problems), None);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("'9223372036854775808' from env var 'EVENT_LIMIT'"));
    }
}
