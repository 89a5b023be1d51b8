//! Schedule expressions.
//!
//! A task schedule is either the manual sentinel (`manual`, `@manual`, or empty)
//! or one or more cron expressions separated by `;` or newlines:
//! - 5 fields `MIN HOUR DOM MON DOW` (fires at second 0)
//! - 6/7 fields with leading seconds (and optional trailing year)
//! - descriptors such as `@hourly`, `@daily`, `@weekly`
//!
//! Example: `"0 8 * * *; 30 17 * * 1-5"` = every day at 8:00 plus weekdays at 17:30.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use scriptguard_core::error::{Result, ScriptGuardError};
use std::collections::HashSet;
use std::str::FromStr;

/// Most fire times one task may carry.
pub const MAX_EXPRESSIONS: usize = 60;

/// A parsed task schedule.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Runs only on demand.
    Manual,
    Cron(Vec<CronExpr>),
}

/// One cron expression with its original text.
#[derive(Debug, Clone)]
pub struct CronExpr {
    pub source: String,
    schedule: ::cron::Schedule,
}

impl Schedule {
    /// Parse a schedule string, rejecting bad or duplicate expressions.
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        if is_manual(trimmed) {
            return Ok(Schedule::Manual);
        }

        let parts: Vec<&str> = trimmed
            .split([';', '\n'])
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.len() > MAX_EXPRESSIONS {
            return Err(ScriptGuardError::validation(format!(
                "at most {MAX_EXPRESSIONS} cron expressions per task"
            )));
        }

        let mut seen = HashSet::new();
        let mut exprs = Vec::with_capacity(parts.len());
        for part in parts {
            if !seen.insert(part) {
                return Err(ScriptGuardError::validation(format!(
                    "duplicate cron expression: '{part}'"
                )));
            }
            exprs.push(CronExpr::parse(part)?);
        }
        Ok(Schedule::Cron(exprs))
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Schedule::Manual)
    }

    /// Earliest fire time strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Manual => None,
            Schedule::Cron(exprs) => {
                let local = after.with_timezone(&tz);
                exprs
                    .iter()
                    .filter_map(|e| e.schedule.after(&local).next())
                    .map(|next| next.with_timezone(&Utc))
                    .min()
            }
        }
    }
}

impl CronExpr {
    fn parse(expression: &str) -> Result<Self> {
        let fields = expression.split_whitespace().count();
        let normalized = if fields == 5 {
            format!("0 {expression}")
        } else {
            expression.to_string()
        };
        let schedule = ::cron::Schedule::from_str(&normalized).map_err(|e| {
            ScriptGuardError::validation(format!("invalid cron expression '{expression}': {e}"))
        })?;
        Ok(Self {
            source: expression.to_string(),
            schedule,
        })
    }
}

fn is_manual(expression: &str) -> bool {
    expression.is_empty()
        || expression.eq_ignore_ascii_case("manual")
        || expression.eq_ignore_ascii_case("@manual")
}

/// Resolve an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ScriptGuardError::validation(format!("unknown timezone: '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 22, h, m, s).unwrap()
    }

    #[test]
    fn test_manual_sentinels() {
        for expr in ["", "  ", "manual", "MANUAL", "@manual"] {
            assert!(Schedule::parse(expr).unwrap().is_manual(), "{expr:?}");
        }
        assert!(Schedule::Manual.next_after(at(10, 0, 0), Tz::UTC).is_none());
    }

    #[test]
    fn test_every_hour() {
        let schedule = Schedule::parse("0 * * * *").unwrap();
        let next = schedule.next_after(at(10, 30, 0), Tz::UTC).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (11, 0, 0));
    }

    #[test]
    fn test_specific_time() {
        let schedule = Schedule::parse("0 8 * * *").unwrap();
        let next = schedule.next_after(at(7, 0, 0), Tz::UTC).unwrap();
        assert_eq!((next.hour(), next.minute()), (8, 0));
    }

    #[test]
    fn test_seconds_field() {
        let schedule = Schedule::parse("*/10 * * * * *").unwrap();
        let next = schedule.next_after(at(10, 0, 3), Tz::UTC).unwrap();
        assert_eq!(next, at(10, 0, 10));
    }

    #[test]
    fn test_descriptor() {
        let schedule = Schedule::parse("@hourly").unwrap();
        let next = schedule.next_after(at(10, 15, 0), Tz::UTC).unwrap();
        assert_eq!(next, at(11, 0, 0));
    }

    #[test]
    fn test_multiple_expressions_pick_earliest() {
        let schedule = Schedule::parse("0 18 * * *; 30 9 * * *\n0 12 * * *").unwrap();
        let next = schedule.next_after(at(10, 0, 0), Tz::UTC).unwrap();
        assert_eq!(next, at(12, 0, 0));
    }

    #[test]
    fn test_timezone_shift() {
        // 08:00 in Shanghai is 00:00 UTC.
        let schedule = Schedule::parse("0 8 * * *").unwrap();
        let tz = parse_timezone("Asia/Shanghai").unwrap();
        let next = schedule.next_after(at(22, 0, 0), tz).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 23, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_expression() {
        assert!(Schedule::parse("bad").is_err());
        assert!(Schedule::parse("61 * * * *").is_err());
    }

    #[test]
    fn test_duplicates_rejected() {
        let err = Schedule::parse("0 8 * * *; 0 8 * * *").unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_too_many_expressions() {
        let exprs: Vec<String> = (0..61).map(|i| format!("{} {} * * *", i % 60, i / 60)).collect();
        assert!(Schedule::parse(&exprs.join(";")).is_err());
    }

    #[test]
    fn test_unknown_timezone() {
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert_eq!(parse_timezone("UTC").unwrap(), Tz::UTC);
    }
}
