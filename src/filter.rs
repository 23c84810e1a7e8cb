//! Stateless predicates applied to listed entries.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

use crate::error::MirrorError;

/// Include/exclude regex lists. Excludes are checked first; an entry is then
/// accepted when any include pattern is found in its name.
#[derive(Debug, Clone)]
pub struct NameMatcher {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl NameMatcher {
    pub fn new<S: AsRef<str>>(includes: &[S], excludes: &[S]) -> Result<Self, MirrorError> {
        Ok(Self {
            includes: compile_all(includes)?,
            excludes: compile_all(excludes)?,
        })
    }

    pub fn single(pattern: &str) -> Result<Self, MirrorError> {
        Self::new(&[pattern], &[])
    }

    pub fn is_match(&self, name: &str) -> bool {
        if self.excludes.iter().any(|re| re.is_match(name)) {
            return false;
        }
        self.includes.iter().any(|re| re.is_match(name))
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty()
    }
}

fn compile_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, MirrorError> {
    patterns
        .iter()
        .map(|pattern| pattern.as_ref().trim())
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| {
            Regex::new(pattern).map_err(|err| MirrorError::InvalidPattern {
                pattern: pattern.to_string(),
                message: err.to_string(),
            })
        })
        .collect()
}

/// Inclusive calendar-date range. Bounds are `YYYYMMDD`; an empty bound leaves
/// that side open. A matcher with an unparsable bound is uninitialized and
/// rejects everything.
#[derive(Debug, Clone)]
pub struct DateMatcher {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    initialized: bool,
}

pub const DATE_FORMAT: &str = "%Y%m%d";

impl DateMatcher {
    pub fn new(from: &str, to: &str) -> Self {
        let from = parse_bound(from);
        let to = parse_bound(to);
        match (from, to) {
            (Ok(from), Ok(to)) => Self {
                from,
                to,
                initialized: true,
            },
            _ => {
                tracing::warn!("date range could not be parsed; no file will match");
                Self {
                    from: None,
                    to: None,
                    initialized: false,
                }
            }
        }
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_match(&self, timestamp: &DateTime<Utc>) -> bool {
        if !self.initialized {
            return false;
        }
        let day = timestamp.date_naive();
        self.from.is_none_or(|from| day >= from) && self.to.is_none_or(|to| day <= to)
    }
}

fn parse_bound(value: &str) -> Result<Option<NaiveDate>, chrono::ParseError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, DATE_FORMAT).map(Some)
}
