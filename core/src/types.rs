//! Shared primitive types used across the pipeline.

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A stable policy identifier.
pub type PolicyId = String;

/// A calendar month over which trips are aggregated per policy.
/// Identified by its first day; serialised as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    start: NaiveDate,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|start| Self { start })
    }

    /// The month containing `date`.
    pub fn containing(date: NaiveDate) -> Self {
        Self { start: date.with_day(1).unwrap_or(date) }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// Last day of the month, inclusive.
    pub fn end(&self) -> NaiveDate {
        self.next().start - Duration::days(1)
    }

    pub fn next(&self) -> Self {
        let (y, m) = if self.start.month() == 12 {
            (self.start.year() + 1, 1)
        } else {
            (self.start.year(), self.start.month() + 1)
        };
        // Day 1 exists in every month.
        Self { start: NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(self.start) }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.start.year(), self.start.month())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| format!("period '{s}' is not YYYY-MM"))?;
        let year: i32 = y.parse().map_err(|_| format!("bad year in period '{s}'"))?;
        let month: u32 = m.parse().map_err(|_| format!("bad month in period '{s}'"))?;
        Period::new(year, month).ok_or_else(|| format!("period '{s}' out of range"))
    }
}

impl TryFrom<String> for Period {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<Period> for String {
    fn from(p: Period) -> Self { p.to_string() }
}
