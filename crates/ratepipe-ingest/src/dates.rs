//! Calendar date ranges to process
//!
//! A run covers `[yesterday - (days - 1), yesterday]`, with "yesterday"
//! taken in UTC. The iteration order is explicit: [`DateOrder::Descending`]
//! (most recent first) unless configured otherwise.

use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Order in which a [`DateRange`] yields its dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DateOrder {
    /// Most recent date first
    #[default]
    Descending,
    /// Oldest date first
    Ascending,
}

impl std::str::FromStr for DateOrder {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "desc" | "descending" | "newest-first" => Ok(DateOrder::Descending),
            "asc" | "ascending" | "oldest-first" => Ok(DateOrder::Ascending),
            _ => Err(PipelineError::Config(format!(
                "invalid date order '{}', expected 'asc' or 'desc'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for DateOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateOrder::Descending => write!(f, "desc"),
            DateOrder::Ascending => write!(f, "asc"),
        }
    }
}

/// Yesterday's date in UTC
pub fn yesterday_utc() -> NaiveDate {
    let today = Utc::now().date_naive();
    today.checked_sub_days(Days::new(1)).unwrap_or(today)
}

/// A finite, restartable span of consecutive calendar dates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
    days: u32,
    order: DateOrder,
}

impl DateRange {
    /// The `days` dates ending yesterday (UTC)
    pub fn ending_yesterday(days: i64, order: DateOrder) -> Result<Self, PipelineError> {
        Self::ending_at(yesterday_utc(), days, order)
    }

    /// The `days` dates ending at `end`, inclusive
    pub fn ending_at(end: NaiveDate, days: i64, order: DateOrder) -> Result<Self, PipelineError> {
        let invalid = || PipelineError::InvalidRange { days };

        if days < 1 {
            return Err(invalid());
        }
        let count = u32::try_from(days).map_err(|_| invalid())?;
        let start = end
            .checked_sub_days(Days::new(u64::from(count) - 1))
            .ok_or_else(invalid)?;

        Ok(Self {
            start,
            end,
            days: count,
            order,
        })
    }

    /// Oldest date in the range
    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// Most recent date in the range
    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn order(&self) -> DateOrder {
        self.order
    }

    pub fn len(&self) -> usize {
        self.days as usize
    }

    /// Always false: a range holds at least one date
    pub fn is_empty(&self) -> bool {
        self.days == 0
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Iterate the dates in the configured order; may be called repeatedly
    pub fn iter(&self) -> DateRangeIter {
        let first = match self.order {
            DateOrder::Descending => self.end,
            DateOrder::Ascending => self.start,
        };
        DateRangeIter {
            next: Some(first),
            remaining: self.days,
            order: self.order,
        }
    }
}

impl<'a> IntoIterator for &'a DateRange {
    type Item = NaiveDate;
    type IntoIter = DateRangeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over a [`DateRange`]
#[derive(Debug, Clone)]
pub struct DateRangeIter {
    next: Option<NaiveDate>,
    remaining: u32,
    order: DateOrder,
}

impl Iterator for DateRangeIter {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next?;
        self.remaining -= 1;
        self.next = match self.order {
            DateOrder::Descending => current.pred_opt(),
            DateOrder::Ascending => current.succ_opt(),
        };
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for DateRangeIter {}
