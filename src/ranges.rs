//! Date-window partitioning for bounded aggregation queries.

use chrono::{DateTime, Duration as ChronoDuration, Months, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, RangeError> {
        if start >= end {
            return Err(RangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Upper bound on the length of one query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowSpan {
    /// Calendar years, stepped back month-aware.
    Years(u32),
    Days(u32),
}

impl WindowSpan {
    pub const ONE_YEAR: Self = Self::Years(1);
    pub const THIRTY_DAYS: Self = Self::Days(30);

    fn is_zero(self) -> bool {
        matches!(self, Self::Years(0) | Self::Days(0))
    }

    fn step_back(self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Years(years) => from.checked_sub_months(Months::new(years.checked_mul(12)?)),
            Self::Days(days) => from.checked_sub_signed(ChronoDuration::days(i64::from(days))),
        }
    }
}

impl std::fmt::Display for WindowSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Years(n) => write!(f, "{n}y"),
            Self::Days(n) => write!(f, "{n}d"),
        }
    }
}

impl std::str::FromStr for WindowSpan {
    type Err = RangeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim().to_ascii_lowercase();
        let invalid = || RangeError::InvalidSpan(raw.to_string());
        let (digits, unit) = trimmed.split_at(
            trimmed
                .find(|c: char| !c.is_ascii_digit())
                .ok_or_else(invalid)?,
        );
        let count: u32 = digits.parse().map_err(|_| invalid())?;
        let span = match unit {
            "y" | "year" | "years" => Self::Years(count),
            "d" | "day" | "days" => Self::Days(count),
            _ => return Err(invalid()),
        };
        if span.is_zero() {
            return Err(invalid());
        }
        Ok(span)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid date bound '{0}'")]
    InvalidBound(String),
    #[error("range start {start} must be before end {end}")]
    Inverted {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("invalid window span '{0}'")]
    InvalidSpan(String),
    #[error("window arithmetic left the supported date range at {0}")]
    Overflow(DateTime<Utc>),
}

/// Windows in construction order (newest first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPlan {
    ranges: Vec<DateRange>,
}

impl WindowPlan {
    pub fn newest_first(&self) -> impl DoubleEndedIterator<Item = &DateRange> + ExactSizeIterator {
        self.ranges.iter()
    }

    pub fn oldest_first(&self) -> impl DoubleEndedIterator<Item = &DateRange> + ExactSizeIterator {
        self.ranges.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The full span covered by the plan.
    pub fn bounds(&self) -> Option<DateRange> {
        let newest = self.ranges.first()?;
        let oldest = self.ranges.last()?;
        Some(DateRange {
            start: oldest.start,
            end: newest.end,
        })
    }
}

pub fn partition(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_span: WindowSpan,
) -> Result<WindowPlan, RangeError> {
    if max_span.is_zero() {
        return Err(RangeError::InvalidSpan(max_span.to_string()));
    }
    let full = DateRange::new(start, end)?;

    let mut ranges = Vec::new();
    let mut trailing = full.end;
    loop {
        let stepped = max_span
            .step_back(trailing)
            .ok_or(RangeError::Overflow(trailing))?;
        if stepped <= full.start {
            break;
        }
        ranges.push(DateRange {
            start: stepped,
            end: trailing,
        });
        trailing = stepped;
    }
    ranges.push(DateRange {
        start: full.start,
        end: trailing,
    });

    debug!(
        component = "ranges",
        event = "ranges.partition.built",
        start = %full.start,
        end = %full.end,
        max_span = %max_span,
        window_count = ranges.len()
    );

    Ok(WindowPlan { ranges })
}

pub fn partition_str(start: &str, end: &str, max_span: WindowSpan) -> Result<WindowPlan, RangeError> {
    partition(parse_bound(start)?, parse_bound(end)?, max_span)
}

/// Parses RFC 3339, `YYYY-MM-DDTHH:MM:SS[.fff][Z]` or a bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_bound(raw: &str) -> Result<DateTime<Utc>, RangeError> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive_text = trimmed.strip_suffix('Z').unwrap_or(trimmed);
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(naive_text, format) {
            return Ok(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| RangeError::InvalidBound(raw.to_string()))
}
