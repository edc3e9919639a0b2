//! Query-time time buckets for stock indicators.
//!
//! Edge-bucket stock indicators cannot know their time filter at compile time:
//! the first or last bucket depends on the interval the analyst queries. The
//! compiler emits a [`FilterSpec::EdgeBucket`](super::FilterSpec::EdgeBucket)
//! placeholder and the query layer resolves it against a [`TimeInterval`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Bucket size used to locate the edge of a queried interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Granularity {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    /// Start of the bucket containing `t`. Weeks start on Monday.
    pub fn bucket_start(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let date = t.date_naive();
        let start = match self {
            Granularity::Day => date,
            Granularity::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            Granularity::Month => date.with_day(1).unwrap_or(date),
            Granularity::Quarter => {
                let month = (date.month0() / 3) * 3 + 1;
                date.with_day(1)
                    .and_then(|d| d.with_month(month))
                    .unwrap_or(date)
            }
            Granularity::Year => date.with_ordinal(1).unwrap_or(date),
        };
        start.and_time(NaiveTime::MIN).and_utc()
    }

    /// Start of the bucket following the one that starts at `start`.
    pub fn next_bucket(self, start: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self {
            Granularity::Day => start.checked_add_signed(Duration::days(1)),
            Granularity::Week => start.checked_add_signed(Duration::days(7)),
            Granularity::Month => start.checked_add_months(Months::new(1)),
            Granularity::Quarter => start.checked_add_months(Months::new(3)),
            Granularity::Year => start.checked_add_months(Months::new(12)),
        };
        next.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            "quarter" | "quarterly" => Ok(Granularity::Quarter),
            "year" | "yearly" => Ok(Granularity::Year),
            other => Err(format!("unknown granularity '{}'", other)),
        }
    }
}

impl TryFrom<String> for Granularity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Granularity> for String {
    fn from(value: Granularity) -> Self {
        value.as_str().to_string()
    }
}

/// Which edge of the queried interval a stock value is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketEdge {
    First,
    Last,
}

impl fmt::Display for BucketEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketEdge::First => f.write_str("first"),
            BucketEdge::Last => f.write_str("last"),
        }
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    /// The first or last `granularity` bucket of this interval, clamped so it
    /// never extends past the interval itself.
    pub fn edge_bucket(&self, edge: BucketEdge, granularity: Granularity) -> TimeInterval {
        let anchor = match edge {
            BucketEdge::First => self.start,
            BucketEdge::Last => {
                let last_instant = self.end - Duration::milliseconds(1);
                last_instant.max(self.start)
            }
        };
        let bucket_start = granularity.bucket_start(anchor);
        let bucket_end = granularity.next_bucket(bucket_start);
        TimeInterval {
            start: bucket_start.max(self.start),
            end: bucket_end.min(self.end),
        }
    }

    /// ISO-8601 `start/end` form used in Druid interval filters.
    pub fn to_druid_interval(&self) -> String {
        format!(
            "{}/{}",
            self.start.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.end.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

/// Parses `start/end`, each side an RFC 3339 instant or a `YYYY-MM-DD` date
/// (midnight UTC).
impl FromStr for TimeInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('/')
            .ok_or_else(|| format!("interval '{}' is not of the form start/end", s))?;
        let start = parse_instant(start)?;
        let end = parse_instant(end)?;
        if end <= start {
            return Err(format!("interval '{}' ends before it starts", s));
        }
        Ok(TimeInterval { start, end })
    }
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    let s = s.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .map_err(|_| format!("'{}' is neither an RFC 3339 timestamp nor a date", s))
}
