//! Calendar bucketing for local (timezone-less) export timestamps.
//!
//! Export timestamps look like `2024-01-15 14:30`. Hours come from the time
//! half of the string only; calendar months come from the date half.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};

use crate::error::{InvalidFilter, MalformedTimestamp};

/// Short month names, independent of the host locale.
pub const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

const YEAR_FILTER_TOKEN: &str = "year";

fn split_local(raw: &str) -> Option<(&str, &str)> {
    let trimmed = raw.trim();
    let (date, time) = trimmed.split_once([' ', 'T'])?;
    let time = time.trim();
    if date.is_empty() || time.is_empty() {
        return None;
    }
    Some((date, time))
}

fn date_of(raw: &str) -> Result<NaiveDate, MalformedTimestamp> {
    let date_text = split_local(raw)
        .map(|(date, _)| date)
        .unwrap_or_else(|| raw.trim());
    NaiveDate::parse_from_str(date_text, "%Y-%m-%d").map_err(|_| MalformedTimestamp::new(raw))
}

/// Hour of day (0-23) of a `date time` timestamp.
pub fn hour_of(raw: &str) -> Result<u8, MalformedTimestamp> {
    let (_, time) = split_local(raw).ok_or_else(|| MalformedTimestamp::new(raw))?;
    let hour_text = time.split(':').next().unwrap_or_default();
    if hour_text.is_empty() || !hour_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MalformedTimestamp::new(raw));
    }
    hour_text
        .parse::<u8>()
        .ok()
        .filter(|hour| *hour < 24)
        .ok_or_else(|| MalformedTimestamp::new(raw))
}

/// `YYYY-MM` with a 1-indexed, zero-padded month.
pub fn year_month(raw: &str) -> Result<String, MalformedTimestamp> {
    let date = date_of(raw)?;
    Ok(format!("{:04}-{:02}", date.year(), date.month()))
}

/// Short English month name (`Jan` .. `Dec`).
pub fn month_label(raw: &str) -> Result<&'static str, MalformedTimestamp> {
    let date = date_of(raw)?;
    Ok(MONTH_LABELS[date.month0() as usize])
}

/// Half-open `[start_hour, end_hour)` interval of the day with a fixed label.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct TimeBand {
    pub start_hour: u8,
    pub end_hour: u8,
    pub label: String,
}

impl TimeBand {
    pub fn new(start_hour: u8, end_hour: u8, label: &str) -> Self {
        Self {
            start_hour,
            end_hour,
            label: label.to_string(),
        }
    }

    pub fn contains(&self, hour: u8) -> bool {
        hour >= self.start_hour && hour < self.end_hour
    }
}

/// Default partition of the day used by the time-of-day view.
pub fn default_time_bands() -> Vec<TimeBand> {
    vec![
        TimeBand::new(0, 6, "Midnight - 6 AM"),
        TimeBand::new(6, 9, "6 AM - 9 AM"),
        TimeBand::new(9, 12, "9 AM - 12 PM"),
        TimeBand::new(12, 18, "12 PM - 6 PM"),
        TimeBand::new(18, 24, "6 PM - Midnight"),
    ]
}

/// Returns `true` when bands are non-empty, ordered, non-overlapping, and inside `[0, 24)`.
///
/// Gaps are allowed: an hour that falls in a gap is simply excluded from every band.
pub fn time_bands_are_valid(bands: &[TimeBand]) -> bool {
    if bands.is_empty() {
        return false;
    }
    let mut previous_end = 0u8;
    for band in bands {
        if band.start_hour >= band.end_hour || band.end_hour > 24 {
            return false;
        }
        if band.start_hour < previous_end {
            return false;
        }
        previous_end = band.end_hour;
    }
    true
}

/// Index of the first band containing `hour`.
pub fn band_index_for(bands: &[TimeBand], hour: u8) -> Option<usize> {
    bands.iter().position(|band| band.contains(hour))
}

/// Restricts a view to a calendar period.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PeriodFilter {
    /// The whole log; never excludes a record.
    #[default]
    Year,
    /// One month label across every year in the log (e.g. all Januaries).
    Month(&'static str),
    /// One specific calendar month, `YYYY-MM`.
    YearMonth(String),
}

impl PeriodFilter {
    pub fn is_restricting(&self) -> bool {
        !matches!(self, Self::Year)
    }

    /// Whether a record with the given timestamp belongs to the period.
    ///
    /// Records without a parseable date only ever match [`PeriodFilter::Year`].
    pub fn matches(&self, timestamp: Option<&str>) -> bool {
        match self {
            Self::Year => true,
            Self::Month(label) => timestamp
                .and_then(|raw| month_label(raw).ok())
                .is_some_and(|month| month == *label),
            Self::YearMonth(key) => timestamp
                .and_then(|raw| year_month(raw).ok())
                .is_some_and(|month| &month == key),
        }
    }
}

impl fmt::Display for PeriodFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Year => f.write_str(YEAR_FILTER_TOKEN),
            Self::Month(label) => f.write_str(label),
            Self::YearMonth(key) => f.write_str(key),
        }
    }
}

impl FromStr for PeriodFilter {
    type Err = InvalidFilter;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case(YEAR_FILTER_TOKEN) {
            return Ok(Self::Year);
        }
        if let Some(label) = MONTH_LABELS
            .iter()
            .find(|label| label.eq_ignore_ascii_case(trimmed))
        {
            return Ok(Self::Month(label));
        }
        if let Some((year, month)) = trimmed.split_once('-') {
            let valid_year = year.len() == 4 && year.chars().all(|c| c.is_ascii_digit());
            let month_number = month.parse::<u32>().ok().filter(|m| (1..=12).contains(m));
            if valid_year && month.len() == 2 {
                if let Some(month_number) = month_number {
                    return Ok(Self::YearMonth(format!("{year}-{month_number:02}")));
                }
            }
        }
        Err(InvalidFilter(value.to_string()))
    }
}
