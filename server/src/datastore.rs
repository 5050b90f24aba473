//! Naming of time-partitioned data indexes

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

use crate::events::{EventListener, ServiceEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexGranularity {
    #[default]
    Week,
    Day,
    Hour,
}

impl FromStr for IndexGranularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "week" => Ok(IndexGranularity::Week),
            "day" => Ok(IndexGranularity::Day),
            "hour" => Ok(IndexGranularity::Hour),
            other => Err(format!("unknown index granularity: {other}")),
        }
    }
}

impl fmt::Display for IndexGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexGranularity::Week => write!(f, "week"),
            IndexGranularity::Day => write!(f, "day"),
            IndexGranularity::Hour => write!(f, "hour"),
        }
    }
}

/// Week-based year and week number, weeks starting on Sunday and week 1
/// being the week that contains 1 January
pub fn week_of_year(date: NaiveDate) -> (i32, u32) {
    let into_week = date.weekday().num_days_from_sunday();
    let saturday = date + Duration::days(i64::from(6 - into_week));
    if saturday.year() > date.year() {
        return (date.year() + 1, 1);
    }

    let first_day_offset = NaiveDate::from_ymd_opt(date.year(), 1, 1)
        .map_or(0, |jan1| jan1.weekday().num_days_from_sunday());
    (date.year(), (date.ordinal0() + first_day_offset) / 7 + 1)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Timestamp {timestamp_ms}ms is outside the representable date range")]
pub struct IndexNameError {
    pub timestamp_ms: i64,
}

/// Name of the data index holding messages captured at `timestamp_ms` (UTC)
pub fn data_index_name(
    tenant_id: &str,
    timestamp_ms: i64,
    granularity: IndexGranularity,
) -> Result<String, IndexNameError> {
    let at = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .ok_or(IndexNameError { timestamp_ms })?;
    Ok(index_name_at(tenant_id, at, granularity))
}

pub fn index_name_at(tenant_id: &str, at: DateTime<Utc>, granularity: IndexGranularity) -> String {
    let prefix = format!("{tenant_id}-data-message");
    match granularity {
        IndexGranularity::Week => {
            let (year, week) = week_of_year(at.date_naive());
            format!("{prefix}-{year}-{week:02}")
        }
        IndexGranularity::Day => format!("{prefix}-{}", at.format("%Y-%m-%d")),
        IndexGranularity::Hour => format!("{prefix}-{}-{:02}", at.format("%Y-%m-%d"), at.hour()),
    }
}

/// Logs the data index each recorded event belongs to
pub struct IndexAuditListener {
    granularity: IndexGranularity,
}

impl IndexAuditListener {
    pub fn new(granularity: IndexGranularity) -> Self {
        Self { granularity }
    }
}

#[async_trait]
impl EventListener for IndexAuditListener {
    fn name(&self) -> &str {
        "index-audit"
    }

    async fn on_event(&self, event: &ServiceEvent) -> anyhow::Result<()> {
        let index = index_name_at(&event.tenant_id, event.occurred_on, self.granularity);
        info!(
            index = %index,
            context_id = %event.context_id,
            source = %event.source_service,
            entity = %event.entity_type,
            action = ?event.action,
            "Event recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(y: i32, m: u32, d: u32, h: u32) -> i64 {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap().timestamp_millis()
    }

    #[test]
    fn test_week_vectors() {
        assert_eq!(data_index_name("1", ms(2017, 1, 1, 0), IndexGranularity::Week).unwrap(), "1-data-message-2017-01");
        assert_eq!(data_index_name("1", ms(2017, 1, 8, 0), IndexGranularity::Week).unwrap(), "1-data-message-2017-02");
    }

    #[test]
    fn test_week_around_year_end() {
        let date = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();
        // Saturday closing the last week of a leap year that began on a Friday
        assert_eq!(week_of_year(date(2016, 12, 31)), (2016, 53));
        // Sunday whose week ends in the next year
        assert_eq!(week_of_year(date(2017, 12, 31)), (2018, 1));
        assert_eq!(week_of_year(date(2018, 1, 6)), (2018, 1));
        assert_eq!(week_of_year(date(2018, 1, 7)), (2018, 2));
    }

    #[test]
    fn test_day_and_hour() {
        let at = ms(2020, 3, 5, 7);
        assert_eq!(data_index_name("acme", at, IndexGranularity::Day).unwrap(), "acme-data-message-2020-03-05");
        assert_eq!(data_index_name("acme", at, IndexGranularity::Hour).unwrap(), "acme-data-message-2020-03-05-07");
    }

    #[test]
    fn test_out_of_range_timestamp_is_rejected() {
        assert_eq!(
            data_index_name("1", i64::MAX, IndexGranularity::Week),
            Err(IndexNameError { timestamp_ms: i64::MAX })
        );
        assert!(data_index_name("1", i64::MIN, IndexGranularity::Day).is_err());
    }

    #[test]
    fn test_granularity_parsing() {
        assert_eq!("HOUR".parse::<IndexGranularity>(), Ok(IndexGranularity::Hour));
        assert!("month".parse::<IndexGranularity>().is_err());
    }
}
