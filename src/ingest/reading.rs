//! Raw sensor readings

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One sample of every sensor of one locomotive at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub locomotive_id: i32,
    pub timestamp: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    /// Sensor column to value; columns outside the schema are kept untyped.
    /// Keys are shared with the chunk they were decoded from.
    pub values: BTreeMap<Arc<str>, Option<f64>>,
}

impl RawReading {
    pub fn new(locomotive_id: i32, timestamp: DateTime<Utc>) -> Self {
        Self {
            locomotive_id,
            timestamp,
            latitude: None,
            longitude: None,
            altitude: None,
            values: BTreeMap::new(),
        }
    }

    pub fn with_position(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn with_value(mut self, column: impl Into<Arc<str>>, value: f64) -> Self {
        self.values.insert(column.into(), Some(value));
        self
    }

    pub fn with_null(mut self, column: impl Into<Arc<str>>) -> Self {
        self.values.insert(column.into(), None);
        self
    }

    /// Finite value of a column, `None` when absent, null or non-finite
    pub fn value(&self, column: &str) -> Option<f64> {
        self.values
            .get(column)
            .copied()
            .flatten()
            .filter(|v| v.is_finite())
    }

    /// Both coordinates present and finite
    pub fn gps_fix(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%d-%m-%Y %H:%M:%S%.f",
    "%d-%m-%Y %H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse a device timestamp. Zone-less formats are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
