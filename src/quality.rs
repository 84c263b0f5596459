//! Data-quality accounting
//!
//! Nothing in the pipeline drops data silently. Every degraded input is
//! either counted (malformed rows, late readings) or recorded as a
//! [`QualityWarning`] and tallied in a [`DataQualityReport`].

use crate::aggregation::AggregatorStats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Non-fatal condition met while scoring
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityWarning {
    /// A configured feature does not exist for this locomotive variant
    MissingSensor { feature: String },
    /// A rule was not evaluated because its input was absent
    RuleSkipped { rule: String, field: String },
    /// Reference distribution with zero spread
    DegenerateReference { feature: String },
    /// Feature left out of the multivariate model (never observed in training)
    FeatureExcludedFromModel { feature: String },
    /// Multivariate scorer could not produce a verdict
    ModelUnavailable { reason: String },
}

impl QualityWarning {
    /// Stable key used for tallying
    pub fn key(&self) -> String {
        match self {
            QualityWarning::MissingSensor { feature } => format!("missing sensor: {}", feature),
            QualityWarning::RuleSkipped { field, .. } => {
                format!("rule skipped: missing sensor {}", field)
            }
            QualityWarning::DegenerateReference { feature } => {
                format!("degenerate reference: {}", feature)
            }
            QualityWarning::FeatureExcludedFromModel { feature } => {
                format!("excluded from model: {}", feature)
            }
            QualityWarning::ModelUnavailable { reason } => format!("model unavailable: {}", reason),
        }
    }
}

/// Run-level data-quality counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQualityReport {
    pub rows_read: u64,
    /// Rows without a locomotive id or a parseable timestamp
    pub malformed_readings: u64,
    pub late_readings_dropped: u64,
    pub foreign_readings_dropped: u64,
    pub windows_emitted: u64,
    /// Rule evaluations skipped for a missing or undefined input
    pub rules_skipped: u64,
    /// Anomaly features absent from a window
    pub missing_sensors: u64,
    /// Warning key to number of occurrences
    pub warnings: BTreeMap<String, u64>,
}

impl DataQualityReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, warning: &QualityWarning) {
        match warning {
            QualityWarning::RuleSkipped { .. } => self.rules_skipped += 1,
            QualityWarning::MissingSensor { .. } => self.missing_sensors += 1,
            _ => {}
        }
        *self.warnings.entry(warning.key()).or_insert(0) += 1;
    }

    pub fn record_all<'a, I>(&mut self, warnings: I)
    where
        I: IntoIterator<Item = &'a QualityWarning>,
    {
        for warning in warnings {
            self.record(warning);
        }
    }

    pub fn absorb_aggregator(&mut self, stats: &AggregatorStats) {
        self.late_readings_dropped += stats.late_readings_dropped;
        self.foreign_readings_dropped += stats.foreign_readings_dropped;
        self.windows_emitted += stats.windows_emitted;
    }

    pub fn merge(&mut self, other: &DataQualityReport) {
        self.rows_read += other.rows_read;
        self.malformed_readings += other.malformed_readings;
        self.late_readings_dropped += other.late_readings_dropped;
        self.foreign_readings_dropped += other.foreign_readings_dropped;
        self.windows_emitted += other.windows_emitted;
        self.rules_skipped += other.rules_skipped;
        self.missing_sensors += other.missing_sensors;
        for (key, count) in &other.warnings {
            *self.warnings.entry(key.clone()).or_insert(0) += count;
        }
    }

    pub fn warning_count(&self) -> u64 {
        self.warnings.values().sum()
    }

    /// Fraction of rows that produced a usable reading
    pub fn completeness(&self) -> f64 {
        if self.rows_read == 0 {
            1.0
        } else {
            1.0 - self.malformed_readings as f64 / self.rows_read as f64
        }
    }
}
