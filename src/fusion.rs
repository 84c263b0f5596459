//! Anomaly fusion
//!
//! Reduces the three scorer outputs of a window into one [`AnomalyRecord`].
//! The fused score is the number of distinct labels raised; labels are kept
//! in rule, robust, multivariate order.

use crate::aggregation::FeatureVector;
use crate::scoring::SignalOutput;
use serde::{Deserialize, Serialize};

/// Separator used when labels are flattened into a single column
pub const LABEL_SEPARATOR: &str = ";";

/// Fused verdict for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub features: FeatureVector,
    pub anomaly_score: u32,
    pub is_anomaly: bool,
    pub anomaly_types: Vec<String>,
    /// Continuous multivariate score; `None` when the model was unavailable
    pub iforest_score: Option<f64>,
}

impl AnomalyRecord {
    pub fn locomotive_id(&self) -> i32 {
        self.features.locomotive_id
    }

    pub fn window_start_millis(&self) -> i64 {
        self.features.window_start_millis()
    }

    /// Labels joined with [`LABEL_SEPARATOR`]
    pub fn anomaly_types_joined(&self) -> String {
        self.anomaly_types.join(LABEL_SEPARATOR)
    }

    /// Both coordinates, when the window had a GPS fix
    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.features.avg_lat, self.features.avg_lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Combine scorer outputs into a record.
///
/// Outputs are ordered by source before their labels are concatenated, so the
/// argument order does not matter.
pub fn fuse(
    vector: FeatureVector,
    mut signals: [SignalOutput; 3],
    iforest_score: Option<f64>,
) -> AnomalyRecord {
    signals.sort_by_key(|s| s.source);

    let mut anomaly_types: Vec<String> = Vec::new();
    for label in signals.iter().flat_map(|s| s.labels.iter()) {
        if !anomaly_types.contains(label) {
            anomaly_types.push(label.clone());
        }
    }

    let anomaly_score = anomaly_types.len() as u32;
    AnomalyRecord {
        features: vector,
        anomaly_score,
        is_anomaly: anomaly_score >= 1,
        anomaly_types,
        iforest_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::SignalSource;
    use chrono::{TimeZone, Utc};

    fn vector() -> FeatureVector {
        FeatureVector {
            locomotive_id: 3,
            window_start: Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap(),
            window_secs: 60,
            sensors: Vec::new(),
            sample_count: 60,
            gps_availability: 0.0,
            avg_lat: None,
            avg_lon: None,
            fault_count: 0,
            energy_consumption: None,
            avg_speed: None,
        }
    }

    fn signal(source: SignalSource, labels: &[&str]) -> SignalOutput {
        let mut out = SignalOutput::new(source);
        for label in labels {
            out.flag(*label);
        }
        out
    }

    #[test]
    fn test_fuse_orders_and_counts() {
        let record = fuse(
            vector(),
            [
                signal(SignalSource::Multivariate, &["iforest"]),
                signal(SignalSource::Rules, &["rule:temp_motor_max", "rule:temp_motor_rate_max"]),
                signal(SignalSource::Robust, &["mad:temp_motor1_1_mean"]),
            ],
            Some(0.71),
        );

        assert_eq!(record.anomaly_score, 4);
        assert!(record.is_anomaly);
        assert_eq!(
            record.anomaly_types_joined(),
            "rule:temp_motor_max;rule:temp_motor_rate_max;mad:temp_motor1_1_mean;iforest"
        );
        assert_eq!(record.iforest_score, Some(0.71));
    }

    #[test]
    fn test_quiet_window() {
        let record = fuse(
            vector(),
            [
                signal(SignalSource::Rules, &[]),
                signal(SignalSource::Robust, &[]),
                signal(SignalSource::Multivariate, &[]),
            ],
            None,
        );
        assert_eq!(record.anomaly_score, 0);
        assert!(!record.is_anomaly);
        assert_eq!(record.anomaly_types_joined(), "");
        assert_eq!(record.position(), None);
    }
}
