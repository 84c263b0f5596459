//! Robust z-score scoring (median / MAD)
//!
//! z = 0.6745 (x - M) / MAD, where M is the median of the reference
//! distribution and MAD the median absolute deviation from M. A reference
//! with MAD = 0 is degenerate: any value different from M is flagged.

use super::{SignalOutput, SignalSource};
use crate::aggregation::{FeatureName, FeatureValue, FeatureVector};
use crate::config::{MadConfig, ReferenceScope, ReferenceWindow};
use crate::quality::QualityWarning;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Consistency constant relating MAD to the standard deviation of a normal
const MAD_SCALE: f64 = 0.6745;

/// Median of `values`; sorts in place
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// median(|x - center|)
pub fn median_absolute_deviation(values: &[f64], center: f64) -> Option<f64> {
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&mut deviations)
}

/// Location and spread of one reference distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStats {
    pub median: f64,
    pub mad: f64,
    pub size: usize,
}

impl ReferenceStats {
    pub fn from_values(mut values: Vec<f64>) -> Option<Self> {
        let median = median(&mut values)?;
        let mad = median_absolute_deviation(&values, median)?;
        Some(Self {
            median,
            mad,
            size: values.len(),
        })
    }

    pub fn is_degenerate(&self) -> bool {
        self.mad == 0.0
    }

    /// Robust z-score; `None` for a degenerate reference
    pub fn z_score(&self, x: f64) -> Option<f64> {
        if self.is_degenerate() {
            None
        } else {
            Some(MAD_SCALE * (x - self.median) / self.mad)
        }
    }

    pub fn is_outlier(&self, x: f64, threshold: f64) -> bool {
        match self.z_score(x) {
            Some(z) => z.abs() > threshold,
            None => x != self.median,
        }
    }
}

/// Immutable per-run reference distributions, one per anomaly feature
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceSet {
    features: Vec<String>,
    scope: Option<ReferenceScope>,
    min_reference_size: usize,
    fleet: Vec<Option<ReferenceStats>>,
    locomotives: BTreeMap<i32, Vec<Option<ReferenceStats>>>,
}

impl ReferenceSet {
    /// Reference set with no history; every lookup misses
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build references from every vector of the run.
    ///
    /// The result does not depend on the order of `vectors`.
    pub fn build<'a, I>(vectors: I, features: &[(String, FeatureName)], config: &MadConfig) -> Self
    where
        I: IntoIterator<Item = &'a FeatureVector>,
    {
        // (window start, locomotive, value) per feature
        let mut observed: Vec<Vec<(i64, i32, f64)>> = vec![Vec::new(); features.len()];
        for vector in vectors {
            for (slot, (_, field)) in observed.iter_mut().zip(features) {
                if let FeatureValue::Value(x) = vector.get(*field) {
                    slot.push((vector.window_start_millis(), vector.locomotive_id, x));
                }
            }
        }
        for slot in &mut observed {
            slot.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)).then(a.2.total_cmp(&b.2)));
        }

        let fleet = observed
            .iter()
            .map(|slot| summarize(slot.iter(), config.window))
            .collect();

        let mut locomotives = BTreeMap::new();
        if config.scope == ReferenceScope::PerLocomotive {
            let mut ids: Vec<i32> = observed.iter().flatten().map(|&(_, id, _)| id).collect();
            ids.sort_unstable();
            ids.dedup();
            for id in ids {
                let stats = observed
                    .iter()
                    .map(|slot| summarize(slot.iter().filter(|o| o.1 == id), config.window))
                    .collect();
                locomotives.insert(id, stats);
            }
        }

        Self {
            features: features.iter().map(|(name, _)| name.clone()).collect(),
            scope: Some(config.scope),
            min_reference_size: effective_min_size(config),
            fleet,
            locomotives,
        }
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    /// Reference for feature `index` as seen by `locomotive_id`.
    ///
    /// Per-locomotive references smaller than the configured minimum fall
    /// back to the fleet reference.
    pub fn lookup(&self, locomotive_id: i32, index: usize) -> Option<&ReferenceStats> {
        let fleet = self.fleet.get(index).and_then(Option::as_ref);
        match self.scope {
            Some(ReferenceScope::PerLocomotive) => {
                let own = self
                    .locomotives
                    .get(&locomotive_id)
                    .and_then(|stats| stats.get(index))
                    .and_then(Option::as_ref)
                    .filter(|s| s.size >= self.min_reference_size);
                own.or(fleet)
            }
            _ => fleet,
        }
    }
}

/// A rolling reference never holds more than `max_windows` values, so the
/// per-locomotive minimum cannot exceed it.
fn effective_min_size(config: &MadConfig) -> usize {
    match config.window {
        ReferenceWindow::Full => config.min_reference_size,
        ReferenceWindow::Rolling { max_windows } => config.min_reference_size.min(max_windows),
    }
}

fn summarize<'a, I>(observations: I, window: ReferenceWindow) -> Option<ReferenceStats>
where
    I: DoubleEndedIterator<Item = &'a (i64, i32, f64)>,
{
    let values: Vec<f64> = match window {
        ReferenceWindow::Full => observations.map(|o| o.2).collect(),
        ReferenceWindow::Rolling { max_windows } => {
            observations.rev().take(max_windows).map(|o| o.2).collect()
        }
    };
    ReferenceStats::from_values(values)
}

/// Flags features whose robust z-score exceeds the threshold
#[derive(Debug, Clone)]
pub struct RobustScorer {
    threshold: f64,
    features: Vec<(String, FeatureName)>,
}

impl RobustScorer {
    pub fn new(threshold: f64, features: Vec<(String, FeatureName)>) -> Self {
        Self { threshold, features }
    }

    pub fn features(&self) -> &[(String, FeatureName)] {
        &self.features
    }

    pub fn score(&self, vector: &FeatureVector, references: &ReferenceSet) -> SignalOutput {
        let mut out = SignalOutput::new(SignalSource::Robust);

        for (index, (name, field)) in self.features.iter().enumerate() {
            let x = match vector.get(*field) {
                FeatureValue::Value(x) => x,
                FeatureValue::Undefined => continue,
                FeatureValue::Missing => {
                    out.warn(QualityWarning::MissingSensor {
                        feature: name.clone(),
                    });
                    continue;
                }
            };
            let Some(stats) = references.lookup(vector.locomotive_id, index) else {
                continue;
            };
            if stats.is_degenerate() {
                out.warn(QualityWarning::DegenerateReference {
                    feature: name.clone(),
                });
            }
            if stats.is_outlier(x, self.threshold) {
                out.flag(format!("{}:{}", SignalSource::Robust.label_prefix(), name));
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Dispersion, FeatureLayout, SensorStats};
    use chrono::{Duration, TimeZone, Utc};

    fn vector(loco: i32, minute: i64, temp: f64) -> FeatureVector {
        FeatureVector {
            locomotive_id: loco,
            window_start: Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap() + Duration::minutes(minute),
            window_secs: 60,
            sensors: vec![Some(SensorStats {
                count: 5,
                mean: temp,
                max: temp,
                std: Dispersion::Value(0.5),
            })],
            sample_count: 5,
            gps_availability: 0.0,
            avg_lat: None,
            avg_lon: None,
            fault_count: 0,
            energy_consumption: None,
            avg_speed: None,
        }
    }

    fn features() -> Vec<(String, FeatureName)> {
        let layout = FeatureLayout::new(vec!["temp_motor1_1".to_string()]);
        layout.resolve_all(&["temp_motor1_1_mean".to_string(), "avg_speed".to_string()])
    }

    #[test]
    fn test_median_and_mad() {
        let mut values = vec![5.0, 1.0, 3.0, 2.0];
        assert_eq!(median(&mut values), Some(2.5));
        let mut empty: Vec<f64> = Vec::new();
        assert_eq!(median(&mut empty), None);

        let stats = ReferenceStats::from_values(vec![1.0, 2.0, 3.0, 4.0, 100.0]).unwrap();
        assert_eq!(stats.median, 3.0);
        assert_eq!(stats.mad, 1.0);
        assert!(stats.is_outlier(100.0, 3.5));
        assert!(!stats.is_outlier(4.0, 3.5));
    }

    #[test]
    fn test_constant_reference_flags_any_deviation() {
        let stats = ReferenceStats::from_values(vec![7.0; 20]).unwrap();
        assert!(stats.is_degenerate());
        assert!(!stats.is_outlier(7.0, 3.5));
        assert!(stats.is_outlier(7.0001, 3.5));
        assert!(stats.is_outlier(6.0, 3.5));
    }

    #[test]
    fn test_per_locomotive_reference_with_fleet_fallback() {
        let mut history: Vec<FeatureVector> = (0..20).map(|m| vector(1, m, 60.0 + (m % 3) as f64)).collect();
        history.extend((0..3).map(|m| vector(2, m, 90.0)));
        let set = ReferenceSet::build(&history, &features(), &MadConfig::default());

        assert_eq!(set.lookup(1, 0).unwrap().size, 20);
        // Locomotive 2 has only 3 windows and borrows the fleet reference
        assert_eq!(set.lookup(2, 0).unwrap().size, 23);
        assert!(set.lookup(1, 1).is_none());
    }

    #[test]
    fn test_rolling_window_keeps_latest() {
        let history: Vec<FeatureVector> = (0..10).map(|m| vector(1, m, m as f64)).collect();
        let config = MadConfig {
            scope: ReferenceScope::Fleet,
            window: ReferenceWindow::Rolling { max_windows: 3 },
            ..MadConfig::default()
        };
        let set = ReferenceSet::build(history.iter().rev(), &features(), &config);
        let stats = set.lookup(1, 0).unwrap();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.median, 8.0);
    }

    #[test]
    fn test_rolling_window_keeps_per_locomotive_scope() {
        let mut history: Vec<FeatureVector> = (0..50).map(|m| vector(1, m, 60.0 + (m % 3) as f64)).collect();
        history.extend((0..50).map(|m| vector(2, m, 90.0 + (m % 3) as f64)));
        let config = MadConfig {
            window: ReferenceWindow::Rolling { max_windows: 5 },
            ..MadConfig::default()
        };
        let set = ReferenceSet::build(&history, &features(), &config);

        let own = set.lookup(1, 0).unwrap();
        assert_eq!(own.size, 5);
        assert!(own.median < 70.0);
        assert!(set.lookup(2, 0).unwrap().median > 85.0);

        let scorer = RobustScorer::new(3.5, features());
        assert!(scorer.score(&vector(1, 60, 61.0), &set).labels.is_empty());
    }

    #[test]
    fn test_scorer_labels_and_skips() {
        let history: Vec<FeatureVector> = (0..20).map(|m| vector(1, m, 60.0 + (m % 3) as f64)).collect();
        let set = ReferenceSet::build(&history, &features(), &MadConfig::default());
        let scorer = RobustScorer::new(3.5, features());

        let hot = scorer.score(&vector(1, 30, 95.0), &set);
        assert_eq!(hot.labels, vec!["mad:temp_motor1_1_mean"]);
        // avg_speed is absent from every vector
        assert_eq!(
            hot.warnings,
            vec![QualityWarning::MissingSensor {
                feature: "avg_speed".to_string()
            }]
        );

        let normal = scorer.score(&vector(1, 31, 61.0), &set);
        assert!(normal.labels.is_empty());
    }

    #[test]
    fn test_empty_reference_never_flags() {
        let scorer = RobustScorer::new(3.5, features());
        let out = scorer.score(&vector(1, 0, 1e6), &ReferenceSet::empty());
        assert!(out.labels.is_empty());
    }
}
