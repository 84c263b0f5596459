//! Integration test: Scorers and fusion on hand-built windows

use chrono::{DateTime, Duration, TimeZone, Utc};
use loco_telemetry::aggregation::{Dispersion, FeatureLayout, FeatureVector, SensorStats};
use loco_telemetry::config::{MadConfig, PipelineConfig, ReferenceScope, ThresholdTable};
use loco_telemetry::fusion::fuse;
use loco_telemetry::scoring::{
    MultivariateScorer, ReferenceSet, RobustScorer, RuleScorer, SignalOutput, SignalSource,
};
use loco_telemetry::TelemetryError;

const SENSORS: [&str; 4] = ["temp_motor1_1", "current_u", "pressure_tr1", "battery_volt"];

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
}

fn layout() -> FeatureLayout {
    FeatureLayout::new(SENSORS.iter().map(|s| s.to_string()).collect())
}

fn stats(mean: f64, std: f64) -> Option<SensorStats> {
    Some(SensorStats {
        count: 60,
        mean,
        max: mean + std,
        std: Dispersion::Value(std),
    })
}

/// A healthy window; fields are overridden per test
fn window(loco: i32, minute: i64) -> FeatureVector {
    FeatureVector {
        locomotive_id: loco,
        window_start: base() + Duration::minutes(minute),
        window_secs: 60,
        sensors: vec![
            stats(75.0 + (minute % 3) as f64, 1.0),
            stats(1500.0, 10.0 + (minute % 4) as f64),
            stats(6.0 + (minute % 2) as f64 * 0.1, 0.1),
            stats(110.0, 0.5),
        ],
        sample_count: 60,
        gps_availability: 1.0,
        avg_lat: Some(50.0),
        avg_lon: Some(14.0),
        fault_count: 0,
        energy_consumption: Some(2.0),
        avg_speed: Some(80.0),
    }
}

fn with_temp(mut v: FeatureVector, temp: f64) -> FeatureVector {
    v.sensors[0] = stats(temp, 1.0);
    v
}

fn with_pressure(mut v: FeatureVector, pressure: f64) -> FeatureVector {
    v.sensors[2] = stats(pressure, 0.1);
    v
}

struct Scorers {
    rules: RuleScorer,
    robust: RobustScorer,
    multivariate: MultivariateScorer,
    references: ReferenceSet,
}

fn scorers(history: &[FeatureVector], config: &PipelineConfig) -> Scorers {
    let layout = layout();
    let features = layout.resolve_all(&config.anomaly_features);
    let mut multivariate = MultivariateScorer::new(features.clone(), config.isolation_forest.clone());
    let _ = multivariate.fit(history);
    Scorers {
        rules: RuleScorer::new(config.thresholds.clone(), &config.rule_targets, &layout),
        robust: RobustScorer::new(config.mad.threshold, features.clone()),
        references: ReferenceSet::build(history, &features, &config.mad),
        multivariate,
    }
}

fn config() -> PipelineConfig {
    PipelineConfig::default().with_sensors(
        SENSORS
            .iter()
            .zip(["xtempmotor1_1", "xuprim_1", "xadrucktr_1", "xu_battery"])
            .map(|(name, column)| loco_telemetry::config::SensorBinding::new(*name, column))
            .collect(),
    )
}

#[test]
fn test_overheating_motor_scores_at_least_two() {
    let history: Vec<FeatureVector> = (0..60).map(|m| window(1, m)).collect();
    let s = scorers(&history, &config());

    let previous = with_temp(window(1, 100), 100.0);
    let current = with_temp(window(1, 101), 125.0);

    let rules = s.rules.evaluate(&current, Some(&previous));
    let robust = s.robust.score(&current, &s.references);
    let (multivariate, iforest_score) = s.multivariate.signal(&current);
    let record = fuse(current, [rules, robust, multivariate], iforest_score);

    assert!(record.anomaly_score >= 2);
    assert!(record.is_anomaly);
    assert_eq!(record.anomaly_types[0], "rule:temp_motor_max");
    assert_eq!(record.anomaly_types[1], "rule:temp_motor_rate_max");
    assert!(record.anomaly_types.contains(&"mad:temp_motor1_1_mean".to_string()));
    assert!(iforest_score.is_some());
}

#[test]
fn test_low_pressure_labels_lower_bound() {
    let s = scorers(&[], &config());
    let out = s.rules.evaluate(&with_pressure(window(2, 0), 2.0), None);
    assert_eq!(out.labels, vec!["rule:pressure_min"]);
}

#[test]
fn test_exact_threshold_is_not_a_violation() {
    let s = scorers(&[], &config());
    let out = s.rules.evaluate(&with_temp(window(2, 0), 120.0), None);
    assert!(out.labels.is_empty());
}

#[test]
fn test_first_window_has_no_rate_check() {
    let s = scorers(&[], &config());
    let out = s.rules.evaluate(&with_temp(window(2, 0), 115.0), None);
    assert!(!out.labels.iter().any(|l| l.ends_with("rate_max")));
}

#[test]
fn test_constant_reference_flags_only_deviation() {
    let config = config().with_mad(MadConfig {
        scope: ReferenceScope::Fleet,
        ..MadConfig::default()
    });
    let history: Vec<FeatureVector> = (0..30).map(|m| with_temp(window(4, m), 80.0)).collect();
    let s = scorers(&history, &config);

    let same = s.robust.score(&with_temp(window(4, 40), 80.0), &s.references);
    assert!(!same.labels.contains(&"mad:temp_motor1_1_mean".to_string()));

    let moved = s.robust.score(&with_temp(window(4, 41), 80.5), &s.references);
    assert!(moved.labels.contains(&"mad:temp_motor1_1_mean".to_string()));
}

#[test]
fn test_model_unavailable_keeps_other_signals() {
    let history: Vec<FeatureVector> = (0..5).map(|m| window(1, m)).collect();
    let s = scorers(&history, &config());
    assert!(!s.multivariate.is_fitted());

    let current = with_pressure(window(1, 10), 12.0);
    assert!(matches!(
        s.multivariate.score(&current),
        Err(TelemetryError::ModelUnavailable(_))
    ));

    let rules = s.rules.evaluate(&current, None);
    let robust = s.robust.score(&current, &s.references);
    let (multivariate, iforest_score) = s.multivariate.signal(&current);
    let record = fuse(current, [rules, robust, multivariate], iforest_score);

    assert_eq!(record.iforest_score, None);
    assert_eq!(record.anomaly_types[0], "rule:pressure_max");
    assert!(!record.anomaly_types.contains(&"iforest".to_string()));
}

#[test]
fn test_disabled_thresholds_only_leave_statistical_signals() {
    let config = config().with_thresholds(ThresholdTable::disabled());
    let s = scorers(&[], &config);
    let out: SignalOutput = s.rules.evaluate(&with_temp(window(1, 0), 500.0), None);
    assert_eq!(out.source, SignalSource::Rules);
    assert!(out.labels.is_empty());
}
