//! Pipeline configuration
//!
//! Every tunable of the pipeline lives in [`PipelineConfig`]. The struct is
//! built once at startup (from defaults, a JSON file, or builder calls),
//! validated, and then passed by reference into each stage. Nothing reads
//! configuration from global state.

use crate::aggregation::FeatureName;
use crate::error::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Binding between an aggregated feature prefix and its raw sensor column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorBinding {
    /// Prefix used in output columns (`<name>_mean`, `<name>_max`, `<name>_std`)
    pub name: String,
    /// Raw column in the input readings
    pub column: String,
}

impl SensorBinding {
    pub fn new(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
        }
    }
}

/// Windowing and ingestion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Window duration in seconds
    pub window_secs: u64,
    /// How long a window stays open after its end for late readings
    pub reorder_horizon_secs: u64,
    /// Rows per input chunk
    pub chunk_size: usize,
    /// Nominal GPS reporting rate used for `gps_availability`
    pub gps_nominal_rate_hz: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            reorder_horizon_secs: 10,
            chunk_size: 1_000_000,
            gps_nominal_rate_hz: 1.0,
        }
    }
}

impl AggregationConfig {
    pub fn window_millis(&self) -> i64 {
        secs_to_millis(self.window_secs)
    }

    pub fn horizon_millis(&self) -> i64 {
        secs_to_millis(self.reorder_horizon_secs)
    }

    /// Number of GPS fixes expected in a full window
    pub fn expected_gps_fixes(&self) -> f64 {
        self.window_secs as f64 * self.gps_nominal_rate_hz
    }
}

/// Named numeric bounds for the rule-based checks.
///
/// `None` disables the corresponding check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    /// Motor temperature ceiling (°C)
    pub temp_motor_max: Option<f64>,
    /// Motor temperature change per minute (°C/min)
    pub temp_motor_rate_max: Option<f64>,
    /// Current dispersion ceiling (A)
    pub current_std_max: Option<f64>,
    /// Battery voltage floor (V)
    pub battery_min: Option<f64>,
    /// Speed change per minute (km/h/min)
    pub speed_jump_max: Option<f64>,
    /// Pressure floor (bar)
    pub pressure_min: Option<f64>,
    /// Pressure ceiling (bar)
    pub pressure_max: Option<f64>,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            temp_motor_max: Some(120.0),
            temp_motor_rate_max: Some(5.0),
            current_std_max: Some(50.0),
            battery_min: Some(90.0),
            speed_jump_max: Some(20.0),
            pressure_min: Some(4.0),
            pressure_max: Some(10.0),
        }
    }
}

impl ThresholdTable {
    /// Table with every check disabled
    pub fn disabled() -> Self {
        Self {
            temp_motor_max: None,
            temp_motor_rate_max: None,
            current_std_max: None,
            battery_min: None,
            speed_jump_max: None,
            pressure_min: None,
            pressure_max: None,
        }
    }
}

/// Which aggregated feature each rule family inspects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleTargets {
    pub motor_temperature: String,
    pub current_dispersion: String,
    pub battery_voltage: String,
    pub pressure: String,
    pub speed: String,
}

impl Default for RuleTargets {
    fn default() -> Self {
        Self {
            motor_temperature: "temp_motor1_1_mean".to_string(),
            current_dispersion: "current_u_std".to_string(),
            battery_voltage: "battery_volt_mean".to_string(),
            pressure: "pressure_tr1_mean".to_string(),
            speed: "avg_speed".to_string(),
        }
    }
}

/// Population a feature's reference distribution is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceScope {
    /// Each locomotive is compared with its own history
    PerLocomotive,
    /// Every locomotive is compared with the whole fleet
    Fleet,
}

/// How much history a reference distribution keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceWindow {
    /// Every window of the run
    Full,
    /// Only the most recent `max_windows` windows
    Rolling { max_windows: usize },
}

/// Robust (MAD) scorer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MadConfig {
    /// Robust z-score threshold
    pub threshold: f64,
    pub scope: ReferenceScope,
    pub window: ReferenceWindow,
    /// Per-locomotive references smaller than this fall back to the fleet reference
    pub min_reference_size: usize,
}

impl Default for MadConfig {
    fn default() -> Self {
        Self {
            threshold: 3.5,
            scope: ReferenceScope::PerLocomotive,
            window: ReferenceWindow::Full,
            min_reference_size: 10,
        }
    }
}

/// Isolation forest parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationForestConfig {
    /// Expected fraction of anomalous windows
    pub contamination: f64,
    pub n_estimators: usize,
    /// Samples drawn per tree
    pub max_samples: usize,
    pub seed: u64,
    /// Upper bound on the training sample; larger runs are subsampled
    pub max_training_rows: usize,
    /// Below this many windows the model is left unfitted
    pub min_training_rows: usize,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            contamination: 0.01,
            n_estimators: 100,
            max_samples: 256,
            seed: 42,
            max_training_rows: 100_000,
            min_training_rows: 32,
        }
    }
}

/// Default aggregated sensors, matching the fleet's telemetry export
pub fn default_sensors() -> Vec<SensorBinding> {
    vec![
        SensorBinding::new("temp_motor1_1", "xtempmotor1_1"),
        SensorBinding::new("temp_motor1_2", "xtempmotor1_2"),
        SensorBinding::new("temp_motor2_1", "xtempmotor2_1"),
        SensorBinding::new("temp_motor2_2", "xtempmotor2_2"),
        SensorBinding::new("temp_motor3_1", "xtempmotor3_1"),
        SensorBinding::new("temp_motor3_2", "xtempmotor3_2"),
        SensorBinding::new("current_u", "xuprim_1"),
        SensorBinding::new("current_i", "xiprim_1"),
        SensorBinding::new("pressure_tr1", "xadrucktr_1"),
        SensorBinding::new("pressure_tr2", "xadrucktr_2"),
        SensorBinding::new("pressure_brake", "xprautobkln"),
        SensorBinding::new("battery_volt", "xu_battery"),
        SensorBinding::new("tractive_effort", "xte_be_loco"),
    ]
}

/// Default feature subset for the robust and multivariate scorers
pub fn default_anomaly_features() -> Vec<String> {
    [
        "temp_motor1_1_mean",
        "temp_motor1_1_max",
        "temp_motor1_1_std",
        "current_u_mean",
        "current_u_std",
        "pressure_tr1_mean",
        "pressure_tr1_std",
        "energy_consumption",
        "avg_speed",
        "battery_volt_mean",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub aggregation: AggregationConfig,
    /// Sensors aggregated into mean/max/std columns, in output order
    pub sensors: Vec<SensorBinding>,
    /// Cumulative energy counter used for `energy_consumption`
    pub energy_column: String,
    /// Speed sensor used for `avg_speed`
    pub speed_column: String,
    /// Fault code column; a non-zero value counts as one fault
    pub fault_code_column: Option<String>,
    /// Binary fault indicator columns (declared int8 in the schema)
    pub flag_columns: Vec<String>,
    pub thresholds: ThresholdTable,
    pub rule_targets: RuleTargets,
    pub mad: MadConfig,
    pub isolation_forest: IsolationForestConfig,
    /// Features scored by the robust and multivariate scorers
    pub anomaly_features: Vec<String>,
    /// Worker threads (None = all available)
    pub n_threads: Option<usize>,
    /// Stop after this many input chunks
    pub max_chunks: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            aggregation: AggregationConfig::default(),
            sensors: default_sensors(),
            energy_column: "xenergkwh_plus".to_string(),
            speed_column: "xspeedloco".to_string(),
            fault_code_column: Some("faultnum".to_string()),
            flag_columns: Vec::new(),
            thresholds: ThresholdTable::default(),
            rule_targets: RuleTargets::default(),
            mad: MadConfig::default(),
            isolation_forest: IsolationForestConfig::default(),
            anomaly_features: default_anomaly_features(),
            n_threads: None,
            max_chunks: None,
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; absent fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn with_window_secs(mut self, secs: u64) -> Self {
        self.aggregation.window_secs = secs;
        self
    }

    pub fn with_reorder_horizon_secs(mut self, secs: u64) -> Self {
        self.aggregation.reorder_horizon_secs = secs;
        self
    }

    pub fn with_chunk_size(mut self, rows: usize) -> Self {
        self.aggregation.chunk_size = rows;
        self
    }

    pub fn with_sensors(mut self, sensors: Vec<SensorBinding>) -> Self {
        self.sensors = sensors;
        self
    }

    pub fn with_flag_columns(mut self, columns: Vec<String>) -> Self {
        self.flag_columns = columns;
        self
    }

    pub fn with_thresholds(mut self, thresholds: ThresholdTable) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_mad(mut self, mad: MadConfig) -> Self {
        self.mad = mad;
        self
    }

    pub fn with_isolation_forest(mut self, config: IsolationForestConfig) -> Self {
        self.isolation_forest = config;
        self
    }

    pub fn with_anomaly_features(mut self, features: Vec<String>) -> Self {
        self.anomaly_features = features;
        self
    }

    pub fn with_n_threads(mut self, n: usize) -> Self {
        self.n_threads = Some(n);
        self
    }

    /// Check internal consistency. Called before any data is touched.
    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregation;
        if agg.window_secs == 0 {
            return Err(invalid("aggregation.window_secs", agg.window_secs, "must be > 0"));
        }
        if agg.window_secs > MAX_DURATION_SECS {
            return Err(invalid(
                "aggregation.window_secs",
                agg.window_secs,
                "does not fit in a millisecond timestamp",
            ));
        }
        if agg.reorder_horizon_secs > MAX_DURATION_SECS {
            return Err(invalid(
                "aggregation.reorder_horizon_secs",
                agg.reorder_horizon_secs,
                "does not fit in a millisecond timestamp",
            ));
        }
        if agg.chunk_size == 0 {
            return Err(invalid("aggregation.chunk_size", agg.chunk_size, "must be > 0"));
        }
        if !(agg.gps_nominal_rate_hz.is_finite() && agg.gps_nominal_rate_hz > 0.0) {
            return Err(invalid(
                "aggregation.gps_nominal_rate_hz",
                agg.gps_nominal_rate_hz,
                "must be a positive finite rate",
            ));
        }

        let mut seen = HashSet::new();
        for sensor in &self.sensors {
            if sensor.name.is_empty() || sensor.column.is_empty() {
                return Err(TelemetryError::ConfigError(
                    "sensor bindings need a non-empty name and column".to_string(),
                ));
            }
            if !seen.insert(sensor.name.as_str()) {
                return Err(TelemetryError::ConfigError(format!(
                    "duplicate sensor name '{}'",
                    sensor.name
                )));
            }
        }

        if let (Some(lo), Some(hi)) = (self.thresholds.pressure_min, self.thresholds.pressure_max) {
            if lo >= hi {
                return Err(invalid("thresholds.pressure_min", lo, "must be below pressure_max"));
            }
        }

        if !(self.mad.threshold.is_finite() && self.mad.threshold > 0.0) {
            return Err(invalid("mad.threshold", self.mad.threshold, "must be > 0"));
        }
        if let ReferenceWindow::Rolling { max_windows } = self.mad.window {
            if max_windows == 0 {
                return Err(invalid("mad.window.max_windows", max_windows, "must be > 0"));
            }
        }

        let forest = &self.isolation_forest;
        if !(forest.contamination > 0.0 && forest.contamination <= 0.5) {
            return Err(invalid(
                "isolation_forest.contamination",
                forest.contamination,
                "must lie in (0, 0.5]",
            ));
        }
        if forest.n_estimators == 0 || forest.max_samples < 2 {
            return Err(TelemetryError::ConfigError(
                "isolation_forest needs n_estimators >= 1 and max_samples >= 2".to_string(),
            ));
        }
        if forest.min_training_rows < 2 {
            return Err(invalid(
                "isolation_forest.min_training_rows",
                forest.min_training_rows,
                "must be >= 2",
            ));
        }

        if self.anomaly_features.is_empty() {
            return Err(TelemetryError::ConfigError(
                "anomaly_features must not be empty".to_string(),
            ));
        }
        for feature in &self.anomaly_features {
            if FeatureName::parse(feature, self.sensors.iter().map(|s| s.name.as_str())).is_none() {
                return Err(TelemetryError::ConfigError(format!(
                    "anomaly feature '{}' does not name an aggregated field",
                    feature
                )));
            }
        }

        if self.n_threads == Some(0) {
            return Err(invalid("n_threads", 0, "must be > 0 when set"));
        }

        Ok(())
    }
}

/// Longest duration whose millisecond count fits an `i64`
const MAX_DURATION_SECS: u64 = (i64::MAX / 1000) as u64;

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000)
}

fn invalid(name: &str, value: impl ToString, reason: &str) -> TelemetryError {
    TelemetryError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.aggregation.window_secs, 60);
        assert_eq!(config.aggregation.chunk_size, 1_000_000);
        assert_eq!(config.mad.threshold, 3.5);
        assert_eq!(config.isolation_forest.contamination, 0.01);
        assert_eq!(config.anomaly_features.len(), 10);
    }

    #[test]
    fn test_builder_pattern() {
        let config = PipelineConfig::new()
            .with_window_secs(30)
            .with_chunk_size(500)
            .with_n_threads(2);

        assert_eq!(config.aggregation.window_secs, 30);
        assert_eq!(config.aggregation.chunk_size, 500);
        assert_eq!(config.n_threads, Some(2));
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let raw = r#"{
            "aggregation": { "window_secs": 120 },
            "mad": { "threshold": 4.0, "scope": "Fleet" },
            "thresholds": { "temp_motor_max": 110.0, "battery_min": null }
        }"#;
        let config = PipelineConfig::from_json_str(raw).unwrap();

        assert_eq!(config.aggregation.window_secs, 120);
        assert_eq!(config.aggregation.reorder_horizon_secs, 10);
        assert_eq!(config.mad.scope, ReferenceScope::Fleet);
        assert_eq!(config.mad.window, ReferenceWindow::Full);
        assert_eq!(config.thresholds.temp_motor_max, Some(110.0));
        assert_eq!(config.thresholds.battery_min, None);
        assert_eq!(config.thresholds.pressure_min, Some(4.0));
    }

    #[test]
    fn test_json_round_trip_preserves_rolling_window() {
        let config = PipelineConfig::default().with_mad(MadConfig {
            window: ReferenceWindow::Rolling { max_windows: 1440 },
            ..MadConfig::default()
        });
        let raw = config.to_json_string().unwrap();
        let parsed = PipelineConfig::from_json_str(&raw).unwrap();
        assert_eq!(parsed.mad.window, ReferenceWindow::Rolling { max_windows: 1440 });
    }

    #[test]
    fn test_rejects_unknown_anomaly_feature() {
        let config = PipelineConfig::default()
            .with_anomaly_features(vec!["temp_gearbox_mean".to_string()]);
        assert!(matches!(config.validate(), Err(TelemetryError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_inverted_pressure_range() {
        let config = PipelineConfig::default().with_thresholds(ThresholdTable {
            pressure_min: Some(10.0),
            pressure_max: Some(4.0),
            ..ThresholdTable::default()
        });
        assert!(matches!(
            config.validate(),
            Err(TelemetryError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_window() {
        let config = PipelineConfig::default().with_window_secs(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_contamination() {
        let config = PipelineConfig::default().with_isolation_forest(IsolationForestConfig {
            contamination: 0.0,
            ..IsolationForestConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_window_overflowing_millis() {
        let config = PipelineConfig::default().with_window_secs(u64::MAX);
        assert!(matches!(
            config.validate(),
            Err(TelemetryError::InvalidParameter { ref name, .. }) if name == "aggregation.window_secs"
        ));
        assert_eq!(config.aggregation.window_millis(), i64::MAX);

        let mut config = PipelineConfig::default();
        config.aggregation.reorder_horizon_secs = MAX_DURATION_SECS + 1;
        assert!(config.validate().is_err());

        let config = PipelineConfig::default().with_window_secs(MAX_DURATION_SECS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_min_training_rows_below_two() {
        for rows in [0, 1] {
            let config = PipelineConfig::default().with_isolation_forest(IsolationForestConfig {
                min_training_rows: rows,
                ..IsolationForestConfig::default()
            });
            assert!(matches!(
                config.validate(),
                Err(TelemetryError::InvalidParameter { ref name, .. })
                    if name == "isolation_forest.min_training_rows"
            ));
        }
    }
}
