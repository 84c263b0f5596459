//! Feature vectors and named field access

use super::accumulator::{Dispersion, SensorStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-sensor statistic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Statistic {
    Mean,
    Max,
    Std,
}

impl Statistic {
    pub const ALL: [Statistic; 3] = [Statistic::Mean, Statistic::Max, Statistic::Std];

    pub fn suffix(self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Max => "max",
            Statistic::Std => "std",
        }
    }
}

/// A field of a [`FeatureVector`], resolved from its column name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureName {
    Sensor { index: usize, stat: Statistic },
    SampleCount,
    GpsAvailability,
    AvgLat,
    AvgLon,
    FaultCount,
    EnergyConsumption,
    AvgSpeed,
}

impl FeatureName {
    /// Resolve a column name against the ordered sensor prefixes
    pub fn parse<'a, I>(name: &str, sensors: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let derived = match name {
            "sample_count" => Some(FeatureName::SampleCount),
            "gps_availability" => Some(FeatureName::GpsAvailability),
            "avg_lat" => Some(FeatureName::AvgLat),
            "avg_lon" => Some(FeatureName::AvgLon),
            "fault_count" => Some(FeatureName::FaultCount),
            "energy_consumption" => Some(FeatureName::EnergyConsumption),
            "avg_speed" => Some(FeatureName::AvgSpeed),
            _ => None,
        };
        if derived.is_some() {
            return derived;
        }

        let (prefix, suffix) = name.rsplit_once('_')?;
        let stat = Statistic::ALL.into_iter().find(|s| s.suffix() == suffix)?;
        sensors
            .into_iter()
            .position(|sensor| sensor == prefix)
            .map(|index| FeatureName::Sensor { index, stat })
    }
}

/// Value of a named field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureValue {
    Value(f64),
    /// Spread of a single-sample window
    Undefined,
    /// Sensor not reported in this window
    Missing,
}

impl FeatureValue {
    pub fn as_f64(self) -> Option<f64> {
        match self {
            FeatureValue::Value(v) => Some(v),
            _ => None,
        }
    }

    fn from_option(value: Option<f64>) -> Self {
        value.map_or(FeatureValue::Missing, FeatureValue::Value)
    }
}

/// Column layout shared by every vector of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLayout {
    sensor_names: Vec<String>,
}

impl FeatureLayout {
    pub fn new(sensor_names: Vec<String>) -> Self {
        Self { sensor_names }
    }

    pub fn sensor_names(&self) -> &[String] {
        &self.sensor_names
    }

    pub fn resolve(&self, name: &str) -> Option<FeatureName> {
        FeatureName::parse(name, self.sensor_names.iter().map(String::as_str))
    }

    /// Resolve a list of names, skipping those that do not exist
    pub fn resolve_all(&self, names: &[String]) -> Vec<(String, FeatureName)> {
        names
            .iter()
            .filter_map(|name| self.resolve(name).map(|f| (name.clone(), f)))
            .collect()
    }

    /// `<sensor>_mean`, `<sensor>_max`, `<sensor>_std` for every sensor, in order
    pub fn sensor_columns(&self) -> Vec<String> {
        self.sensor_names
            .iter()
            .flat_map(|name| {
                Statistic::ALL
                    .iter()
                    .map(move |stat| format!("{}_{}", name, stat.suffix()))
            })
            .collect()
    }
}

/// Aggregated features of one locomotive over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub locomotive_id: i32,
    pub window_start: DateTime<Utc>,
    pub window_secs: u64,
    /// Per-sensor statistics aligned with the [`FeatureLayout`]; `None` when
    /// the sensor had no observation in the window
    pub sensors: Vec<Option<SensorStats>>,
    pub sample_count: u32,
    /// Fraction of the nominal GPS fixes actually received
    pub gps_availability: f64,
    pub avg_lat: Option<f64>,
    pub avg_lon: Option<f64>,
    pub fault_count: u32,
    pub energy_consumption: Option<f64>,
    pub avg_speed: Option<f64>,
}

impl FeatureVector {
    pub fn window_start_millis(&self) -> i64 {
        self.window_start.timestamp_millis()
    }

    pub fn sensor(&self, index: usize) -> Option<&SensorStats> {
        self.sensors.get(index).and_then(Option::as_ref)
    }

    pub fn get(&self, name: FeatureName) -> FeatureValue {
        match name {
            FeatureName::Sensor { index, stat } => match self.sensor(index) {
                None => FeatureValue::Missing,
                Some(stats) => match stat {
                    Statistic::Mean => FeatureValue::Value(stats.mean),
                    Statistic::Max => FeatureValue::Value(stats.max),
                    Statistic::Std => match stats.std {
                        Dispersion::Value(v) => FeatureValue::Value(v),
                        Dispersion::Undefined => FeatureValue::Undefined,
                    },
                },
            },
            FeatureName::SampleCount => FeatureValue::Value(self.sample_count as f64),
            FeatureName::GpsAvailability => FeatureValue::Value(self.gps_availability),
            FeatureName::AvgLat => FeatureValue::from_option(self.avg_lat),
            FeatureName::AvgLon => FeatureValue::from_option(self.avg_lon),
            FeatureName::FaultCount => FeatureValue::Value(self.fault_count as f64),
            FeatureName::EnergyConsumption => FeatureValue::from_option(self.energy_consumption),
            FeatureName::AvgSpeed => FeatureValue::from_option(self.avg_speed),
        }
    }

    /// Look a field up by column name
    pub fn feature(&self, layout: &FeatureLayout, name: &str) -> FeatureValue {
        layout
            .resolve(name)
            .map_or(FeatureValue::Missing, |f| self.get(f))
    }

    /// Minutes between this window and an earlier one
    pub fn minutes_since(&self, earlier: &FeatureVector) -> f64 {
        (self.window_start_millis() - earlier.window_start_millis()) as f64 / 60_000.0
    }
}
