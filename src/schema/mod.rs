//! Sensor schema registry
//!
//! Static description of the columns a locomotive telemetry export carries:
//! what each column measures and the precision it is stored at. Flag columns
//! are declared explicitly and resolved once against the registry when a
//! pipeline is built, so every chunk is read with the same schema.

use crate::config::PipelineConfig;
use crate::error::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Locomotive identifier column
pub const LOCO_ID_COLUMN: &str = "locoid";
/// Device timestamp column
pub const TIMESTAMP_COLUMN: &str = "devicetime";
pub const LATITUDE_COLUMN: &str = "latitude";
pub const LONGITUDE_COLUMN: &str = "longitude";
pub const ALTITUDE_COLUMN: &str = "altitude";

/// What a column measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Identifier,
    Timestamp,
    Gps,
    Temperature,
    Current,
    Pressure,
    BatteryVoltage,
    Speed,
    TractiveEffort,
    Energy,
    Odometer,
    FaultCode,
    /// Binary fault indicator
    Flag,
}

/// Storage precision of a column in the columnar export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    Float32,
    Int32,
    Int16,
    /// Binary flag stored as int8
    Int8Flag,
    Text,
}

impl StorageType {
    /// Round a value to what the column can actually hold
    pub fn quantize(self, value: f64) -> Option<f64> {
        if !value.is_finite() {
            return None;
        }
        match self {
            StorageType::Float32 => Some(value as f32 as f64),
            StorageType::Int32 => Some(value.trunc().clamp(i32::MIN as f64, i32::MAX as f64)),
            StorageType::Int16 => Some(value.trunc().clamp(i16::MIN as f64, i16::MAX as f64)),
            StorageType::Int8Flag => Some(if value != 0.0 { 1.0 } else { 0.0 }),
            StorageType::Text => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, StorageType::Text)
    }
}

/// Registry entry for one column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub kind: SensorKind,
    pub storage: StorageType,
}

impl SensorSpec {
    const fn new(kind: SensorKind, storage: StorageType) -> Self {
        Self { kind, storage }
    }
}

/// Mapping from column name to [`SensorSpec`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaRegistry {
    columns: BTreeMap<String, SensorSpec>,
}

impl SchemaRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for the fleet's standard telemetry export
    pub fn locomotive() -> Self {
        use SensorKind::*;
        use StorageType::*;

        let entries: &[(&str, SensorKind, StorageType)] = &[
            (LOCO_ID_COLUMN, Identifier, Int32),
            (TIMESTAMP_COLUMN, Timestamp, Text),
            (LATITUDE_COLUMN, Gps, Float32),
            (LONGITUDE_COLUMN, Gps, Float32),
            (ALTITUDE_COLUMN, Gps, Float32),
            ("gpsspeed", Speed, Float32),
            ("faultnum", FaultCode, Int16),
            ("xtempmotor1_1", Temperature, Float32),
            ("xtempmotor1_2", Temperature, Float32),
            ("xtempmotor2_1", Temperature, Float32),
            ("xtempmotor2_2", Temperature, Float32),
            ("xtempmotor3_1", Temperature, Float32),
            ("xtempmotor3_2", Temperature, Float32),
            ("xatmp1oeltr_1", Temperature, Float32),
            ("xatmp1oeltr_2", Temperature, Float32),
            ("xatmp2oeltr_1", Temperature, Float32),
            ("xatmp2oeltr_2", Temperature, Float32),
            ("xatmp1oelsr_1", Temperature, Float32),
            ("xatmp1oelsr_2", Temperature, Float32),
            ("xatmp2oelsr_1", Temperature, Float32),
            ("xatmp2oelsr_2", Temperature, Float32),
            ("xuprim_1", Current, Float32),
            ("xiprim_1", Current, Float32),
            ("xaibur", Current, Float32),
            ("xadrucktr_1", Pressure, Float32),
            ("xadrucktr_2", Pressure, Float32),
            ("xadrucksr_1", Pressure, Float32),
            ("xadrucksr_2", Pressure, Float32),
            ("xprautobkln", Pressure, Float32),
            ("xpressurecv_1", Pressure, Float32),
            ("xpressurecv_2", Pressure, Float32),
            ("xenergkwh_plus", Energy, Float32),
            ("xenergkwh_minus", Energy, Float32),
            ("odometerK", Odometer, Float32),
            ("odometerM", Odometer, Float32),
            ("odometerG", Odometer, Float32),
            ("xu_battery", BatteryVoltage, Float32),
            ("xspeedloco", Speed, Float32),
            ("xte_be_loco", TractiveEffort, Float32),
        ];

        let columns = entries
            .iter()
            .map(|&(name, kind, storage)| (name.to_string(), SensorSpec::new(kind, storage)))
            .collect();

        Self { columns }
    }

    /// Register (or replace) a column
    pub fn register(&mut self, column: impl Into<String>, kind: SensorKind, storage: StorageType) {
        self.columns.insert(column.into(), SensorSpec::new(kind, storage));
    }

    /// Declare binary fault indicator columns
    pub fn with_flag_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            self.register(column, SensorKind::Flag, StorageType::Int8Flag);
        }
        self
    }

    pub fn get(&self, column: &str) -> Option<&SensorSpec> {
        self.columns.get(column)
    }

    /// Kind of a column, `None` for untyped columns
    pub fn kind(&self, column: &str) -> Option<SensorKind> {
        self.get(column).map(|spec| spec.kind)
    }

    pub fn storage(&self, column: &str) -> Option<StorageType> {
        self.get(column).map(|spec| spec.storage)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Resolve a pipeline configuration against this registry.
    ///
    /// Flag columns from the configuration are registered as int8 flags.
    /// Every other configured column must already be known.
    pub fn resolve(&self, config: &PipelineConfig) -> Result<ResolvedSchema> {
        let registry = self.clone().with_flag_columns(config.flag_columns.iter().cloned());

        let mut sensors = Vec::with_capacity(config.sensors.len());
        for binding in &config.sensors {
            let spec = registry.require(&binding.column)?;
            if !spec.storage.is_numeric() || spec.kind == SensorKind::Flag {
                return Err(TelemetryError::ConfigError(format!(
                    "sensor '{}' maps to non-measurement column '{}'",
                    binding.name, binding.column
                )));
            }
            sensors.push(ResolvedSensor {
                name: binding.name.clone(),
                column: binding.column.clone(),
                kind: spec.kind,
            });
        }

        let energy = registry.require(&config.energy_column)?;
        if energy.kind != SensorKind::Energy {
            return Err(TelemetryError::ConfigError(format!(
                "energy column '{}' is registered as {:?}",
                config.energy_column, energy.kind
            )));
        }
        let speed = registry.require(&config.speed_column)?;
        if speed.kind != SensorKind::Speed {
            return Err(TelemetryError::ConfigError(format!(
                "speed column '{}' is registered as {:?}",
                config.speed_column, speed.kind
            )));
        }

        if let Some(fault) = &config.fault_code_column {
            registry.require(fault)?;
        }

        Ok(ResolvedSchema {
            sensors,
            energy_column: config.energy_column.clone(),
            speed_column: config.speed_column.clone(),
            fault_code_column: config.fault_code_column.clone(),
            flag_columns: config.flag_columns.clone(),
            registry,
        })
    }

    fn require(&self, column: &str) -> Result<SensorSpec> {
        self.get(column).copied().ok_or_else(|| {
            TelemetryError::ConfigError(format!("column '{}' is not in the sensor schema", column))
        })
    }
}

/// Aggregated sensor after resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSensor {
    pub name: String,
    pub column: String,
    pub kind: SensorKind,
}

/// Schema fixed for the whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedSchema {
    pub sensors: Vec<ResolvedSensor>,
    pub energy_column: String,
    pub speed_column: String,
    pub fault_code_column: Option<String>,
    pub flag_columns: Vec<String>,
    pub registry: SchemaRegistry,
}

impl ResolvedSchema {
    /// Sensor prefixes in output order
    pub fn sensor_names(&self) -> Vec<String> {
        self.sensors.iter().map(|s| s.name.clone()).collect()
    }

    /// Storage precision of a column; untyped columns are kept as-is
    pub fn quantize(&self, column: &str, value: f64) -> Option<f64> {
        match self.registry.storage(column) {
            Some(storage) => storage.quantize(value),
            None if value.is_finite() => Some(value),
            None => None,
        }
    }
}
