//! Anomaly sink module
//!
//! Persists fused records as a columnar table:
//! - [`ParquetSink`] writes a single Parquet file
//! - [`MemorySink`] keeps frames in memory
//! - [`latest_positions`] serves map consumers that need the last known fix

mod frame;

pub use frame::{latest_positions, output_columns, records_to_frame, OUTPUT_SCHEMA_VERSION};

use crate::aggregation::FeatureLayout;
use crate::error::{Result, TelemetryError};
use crate::fusion::AnomalyRecord;
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

/// Destination of a run's records
pub trait AnomalySink: Send {
    /// Persist one rendered frame
    fn write_frame(&mut self, frame: &mut DataFrame) -> Result<()>;

    /// Render and persist records
    fn write_records(&mut self, records: &[AnomalyRecord], layout: &FeatureLayout) -> Result<()> {
        let mut frame = records_to_frame(records, layout)?;
        self.write_frame(&mut frame)
    }
}

/// Writes records to a Parquet file, replacing any previous content
#[derive(Debug, Clone)]
pub struct ParquetSink {
    path: PathBuf,
}

impl ParquetSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AnomalySink for ParquetSink {
    fn write_frame(&mut self, frame: &mut DataFrame) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.path)?;
        ParquetWriter::new(file)
            .finish(frame)
            .map_err(|e| TelemetryError::SinkError(format!("{}: {}", self.path.display(), e)))?;

        info!(
            path = %self.path.display(),
            rows = frame.height(),
            columns = frame.width(),
            "Wrote anomaly records"
        );
        Ok(())
    }
}

/// Collects frames in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    frames: Vec<DataFrame>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[DataFrame] {
        &self.frames
    }

    pub fn rows(&self) -> usize {
        self.frames.iter().map(DataFrame::height).sum()
    }

    pub fn into_frames(self) -> Vec<DataFrame> {
        self.frames
    }
}

impl AnomalySink for MemorySink {
    fn write_frame(&mut self, frame: &mut DataFrame) -> Result<()> {
        self.frames.push(frame.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::FeatureVector;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn records() -> Vec<AnomalyRecord> {
        (0..3)
            .map(|i| AnomalyRecord {
                features: FeatureVector {
                    locomotive_id: 10 + i,
                    window_start: Utc.with_ymd_and_hms(2024, 4, 1, 8, i as u32, 0).unwrap(),
                    window_secs: 60,
                    sensors: vec![None],
                    sample_count: 1,
                    gps_availability: 0.0,
                    avg_lat: None,
                    avg_lon: None,
                    fault_count: 0,
                    energy_consumption: None,
                    avg_speed: Some(12.0),
                },
                anomaly_score: 0,
                is_anomaly: false,
                anomaly_types: Vec::new(),
                iforest_score: None,
            })
            .collect()
    }

    #[test]
    fn test_parquet_sink_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("anomalies.parquet");
        let layout = FeatureLayout::new(vec!["battery_volt".to_string()]);

        let mut sink = ParquetSink::new(&path);
        sink.write_records(&records(), &layout).unwrap();

        let file = File::open(&path).unwrap();
        let df = ParquetReader::new(file).finish().unwrap();
        assert_eq!(df.height(), 3);
        assert_eq!(df.width(), output_columns(&layout).len());
        assert_eq!(
            df.column("ts").unwrap().dtype(),
            &DataType::Datetime(TimeUnit::Milliseconds, None)
        );
    }

    #[test]
    fn test_memory_sink_collects() {
        let layout = FeatureLayout::new(vec!["battery_volt".to_string()]);
        let mut sink = MemorySink::new();
        sink.write_records(&records(), &layout).unwrap();
        sink.write_records(&records()[..1], &layout).unwrap();
        assert_eq!(sink.frames().len(), 2);
        assert_eq!(sink.rows(), 4);
    }
}
