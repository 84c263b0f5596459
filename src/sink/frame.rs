//! Tabular rendering of anomaly records

use crate::aggregation::{FeatureLayout, FeatureName, Statistic};
use crate::error::Result;
use crate::fusion::AnomalyRecord;
use polars::prelude::*;
use std::collections::BTreeMap;

/// Version of the output column layout
pub const OUTPUT_SCHEMA_VERSION: u32 = 1;

/// Output column names, in order
pub fn output_columns(layout: &FeatureLayout) -> Vec<String> {
    let mut columns = vec!["ts".to_string(), "locoid".to_string()];
    columns.extend(layout.sensor_columns());
    columns.extend(
        [
            "sample_count",
            "gps_availability",
            "avg_lat",
            "avg_lon",
            "fault_count",
            "energy_consumption",
            "avg_speed",
            "anomaly_score",
            "is_anomaly",
            "anomaly_types",
            "iforest_score",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    columns
}

/// Render records as a DataFrame with the versioned output layout.
///
/// Undefined dispersions and missing sensors become nulls.
pub fn records_to_frame(records: &[AnomalyRecord], layout: &FeatureLayout) -> Result<DataFrame> {
    let ts: Vec<i64> = records.iter().map(|r| r.window_start_millis()).collect();
    let ts = Series::new("ts".into(), ts).cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?;

    let mut columns: Vec<Column> = Vec::with_capacity(layout.sensor_names().len() * 3 + 13);
    columns.push(ts.into());
    columns.push(
        Series::new(
            "locoid".into(),
            records.iter().map(|r| r.locomotive_id()).collect::<Vec<i32>>(),
        )
        .into(),
    );

    for (index, sensor) in layout.sensor_names().iter().enumerate() {
        for stat in Statistic::ALL {
            let field = FeatureName::Sensor { index, stat };
            let values: Vec<Option<f64>> = records.iter().map(|r| r.features.get(field).as_f64()).collect();
            columns.push(Series::new(format!("{}_{}", sensor, stat.suffix()).into(), values).into());
        }
    }

    columns.push(
        Series::new(
            "sample_count".into(),
            records.iter().map(|r| r.features.sample_count).collect::<Vec<u32>>(),
        )
        .into(),
    );
    columns.push(
        Series::new(
            "gps_availability".into(),
            records.iter().map(|r| r.features.gps_availability).collect::<Vec<f64>>(),
        )
        .into(),
    );
    columns.push(optional_f64("avg_lat", records, |r| r.features.avg_lat));
    columns.push(optional_f64("avg_lon", records, |r| r.features.avg_lon));
    columns.push(
        Series::new(
            "fault_count".into(),
            records.iter().map(|r| r.features.fault_count).collect::<Vec<u32>>(),
        )
        .into(),
    );
    columns.push(optional_f64("energy_consumption", records, |r| r.features.energy_consumption));
    columns.push(optional_f64("avg_speed", records, |r| r.features.avg_speed));
    columns.push(
        Series::new(
            "anomaly_score".into(),
            records
                .iter()
                .map(|r| i32::try_from(r.anomaly_score).unwrap_or(i32::MAX))
                .collect::<Vec<i32>>(),
        )
        .into(),
    );
    columns.push(
        Series::new(
            "is_anomaly".into(),
            records.iter().map(|r| r.is_anomaly).collect::<Vec<bool>>(),
        )
        .into(),
    );
    columns.push(
        Series::new(
            "anomaly_types".into(),
            records.iter().map(|r| r.anomaly_types_joined()).collect::<Vec<String>>(),
        )
        .into(),
    );
    columns.push(optional_f64("iforest_score", records, |r| r.iforest_score));

    Ok(DataFrame::new(columns)?)
}

fn optional_f64(name: &str, records: &[AnomalyRecord], get: impl Fn(&AnomalyRecord) -> Option<f64>) -> Column {
    let values: Vec<Option<f64>> = records.iter().map(get).collect();
    Series::new(name.into(), values).into()
}

/// Last known position of each locomotive.
///
/// Takes each locomotive's most recent record; a locomotive whose most recent
/// record has no fix is left out rather than shown at an older position.
pub fn latest_positions(records: &[AnomalyRecord]) -> Vec<&AnomalyRecord> {
    let mut latest: BTreeMap<i32, &AnomalyRecord> = BTreeMap::new();
    for record in records {
        latest
            .entry(record.locomotive_id())
            .and_modify(|current| {
                if record.window_start_millis() >= current.window_start_millis() {
                    *current = record;
                }
            })
            .or_insert(record);
    }
    latest
        .into_values()
        .filter(|record| record.position().is_some())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::{Dispersion, FeatureVector, SensorStats};
    use chrono::{Duration, TimeZone, Utc};

    fn record(loco: i32, minute: i64, position: Option<(f64, f64)>, std: Dispersion) -> AnomalyRecord {
        AnomalyRecord {
            features: FeatureVector {
                locomotive_id: loco,
                window_start: Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap() + Duration::minutes(minute),
                window_secs: 60,
                sensors: vec![
                    Some(SensorStats {
                        count: 2,
                        mean: 80.0,
                        max: 81.0,
                        std,
                    }),
                    None,
                ],
                sample_count: 2,
                gps_availability: if position.is_some() { 0.5 } else { 0.0 },
                avg_lat: position.map(|p| p.0),
                avg_lon: position.map(|p| p.1),
                fault_count: 1,
                energy_consumption: Some(0.4),
                avg_speed: None,
            },
            anomaly_score: 2,
            is_anomaly: true,
            anomaly_types: vec!["rule:battery_min".to_string(), "iforest".to_string()],
            iforest_score: Some(0.66),
        }
    }

    fn layout() -> FeatureLayout {
        FeatureLayout::new(vec!["temp_motor1_1".to_string(), "battery_volt".to_string()])
    }

    #[test]
    fn test_frame_layout() {
        let records = vec![
            record(1, 0, Some((50.1, 14.4)), Dispersion::Value(0.7)),
            record(2, 0, None, Dispersion::Undefined),
        ];
        let df = records_to_frame(&records, &layout()).unwrap();

        let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
        assert_eq!(names, output_columns(&layout()));
        assert_eq!(df.height(), 2);
        assert_eq!(
            df.column("ts").unwrap().dtype(),
            &DataType::Datetime(TimeUnit::Milliseconds, None)
        );
        assert_eq!(df.column("locoid").unwrap().dtype(), &DataType::Int32);
        assert_eq!(df.column("sample_count").unwrap().dtype(), &DataType::UInt32);
        assert_eq!(df.column("anomaly_score").unwrap().dtype(), &DataType::Int32);

        let std = df.column("temp_motor1_1_std").unwrap().f64().unwrap();
        assert_eq!(std.get(0), Some(0.7));
        assert_eq!(std.get(1), None);
        assert_eq!(df.column("battery_volt_mean").unwrap().null_count(), 2);
        assert_eq!(df.column("avg_lat").unwrap().null_count(), 1);

        let types = df.column("anomaly_types").unwrap().str().unwrap();
        assert_eq!(types.get(0), Some("rule:battery_min;iforest"));
    }

    #[test]
    fn test_empty_frame_keeps_columns() {
        let df = records_to_frame(&[], &layout()).unwrap();
        assert_eq!(df.height(), 0);
        assert_eq!(df.width(), output_columns(&layout()).len());
    }

    #[test]
    fn test_latest_positions_use_most_recent_record() {
        let records = vec![
            record(1, 0, Some((50.0, 14.0)), Dispersion::Undefined),
            record(1, 1, Some((50.1, 14.1)), Dispersion::Undefined),
            record(1, 2, None, Dispersion::Undefined),
            record(2, 5, None, Dispersion::Undefined),
            record(3, 4, Some((49.0, 15.0)), Dispersion::Undefined),
            record(3, 3, Some((48.0, 16.0)), Dispersion::Undefined),
        ];
        let latest = latest_positions(&records);

        // Locomotive 1 lost its fix in the last window, so its older position is not shown
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].locomotive_id(), 3);
        assert_eq!(latest[0].position(), Some((49.0, 15.0)));
    }
}
