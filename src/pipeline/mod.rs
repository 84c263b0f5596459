//! Batch pipeline
//!
//! Runs the whole chain over a chunked source:
//! 1. Aggregate: readings are partitioned by locomotive and pushed into
//!    per-locomotive aggregators in parallel
//! 2. Snapshot: reference distributions are built and the forest fitted
//! 3. Score: locomotives are scored in parallel, windows in order
//! 4. Sink: records sorted by (window start, locomotive) are written once

mod store;

pub use store::{ModelStore, Snapshot};

use crate::aggregation::{FeatureAggregator, FeatureLayout, FeatureName, FeatureVector};
use crate::config::PipelineConfig;
use crate::error::{Result, TelemetryError};
use crate::fusion::{fuse, AnomalyRecord};
use crate::ingest::{decode_chunk, ChunkSource, RawReading};
use crate::quality::{DataQualityReport, QualityWarning};
use crate::schema::{ResolvedSchema, SchemaRegistry};
use crate::scoring::{MultivariateScorer, ReferenceSet, RobustScorer, RuleScorer};
use crate::sink::AnomalySink;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Feature vectors of a run, per locomotive, in window order
pub type LocomotiveSeries = BTreeMap<i32, Vec<FeatureVector>>;

/// Result of the aggregation phase
#[derive(Debug, Default)]
pub struct AggregationOutput {
    pub series: LocomotiveSeries,
    pub chunks_read: usize,
    pub quality: DataQualityReport,
}

impl AggregationOutput {
    pub fn window_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineReport {
    pub chunks_read: usize,
    pub rows_read: u64,
    pub malformed_readings: u64,
    pub late_readings_dropped: u64,
    pub windows_emitted: u64,
    pub records_written: usize,
    pub anomalies: usize,
    /// Label to number of windows carrying it
    pub label_counts: BTreeMap<String, u64>,
    pub rules_skipped: u64,
    pub missing_sensors: u64,
    pub model_available: bool,
    pub model_features: Vec<String>,
    pub excluded_model_features: Vec<String>,
    pub quality: DataQualityReport,
    pub elapsed_ms: u64,
}

impl PipelineReport {
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Configured pipeline, ready to run
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    schema: Arc<ResolvedSchema>,
    layout: FeatureLayout,
    anomaly_features: Vec<(String, FeatureName)>,
    rules: RuleScorer,
    robust: RobustScorer,
    store: ModelStore,
    pool: rayon::ThreadPool,
}

impl Pipeline {
    /// Pipeline over the standard locomotive schema
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_registry(config, &SchemaRegistry::locomotive())
    }

    /// Validate the configuration and resolve it against `registry`
    pub fn with_registry(config: PipelineConfig, registry: &SchemaRegistry) -> Result<Self> {
        config.validate()?;
        let schema = Arc::new(registry.resolve(&config)?);
        let layout = FeatureLayout::new(schema.sensor_names());
        let anomaly_features = layout.resolve_all(&config.anomaly_features);

        let rules = RuleScorer::new(config.thresholds.clone(), &config.rule_targets, &layout);
        let robust = RobustScorer::new(config.mad.threshold, anomaly_features.clone());

        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = config.n_threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| TelemetryError::ThreadPoolError(e.to_string()))?;

        info!(
            sensors = schema.sensors.len(),
            anomaly_features = anomaly_features.len(),
            threads = pool.current_num_threads(),
            window_secs = config.aggregation.window_secs,
            "Pipeline configured"
        );

        Ok(Self {
            config,
            schema,
            layout,
            anomaly_features,
            rules,
            robust,
            store: ModelStore::new(),
            pool,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn schema(&self) -> &ResolvedSchema {
        &self.schema
    }

    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Run every phase and write the records to `sink`
    pub fn run(&self, source: &mut dyn ChunkSource, sink: &mut dyn AnomalySink) -> Result<PipelineReport> {
        let started = Instant::now();

        let aggregated = self.aggregate(source)?;
        let snapshot = self.build_snapshot(&aggregated.series);
        let (records, scoring_quality) = self.score(&aggregated.series, &snapshot);

        sink.write_records(&records, &self.layout)?;

        let mut quality = aggregated.quality;
        quality.merge(&scoring_quality);
        let (model_features, excluded_model_features) = match snapshot.multivariate.model() {
            Some(model) => (model.features(), model.excluded().to_vec()),
            None => (Vec::new(), Vec::new()),
        };
        for feature in &excluded_model_features {
            quality.record(&QualityWarning::FeatureExcludedFromModel {
                feature: feature.clone(),
            });
        }
        if let Some(reason) = snapshot.multivariate.unavailable_reason() {
            quality.record(&QualityWarning::ModelUnavailable {
                reason: reason.to_string(),
            });
        }

        let mut label_counts = BTreeMap::new();
        for label in records.iter().flat_map(|r| r.anomaly_types.iter()) {
            *label_counts.entry(label.clone()).or_insert(0) += 1;
        }

        let report = PipelineReport {
            chunks_read: aggregated.chunks_read,
            rows_read: quality.rows_read,
            malformed_readings: quality.malformed_readings,
            late_readings_dropped: quality.late_readings_dropped,
            windows_emitted: quality.windows_emitted,
            records_written: records.len(),
            anomalies: records.iter().filter(|r| r.is_anomaly).count(),
            label_counts,
            rules_skipped: quality.rules_skipped,
            missing_sensors: quality.missing_sensors,
            model_available: snapshot.multivariate.is_fitted(),
            model_features,
            excluded_model_features,
            quality,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            rows = report.rows_read,
            windows = report.windows_emitted,
            anomalies = report.anomalies,
            malformed = report.malformed_readings,
            late = report.late_readings_dropped,
            model_available = report.model_available,
            elapsed_ms = report.elapsed_ms,
            "Pipeline run complete"
        );

        Ok(report)
    }

    /// Consume the source and aggregate every locomotive's readings
    pub fn aggregate(&self, source: &mut dyn ChunkSource) -> Result<AggregationOutput> {
        let mut output = AggregationOutput::default();
        let mut aggregators: BTreeMap<i32, FeatureAggregator> = BTreeMap::new();
        let mut row_offset = 0usize;

        loop {
            if self.config.max_chunks.is_some_and(|max| output.chunks_read >= max) {
                info!(chunks = output.chunks_read, "Chunk limit reached, stopping input");
                break;
            }
            let Some(chunk) = source.next_chunk()? else {
                break;
            };
            output.chunks_read += 1;

            let decoded = decode_chunk(&chunk, &self.schema, row_offset)?;
            row_offset += chunk.height();
            output.quality.rows_read += chunk.height() as u64;
            output.quality.malformed_readings += decoded.malformed.len() as u64;
            if let Some(first) = decoded.malformed.first() {
                warn!(
                    chunk = output.chunks_read,
                    dropped = decoded.malformed.len(),
                    first_row = first.row,
                    reason = %first.reason,
                    "Dropped malformed readings"
                );
            }

            let mut partitions: BTreeMap<i32, Vec<RawReading>> = BTreeMap::new();
            for reading in decoded.readings {
                partitions.entry(reading.locomotive_id).or_default().push(reading);
            }

            let work: Vec<(FeatureAggregator, Vec<RawReading>)> = partitions
                .into_iter()
                .map(|(id, mut readings)| {
                    readings.sort_by_key(RawReading::timestamp_millis);
                    let aggregator = aggregators.remove(&id).unwrap_or_else(|| {
                        FeatureAggregator::new(id, &self.config.aggregation, Arc::clone(&self.schema))
                    });
                    (aggregator, readings)
                })
                .collect();

            let done: Vec<(FeatureAggregator, Vec<FeatureVector>)> = self.pool.install(|| {
                work.into_par_iter()
                    .map(|(mut aggregator, readings)| {
                        let mut closed = Vec::new();
                        for reading in &readings {
                            closed.extend(aggregator.push(reading));
                        }
                        (aggregator, closed)
                    })
                    .collect()
            });

            for (aggregator, closed) in done {
                let id = aggregator.locomotive_id();
                if !closed.is_empty() {
                    output.series.entry(id).or_default().extend(closed);
                }
                aggregators.insert(id, aggregator);
            }

            debug!(
                chunk = output.chunks_read,
                rows = chunk.height(),
                locomotives = aggregators.len(),
                "Chunk aggregated"
            );
        }

        let flushed: Vec<(FeatureAggregator, Vec<FeatureVector>)> = self.pool.install(|| {
            aggregators
                .into_values()
                .collect::<Vec<_>>()
                .into_par_iter()
                .map(|mut aggregator| {
                    let closed = aggregator.flush();
                    (aggregator, closed)
                })
                .collect()
        });
        for (aggregator, closed) in flushed {
            output.quality.absorb_aggregator(aggregator.stats());
            if !closed.is_empty() {
                output
                    .series
                    .entry(aggregator.locomotive_id())
                    .or_default()
                    .extend(closed);
            }
        }

        info!(
            chunks = output.chunks_read,
            rows = output.quality.rows_read,
            locomotives = output.series.len(),
            windows = output.window_count(),
            "Aggregation complete"
        );
        Ok(output)
    }

    /// Build reference distributions and fit the forest, then publish the
    /// result as the current snapshot.
    ///
    /// A forest that cannot be fitted leaves the multivariate signal
    /// unavailable; it never fails the run.
    pub fn build_snapshot(&self, series: &LocomotiveSeries) -> Arc<Snapshot> {
        let windows = || series.values().flatten();
        let training_windows = windows().count();

        let references = ReferenceSet::build(windows(), &self.anomaly_features, &self.config.mad);

        let mut multivariate =
            MultivariateScorer::new(self.anomaly_features.clone(), self.config.isolation_forest.clone());
        if let Err(err) = multivariate.fit(windows()) {
            warn!(error = %err, windows = training_windows, "Multivariate scorer unavailable");
        }

        self.store.publish(Snapshot {
            references,
            multivariate,
            training_windows,
        })
    }

    /// Snapshot with no references and an unfitted forest; scoring against
    /// it leaves only the rule signal.
    pub fn unfitted_snapshot(&self) -> Snapshot {
        Snapshot {
            references: ReferenceSet::empty(),
            multivariate: MultivariateScorer::new(
                self.anomaly_features.clone(),
                self.config.isolation_forest.clone(),
            ),
            training_windows: 0,
        }
    }

    /// Score every window against `snapshot`.
    ///
    /// The snapshot is passed explicitly so a run always scores against the
    /// references it built, whatever the store holds by then. Records come
    /// back sorted by (window start, locomotive id).
    pub fn score(&self, series: &LocomotiveSeries, snapshot: &Snapshot) -> (Vec<AnomalyRecord>, DataQualityReport) {
        let scored: Vec<(Vec<AnomalyRecord>, DataQualityReport)> = self.pool.install(|| {
            series
                .par_iter()
                .map(|(_, windows)| self.score_locomotive(snapshot, windows))
                .collect()
        });

        let mut quality = DataQualityReport::new();
        let mut records = Vec::with_capacity(scored.iter().map(|(r, _)| r.len()).sum());
        for (locomotive_records, locomotive_quality) in scored {
            records.extend(locomotive_records);
            quality.merge(&locomotive_quality);
        }
        records.sort_by_key(|r| (r.window_start_millis(), r.locomotive_id()));

        debug!(records = records.len(), "Scoring complete");
        (records, quality)
    }

    fn score_locomotive(
        &self,
        snapshot: &Snapshot,
        windows: &[FeatureVector],
    ) -> (Vec<AnomalyRecord>, DataQualityReport) {
        let mut ordered: Vec<&FeatureVector> = windows.iter().collect();
        ordered.sort_by_key(|v| v.window_start_millis());

        let mut quality = DataQualityReport::new();
        let mut records = Vec::with_capacity(ordered.len());
        let mut previous: Option<&FeatureVector> = None;

        for vector in ordered {
            let rules = self.rules.evaluate(vector, previous);
            let robust = self.robust.score(vector, &snapshot.references);
            let (multivariate, iforest_score) = snapshot.multivariate.signal(vector);

            quality.record_all(&rules.warnings);
            quality.record_all(&robust.warnings);
            // Unavailability is reported once per run, not per window
            if snapshot.multivariate.is_fitted() {
                quality.record_all(&multivariate.warnings);
            }

            records.push(fuse(vector.clone(), [rules, robust, multivariate], iforest_score));
            previous = Some(vector);
        }

        (records, quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensorBinding;
    use crate::ingest::FrameSource;
    use crate::sink::MemorySink;
    use polars::prelude::*;

    fn config() -> PipelineConfig {
        PipelineConfig::default()
            .with_sensors(vec![
                SensorBinding::new("temp_motor1_1", "xtempmotor1_1"),
                SensorBinding::new("battery_volt", "xu_battery"),
            ])
            .with_anomaly_features(vec![
                "temp_motor1_1_mean".to_string(),
                "battery_volt_mean".to_string(),
            ])
            .with_n_threads(2)
    }

    fn frame(minutes: i64) -> DataFrame {
        let mut locoid = Vec::new();
        let mut ts = Vec::new();
        let mut temp = Vec::new();
        let mut battery = Vec::new();
        for minute in 0..minutes {
            for second in [5i64, 35] {
                for loco in [1i32, 2] {
                    locoid.push(loco);
                    ts.push(format!("2024-04-01 10:{:02}:{:02}", minute, second));
                    temp.push(70.0 + (minute % 4) as f32);
                    battery.push(if loco == 2 && minute == 3 { 80.0f32 } else { 110.0 });
                }
            }
        }
        DataFrame::new(vec![
            Series::new("locoid".into(), locoid).into(),
            Series::new("devicetime".into(), ts).into(),
            Series::new("xtempmotor1_1".into(), temp).into(),
            Series::new("xu_battery".into(), battery).into(),
        ])
        .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected_before_processing() {
        let result = Pipeline::new(config().with_window_secs(0));
        assert!(result.is_err());
    }

    #[test]
    fn test_run_end_to_end() {
        let pipeline = Pipeline::new(config()).unwrap();
        let mut source = FrameSource::new(vec![frame(10)], 7);
        let mut sink = MemorySink::new();

        let report = pipeline.run(&mut source, &mut sink).unwrap();

        assert_eq!(report.rows_read, 40);
        assert_eq!(report.malformed_readings, 0);
        assert_eq!(report.windows_emitted, 20);
        assert_eq!(report.records_written, 20);
        // 20 windows is below the default training minimum
        assert!(!report.model_available);
        assert_eq!(report.label_counts.get("rule:battery_min"), Some(&1));
        assert_eq!(sink.rows(), 20);

        let df = &sink.frames()[0];
        let locos: Vec<Option<i32>> = df.column("locoid").unwrap().i32().unwrap().into_iter().collect();
        assert_eq!(&locos[..4], &[Some(1), Some(2), Some(1), Some(2)]);
    }

    #[test]
    fn test_max_chunks_stops_input() {
        let pipeline = Pipeline::new(PipelineConfig {
            max_chunks: Some(1),
            ..config()
        })
        .unwrap();
        let mut source = FrameSource::new(vec![frame(10)], 8);
        let aggregated = pipeline.aggregate(&mut source).unwrap();
        assert_eq!(aggregated.chunks_read, 1);
        assert_eq!(aggregated.quality.rows_read, 8);
    }

    #[test]
    fn test_score_without_snapshot_keeps_rules() {
        let pipeline = Pipeline::new(config()).unwrap();
        let aggregated = pipeline.aggregate(&mut FrameSource::new(vec![frame(5)], 100)).unwrap();
        let (records, _) = pipeline.score(&aggregated.series, &pipeline.unfitted_snapshot());
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.iforest_score.is_none()));
        assert_eq!(records.iter().filter(|r| r.is_anomaly).count(), 1);
    }

    #[test]
    fn test_scoring_uses_the_given_snapshot() {
        let pipeline = Pipeline::new(config()).unwrap();
        let run_a = pipeline.aggregate(&mut FrameSource::new(vec![frame(10)], 100)).unwrap();
        let hot: DataFrame = {
            let mut df = frame(10);
            let hotter: Vec<f32> = vec![140.0; df.height()];
            df.replace("xtempmotor1_1", Series::new("xtempmotor1_1".into(), hotter)).unwrap();
            df
        };
        let run_b = pipeline.aggregate(&mut FrameSource::new(vec![hot], 100)).unwrap();

        let snapshot_a = pipeline.build_snapshot(&run_a.series);
        let (before, _) = pipeline.score(&run_a.series, &snapshot_a);

        // Another run publishes its own snapshot in between
        pipeline.build_snapshot(&run_b.series);
        let (after, _) = pipeline.score(&run_a.series, &snapshot_a);

        let mad_windows = |records: &[AnomalyRecord]| {
            records
                .iter()
                .filter(|r| r.anomaly_types.iter().any(|l| l.starts_with("mad:")))
                .count()
        };
        assert_eq!(mad_windows(&after), mad_windows(&before));

        // The published snapshot belongs to the hot run and would flag everything
        let published = pipeline.store().current().unwrap();
        let (crossed, _) = pipeline.score(&run_a.series, &published);
        assert!(mad_windows(&crossed) > mad_windows(&before));
    }
}
