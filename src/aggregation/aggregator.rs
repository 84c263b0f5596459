//! Streaming per-locomotive window aggregation

use super::accumulator::{CounterSpan, SensorAccumulator};
use super::vector::FeatureVector;
use crate::config::AggregationConfig;
use crate::ingest::RawReading;
use crate::schema::ResolvedSchema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Counters kept by an aggregator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub readings_accepted: u64,
    /// Readings whose window had already been emitted
    pub late_readings_dropped: u64,
    /// Readings routed to the wrong locomotive
    pub foreign_readings_dropped: u64,
    pub windows_emitted: u64,
}

impl AggregatorStats {
    pub fn merge(&mut self, other: &AggregatorStats) {
        self.readings_accepted += other.readings_accepted;
        self.late_readings_dropped += other.late_readings_dropped;
        self.foreign_readings_dropped += other.foreign_readings_dropped;
        self.windows_emitted += other.windows_emitted;
    }
}

/// Readings of one window that has not been emitted yet.
///
/// Values are kept until the window closes and then accumulated in a
/// canonical order, so the emitted vector does not depend on arrival order.
#[derive(Debug, Default)]
struct OpenWindow {
    sample_count: u32,
    sensors: Vec<Vec<f64>>,
    speed: Vec<f64>,
    fixes: Vec<(f64, f64)>,
    energy: CounterSpan,
    fault_count: u32,
}

impl OpenWindow {
    fn new(n_sensors: usize) -> Self {
        Self {
            sensors: vec![Vec::new(); n_sensors],
            ..Self::default()
        }
    }

    fn add(&mut self, reading: &RawReading, schema: &ResolvedSchema) {
        self.sample_count += 1;

        for (slot, sensor) in self.sensors.iter_mut().zip(&schema.sensors) {
            if let Some(v) = reading.value(&sensor.column) {
                slot.push(v);
            }
        }
        if let Some(v) = reading.value(&schema.speed_column) {
            self.speed.push(v);
        }
        if let Some(fix) = reading.gps_fix() {
            self.fixes.push(fix);
        }
        if let Some(v) = reading.value(&schema.energy_column) {
            self.energy.push(reading.timestamp_millis(), v);
        }

        if let Some(fault) = &schema.fault_code_column {
            if reading.value(fault).map_or(false, |v| v != 0.0) {
                self.fault_count += 1;
            }
        }
        for flag in &schema.flag_columns {
            if reading.value(flag).map_or(false, |v| v != 0.0) {
                self.fault_count += 1;
            }
        }
    }

    fn close(
        mut self,
        locomotive_id: i32,
        start_ms: i64,
        config: &AggregationConfig,
    ) -> Option<FeatureVector> {
        if self.sample_count == 0 {
            return None;
        }
        let window_start = DateTime::<Utc>::from_timestamp_millis(start_ms)?;

        let sensors = self
            .sensors
            .iter_mut()
            .map(|values| SensorAccumulator::from_unordered(values).finish())
            .collect();

        let avg_speed = SensorAccumulator::from_unordered(&mut self.speed)
            .finish()
            .map(|s| s.mean);

        self.fixes
            .sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.total_cmp(&b.1)));
        let n_fixes = self.fixes.len();
        let (avg_lat, avg_lon) = if n_fixes == 0 {
            (None, None)
        } else {
            let (lat_sum, lon_sum) = self
                .fixes
                .iter()
                .fold((0.0, 0.0), |(la, lo), &(lat, lon)| (la + lat, lo + lon));
            (Some(lat_sum / n_fixes as f64), Some(lon_sum / n_fixes as f64))
        };

        let expected = config.expected_gps_fixes();
        let gps_availability = if expected > 0.0 {
            (n_fixes as f64 / expected).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Some(FeatureVector {
            locomotive_id,
            window_start,
            window_secs: config.window_secs,
            sensors,
            sample_count: self.sample_count,
            gps_availability,
            avg_lat,
            avg_lon,
            fault_count: self.fault_count,
            energy_consumption: self.energy.increase(),
            avg_speed,
        })
    }
}

/// Window aggregation for one locomotive.
///
/// Readings may arrive out of order. A window closes once the newest
/// timestamp seen is at least `reorder_horizon` past the window's end; a
/// reading for a window that has already closed is dropped and counted in
/// [`AggregatorStats::late_readings_dropped`].
#[derive(Debug)]
pub struct FeatureAggregator {
    locomotive_id: i32,
    config: AggregationConfig,
    schema: Arc<ResolvedSchema>,
    window_ms: i64,
    horizon_ms: i64,
    open: BTreeMap<i64, OpenWindow>,
    /// Newest timestamp seen
    watermark: Option<i64>,
    /// Every window ending at or before this instant has been emitted
    closed_until: Option<i64>,
    stats: AggregatorStats,
}

impl FeatureAggregator {
    pub fn new(locomotive_id: i32, config: &AggregationConfig, schema: Arc<ResolvedSchema>) -> Self {
        Self {
            locomotive_id,
            config: config.clone(),
            schema,
            window_ms: config.window_millis().max(1),
            horizon_ms: config.horizon_millis().max(0),
            open: BTreeMap::new(),
            watermark: None,
            closed_until: None,
            stats: AggregatorStats::default(),
        }
    }

    pub fn locomotive_id(&self) -> i32 {
        self.locomotive_id
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    /// Windows currently held open
    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    /// Start of the window containing `timestamp_ms`
    pub fn window_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.window_ms) * self.window_ms
    }

    /// Add one reading and return the windows it closed, oldest first
    pub fn push(&mut self, reading: &RawReading) -> Vec<FeatureVector> {
        if reading.locomotive_id != self.locomotive_id {
            warn!(
                expected = self.locomotive_id,
                got = reading.locomotive_id,
                "Reading routed to wrong aggregator"
            );
            self.stats.foreign_readings_dropped += 1;
            return Vec::new();
        }

        let ts = reading.timestamp_millis();
        let start = self.window_start(ts);
        if self.closed_until.map_or(false, |closed| start + self.window_ms <= closed) {
            self.stats.late_readings_dropped += 1;
            return Vec::new();
        }

        let n_sensors = self.schema.sensors.len();
        self.open
            .entry(start)
            .or_insert_with(|| OpenWindow::new(n_sensors))
            .add(reading, &self.schema);
        self.stats.readings_accepted += 1;

        self.watermark = Some(self.watermark.map_or(ts, |w| w.max(ts)));
        self.close_ready()
    }

    fn close_ready(&mut self) -> Vec<FeatureVector> {
        let Some(watermark) = self.watermark else {
            return Vec::new();
        };
        let frontier = watermark.saturating_sub(self.horizon_ms);

        let mut emitted = Vec::new();
        while let Some((&start, _)) = self.open.first_key_value() {
            if start + self.window_ms > frontier {
                break;
            }
            if let Some(window) = self.open.remove(&start) {
                emitted.extend(window.close(self.locomotive_id, start, &self.config));
            }
        }

        self.closed_until = Some(
            self.closed_until
                .map_or(frontier, |closed| closed.max(frontier)),
        );
        self.stats.windows_emitted += emitted.len() as u64;
        emitted
    }

    /// Emit every window still open
    pub fn flush(&mut self) -> Vec<FeatureVector> {
        let open = std::mem::take(&mut self.open);
        let mut emitted = Vec::with_capacity(open.len());
        let mut last_end = None;
        for (start, window) in open {
            last_end = Some(start + self.window_ms);
            emitted.extend(window.close(self.locomotive_id, start, &self.config));
        }
        if let Some(end) = last_end {
            self.closed_until = Some(self.closed_until.map_or(end, |closed| closed.max(end)));
        }
        self.stats.windows_emitted += emitted.len() as u64;
        debug!(
            locomotive = self.locomotive_id,
            windows = emitted.len(),
            "Flushed open windows"
        );
        emitted
    }

    /// Lazily aggregate a stream of readings
    pub fn stream<I>(self, readings: I) -> WindowStream<I::IntoIter>
    where
        I: IntoIterator<Item = RawReading>,
    {
        WindowStream {
            aggregator: self,
            readings: readings.into_iter(),
            ready: std::collections::VecDeque::new(),
            flushed: false,
        }
    }

    /// Aggregate a complete, unordered batch.
    ///
    /// The batch is sorted first, so no reading counts as late and the result
    /// is the same for every permutation of the input.
    pub fn aggregate_batch(mut self, mut readings: Vec<RawReading>) -> (Vec<FeatureVector>, AggregatorStats) {
        readings.sort_by_key(RawReading::timestamp_millis);
        let mut vectors = Vec::new();
        for reading in &readings {
            vectors.extend(self.push(reading));
        }
        vectors.extend(self.flush());
        (vectors, self.stats)
    }
}

/// Iterator adapter returned by [`FeatureAggregator::stream`]
pub struct WindowStream<I> {
    aggregator: FeatureAggregator,
    readings: I,
    ready: std::collections::VecDeque<FeatureVector>,
    flushed: bool,
}

impl<I> WindowStream<I> {
    pub fn stats(&self) -> &AggregatorStats {
        self.aggregator.stats()
    }
}

impl<I> Iterator for WindowStream<I>
where
    I: Iterator<Item = RawReading>,
{
    type Item = FeatureVector;

    fn next(&mut self) -> Option<FeatureVector> {
        loop {
            if let Some(vector) = self.ready.pop_front() {
                return Some(vector);
            }
            if self.flushed {
                return None;
            }
            match self.readings.next() {
                Some(reading) => self.ready.extend(self.aggregator.push(&reading)),
                None => {
                    self.ready.extend(self.aggregator.flush());
                    self.flushed = true;
                }
            }
        }
    }
}
