//! One-pass window accumulators

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Spread of a sensor within a window.
///
/// A window with a single observation carries no information about spread,
/// which is different from an observed spread of zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Dispersion {
    /// Fewer than two observations
    Undefined,
    /// Sample standard deviation
    Value(f64),
}

impl Dispersion {
    pub fn value(self) -> Option<f64> {
        match self {
            Dispersion::Value(v) => Some(v),
            Dispersion::Undefined => None,
        }
    }

    pub fn is_undefined(self) -> bool {
        matches!(self, Dispersion::Undefined)
    }
}

/// Aggregated statistics of one sensor over one window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorStats {
    /// Non-null observations
    pub count: u32,
    pub mean: f64,
    pub max: f64,
    pub std: Dispersion,
}

/// Welford accumulator for mean, max and sample variance
#[derive(Debug, Clone, Default)]
pub struct SensorAccumulator {
    count: u32,
    mean: f64,
    m2: f64,
    max: f64,
}

impl SensorAccumulator {
    pub fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            max: f64::NEG_INFINITY,
        }
    }

    /// Add one observation. Non-finite values are ignored.
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        self.max = self.max.max(value);

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Sample variance, `None` below two observations
    pub fn variance(&self) -> Option<f64> {
        if self.count < 2 {
            None
        } else {
            Some((self.m2 / (self.count - 1) as f64).max(0.0))
        }
    }

    /// Final statistics, `None` if nothing was observed
    pub fn finish(&self) -> Option<SensorStats> {
        if self.count == 0 {
            return None;
        }
        let std = match self.variance() {
            Some(var) => Dispersion::Value(var.sqrt()),
            None => Dispersion::Undefined,
        };
        Some(SensorStats {
            count: self.count,
            mean: self.mean,
            max: self.max,
            std,
        })
    }

    /// Accumulate values in canonical order so the result does not depend on
    /// the order they arrived in.
    pub fn from_unordered(values: &mut [f64]) -> Self {
        values.sort_by(f64::total_cmp);
        let mut acc = Self::new();
        for &v in values.iter() {
            acc.push(v);
        }
        acc
    }
}

/// Value of a cumulative counter at a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSample {
    pub timestamp_ms: i64,
    pub value: f64,
}

impl CounterSample {
    /// Time order, ties broken by value so the choice is deterministic
    fn order(&self, other: &Self) -> Ordering {
        self.timestamp_ms
            .cmp(&other.timestamp_ms)
            .then_with(|| self.value.total_cmp(&other.value))
    }
}

/// First and last sample of a cumulative counter within a window
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSpan {
    first: Option<CounterSample>,
    last: Option<CounterSample>,
}

impl CounterSpan {
    pub fn push(&mut self, timestamp_ms: i64, value: f64) {
        if !value.is_finite() {
            return;
        }
        let sample = CounterSample { timestamp_ms, value };
        match self.first {
            Some(first) if first.order(&sample) != Ordering::Greater => {}
            _ => self.first = Some(sample),
        }
        match self.last {
            Some(last) if last.order(&sample) != Ordering::Less => {}
            _ => self.last = Some(sample),
        }
    }

    /// Counter increase over the window. A decrease means the counter was
    /// reset and is reported as zero.
    pub fn increase(&self) -> Option<f64> {
        match (self.first, self.last) {
            (Some(first), Some(last)) => Some((last.value - first.value).max(0.0)),
            _ => None,
        }
    }
}
