//! Feature aggregation module
//!
//! Converts irregularly sampled readings into fixed-width windowed feature
//! vectors:
//! - Welford mean/max/std per configured sensor
//! - GPS availability and average position
//! - Fault counts, energy consumption and average speed
//! - Bounded out-of-order tolerance with late-reading accounting

mod accumulator;
mod aggregator;
mod vector;

pub use accumulator::{CounterSpan, Dispersion, SensorAccumulator, SensorStats};
pub use aggregator::{AggregatorStats, FeatureAggregator, WindowStream};
pub use vector::{FeatureLayout, FeatureName, FeatureValue, FeatureVector, Statistic};
