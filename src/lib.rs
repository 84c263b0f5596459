//! Locomotive telemetry - windowed feature aggregation and hybrid anomaly detection
//!
//! This crate turns raw per-second locomotive sensor readings into per-minute
//! feature vectors and flags anomalous windows by combining:
//! - Fixed engineering thresholds (temperature, current, battery, pressure, speed)
//! - Robust statistics (median / MAD z-scores)
//! - A multivariate Isolation Forest
//!
//! # Modules
//!
//! ## Data model
//! - [`schema`] - Sensor schema registry and run-time column resolution
//! - [`ingest`] - Chunked input and row decoding
//! - [`aggregation`] - Windowed feature aggregation
//!
//! ## Detection
//! - [`scoring`] - Rule-based, robust and multivariate scorers
//! - [`anomaly`] - Isolation Forest
//! - [`fusion`] - Combination of scorer outputs into anomaly records
//!
//! ## Output and orchestration
//! - [`sink`] - Columnar output and map helpers
//! - [`pipeline`] - Batch orchestration and run report
//! - [`quality`] - Data-quality accounting

// Core
pub mod config;
pub mod error;

// Data model
pub mod aggregation;
pub mod ingest;
pub mod schema;

// Detection
pub mod anomaly;
pub mod fusion;
pub mod scoring;

// Output and orchestration
pub mod pipeline;
pub mod quality;
pub mod sink;

pub use error::{Result, TelemetryError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Result, TelemetryError};

    // Configuration
    pub use crate::config::{
        AggregationConfig, IsolationForestConfig, MadConfig, PipelineConfig, ReferenceScope,
        ReferenceWindow, RuleTargets, SensorBinding, ThresholdTable,
    };

    // Schema and input
    pub use crate::ingest::{ChunkSource, FrameSource, ParquetChunkSource, RawReading};
    pub use crate::schema::{ResolvedSchema, SchemaRegistry, SensorKind, StorageType};

    // Aggregation
    pub use crate::aggregation::{
        Dispersion, FeatureAggregator, FeatureLayout, FeatureValue, FeatureVector,
    };

    // Scoring
    pub use crate::anomaly::{AnomalyDetector, IsolationForest};
    pub use crate::fusion::{fuse, AnomalyRecord};
    pub use crate::scoring::{
        MultivariateScorer, ReferenceSet, RobustScorer, RuleScorer, SignalOutput, SignalSource,
    };

    // Output
    pub use crate::pipeline::{Pipeline, PipelineReport};
    pub use crate::quality::{DataQualityReport, QualityWarning};
    pub use crate::sink::{latest_positions, AnomalySink, MemorySink, ParquetSink};
}
