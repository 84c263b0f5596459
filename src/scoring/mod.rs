//! Anomaly scoring module
//!
//! Three independent scorers inspect each [`FeatureVector`](crate::aggregation::FeatureVector):
//! - [`RuleScorer`]: fixed engineering thresholds, including rate-of-change checks
//! - [`RobustScorer`]: per-feature robust z-scores (median / MAD)
//! - [`MultivariateScorer`]: Isolation Forest over a configured feature subset
//!
//! Each produces a [`SignalOutput`]; fusion combines them into the final verdict.

mod multivariate;
mod robust;
mod rules;

pub use multivariate::{MultivariateModel, MultivariateScorer, MultivariateVerdict};
pub use robust::{median, median_absolute_deviation, ReferenceSet, ReferenceStats, RobustScorer};
pub use rules::{RuleCheck, RuleScorer};

use crate::quality::QualityWarning;
use serde::{Deserialize, Serialize};

/// Scorer family, in fusion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignalSource {
    Rules,
    Robust,
    Multivariate,
}

impl SignalSource {
    pub fn label_prefix(self) -> &'static str {
        match self {
            SignalSource::Rules => "rule",
            SignalSource::Robust => "mad",
            SignalSource::Multivariate => "iforest",
        }
    }
}

/// What one scorer concluded about one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalOutput {
    pub source: SignalSource,
    /// Anomaly labels, in the scorer's evaluation order
    pub labels: Vec<String>,
    /// Checks that could not be evaluated
    pub warnings: Vec<QualityWarning>,
}

impl SignalOutput {
    pub fn new(source: SignalSource) -> Self {
        Self {
            source,
            labels: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Append a label; a label already present is not repeated
    pub fn flag(&mut self, label: impl Into<String>) {
        let label = label.into();
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
    }

    pub fn warn(&mut self, warning: QualityWarning) {
        self.warnings.push(warning);
    }
}
