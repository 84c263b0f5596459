//! Outlier detection primitives
//!
//! Provides the [`AnomalyDetector`] trait and a seeded Isolation Forest used
//! by the multivariate scorer. Detectors work on dense, fully imputed
//! matrices (one row per window, one column per feature).

mod isolation_forest;

pub use isolation_forest::{IsolationForest, IsolationTree};

use crate::error::Result;
use ndarray::{Array1, Array2};

/// Trait for unsupervised outlier detectors
pub trait AnomalyDetector: Send + Sync {
    /// Fit the detector on training data
    fn fit(&mut self, x: &Array2<f64>) -> Result<()>;

    /// Compute outlier scores for new data
    fn score_samples(&self, x: &Array2<f64>) -> Result<Array1<f64>>;

    /// Flag rows whose score reaches the fitted threshold
    fn predict(&self, x: &Array2<f64>) -> Result<Array1<bool>> {
        let threshold = self.threshold()?;
        Ok(self.score_samples(x)?.mapv(|s| s >= threshold))
    }

    /// Decision threshold learned during `fit`
    fn threshold(&self) -> Result<f64>;
}
