//! Isolation Forest outlier detection

use crate::anomaly::AnomalyDetector;
use crate::error::{Result, TelemetryError};
use ndarray::{Array1, Array2, ArrayView1};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// Isolation Tree node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IsolationTree {
    Internal {
        feature: usize,
        threshold: f64,
        /// Values < threshold
        left: Box<IsolationTree>,
        /// Values >= threshold
        right: Box<IsolationTree>,
    },
    External {
        size: usize,
    },
}

impl IsolationTree {
    /// Build an isolation tree over the rows named by `indices`
    pub fn build(
        x: &Array2<f64>,
        indices: &[usize],
        height: usize,
        max_height: usize,
        rng: &mut impl Rng,
    ) -> Self {
        let n_samples = indices.len();

        if height >= max_height || n_samples <= 1 {
            return IsolationTree::External { size: n_samples };
        }

        let feature = rng.gen_range(0..x.ncols());

        let (min_val, max_val) = indices.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(lo, hi), &i| {
                let v = x[[i, feature]];
                (lo.min(v), hi.max(v))
            },
        );

        if !(max_val - min_val > 1e-10) {
            return IsolationTree::External { size: n_samples };
        }

        let threshold = rng.gen_range(min_val..max_val);

        let (left_indices, right_indices): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .partition(|&&i| x[[i, feature]] < threshold);

        if left_indices.is_empty() || right_indices.is_empty() {
            return IsolationTree::External { size: n_samples };
        }

        let left = Box::new(Self::build(x, &left_indices, height + 1, max_height, rng));
        let right = Box::new(Self::build(x, &right_indices, height + 1, max_height, rng));

        IsolationTree::Internal {
            feature,
            threshold,
            left,
            right,
        }
    }

    /// Path length of a sample, with the c(size) correction at leaves
    pub fn path_length(&self, sample: ArrayView1<f64>, current_height: usize) -> f64 {
        match self {
            IsolationTree::External { size } => current_height as f64 + Self::c(*size),
            IsolationTree::Internal {
                feature,
                threshold,
                left,
                right,
            } => {
                if sample[*feature] < *threshold {
                    left.path_length(sample, current_height + 1)
                } else {
                    right.path_length(sample, current_height + 1)
                }
            }
        }
    }

    /// Average path length of an unsuccessful BST search:
    /// c(n) = 2 H(n-1) - 2(n-1)/n
    fn c(n: usize) -> f64 {
        if n <= 1 {
            0.0
        } else if n == 2 {
            1.0
        } else {
            let n_f = n as f64;
            2.0 * ((n_f - 1.0).ln() + 0.5772156649) - 2.0 * (n_f - 1.0) / n_f
        }
    }
}

/// Seeded Isolation Forest.
///
/// Two forests built with the same parameters, seed and training matrix are
/// identical and score identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    n_estimators: usize,
    max_samples: usize,
    /// Expected proportion of outliers in the training data
    contamination: f64,
    seed: u64,
    trees: Option<Vec<IsolationTree>>,
    threshold: Option<f64>,
    /// Rows drawn per tree during fit
    samples_per_tree: Option<usize>,
    n_features: Option<usize>,
}

impl IsolationForest {
    pub fn new(seed: u64) -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            contamination: 0.01,
            seed,
            trees: None,
            threshold: None,
            samples_per_tree: None,
            n_features: None,
        }
    }

    pub fn with_n_estimators(mut self, n: usize) -> Self {
        self.n_estimators = n.max(1);
        self
    }

    pub fn with_max_samples(mut self, n: usize) -> Self {
        self.max_samples = n.max(2);
        self
    }

    pub fn with_contamination(mut self, c: f64) -> Self {
        self.contamination = c.clamp(f64::EPSILON, 0.5);
        self
    }

    pub fn is_fitted(&self) -> bool {
        self.trees.is_some()
    }

    pub fn n_features(&self) -> Option<usize> {
        self.n_features
    }

    /// Score a single row
    pub fn score_row(&self, row: ArrayView1<f64>) -> Result<f64> {
        let trees = self.fitted_trees()?;
        self.check_width(row.len())?;
        Ok(self.row_score(trees, row))
    }

    fn fitted_trees(&self) -> Result<&[IsolationTree]> {
        self.trees
            .as_deref()
            .ok_or_else(|| TelemetryError::ModelUnavailable("isolation forest not fitted".to_string()))
    }

    fn check_width(&self, width: usize) -> Result<()> {
        match self.n_features {
            Some(expected) if expected != width => Err(TelemetryError::ShapeError {
                expected: format!("{} features", expected),
                actual: format!("{} features", width),
            }),
            _ => Ok(()),
        }
    }

    /// s(x, n) = 2^(-E[h(x)] / c(n)), in (0, 1], higher is more anomalous
    fn row_score(&self, trees: &[IsolationTree], row: ArrayView1<f64>) -> f64 {
        let c_n = IsolationTree::c(self.samples_per_tree.unwrap_or(self.max_samples));
        let avg_path_length = trees
            .iter()
            .map(|tree| tree.path_length(row, 0))
            .sum::<f64>()
            / trees.len() as f64;

        if c_n > 0.0 {
            2.0_f64.powf(-avg_path_length / c_n)
        } else {
            0.5
        }
    }
}

impl AnomalyDetector for IsolationForest {
    fn fit(&mut self, x: &Array2<f64>) -> Result<()> {
        let n_samples = x.nrows();
        if n_samples < 2 || x.ncols() == 0 {
            return Err(TelemetryError::DataError(format!(
                "isolation forest needs at least 2 rows and 1 column, got {}x{}",
                n_samples,
                x.ncols()
            )));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(TelemetryError::DataError(
                "isolation forest training matrix contains non-finite values".to_string(),
            ));
        }

        let samples_per_tree = self.max_samples.min(n_samples);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let max_height = (samples_per_tree as f64).log2().ceil() as usize;

        let mut trees = Vec::with_capacity(self.n_estimators);
        for _ in 0..self.n_estimators {
            let indices = rand::seq::index::sample(&mut rng, n_samples, samples_per_tree).into_vec();
            trees.push(IsolationTree::build(x, &indices, 0, max_height, &mut rng));
        }

        self.trees = Some(trees);
        self.samples_per_tree = Some(samples_per_tree);
        self.n_features = Some(x.ncols());

        // Threshold at the ceil(contamination * n)-th highest training score
        let mut sorted_scores = self.score_samples(x)?.to_vec();
        sorted_scores.sort_by(|a, b| b.total_cmp(a));
        let k = ((self.contamination * n_samples as f64).ceil() as usize).clamp(1, n_samples);
        self.threshold = Some(sorted_scores[k - 1]);

        Ok(())
    }

    fn score_samples(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let trees = self.fitted_trees()?;
        self.check_width(x.ncols())?;
        Ok(x.rows()
            .into_iter()
            .map(|row| self.row_score(trees, row))
            .collect())
    }

    fn threshold(&self) -> Result<f64> {
        self.threshold
            .ok_or_else(|| TelemetryError::ModelUnavailable("isolation forest not fitted".to_string()))
    }
}
