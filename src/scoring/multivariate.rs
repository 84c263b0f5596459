//! Multivariate outlier scoring over an Isolation Forest
//!
//! The forest is fitted once per run on the configured feature subset.
//! Missing values are imputed with the training-sample median of their
//! feature; a feature never observed in the training sample is left out of
//! the model entirely.

use super::{SignalOutput, SignalSource};
use crate::aggregation::{FeatureName, FeatureVector};
use crate::anomaly::{AnomalyDetector, IsolationForest};
use crate::config::IsolationForestConfig;
use crate::error::{Result, TelemetryError};
use crate::quality::QualityWarning;
use crate::scoring::robust::median;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Verdict for a single window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultivariateVerdict {
    /// Isolation score in (0, 1], higher is more anomalous
    pub score: f64,
    pub is_outlier: bool,
}

/// A fitted forest together with its column mapping and imputation values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultivariateModel {
    forest: IsolationForest,
    columns: Vec<(String, FeatureName)>,
    medians: Vec<f64>,
    excluded: Vec<String>,
    training_rows: usize,
}

impl MultivariateModel {
    /// Feature names the forest was trained on
    pub fn features(&self) -> Vec<String> {
        self.columns.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn training_rows(&self) -> usize {
        self.training_rows
    }

    fn row(&self, vector: &FeatureVector) -> Array1<f64> {
        self.columns
            .iter()
            .zip(&self.medians)
            .map(|((_, field), fill)| vector.get(*field).as_f64().unwrap_or(*fill))
            .collect()
    }

    pub fn score(&self, vector: &FeatureVector) -> Result<MultivariateVerdict> {
        let score = self.forest.score_row(self.row(vector).view())?;
        Ok(MultivariateVerdict {
            score,
            is_outlier: score >= self.forest.threshold()?,
        })
    }
}

/// Isolation Forest scorer; unavailable until fitted
#[derive(Debug, Clone)]
pub struct MultivariateScorer {
    features: Vec<(String, FeatureName)>,
    config: IsolationForestConfig,
    model: Option<MultivariateModel>,
    unavailable: String,
}

impl MultivariateScorer {
    pub fn new(features: Vec<(String, FeatureName)>, config: IsolationForestConfig) -> Self {
        Self {
            features,
            config,
            model: None,
            unavailable: "not fitted".to_string(),
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<&MultivariateModel> {
        self.model.as_ref()
    }

    /// Why no verdict can be produced, when unfitted
    pub fn unavailable_reason(&self) -> Option<&str> {
        if self.model.is_some() {
            None
        } else {
            Some(&self.unavailable)
        }
    }

    /// Fit on the windows of a run.
    ///
    /// The training sample is every window, or a seeded subsample when the
    /// run exceeds `max_training_rows`. Fitting with fewer than
    /// `min_training_rows` windows leaves the scorer unavailable.
    pub fn fit<'a, I>(&mut self, vectors: I) -> Result<&MultivariateModel>
    where
        I: IntoIterator<Item = &'a FeatureVector>,
    {
        self.model = None;
        match self.train(vectors.into_iter().collect()) {
            Ok(model) => {
                let model: &MultivariateModel = self.model.insert(model);
                Ok(model)
            }
            Err(err) => {
                self.unavailable = match &err {
                    TelemetryError::ModelUnavailable(reason) => reason.clone(),
                    other => other.to_string(),
                };
                Err(err)
            }
        }
    }

    fn train(&self, mut vectors: Vec<&FeatureVector>) -> Result<MultivariateModel> {
        let config = &self.config;
        if vectors.len() < config.min_training_rows {
            return Err(TelemetryError::ModelUnavailable(format!(
                "{} training windows, at least {} required",
                vectors.len(),
                config.min_training_rows
            )));
        }

        // Canonical order first so the subsample depends only on the data
        vectors.sort_by_key(|v| (v.locomotive_id, v.window_start_millis()));
        if vectors.len() > config.max_training_rows {
            let mut rng = StdRng::seed_from_u64(config.seed);
            let mut picked =
                rand::seq::index::sample(&mut rng, vectors.len(), config.max_training_rows).into_vec();
            picked.sort_unstable();
            vectors = picked.into_iter().map(|i| vectors[i]).collect();
            debug!(rows = vectors.len(), "Subsampled multivariate training set");
        }

        let mut columns = Vec::new();
        let mut medians = Vec::new();
        let mut excluded = Vec::new();
        for (name, field) in &self.features {
            let mut observed: Vec<f64> = vectors.iter().filter_map(|v| v.get(*field).as_f64()).collect();
            match median(&mut observed) {
                Some(m) => {
                    columns.push((name.clone(), *field));
                    medians.push(m);
                }
                None => excluded.push(name.clone()),
            }
        }
        if columns.is_empty() {
            return Err(TelemetryError::ModelUnavailable(
                "no anomaly feature observed in the training sample".to_string(),
            ));
        }

        let n_rows = vectors.len();
        let n_cols = columns.len();
        let mut data = Vec::with_capacity(n_rows * n_cols);
        for vector in &vectors {
            for ((_, field), fill) in columns.iter().zip(&medians) {
                data.push(vector.get(*field).as_f64().unwrap_or(*fill));
            }
        }
        let matrix = Array2::from_shape_vec((n_rows, n_cols), data)?;

        let mut forest = IsolationForest::new(config.seed)
            .with_n_estimators(config.n_estimators)
            .with_max_samples(config.max_samples)
            .with_contamination(config.contamination);
        forest.fit(&matrix)?;

        info!(
            rows = n_rows,
            features = n_cols,
            excluded = excluded.len(),
            threshold = forest.threshold()?,
            "Fitted isolation forest"
        );

        Ok(MultivariateModel {
            forest,
            columns,
            medians,
            excluded,
            training_rows: n_rows,
        })
    }

    pub fn score(&self, vector: &FeatureVector) -> Result<MultivariateVerdict> {
        match &self.model {
            Some(model) => model.score(vector),
            None => Err(TelemetryError::ModelUnavailable(self.unavailable.clone())),
        }
    }

    /// Score as a fusion signal, together with the continuous score.
    ///
    /// Failure only removes this signal; it is reported as a warning.
    pub fn signal(&self, vector: &FeatureVector) -> (SignalOutput, Option<f64>) {
        let mut out = SignalOutput::new(SignalSource::Multivariate);
        match self.score(vector) {
            Ok(verdict) => {
                if verdict.is_outlier {
                    out.flag(SignalSource::Multivariate.label_prefix());
                }
                (out, Some(verdict.score))
            }
            Err(err) => {
                let reason = match err {
                    TelemetryError::ModelUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                out.warn(QualityWarning::ModelUnavailable { reason });
                (out, None)
            }
        }
    }
}
