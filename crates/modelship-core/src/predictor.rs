//! Predictor abstraction and the built-in linear model format

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::{FeatureSchema, LoadError, ModelshipError, ModelshipResult};

/// A single model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prediction {
    Number(f64),
    Label(String),
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prediction::Number(n) => write!(f, "{}", n),
            Prediction::Label(l) => write!(f, "{}", l),
        }
    }
}

/// A loaded, read-only model artifact
///
/// Implementations must be immutable after load so the hot path needs no lock.
pub trait Predictor: Send + Sync {
    /// The ordered feature fields this predictor consumes
    fn schema(&self) -> &FeatureSchema;

    /// Run inference over a batch; output order and length match `rows`
    fn predict(&self, rows: &[Vec<f64>]) -> ModelshipResult<Vec<Prediction>>;
}

/// Turns raw artifact bytes into a predictor
pub trait PredictorLoader: Send + Sync {
    fn load(&self, bytes: &[u8]) -> Result<Arc<dyn Predictor>, LoadError>;
}

/// Output family of a [`LinearModel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinearKind {
    /// Binary classifier over the sigmoid of the score
    Logistic,
    /// Raw regression score
    Linear,
}

fn default_threshold() -> f64 {
    0.5
}

/// Standardize-then-linear model, serialized as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub kind: LinearKind,
    pub features: FeatureSchema,
    /// Per-feature mean subtracted before scoring
    #[serde(default)]
    pub mean: Option<Vec<f64>>,
    /// Per-feature scale divided out before scoring
    #[serde(default)]
    pub scale: Option<Vec<f64>>,
    pub weights: Vec<f64>,
    pub intercept: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Class labels `[negative, positive]` for logistic models
    #[serde(default)]
    pub labels: Option<[String; 2]>,
}

impl LinearModel {
    /// Check internal consistency of a decoded model
    pub fn check(&self) -> Result<(), LoadError> {
        let n = self.features.len();
        if self.weights.len() != n {
            return Err(LoadError::Corrupt(format!(
                "{} weights for {} features",
                self.weights.len(),
                n
            )));
        }
        if let Some(mean) = &self.mean {
            if mean.len() != n {
                return Err(LoadError::Corrupt(format!(
                    "{} means for {} features",
                    mean.len(),
                    n
                )));
            }
        }
        if let Some(scale) = &self.scale {
            if scale.len() != n {
                return Err(LoadError::Corrupt(format!(
                    "{} scales for {} features",
                    scale.len(),
                    n
                )));
            }
            if scale.iter().any(|s| *s == 0.0 || !s.is_finite()) {
                return Err(LoadError::Corrupt(
                    "scale entries must be finite and non-zero".to_string(),
                ));
            }
        }
        if !self.weights.iter().chain(std::iter::once(&self.intercept)).all(|w| w.is_finite()) {
            return Err(LoadError::Corrupt("weights must be finite".to_string()));
        }
        Ok(())
    }

    fn score(&self, row: &[f64]) -> f64 {
        let mut score = self.intercept;
        for (i, (x, w)) in row.iter().zip(&self.weights).enumerate() {
            let mut x = *x;
            if let Some(mean) = &self.mean {
                x -= mean[i];
            }
            if let Some(scale) = &self.scale {
                x /= scale[i];
            }
            score += x * w;
        }
        score
    }
}

impl Predictor for LinearModel {
    fn schema(&self) -> &FeatureSchema {
        &self.features
    }

    fn predict(&self, rows: &[Vec<f64>]) -> ModelshipResult<Vec<Prediction>> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                if row.len() != self.weights.len() {
                    return Err(ModelshipError::Inference(format!(
                        "row {} has {} values, model expects {}",
                        i,
                        row.len(),
                        self.weights.len()
                    )));
                }
                if row.iter().any(|x| !x.is_finite()) {
                    return Err(ModelshipError::Inference(format!(
                        "row {} contains a non-finite value",
                        i
                    )));
                }
                let score = self.score(row);
                if !score.is_finite() {
                    return Err(ModelshipError::Inference(format!(
                        "row {} produced a non-finite score",
                        i
                    )));
                }
                Ok(match self.kind {
                    LinearKind::Linear => Prediction::Number(score),
                    LinearKind::Logistic => {
                        let positive = sigmoid(score) >= self.threshold;
                        match &self.labels {
                            Some([neg, pos]) => {
                                Prediction::Label((if positive { pos } else { neg }).clone())
                            }
                            None => Prediction::Number(if positive { 1.0 } else { 0.0 }),
                        }
                    }
                })
            })
            .collect()
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Loader for JSON-encoded [`LinearModel`] artifacts
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearModelLoader;

impl PredictorLoader for LinearModelLoader {
    fn load(&self, bytes: &[u8]) -> Result<Arc<dyn Predictor>, LoadError> {
        let model: LinearModel =
            serde_json::from_slice(bytes).map_err(|e| LoadError::Corrupt(e.to_string()))?;
        model.check()?;
        Ok(Arc::new(model))
    }
}
