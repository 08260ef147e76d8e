//! Classifier predictions and gradient targets.

use serde::{Deserialize, Serialize};

use crate::errors::OracleError;

/// Top-1 prediction returned by a classifier oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Stable label identifier (e.g. an ImageNet synset id "n02510455").
    pub label: String,
    /// Human-readable class name (e.g. "giant_panda").
    pub display_name: String,
    /// Confidence of the top prediction in [0, 1].
    pub confidence: f64,
    /// Position of the label in the model's output vector.
    pub class_index: usize,
}

impl Classification {
    pub fn new(
        label: impl Into<String>,
        display_name: impl Into<String>,
        confidence: f64,
        class_index: usize,
    ) -> Self {
        Self {
            label: label.into(),
            display_name: display_name.into(),
            confidence,
            class_index,
        }
    }

    /// True when the predicted label is not the same as `other`'s.
    pub fn differs_from(&self, other: &Classification) -> bool {
        self.label != other.label
    }

    /// Check the oracle contract: confidence must be a probability.
    pub fn validate(&self) -> Result<(), OracleError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(OracleError::InvalidOutput {
                message: format!(
                    "confidence {} for label {} is outside [0, 1]",
                    self.confidence, self.label
                ),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:.2}%)", self.display_name, self.confidence * 100.0)
    }
}

/// Single-peaked label distribution the gradient oracle differentiates against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDistribution {
    probabilities: Vec<f32>,
}

impl TargetDistribution {
    /// One-hot vector of length `num_classes` with the peak at `index`.
    pub fn one_hot(index: usize, num_classes: usize) -> Result<Self, OracleError> {
        if index >= num_classes {
            return Err(OracleError::InvalidOutput {
                message: format!("class index {index} out of range for {num_classes} classes"),
            });
        }
        let mut probabilities = vec![0.0; num_classes];
        probabilities[index] = 1.0;
        Ok(Self { probabilities })
    }

    /// Untargeted FGSM target: the image's own top prediction.
    pub fn for_prediction(
        prediction: &Classification,
        num_classes: usize,
    ) -> Result<Self, OracleError> {
        Self::one_hot(prediction.class_index, num_classes)
    }

    pub fn num_classes(&self) -> usize {
        self.probabilities.len()
    }

    /// Index of the largest entry.
    pub fn peak(&self) -> usize {
        self.probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.probabilities
    }
}
