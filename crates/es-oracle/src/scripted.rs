//! Scripted (simulated) oracle for tests and dry runs.
//!
//! Answers classification queries from a rule over the L-infinity distance
//! between the queried tensor and a reference image, so a caller can say
//! "the label flips once epsilon reaches 0.037" without loading a model.

use es_types::{
    Classification, ImageTensor, ModelKind, OracleError, OracleResult, TargetDistribution,
    TensorError,
};
use ndarray::Array4;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use crate::oracle::{Classifier, GradientOracle};

/// When the scripted classifier reports the adversarial label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlipRule {
    Never,
    AtLeast { epsilon: f64 },
    Within { low: f64, high: f64 },
    Exactly { epsilon: f64 },
}

impl FlipRule {
    fn flips(&self, distance: f64, tolerance: f64) -> bool {
        match *self {
            Self::Never => false,
            Self::AtLeast { epsilon } => distance >= epsilon - tolerance,
            Self::Within { low, high } => distance >= low - tolerance && distance <= high + tolerance,
            Self::Exactly { epsilon } => (distance - epsilon).abs() <= tolerance,
        }
    }
}

/// A label the scripted classifier can answer with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub label: String,
    pub display_name: String,
    pub class_index: usize,
}

impl LabelSpec {
    pub fn new(label: impl Into<String>, display_name: impl Into<String>, class_index: usize) -> Self {
        Self {
            label: label.into(),
            display_name: display_name.into(),
            class_index,
        }
    }

    fn with_confidence(&self, confidence: f64) -> Classification {
        Classification::new(
            self.label.clone(),
            self.display_name.clone(),
            confidence,
            self.class_index,
        )
    }
}

/// Configuration for the scripted oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedOracleConfig {
    pub rule: FlipRule,
    pub original: LabelSpec,
    pub adversarial: LabelSpec,
    pub original_confidence: f64,
    pub adversarial_confidence: f64,
    /// Flips below this distance come back with `unreliable_confidence`.
    pub unreliable_below: Option<f64>,
    pub unreliable_confidence: f64,
    /// Distances at which `classify` fails with an inference error.
    pub fail_at: Vec<f64>,
    /// Make every `classify` call fail, including the baseline.
    pub fail_classifier: bool,
    pub fail_gradient: bool,
    /// Distance slack absorbing f32 rounding of perturbed pixels.
    pub tolerance: f64,
    pub num_classes: usize,
    pub seed: u64,
    pub model: Option<ModelKind>,
}

impl Default for ScriptedOracleConfig {
    fn default() -> Self {
        Self {
            rule: FlipRule::Never,
            original: LabelSpec::new("n02510455", "giant_panda", 388),
            adversarial: LabelSpec::new("n02509815", "lesser_panda", 387),
            original_confidence: 0.93,
            adversarial_confidence: 0.62,
            unreliable_below: None,
            unreliable_confidence: 0.0001,
            fail_at: Vec::new(),
            fail_classifier: false,
            fail_gradient: false,
            tolerance: 1e-6,
            num_classes: 1000,
            seed: 42,
            model: None,
        }
    }
}

impl ScriptedOracleConfig {
    pub fn with_rule(mut self, rule: FlipRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_adversarial_confidence(mut self, confidence: f64) -> Self {
        self.adversarial_confidence = confidence;
        self
    }

    pub fn with_unreliable_below(mut self, distance: f64, confidence: f64) -> Self {
        self.unreliable_below = Some(distance);
        self.unreliable_confidence = confidence;
        self
    }

    pub fn with_failure_at(mut self, distance: f64) -> Self {
        self.fail_at.push(distance);
        self
    }
}

/// Deterministic in-process classifier and gradient oracle.
#[derive(Debug)]
pub struct ScriptedOracle {
    config: ScriptedOracleConfig,
    reference: ImageTensor,
    classify_calls: AtomicUsize,
    gradient_calls: AtomicUsize,
    distances: Mutex<Vec<f64>>,
}

impl ScriptedOracle {
    pub fn new(config: ScriptedOracleConfig, reference: ImageTensor) -> Self {
        Self {
            config,
            reference,
            classify_calls: AtomicUsize::new(0),
            gradient_calls: AtomicUsize::new(0),
            distances: Mutex::new(Vec::new()),
        }
    }

    /// Seeded reference image with pixels in `[-amplitude, amplitude]`.
    pub fn random_image(
        height: usize,
        width: usize,
        channels: usize,
        amplitude: f32,
        seed: u64,
    ) -> Result<ImageTensor, TensorError> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let array = Array4::from_shape_simple_fn((1, height, width, channels), || {
            rng.gen_range(-amplitude..=amplitude)
        });
        ImageTensor::new(array)
    }

    pub fn config(&self) -> &ScriptedOracleConfig {
        &self.config
    }

    pub fn reference(&self) -> &ImageTensor {
        &self.reference
    }

    /// Number of `classify` calls so far, failed ones included.
    pub fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    pub fn gradient_calls(&self) -> usize {
        self.gradient_calls.load(Ordering::SeqCst)
    }

    /// Distances of every classified tensor from the reference, in call order.
    pub fn queried_distances(&self) -> Vec<f64> {
        self.distances.lock().clone()
    }

    fn confidence_for_flip(&self, distance: f64) -> f64 {
        match self.config.unreliable_below {
            Some(limit) if distance < limit - self.config.tolerance => {
                self.config.unreliable_confidence
            }
            _ => self.config.adversarial_confidence,
        }
    }
}

impl Classifier for ScriptedOracle {
    fn classify(&self, image: &ImageTensor) -> OracleResult<Classification> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);

        let distance = self
            .reference
            .linf_distance(image)
            .map_err(|_| OracleError::ShapeMismatch {
                expected: self.reference.shape().to_vec(),
                actual: image.shape().to_vec(),
            })? as f64;
        self.distances.lock().push(distance);

        let tolerance = self.config.tolerance;
        if self.config.fail_classifier
            || self
                .config
                .fail_at
                .iter()
                .any(|d| (distance - d).abs() <= tolerance)
        {
            return Err(OracleError::Inference {
                message: format!("scripted failure at distance {distance:.6}"),
            });
        }

        let result = if self.config.rule.flips(distance, tolerance) {
            self.config
                .adversarial
                .with_confidence(self.confidence_for_flip(distance))
        } else {
            self.config
                .original
                .with_confidence(self.config.original_confidence)
        };
        debug!(distance, label = %result.label, "Scripted classification");
        Ok(result)
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn model(&self) -> Option<ModelKind> {
        self.config.model
    }
}

impl GradientOracle for ScriptedOracle {
    fn loss_gradient(
        &self,
        image: &ImageTensor,
        target: &TargetDistribution,
    ) -> OracleResult<Array4<f32>> {
        self.gradient_calls.fetch_add(1, Ordering::SeqCst);

        if self.config.fail_gradient {
            return Err(OracleError::Unavailable {
                message: "scripted gradient failure".to_string(),
            });
        }
        if target.num_classes() != self.config.num_classes {
            return Err(OracleError::InvalidOutput {
                message: format!(
                    "target has {} classes, model has {}",
                    target.num_classes(),
                    self.config.num_classes
                ),
            });
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let dim = image.view().dim();
        Ok(Array4::from_shape_simple_fn(dim, || rng.gen_range(-1.0f32..=1.0)))
    }
}
