//! Caller-owned search configuration.
//!
//! A [`SearchConfig`] is built per invocation and passed into the controller;
//! nothing here is process-wide state.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::classification::Classification;
use crate::errors::{EsResult, SearchError};
use crate::model::ModelKind;
use crate::tensor::ClipRange;

/// Range of perturbation magnitudes the search may try.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpsilonBounds {
    pub epsilon_min: f64,
    pub epsilon_max: f64,
}

impl EpsilonBounds {
    pub fn new(epsilon_min: f64, epsilon_max: f64) -> Self {
        Self {
            epsilon_min,
            epsilon_max,
        }
    }

    pub fn width(&self) -> f64 {
        self.epsilon_max - self.epsilon_min
    }

    /// A zero-width range collapses the search to a single evaluation.
    pub fn is_degenerate(&self) -> bool {
        self.epsilon_min == self.epsilon_max
    }

    pub fn contains(&self, epsilon: f64) -> bool {
        epsilon >= self.epsilon_min && epsilon <= self.epsilon_max
    }
}

impl Default for EpsilonBounds {
    fn default() -> Self {
        Self::new(0.0001, 1.0)
    }
}

/// Step sizes for the two scan resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub coarse: f64,
    pub fine: f64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            coarse: 0.05,
            fine: 0.001,
        }
    }
}

/// What counts as a successful flip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessPolicy {
    /// Minimum confidence of the adversarial prediction. Low-confidence flips
    /// are treated as unreliable.
    pub min_confidence: f64,
    /// Range every perturbed tensor is clamped to before classification.
    pub clip: ClipRange,
}

impl SuccessPolicy {
    pub fn accepts(&self, original: &Classification, candidate: &Classification) -> bool {
        candidate.differs_from(original) && candidate.confidence >= self.min_confidence
    }
}

impl Default for SuccessPolicy {
    fn default() -> Self {
        Self {
            min_confidence: 0.001,
            clip: ClipRange::symmetric_unit(),
        }
    }
}

/// How the controller walks the epsilon range once the probe succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanStrategy {
    /// Coarse linear scan, then a fine linear scan below the coarse anchor.
    CoarseToFine,
    /// Bisection of `[epsilon_min, epsilon_max]`.
    Bisection { precision: f64, max_iterations: usize },
}

impl Default for ScanStrategy {
    fn default() -> Self {
        Self::CoarseToFine
    }
}

/// Full configuration of one epsilon search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub bounds: EpsilonBounds,
    pub steps: StepConfig,
    pub policy: SuccessPolicy,

    /// Magnitude retried once when the probe at `epsilon_max` fails.
    pub forced_fallback_epsilon: Option<f64>,

    /// If set, probe `best - precision` once after the scan converges.
    pub tighten_precision: Option<f64>,

    pub strategy: ScanStrategy,

    /// Fine-scan below `epsilon_max` when the probe succeeded but the coarse
    /// scan found no anchor.
    pub anchor_on_probe: bool,

    /// Number of coarse candidates evaluated concurrently (1 = sequential).
    pub coarse_batch: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            bounds: EpsilonBounds::default(),
            steps: StepConfig::default(),
            policy: SuccessPolicy::default(),
            forced_fallback_epsilon: Some(0.5),
            tighten_precision: None,
            strategy: ScanStrategy::CoarseToFine,
            anchor_on_probe: true,
            coarse_batch: 1,
        }
    }
}

impl SearchConfig {
    pub fn new(bounds: EpsilonBounds, steps: StepConfig) -> Self {
        Self {
            bounds,
            steps,
            ..Self::default()
        }
    }

    /// Defaults with the clip range of the given model's preprocessing.
    pub fn for_model(model: ModelKind) -> Self {
        let mut config = Self::default();
        config.policy.clip = model.profile().clip_range;
        config
    }

    pub fn with_bounds(mut self, epsilon_min: f64, epsilon_max: f64) -> Self {
        self.bounds = EpsilonBounds::new(epsilon_min, epsilon_max);
        self
    }

    pub fn with_steps(mut self, coarse: f64, fine: f64) -> Self {
        self.steps = StepConfig { coarse, fine };
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.policy.min_confidence = min_confidence;
        self
    }

    pub fn with_clip(mut self, clip: ClipRange) -> Self {
        self.policy.clip = clip;
        self
    }

    pub fn with_forced_fallback(mut self, epsilon: Option<f64>) -> Self {
        self.forced_fallback_epsilon = epsilon;
        self
    }

    pub fn with_tighten_precision(mut self, precision: Option<f64>) -> Self {
        self.tighten_precision = precision;
        self
    }

    pub fn with_strategy(mut self, strategy: ScanStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_anchor_on_probe(mut self, enabled: bool) -> Self {
        self.anchor_on_probe = enabled;
        self
    }

    pub fn with_coarse_batch(mut self, batch: usize) -> Self {
        self.coarse_batch = batch;
        self
    }

    /// Check every numeric constraint before a search starts.
    pub fn validate(&self) -> Result<(), SearchError> {
        let invalid = |message: String| Err(SearchError::InvalidConfig { message });
        let b = &self.bounds;

        if !b.epsilon_min.is_finite() || !b.epsilon_max.is_finite() {
            return invalid(format!(
                "epsilon bounds must be finite, got [{}, {}]",
                b.epsilon_min, b.epsilon_max
            ));
        }
        if b.epsilon_min < 0.0 {
            return invalid(format!("epsilon_min must be >= 0, got {}", b.epsilon_min));
        }
        if b.epsilon_max < b.epsilon_min {
            return invalid(format!(
                "epsilon_max {} is below epsilon_min {}",
                b.epsilon_max, b.epsilon_min
            ));
        }

        if !b.is_degenerate() {
            for (name, step) in [("coarse", self.steps.coarse), ("fine", self.steps.fine)] {
                if !step.is_finite() || step <= 0.0 {
                    return invalid(format!("{name} step must be > 0, got {step}"));
                }
                if step > b.width() {
                    return invalid(format!(
                        "{name} step {step} exceeds epsilon range width {}",
                        b.width()
                    ));
                }
            }
        }

        if !(0.0..=1.0).contains(&self.policy.min_confidence) {
            return invalid(format!(
                "min_confidence must be in [0, 1], got {}",
                self.policy.min_confidence
            ));
        }
        if !self.policy.clip.is_valid() {
            return invalid(format!(
                "clip range [{}, {}] is empty or non-finite",
                self.policy.clip.low, self.policy.clip.high
            ));
        }

        if let Some(forced) = self.forced_fallback_epsilon {
            if !forced.is_finite() || forced <= 0.0 {
                return invalid(format!("forced fallback epsilon must be > 0, got {forced}"));
            }
        }
        if let Some(precision) = self.tighten_precision {
            if !precision.is_finite() || precision <= 0.0 {
                return invalid(format!("tighten precision must be > 0, got {precision}"));
            }
        }
        if let ScanStrategy::Bisection {
            precision,
            max_iterations,
        } = self.strategy
        {
            if !precision.is_finite() || precision <= 0.0 {
                return invalid(format!("bisection precision must be > 0, got {precision}"));
            }
            if max_iterations == 0 {
                return invalid("bisection needs at least one iteration".to_string());
            }
        }
        if self.coarse_batch == 0 {
            return invalid("coarse_batch must be at least 1".to_string());
        }

        Ok(())
    }

    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> EsResult<Self> {
        let config: SearchConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EsResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}
