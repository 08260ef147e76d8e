//! Probe runner behind the `es-probe` binary.
//!
//! A probe builds a seeded reference image and a [`ScriptedOracle`] from a JSON
//! document, then runs either the full epsilon search or one fixed-epsilon
//! attack against it.

use es_oracle::{DirectionProvider, FlipRule, ScriptedOracle, ScriptedOracleConfig};
use es_search::{auto_tune, single_shot, CancelToken, EpsilonSearch, SearchBudget};
use es_types::{
    config_error, validation_error, Classification, EsResult, ModelKind, SearchConfig, SearchSummary,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Seeded reference image the scripted oracle measures distances from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSpec {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub amplitude: f32,
    pub seed: u64,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            height: 32,
            width: 32,
            channels: 3,
            amplitude: 0.5,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeMode {
    AutoTune,
    SingleShot { epsilon: f64 },
}

impl Default for ProbeMode {
    fn default() -> Self {
        Self::AutoTune
    }
}

/// Everything one `es-probe` run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub mode: ProbeMode,
    /// When set, the search clips to this model's input range.
    pub model: Option<ModelKind>,
    pub search: SearchConfig,
    pub oracle: ScriptedOracleConfig,
    pub image: ImageSpec,
    pub max_evaluations: Option<usize>,
    pub deadline_ms: Option<u64>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            mode: ProbeMode::AutoTune,
            model: None,
            search: SearchConfig::default(),
            oracle: ScriptedOracleConfig::default().with_rule(FlipRule::AtLeast { epsilon: 0.037 }),
            image: ImageSpec::default(),
            max_evaluations: None,
            deadline_ms: None,
        }
    }
}

impl ProbeConfig {
    pub fn from_json_str(json: &str) -> EsResult<Self> {
        let config: ProbeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EsResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read probe config {}: {e}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> EsResult<()> {
        let image = &self.image;
        if image.height == 0 || image.width == 0 || image.channels == 0 {
            return Err(validation_error!(
                "image dimensions must be positive, got {}x{}x{}",
                image.height,
                image.width,
                image.channels
            ));
        }
        let clip = self.effective_search().policy.clip;
        if !(image.amplitude >= 0.0 && -image.amplitude >= clip.low && image.amplitude <= clip.high) {
            return Err(validation_error!(
                "image amplitude {} does not fit clip range [{}, {}]",
                image.amplitude,
                clip.low,
                clip.high
            ));
        }
        if let ProbeMode::SingleShot { epsilon } = self.mode {
            if !(epsilon.is_finite() && epsilon >= 0.0) {
                return Err(validation_error!("single-shot epsilon must be >= 0, got {epsilon}"));
            }
        }
        self.effective_search().validate()?;
        Ok(())
    }

    /// Search configuration with the model's clip range applied.
    pub fn effective_search(&self) -> SearchConfig {
        match self.model {
            Some(model) => self.search.clone().with_clip(model.profile().clip_range),
            None => self.search.clone(),
        }
    }

    fn budget(&self, cancel: CancelToken) -> SearchBudget {
        let mut budget = SearchBudget::unlimited().with_cancel(cancel);
        if let Some(max) = self.max_evaluations {
            budget = budget.with_max_evaluations(max);
        }
        if let Some(ms) = self.deadline_ms {
            budget = budget.with_deadline(Duration::from_millis(ms));
        }
        budget
    }
}

/// What `es-probe` prints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProbeReport {
    AutoTune(SearchSummary),
    SingleShot {
        epsilon: f64,
        success: bool,
        original: Classification,
        adversarial: Classification,
    },
}

/// Run one probe to completion. Blocking; `cancel` stops a running search
/// between candidates.
pub fn run_probe(config: &ProbeConfig, cancel: CancelToken) -> EsResult<ProbeReport> {
    config.validate()?;

    let dims = &config.image;
    let image = ScriptedOracle::random_image(dims.height, dims.width, dims.channels, dims.amplitude, dims.seed)?;
    let mut oracle_config = config.oracle.clone();
    if config.model.is_some() {
        oracle_config.model = config.model;
    }
    let num_classes = oracle_config.num_classes;
    let oracle = ScriptedOracle::new(oracle_config, image.clone());
    let provider = DirectionProvider::new(&oracle).with_num_classes(num_classes);
    let search_config = config.effective_search();

    info!(
        mode = ?config.mode,
        model = ?config.model,
        "Running probe on a {}x{}x{} image",
        dims.height,
        dims.width,
        dims.channels
    );

    let report = match config.mode {
        ProbeMode::AutoTune => {
            let search = EpsilonSearch::new(&oracle, search_config)?.with_budget(config.budget(cancel));
            let outcome = auto_tune(&search, &provider, &image)?;
            ProbeReport::AutoTune(outcome.summary())
        }
        ProbeMode::SingleShot { epsilon } => {
            let report = single_shot(&oracle, &provider, &image, epsilon, search_config.policy)?;
            ProbeReport::SingleShot {
                epsilon: report.epsilon,
                success: report.success,
                original: report.original,
                adversarial: report.adversarial,
            }
        }
    };
    info!(classifications = oracle.classify_calls(), "Probe finished");
    Ok(report)
}
