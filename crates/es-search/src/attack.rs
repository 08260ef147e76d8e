//! End-to-end attack entry points: baseline, direction, then either one fixed
//! epsilon or a full minimal-epsilon search.

use es_oracle::{Classifier, DirectionProvider, GradientOracle};
use es_types::{
    Classification, DirectionTensor, ImageTensor, SearchError, SearchOutcome, SuccessPolicy,
    TargetDistribution,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::controller::EpsilonSearch;

/// Result of a single fixed-epsilon attack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackReport {
    pub epsilon: f64,
    pub success: bool,
    pub original: Classification,
    pub adversarial: Classification,
    pub original_image: ImageTensor,
    pub direction: DirectionTensor,
    pub adversarial_image: ImageTensor,
}

fn baseline<C: Classifier>(classifier: &C, image: &ImageTensor) -> Result<Classification, SearchError> {
    classifier
        .classify(image)
        .and_then(|c| c.validate().map(|_| c))
        .map_err(|e| SearchError::BaselineClassification {
            message: e.to_string(),
        })
}

fn direction_for<C: Classifier, G: GradientOracle>(
    classifier: &C,
    provider: &DirectionProvider<G>,
    image: &ImageTensor,
    original: &Classification,
) -> Result<DirectionTensor, SearchError> {
    let target = TargetDistribution::for_prediction(original, classifier.num_classes()).map_err(
        |e| SearchError::DirectionComputation {
            message: e.to_string(),
        },
    )?;
    provider.compute_direction(image, &target)
}

/// Classify `image`, derive the FGSM direction from its own prediction and run
/// the minimal-epsilon search along it.
///
/// Baseline and direction failures are fatal; nothing is searched.
pub fn auto_tune<C: Classifier, G: GradientOracle>(
    search: &EpsilonSearch<C>,
    provider: &DirectionProvider<G>,
    image: &ImageTensor,
) -> Result<SearchOutcome, SearchError> {
    let original = baseline(search.classifier(), image)?;
    let direction = direction_for(search.classifier(), provider, image, &original)?;
    search.search_from_baseline(image, &direction, original)
}

/// Perturb `image` once at `epsilon` and report whether the label flipped.
pub fn single_shot<C: Classifier, G: GradientOracle>(
    classifier: &C,
    provider: &DirectionProvider<G>,
    image: &ImageTensor,
    epsilon: f64,
    policy: SuccessPolicy,
) -> Result<AttackReport, SearchError> {
    let original = baseline(classifier, image)?;
    let direction = direction_for(classifier, provider, image, &original)?;

    let adversarial_image = image.perturb(&direction, epsilon, policy.clip)?;
    let adversarial = classifier
        .classify(&adversarial_image)
        .and_then(|c| c.validate().map(|_| c))
        .map_err(|e| SearchError::CandidateEvaluation {
            epsilon,
            message: e.to_string(),
        })?;
    let success = policy.accepts(&original, &adversarial);
    info!(
        epsilon,
        success,
        "Single-shot attack: {} -> {}",
        original,
        adversarial
    );

    Ok(AttackReport {
        epsilon,
        success,
        original,
        adversarial,
        original_image: image.clone(),
        direction,
        adversarial_image,
    })
}
