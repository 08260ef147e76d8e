//! FGSM perturbation direction provider.

use es_types::{DirectionTensor, ImageTensor, SearchError, TargetDistribution};
use tracing::{debug, info};

use crate::oracle::GradientOracle;

/// Wraps a gradient oracle and produces `sign(grad_x loss(x, target))`.
///
/// The direction is computed once per attack and never changes while the
/// controller scans epsilons along it. Every failure is a
/// [`SearchError::DirectionComputation`]: the search cannot proceed without it.
#[derive(Debug, Clone)]
pub struct DirectionProvider<G> {
    oracle: G,
    num_classes: Option<usize>,
}

impl<G: GradientOracle> DirectionProvider<G> {
    pub fn new(oracle: G) -> Self {
        Self {
            oracle,
            num_classes: None,
        }
    }

    /// Reject targets whose length differs from the model's class count
    /// before the oracle is queried.
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = Some(num_classes);
        self
    }

    pub fn oracle(&self) -> &G {
        &self.oracle
    }

    pub fn compute_direction(
        &self,
        image: &ImageTensor,
        target: &TargetDistribution,
    ) -> Result<DirectionTensor, SearchError> {
        debug!(
            classes = target.num_classes(),
            peak = target.peak(),
            "Requesting loss gradient"
        );

        if let Some(expected) = self.num_classes {
            if target.num_classes() != expected {
                return Err(SearchError::DirectionComputation {
                    message: format!(
                        "target has {} classes, model expects {expected}",
                        target.num_classes()
                    ),
                });
            }
        }

        let gradient = self
            .oracle
            .loss_gradient(image, target)
            .map_err(|e| SearchError::DirectionComputation {
                message: e.to_string(),
            })?;

        if gradient.shape() != image.shape() {
            return Err(SearchError::DirectionComputation {
                message: format!(
                    "gradient shape {:?} does not match image shape {:?}",
                    gradient.shape(),
                    image.shape()
                ),
            });
        }

        let direction =
            DirectionTensor::from_gradient(gradient).map_err(|e| SearchError::DirectionComputation {
                message: e.to_string(),
            })?;

        info!(
            support = direction.support(),
            "Computed FGSM direction"
        );
        Ok(direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use es_types::{OracleError, OracleResult};
    use ndarray::Array4;

    struct FixedGradient(Array4<f32>);

    impl GradientOracle for FixedGradient {
        fn loss_gradient(
            &self,
            _image: &ImageTensor,
            _target: &TargetDistribution,
        ) -> OracleResult<Array4<f32>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenGradient;

    impl GradientOracle for BrokenGradient {
        fn loss_gradient(
            &self,
            _image: &ImageTensor,
            _target: &TargetDistribution,
        ) -> OracleResult<Array4<f32>> {
            Err(OracleError::Unavailable {
                message: "autodiff backend offline".into(),
            })
        }
    }

    fn target() -> TargetDistribution {
        TargetDistribution::one_hot(1, 4).unwrap()
    }

    #[test]
    fn signs_the_gradient() {
        let mut gradient = Array4::zeros((1, 2, 2, 1));
        gradient[[0, 0, 0, 0]] = 0.7;
        gradient[[0, 1, 1, 0]] = -0.002;
        let provider = DirectionProvider::new(FixedGradient(gradient));

        let image = ImageTensor::filled(2, 2, 1, 0.0);
        let direction = provider.compute_direction(&image, &target()).unwrap();

        assert_eq!(direction.view()[[0, 0, 0, 0]], 1.0);
        assert_eq!(direction.view()[[0, 1, 1, 0]], -1.0);
        assert_eq!(direction.view()[[0, 0, 1, 0]], 0.0);
        assert_eq!(direction.shape(), image.shape());
    }

    #[test]
    fn oracle_failure_is_direction_error() {
        let provider = DirectionProvider::new(BrokenGradient);
        let image = ImageTensor::filled(2, 2, 1, 0.0);
        let err = provider.compute_direction(&image, &target()).unwrap_err();
        match err {
            SearchError::DirectionComputation { message } => {
                assert!(message.contains("autodiff backend offline"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn shape_mismatch_is_direction_error() {
        let provider = DirectionProvider::new(FixedGradient(Array4::zeros((1, 3, 3, 1))));
        let image = ImageTensor::filled(2, 2, 1, 0.0);
        assert!(matches!(
            provider.compute_direction(&image, &target()),
            Err(SearchError::DirectionComputation { .. })
        ));
    }

    #[test]
    fn target_cardinality_is_checked_before_the_oracle() {
        let provider = DirectionProvider::new(BrokenGradient).with_num_classes(1000);
        let image = ImageTensor::filled(2, 2, 1, 0.0);
        match provider.compute_direction(&image, &target()).unwrap_err() {
            SearchError::DirectionComputation { message } => {
                assert!(message.contains("4 classes"));
                assert!(message.contains("1000"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let provider = DirectionProvider::new(FixedGradient(Array4::ones((1, 2, 2, 1)))).with_num_classes(4);
        assert!(provider.compute_direction(&image, &target()).is_ok());
    }

    #[test]
    fn non_finite_gradient_is_direction_error() {
        let provider =
            DirectionProvider::new(FixedGradient(Array4::from_elem((1, 2, 2, 1), f32::NAN)));
        let image = ImageTensor::filled(2, 2, 1, 0.0);
        assert!(provider.compute_direction(&image, &target()).is_err());
    }
}
