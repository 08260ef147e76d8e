//! Oracle contracts consumed by the search.

use es_types::{Classification, ImageTensor, ModelKind, OracleResult, TargetDistribution};
use ndarray::Array4;
use std::sync::Arc;

/// Top-1 image classifier.
///
/// `classify` must be a pure function of its input for a fixed model: the
/// search assumes that asking twice about the same tensor gives the same answer.
pub trait Classifier: Send + Sync {
    fn classify(&self, image: &ImageTensor) -> OracleResult<Classification>;

    /// Cardinality of the model's output distribution.
    fn num_classes(&self) -> usize;

    /// Model family behind this oracle, when known.
    fn model(&self) -> Option<ModelKind> {
        None
    }
}

/// Gradient of a classification loss with respect to the input tensor.
pub trait GradientOracle: Send + Sync {
    /// Raw (unsigned) gradient of e.g. categorical cross-entropy between the
    /// model's prediction on `image` and `target`. Same shape as `image`.
    fn loss_gradient(
        &self,
        image: &ImageTensor,
        target: &TargetDistribution,
    ) -> OracleResult<Array4<f32>>;
}

impl<T: Classifier + ?Sized> Classifier for &T {
    fn classify(&self, image: &ImageTensor) -> OracleResult<Classification> {
        (**self).classify(image)
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn model(&self) -> Option<ModelKind> {
        (**self).model()
    }
}

impl<T: Classifier + ?Sized> Classifier for Box<T> {
    fn classify(&self, image: &ImageTensor) -> OracleResult<Classification> {
        (**self).classify(image)
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn model(&self) -> Option<ModelKind> {
        (**self).model()
    }
}

impl<T: Classifier + ?Sized> Classifier for Arc<T> {
    fn classify(&self, image: &ImageTensor) -> OracleResult<Classification> {
        (**self).classify(image)
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn model(&self) -> Option<ModelKind> {
        (**self).model()
    }
}

impl<T: GradientOracle + ?Sized> GradientOracle for &T {
    fn loss_gradient(
        &self,
        image: &ImageTensor,
        target: &TargetDistribution,
    ) -> OracleResult<Array4<f32>> {
        (**self).loss_gradient(image, target)
    }
}

impl<T: GradientOracle + ?Sized> GradientOracle for Box<T> {
    fn loss_gradient(
        &self,
        image: &ImageTensor,
        target: &TargetDistribution,
    ) -> OracleResult<Array4<f32>> {
        (**self).loss_gradient(image, target)
    }
}

impl<T: GradientOracle + ?Sized> GradientOracle for Arc<T> {
    fn loss_gradient(
        &self,
        image: &ImageTensor,
        target: &TargetDistribution,
    ) -> OracleResult<Array4<f32>> {
        (**self).loss_gradient(image, target)
    }
}
