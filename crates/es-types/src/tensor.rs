//! Image and perturbation-direction tensors.
//!
//! Both tensors are rank-4 `(batch, height, width, channels)` arrays with a
//! batch size of exactly one. They are immutable once built: every operation
//! that changes pixel values returns a new tensor.

use ndarray::{Array4, ArrayD, Ix4};
use serde::{Deserialize, Serialize};

use crate::errors::TensorError;

/// Valid input range of a model after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipRange {
    pub low: f32,
    pub high: f32,
}

impl ClipRange {
    pub fn new(low: f32, high: f32) -> Self {
        Self { low, high }
    }

    /// `[-1, 1]`, the range used by MobileNetV2 and InceptionV3 preprocessing.
    pub fn symmetric_unit() -> Self {
        Self::new(-1.0, 1.0)
    }

    pub fn is_valid(&self) -> bool {
        self.low.is_finite() && self.high.is_finite() && self.low < self.high
    }

    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.low, self.high)
    }
}

impl Default for ClipRange {
    fn default() -> Self {
        Self::symmetric_unit()
    }
}

fn check_shape(array: &Array4<f32>) -> Result<(), TensorError> {
    let batch = array.shape()[0];
    if batch != 1 {
        return Err(TensorError::BadBatch { batch });
    }
    Ok(())
}

fn into_rank4(array: ArrayD<f32>) -> Result<Array4<f32>, TensorError> {
    let rank = array.ndim();
    array
        .into_dimensionality::<Ix4>()
        .map_err(|_| TensorError::BadRank { rank })
}

/// A normalized input image, owned by the caller and only read by the search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Array4<f32>", into = "Array4<f32>")]
pub struct ImageTensor(Array4<f32>);

impl ImageTensor {
    pub fn new(array: Array4<f32>) -> Result<Self, TensorError> {
        check_shape(&array)?;
        if let Some(index) = array.iter().position(|v| !v.is_finite()) {
            return Err(TensorError::NonFinite { index });
        }
        Ok(Self(array))
    }

    /// Build from a dynamically-shaped array, rejecting anything that is not rank 4.
    pub fn from_dyn(array: ArrayD<f32>) -> Result<Self, TensorError> {
        Self::new(into_rank4(array)?)
    }

    /// A `1 x height x width x channels` image filled with `value`.
    pub fn filled(height: usize, width: usize, channels: usize, value: f32) -> Self {
        Self(Array4::from_elem((1, height, width, channels), value))
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn view(&self) -> &Array4<f32> {
        &self.0
    }

    pub fn into_inner(self) -> Array4<f32> {
        self.0
    }

    /// Returns `clip(self + epsilon * direction)` as a new tensor.
    pub fn perturb(
        &self,
        direction: &DirectionTensor,
        epsilon: f64,
        clip: ClipRange,
    ) -> Result<ImageTensor, TensorError> {
        if self.shape() != direction.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape().to_vec(),
                actual: direction.shape().to_vec(),
            });
        }

        let eps = epsilon as f32;
        let mut out = self.0.clone();
        out.zip_mut_with(&direction.0, |x, &d| *x = clip.clamp(*x + eps * d));
        Ok(ImageTensor(out))
    }

    /// Largest absolute per-element difference to `other`.
    pub fn linf_distance(&self, other: &ImageTensor) -> Result<f32, TensorError> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape().to_vec(),
                actual: other.shape().to_vec(),
            });
        }
        Ok(self
            .0
            .iter()
            .zip(other.0.iter())
            .fold(0.0f32, |acc, (a, b)| acc.max((a - b).abs())))
    }
}

impl TryFrom<Array4<f32>> for ImageTensor {
    type Error = TensorError;

    fn try_from(array: Array4<f32>) -> Result<Self, Self::Error> {
        Self::new(array)
    }
}

impl From<ImageTensor> for Array4<f32> {
    fn from(tensor: ImageTensor) -> Self {
        tensor.0
    }
}

/// FGSM perturbation direction: the sign of the loss gradient, one entry per pixel
/// channel, each in {-1, 0, +1}.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Array4<f32>", into = "Array4<f32>")]
pub struct DirectionTensor(Array4<f32>);

impl DirectionTensor {
    /// Wrap an already sign-valued array.
    pub fn new(array: Array4<f32>) -> Result<Self, TensorError> {
        check_shape(&array)?;
        if let Some((index, &value)) = array
            .iter()
            .enumerate()
            .find(|(_, v)| **v != 0.0 && **v != 1.0 && **v != -1.0)
        {
            return Err(TensorError::NotSignValued { index, value });
        }
        Ok(Self(array))
    }

    /// Take the element-wise sign of a raw loss gradient.
    pub fn from_gradient(gradient: Array4<f32>) -> Result<Self, TensorError> {
        check_shape(&gradient)?;
        if let Some(index) = gradient.iter().position(|v| !v.is_finite()) {
            return Err(TensorError::NonFinite { index });
        }
        Ok(Self(gradient.mapv(|g| {
            if g > 0.0 {
                1.0
            } else if g < 0.0 {
                -1.0
            } else {
                0.0
            }
        })))
    }

    /// A direction with every entry set to the same sign.
    pub fn uniform(height: usize, width: usize, channels: usize, sign: f32) -> Result<Self, TensorError> {
        Self::new(Array4::from_elem((1, height, width, channels), sign))
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn view(&self) -> &Array4<f32> {
        &self.0
    }

    /// Number of entries that actually move a pixel.
    pub fn support(&self) -> usize {
        self.0.iter().filter(|v| **v != 0.0).count()
    }
}

impl TryFrom<Array4<f32>> for DirectionTensor {
    type Error = TensorError;

    fn try_from(array: Array4<f32>) -> Result<Self, Self::Error> {
        Self::new(array)
    }
}

impl From<DirectionTensor> for Array4<f32> {
    fn from(tensor: DirectionTensor) -> Self {
        tensor.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, IxDyn};

    #[test]
    fn rejects_batch_larger_than_one() {
        let err = ImageTensor::new(Array4::zeros((2, 4, 4, 3))).unwrap_err();
        assert_eq!(err, TensorError::BadBatch { batch: 2 });
    }

    #[test]
    fn rejects_wrong_rank() {
        let err = ImageTensor::from_dyn(ArrayD::zeros(IxDyn(&[4, 4, 3]))).unwrap_err();
        assert_eq!(err, TensorError::BadRank { rank: 3 });
    }

    #[test]
    fn rejects_non_finite_pixels() {
        let mut array = Array4::zeros((1, 2, 2, 1));
        array[[0, 1, 0, 0]] = f32::NAN;
        let err = ImageTensor::new(array).unwrap_err();
        assert_eq!(err, TensorError::NonFinite { index: 2 });
    }

    #[test]
    fn gradient_sign_keeps_zeros() {
        let gradient = arr1(&[0.3f32, -2.0, 0.0, 1e-9])
            .into_shape((1, 2, 2, 1))
            .unwrap();
        let direction = DirectionTensor::from_gradient(gradient).unwrap();
        let values: Vec<f32> = direction.view().iter().copied().collect();
        assert_eq!(values, vec![1.0, -1.0, 0.0, 1.0]);
        assert_eq!(direction.support(), 3);
    }

    #[test]
    fn direction_rejects_non_sign_values() {
        let err = DirectionTensor::new(Array4::from_elem((1, 1, 1, 1), 0.5)).unwrap_err();
        assert!(matches!(err, TensorError::NotSignValued { index: 0, .. }));
    }

    #[test]
    fn perturb_clamps_and_leaves_source_untouched() {
        let image = ImageTensor::filled(2, 2, 3, 0.9);
        let direction = DirectionTensor::uniform(2, 2, 3, 1.0).unwrap();

        let perturbed = image.perturb(&direction, 0.5, ClipRange::symmetric_unit()).unwrap();

        assert!(perturbed.view().iter().all(|v| *v == 1.0));
        assert!(image.view().iter().all(|v| *v == 0.9));
    }

    #[test]
    fn perturb_rejects_mismatched_direction() {
        let image = ImageTensor::filled(2, 2, 3, 0.0);
        let direction = DirectionTensor::uniform(3, 2, 3, 1.0).unwrap();
        let err = image.perturb(&direction, 0.1, ClipRange::default()).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn linf_distance_tracks_epsilon() {
        let image = ImageTensor::filled(4, 4, 3, 0.0);
        let direction = DirectionTensor::uniform(4, 4, 3, -1.0).unwrap();
        let perturbed = image.perturb(&direction, 0.125, ClipRange::default()).unwrap();
        assert_eq!(image.linf_distance(&perturbed).unwrap(), 0.125);
    }

    #[test]
    fn image_deserialization_validates_batch() {
        let bad = serde_json::to_string(&Array4::<f32>::zeros((2, 1, 1, 1))).unwrap();
        assert!(serde_json::from_str::<ImageTensor>(&bad).is_err());

        let good = serde_json::to_string(&ImageTensor::filled(1, 1, 1, 0.5)).unwrap();
        let back: ImageTensor = serde_json::from_str(&good).unwrap();
        assert_eq!(back.shape(), &[1, 1, 1, 1]);
    }
}
