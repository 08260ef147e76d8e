//! Supported pretrained model families.
//!
//! The model is picked once, when a search is configured, instead of being
//! looked up by name on every call.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::tensor::ClipRange;

/// Closed set of ImageNet classifiers an oracle can wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "mobilenet_v2")]
    MobileNetV2,
    #[serde(rename = "inception_v3")]
    InceptionV3,
    #[serde(rename = "vgg19")]
    Vgg19,
    #[serde(rename = "densenet121")]
    DenseNet121,
}

impl Default for ModelKind {
    fn default() -> Self {
        Self::MobileNetV2
    }
}

/// Input geometry and normalized value range for a model family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub input_size: (usize, usize),
    pub channels: usize,
    pub num_classes: usize,
    pub clip_range: ClipRange,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::MobileNetV2,
        ModelKind::InceptionV3,
        ModelKind::Vgg19,
        ModelKind::DenseNet121,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::MobileNetV2 => "mobilenet_v2",
            Self::InceptionV3 => "inception_v3",
            Self::Vgg19 => "vgg19",
            Self::DenseNet121 => "densenet121",
        }
    }

    pub fn profile(&self) -> ModelProfile {
        match self {
            // "tf" mode: x / 127.5 - 1
            Self::MobileNetV2 => ModelProfile {
                input_size: (224, 224),
                channels: 3,
                num_classes: 1000,
                clip_range: ClipRange::symmetric_unit(),
            },
            Self::InceptionV3 => ModelProfile {
                input_size: (299, 299),
                channels: 3,
                num_classes: 1000,
                clip_range: ClipRange::symmetric_unit(),
            },
            // "caffe" mode: BGR with ImageNet channel means subtracted
            Self::Vgg19 => ModelProfile {
                input_size: (224, 224),
                channels: 3,
                num_classes: 1000,
                clip_range: ClipRange::new(-123.68, 151.061),
            },
            // "torch" mode: per-channel standardization
            Self::DenseNet121 => ModelProfile {
                input_size: (224, 224),
                channels: 3,
                num_classes: 1000,
                clip_range: ClipRange::new(-2.1179, 2.64),
            },
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| format!("Unsupported model: {s}"))
    }
}
