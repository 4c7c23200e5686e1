use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum detection score for a detection to be reported.
///
/// Deserialization rejects values outside `[0, 1]` (and NaN), so a request
/// carrying an invalid threshold never reaches a handler body.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Deserialize)]
#[serde(try_from = "f32")]
pub struct Probability(f32);

impl Probability {
    pub const DEFAULT: Probability = Probability(0.5);

    pub fn get(self) -> f32 {
        self.0
    }
}

impl Default for Probability {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<f32> for Probability {
    type Error = String;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        if (0.0..=1.0).contains(&value) {
            Ok(Probability(value))
        } else {
            Err(format!(
                "probability must be between 0 and 1 (got {})",
                value
            ))
        }
    }
}

impl fmt::Display for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Largest downsampling factor of the YOLOv5 backbone.
pub const MODEL_STRIDE: u32 = 32;

/// Square edge, in pixels, the detector resizes its input to. Always a
/// multiple of [`MODEL_STRIDE`] so the P4/P5 feature maps line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InferenceSize(u32);

impl InferenceSize {
    /// Rounds `edge` up to the next stride multiple (240 becomes 256).
    pub fn new(edge: u32) -> Option<Self> {
        if edge == 0 {
            return None;
        }
        let aligned = edge.checked_add(MODEL_STRIDE - 1)? / MODEL_STRIDE * MODEL_STRIDE;
        Some(InferenceSize(aligned))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InferenceSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}px", self.0)
    }
}

#[derive(Debug, Deserialize)]
pub struct PredictionQuery {
    #[serde(default)]
    pub probability: Probability,
}

#[derive(Debug, Deserialize)]
pub struct EncodeUrlQuery {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct Greeting {
    pub message: String,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ModelInfo {
    pub algorithm_name: &'static str,
    pub related_research_paper: Vec<&'static str>,
    pub version_number: &'static str,
    pub training_dataset: &'static str,
}

impl ModelInfo {
    pub fn coins() -> Self {
        ModelInfo {
            algorithm_name: "YOLOv5",
            related_research_paper: vec!["https://arxiv.org/abs/1506.02640"],
            version_number: "7.0",
            training_dataset: "Custom dataset of coin images",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    pub filename: String,
    #[serde(rename = "Summ")]
    pub summ: u64,
}

#[derive(Debug, Serialize)]
pub struct EncodedUrl {
    pub encoded_url: String,
    pub prediction_path: String,
}
