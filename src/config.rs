use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::models::InferenceSize;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("iou threshold must be between 0 and 1 (got {0})")]
    IouThreshold(f32),
}

/// Coin recognition API: processes uploaded images and returns the sum of coins.
#[derive(Debug, Clone, Parser)]
#[command(name = "coin-recognition-api", version)]
pub struct Config {
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Worker threads; actix picks one per CPU when unset
    #[arg(long, env = "WORKERS")]
    pub workers: Option<usize>,

    /// YOLOv5 ONNX export
    #[arg(long, env = "MODEL_PATH", default_value = "model/coins.onnx")]
    pub model_path: PathBuf,

    /// One class name (coin value) per line, in model class order
    #[arg(long, env = "LABELS_PATH", default_value = "model/labels.txt")]
    pub labels_path: PathBuf,

    /// Model input edge for POST /Prediction/, rounded up to a multiple of 32
    #[arg(long, env = "UPLOAD_SIZE", default_value_t = 640)]
    pub upload_size: u32,

    /// Model input edge for GET /PredictionFromURL/, rounded up to a multiple of 32
    #[arg(long, env = "PREVIEW_SIZE", default_value_t = 240)]
    pub preview_size: u32,

    #[arg(long, env = "IOU_THRESHOLD", default_value_t = 0.45)]
    pub iou_threshold: f32,

    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = 30)]
    pub fetch_timeout_secs: u64,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload_size == 0 {
            return Err(ConfigError::Zero("upload size"));
        }
        if self.preview_size == 0 {
            return Err(ConfigError::Zero("preview size"));
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::Zero("max upload bytes"));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(ConfigError::IouThreshold(self.iou_threshold));
        }
        Ok(())
    }

    pub fn upload_size(&self) -> Result<InferenceSize, ConfigError> {
        InferenceSize::new(self.upload_size).ok_or(ConfigError::Zero("upload size"))
    }

    pub fn preview_size(&self) -> Result<InferenceSize, ConfigError> {
        InferenceSize::new(self.preview_size).ok_or(ConfigError::Zero("preview size"))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
