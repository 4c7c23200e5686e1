use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::Array4;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tract_onnx::prelude::*;

use crate::models::{InferenceSize, Probability};

/// YOLOv5 keeps at most this many boxes per image.
const MAX_DETECTIONS: usize = 1000;
const LETTERBOX_FILL: u8 = 114;

type CoinPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("cannot read labels from {path}: {source}")]
    Labels {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no inference plan for input size {0}")]
    UnsupportedSize(InferenceSize),
    #[error("unexpected model output shape {0:?}")]
    UnexpectedOutput(Vec<usize>),
    #[error("model failure: {0}")]
    Model(#[from] TractError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &BoundingBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub class_id: usize,
    pub bbox: BoundingBox,
}

/// Per-call inference parameters. Nothing here outlives the call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectOptions {
    pub confidence: Probability,
    pub size: InferenceSize,
}

/// Maps an image to labeled, scored detections, highest score first.
pub trait Detector: Send + Sync {
    fn detect(
        &self,
        image: &DynamicImage,
        options: &DetectOptions,
    ) -> Result<Vec<Detection>, DetectorError>;
}

/// Class names, one per line. Blank lines are skipped.
pub fn load_labels(path: &Path) -> Result<Vec<String>, DetectorError> {
    let raw = fs::read_to_string(path).map_err(|source| DetectorError::Labels {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

/// YOLOv5 ONNX export served through tract, one optimized plan per input size.
pub struct OnnxDetector {
    plans: HashMap<InferenceSize, CoinPlan>,
    labels: Vec<String>,
    iou_threshold: f32,
}

impl OnnxDetector {
    pub fn load(
        model_path: &Path,
        labels: Vec<String>,
        sizes: &[InferenceSize],
        iou_threshold: f32,
    ) -> Result<Self, DetectorError> {
        if !model_path.is_file() {
            return Err(DetectorError::ModelNotFound(model_path.to_path_buf()));
        }

        let model = tract_onnx::onnx().model_for_path(model_path)?;
        let mut plans = HashMap::new();
        for &size in sizes {
            if plans.contains_key(&size) {
                continue;
            }
            let edge = size.get() as usize;
            let plan = model
                .clone()
                .with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, edge, edge)),
                )?
                .into_optimized()?
                .into_runnable()?;
            log::debug!("built inference plan for {}", size);
            plans.insert(size, plan);
        }

        Ok(Self {
            plans,
            labels,
            iou_threshold,
        })
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    fn label_for(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| class_id.to_string())
    }
}

impl Detector for OnnxDetector {
    fn detect(
        &self,
        image: &DynamicImage,
        options: &DetectOptions,
    ) -> Result<Vec<Detection>, DetectorError> {
        let plan = self
            .plans
            .get(&options.size)
            .ok_or(DetectorError::UnsupportedSize(options.size))?;

        let (canvas, geometry) = letterbox(image, options.size.get());
        let tensor = Tensor::from(to_input_array(&canvas));

        let outputs = plan.run(tvec!(tensor.into()))?;
        let output = outputs[0].to_array_view::<f32>()?;
        let shape = output.shape().to_vec();
        if shape.len() != 3 || shape[2] < 6 {
            return Err(DetectorError::UnexpectedOutput(shape));
        }
        let rows: Vec<f32> = output.iter().copied().collect();

        let candidates = decode_candidates(&rows, shape[2], options.confidence.get());
        let kept = non_max_suppression(candidates, self.iou_threshold, MAX_DETECTIONS);

        Ok(kept
            .into_iter()
            .map(|c| Detection {
                label: self.label_for(c.class_id),
                score: c.score,
                class_id: c.class_id,
                bbox: geometry.restore(&c.bbox),
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    width: f32,
    height: f32,
}

impl Letterbox {
    /// Maps a box from model-input space back onto the source image.
    fn restore(&self, b: &BoundingBox) -> BoundingBox {
        let x = |v: f32| ((v - self.pad_x) / self.scale).clamp(0.0, self.width);
        let y = |v: f32| ((v - self.pad_y) / self.scale).clamp(0.0, self.height);
        BoundingBox {
            x1: x(b.x1),
            y1: y(b.y1),
            x2: x(b.x2),
            y2: y(b.y2),
        }
    }
}

fn letterbox(image: &DynamicImage, edge: u32) -> (RgbImage, Letterbox) {
    let (width, height) = (image.width().max(1), image.height().max(1));
    let scale = (edge as f32 / width as f32).min(edge as f32 / height as f32);
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, edge);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, edge);

    let resized = image
        .resize_exact(new_width, new_height, FilterType::Triangle)
        .to_rgb8();
    let mut canvas = RgbImage::from_pixel(edge, edge, Rgb([LETTERBOX_FILL; 3]));
    let pad_x = (edge - new_width) / 2;
    let pad_y = (edge - new_height) / 2;
    imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let geometry = Letterbox {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
        width: width as f32,
        height: height as f32,
    };
    (canvas, geometry)
}

fn to_input_array(image: &RgbImage) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut input = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    input
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    class_id: usize,
    score: f32,
    bbox: BoundingBox,
}

/// Rows are `cx, cy, w, h, objectness, class scores...`.
fn decode_candidates(rows: &[f32], width: usize, confidence: f32) -> Vec<Candidate> {
    rows.chunks_exact(width)
        .filter(|row| row[4] > confidence)
        .filter_map(|row| {
            let (class_id, class_score) = row[5..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))?;
            let score = row[4] * class_score;
            if score <= confidence {
                return None;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            Some(Candidate {
                class_id,
                score,
                bbox: BoundingBox {
                    x1: cx - w / 2.0,
                    y1: cy - h / 2.0,
                    x2: cx + w / 2.0,
                    y2: cy + h / 2.0,
                },
            })
        })
        .collect()
}

/// Greedy per-class suppression, highest score first.
fn non_max_suppression(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    limit: usize,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= limit {
            break;
        }
        let overlaps = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn row(cx: f32, cy: f32, w: f32, h: f32, obj: f32, classes: &[f32]) -> Vec<f32> {
        let mut r = vec![cx, cy, w, h, obj];
        r.extend_from_slice(classes);
        r
    }

    #[test]
    fn decode_applies_objectness_and_class_confidence() {
        let mut rows = Vec::new();
        rows.extend(row(50.0, 50.0, 20.0, 20.0, 0.9, &[0.1, 0.95]));
        // objectness below threshold
        rows.extend(row(10.0, 10.0, 4.0, 4.0, 0.3, &[0.99, 0.0]));
        // objectness passes, combined score does not
        rows.extend(row(80.0, 80.0, 4.0, 4.0, 0.6, &[0.7, 0.1]));

        let found = decode_candidates(&rows, 7, 0.5);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].class_id, 1);
        assert!((found[0].score - 0.855).abs() < 1e-4);
        assert_eq!(
            found[0].bbox,
            BoundingBox { x1: 40.0, y1: 40.0, x2: 60.0, y2: 60.0 }
        );
    }

    #[test]
    fn nms_suppresses_same_class_overlaps_only() {
        let bbox = BoundingBox { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 };
        let shifted = BoundingBox { x1: 1.0, y1: 1.0, x2: 11.0, y2: 11.0 };
        let candidates = vec![
            Candidate { class_id: 0, score: 0.6, bbox: shifted },
            Candidate { class_id: 0, score: 0.9, bbox },
            Candidate { class_id: 1, score: 0.7, bbox },
        ];

        let kept = non_max_suppression(candidates, 0.45, MAX_DETECTIONS);
        let summary: Vec<(usize, f32)> = kept.iter().map(|c| (c.class_id, c.score)).collect();
        assert_eq!(summary, vec![(0, 0.9), (1, 0.7)]);
    }

    #[test]
    fn nms_honours_limit() {
        let candidates = (0..5)
            .map(|i| Candidate {
                class_id: 0,
                score: 0.5 + i as f32 / 10.0,
                bbox: BoundingBox {
                    x1: i as f32 * 100.0,
                    y1: 0.0,
                    x2: i as f32 * 100.0 + 10.0,
                    y2: 10.0,
                },
            })
            .collect();
        assert_eq!(non_max_suppression(candidates, 0.45, 3).len(), 3);
    }

    #[test]
    fn letterbox_pads_short_side_and_restores_boxes() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([255, 0, 0])));
        let (canvas, geometry) = letterbox(&image, 100);

        assert_eq!(canvas.dimensions(), (100, 100));
        assert_eq!(geometry.pad_x, 0.0);
        assert_eq!(geometry.pad_y, 25.0);
        assert_eq!(canvas.get_pixel(50, 5), &Rgb([LETTERBOX_FILL; 3]));
        assert_eq!(canvas.get_pixel(50, 50)[0], 255);

        let restored = geometry.restore(&BoundingBox { x1: 10.0, y1: 25.0, x2: 60.0, y2: 75.0 });
        assert_eq!(restored, BoundingBox { x1: 20.0, y1: 0.0, x2: 120.0, y2: 100.0 });
    }

    #[test]
    fn input_array_is_nchw_scaled() {
        let image = RgbImage::from_pixel(4, 2, Rgb([255, 0, 51]));
        let input = to_input_array(&image);
        assert_eq!(input.shape(), &[1, 3, 2, 4]);
        assert_eq!(input[[0, 0, 1, 3]], 1.0);
        assert_eq!(input[[0, 1, 0, 0]], 0.0);
        assert!((input[[0, 2, 0, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn input_tensor_keeps_array_layout() {
        let image = RgbImage::from_pixel(4, 2, Rgb([255, 0, 51]));
        let tensor = Tensor::from(to_input_array(&image));
        assert_eq!(tensor.shape(), &[1, 3, 2, 4]);
        let view = tensor.to_array_view::<f32>().unwrap();
        assert_eq!(view[[0, 0, 1, 3]], 1.0);
        assert_eq!(view[[0, 1, 0, 0]], 0.0);
    }

    #[test]
    fn detect_without_plan_for_size_fails() {
        let detector = OnnxDetector {
            plans: HashMap::new(),
            labels: vec!["100".into()],
            iou_threshold: 0.45,
        };
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])));
        let options = DetectOptions {
            confidence: Probability::DEFAULT,
            size: InferenceSize::new(240).unwrap(),
        };

        let err = detector.detect(&image, &options).unwrap_err();
        assert!(matches!(err, DetectorError::UnsupportedSize(size) if size.get() == 256));
    }

    #[test]
    fn unknown_class_falls_back_to_index() {
        let detector = OnnxDetector {
            plans: HashMap::new(),
            labels: vec!["10".into(), "50".into()],
            iou_threshold: 0.45,
        };
        assert_eq!(detector.label_for(1), "50");
        assert_eq!(detector.label_for(7), "7");
    }

    #[test]
    fn labels_skip_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10\n\n50\n 100 \n").unwrap();
        assert_eq!(load_labels(file.path()).unwrap(), vec!["10", "50", "100"]);
    }

    #[test]
    fn missing_labels_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_labels(&dir.path().join("labels.txt")).unwrap_err();
        assert!(matches!(err, DetectorError::Labels { .. }));
    }

    #[test]
    fn load_rejects_missing_and_corrupt_models() {
        let dir = tempfile::tempdir().unwrap();
        let sizes = [InferenceSize::new(640).unwrap()];

        let missing = OnnxDetector::load(&dir.path().join("coins.onnx"), vec![], &sizes, 0.45);
        assert!(matches!(missing, Err(DetectorError::ModelNotFound(_))));

        let corrupt = dir.path().join("corrupt.onnx");
        fs::write(&corrupt, b"definitely not protobuf").unwrap();
        let loaded = OnnxDetector::load(&corrupt, vec![], &sizes, 0.45);
        assert!(matches!(loaded, Err(DetectorError::Model(_))));
    }
}
