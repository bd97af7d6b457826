//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-based decoding over strides 8/16/32 with two anchors per cell,
//! followed by greedy non-maximum suppression.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download the insightface buffalo_l pack into the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face box from the detector, in source-image pixels.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    /// Five-point landmarks: left eye, right eye, nose, left mouth, right mouth.
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// How the source image was placed inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);
        let (new_w, new_h) = Self::scaled_size(width, height, scale);
        Self {
            scale,
            pad_x: ((SCRFD_INPUT_SIZE - new_w) / 2) as f32,
            pad_y: ((SCRFD_INPUT_SIZE - new_h) / 2) as f32,
        }
    }

    fn scaled_size(width: u32, height: u32, scale: f32) -> (u32, u32) {
        let w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        (w, h)
    }

    /// Model-input coordinates back to source-image coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Tensor indices of (score, bbox, kps) for one stride.
type StrideOutputs = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model must expose 9 outputs (score/bbox/kps per stride), found {}",
                names.len()
            )));
        }

        let outputs = map_outputs(&names);
        tracing::info!(path = model_path, ?names, ?outputs, "loaded SCRFD model");

        Ok(Self { session, outputs })
    }

    /// Detect faces, highest score first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::fit(image.width(), image.height());
        let input = preprocess(image, &letterbox);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(self.outputs.iter()) {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = tensor(score_idx, "scores")?;
            let boxes = tensor(bbox_idx, "boxes")?;
            let kps = tensor(kps_idx, "landmarks")?;

            candidates.extend(decode_stride(scores, boxes, kps, stride, &letterbox));
        }

        Ok(suppress(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Resize into the letterbox and lay out as normalized NCHW RGB.
fn preprocess(image: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let (new_w, new_h) = Letterbox::scaled_size(image.width(), image.height(), letterbox.scale);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (ox + x as usize, oy + y as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    tensor
}

/// Locate per-stride tensors by name ("score_8", "bbox_16", ...), falling
/// back to the usual positional export order.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |kind: &str, stride: u32| names.iter().position(|n| *n == format!("{kind}_{stride}"));

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((position("score", s)?, position("bbox", s)?, position("kps", s)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: u32,
    letterbox: &Letterbox,
) -> Vec<Detection> {
    let cells_x = (SCRFD_INPUT_SIZE / stride) as usize;
    let cells_y = cells_x;
    let anchors = cells_x * cells_y * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > SCRFD_SCORE_THRESHOLD)
        .filter_map(|i| {
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % cells_x) as f32 * step;
            let ay = (cell / cells_x) as f32 * step;

            let d = boxes.get(i * 4..i * 4 + 4)?;
            let (x0, y0) = letterbox.unmap(ax - d[0] * step, ay - d[1] * step);
            let (x1, y1) = letterbox.unmap(ax + d[2] * step, ay + d[3] * step);

            let landmarks = kps.get(i * 10..i * 10 + 10).map(|k| {
                std::array::from_fn(|p| letterbox.unmap(ax + k[p * 2] * step, ay + k[p * 2 + 1] * step))
            });

            Some(Detection {
                bbox: BoundingBox::from_corners(x0, y0, x1, y1),
                score: scores[i],
                landmarks,
            })
        })
        .collect()
}

/// Greedy NMS; output sorted by descending score.
fn suppress(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
