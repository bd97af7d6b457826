//! Embedding extraction seam.
//!
//! The pipeline only depends on [`EmbeddingExtractor`]; [`OnnxExtractor`]
//! is the model-backed implementation (SCRFD + ArcFace, plus gender/age
//! when `genderage.onnx` is present).

use crate::attributes::{AttributeError, AttributeModel};
use crate::database::FaceDatabase;
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::resolver::Resolver;
use crate::types::{Face, MatchResult};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";
pub const ATTRIBUTE_MODEL_FILE: &str = "genderage.onnx";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("attributes: {0}")]
    Attributes(#[from] AttributeError),
    #[error("{0}")]
    Other(String),
}

/// Turns an image into zero or more faces with embeddings.
///
/// Called from a single thread at a time; implementations need not be `Sync`.
pub trait EmbeddingExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Face>, ExtractError>;
}

impl<E: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Box<E> {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Face>, ExtractError> {
        (**self).extract(image)
    }
}

/// Names and locations of the models behind an extractor, for reports.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelInfo {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    /// Optional; faces carry no age or gender without it.
    pub attributes: PathBuf,
}

impl ModelInfo {
    pub fn in_dir(model_dir: &Path) -> Self {
        Self {
            detector: model_dir.join(DETECTOR_MODEL_FILE),
            recognizer: model_dir.join(RECOGNIZER_MODEL_FILE),
            attributes: model_dir.join(ATTRIBUTE_MODEL_FILE),
        }
    }

    pub fn is_present(&self) -> bool {
        self.detector.exists() && self.recognizer.exists()
    }
}

pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    attributes: Option<AttributeModel>,
    info: ModelInfo,
}

impl OnnxExtractor {
    /// Load the detector and recognizer from `model_dir`, and the gender/age
    /// model when it is there.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractError> {
        let info = ModelInfo::in_dir(model_dir);
        let detector = FaceDetector::load(&info.detector.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&info.recognizer.to_string_lossy())?;
        let attributes = if info.attributes.exists() {
            Some(AttributeModel::load(&info.attributes.to_string_lossy())?)
        } else {
            tracing::info!(path = %info.attributes.display(), "no gender/age model; skipping attributes");
            None
        };
        Ok(Self {
            detector,
            recognizer,
            attributes,
            info,
        })
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Face>, ExtractError> {
        let detections = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(detections.len());

        for det in detections {
            // Faces without landmarks cannot be aligned.
            let Some(landmarks) = det.landmarks else {
                continue;
            };
            let embedding = self.recognizer.embed(image, &landmarks)?;
            let attributes = match self.attributes.as_mut() {
                Some(model) => Some(model.estimate(image, &det.bbox)?),
                None => None,
            };
            faces.push(Face {
                bbox: det.bbox,
                embedding,
                score: det.score,
                age: attributes.map(|a| a.age),
                gender: attributes.map(|a| a.gender),
            });
        }

        Ok(faces)
    }
}

/// Resolve every face in a still image.
///
/// Returns an empty list without running extraction when nothing is enrolled.
pub fn recognize<E, R>(
    extractor: &mut E,
    resolver: &R,
    image: &RgbImage,
    database: &FaceDatabase,
    threshold: f32,
) -> Result<Vec<MatchResult>, ExtractError>
where
    E: EmbeddingExtractor + ?Sized,
    R: Resolver + ?Sized,
{
    if database.is_empty() {
        tracing::warn!("face database is empty; nothing to recognize against");
        return Ok(Vec::new());
    }

    let faces = extractor.extract(image)?;
    Ok(faces
        .iter()
        .map(|face| MatchResult::from_face(face, resolver.resolve(&face.embedding, database, threshold)))
        .collect())
}
