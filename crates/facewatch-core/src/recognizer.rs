//! ArcFace face recognizer via ONNX Runtime.
//!
//! Produces L2-normalized 512-d embeddings from aligned 112×112 RGB crops
//! (w600k_r50 from the insightface buffalo_l pack).

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::Embedding;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download the insightface buffalo_l pack into the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Align the face at `landmarks` and embed it.
    pub fn embed(
        &mut self,
        image: &RgbImage,
        landmarks: &[(f32, f32); 5],
    ) -> Result<Embedding, RecognizerError> {
        let aligned = alignment::align_face(image, landmarks);
        self.embed_aligned(&aligned)
    }

    /// Embed an already aligned 112×112 crop.
    pub fn embed_aligned(&mut self, aligned: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = to_tensor(aligned);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding output: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-d embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(raw.to_vec()).normalized())
    }
}

/// NCHW float tensor with symmetric normalization.
fn to_tensor(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in aligned.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= size || y >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }

    tensor
}
