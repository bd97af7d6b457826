//! Age and gender estimation (genderage.onnx from the buffalo_l pack).
//!
//! The model takes a 96×96 square crop around the detection box, 1.5× the
//! box's longer side, as raw 0..255 RGB. Output is `[female, male, age/100]`.

use crate::alignment;
use crate::types::{BoundingBox, Gender};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const ATTRIBUTE_INPUT_SIZE: u32 = 96;
const CROP_MARGIN: f32 = 1.5;

#[derive(Error, Debug)]
pub enum AttributeError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Estimated attributes of one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attributes {
    pub age: f32,
    pub gender: Gender,
}

pub struct AttributeModel {
    session: Session,
}

impl AttributeModel {
    pub fn load(model_path: &str) -> Result<Self, AttributeError> {
        if !Path::new(model_path).exists() {
            return Err(AttributeError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded gender/age model");
        Ok(Self { session })
    }

    pub fn estimate(&mut self, image: &RgbImage, bbox: &BoundingBox) -> Result<Attributes, AttributeError> {
        let crop = face_crop(image, bbox);
        let input = to_tensor(&crop);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| AttributeError::InferenceFailed(format!("attribute output: {e}")))?;

        decode(raw).ok_or_else(|| {
            AttributeError::InferenceFailed(format!("expected 3 attribute values, got {}", raw.len()))
        })
    }
}

fn face_crop(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    let center = (bbox.x + bbox.width / 2.0, bbox.y + bbox.height / 2.0);
    let side = bbox.width.max(bbox.height) * CROP_MARGIN;
    alignment::crop_centered(image, center, side, ATTRIBUTE_INPUT_SIZE)
}

/// NCHW, unnormalised.
fn to_tensor(crop: &RgbImage) -> Array4<f32> {
    let size = ATTRIBUTE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= size || y >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = pixel.0[c] as f32;
        }
    }
    tensor
}

fn decode(raw: &[f32]) -> Option<Attributes> {
    let [female, male, age]: [f32; 3] = raw.get(..3)?.try_into().ok()?;
    let gender = if male > female { Gender::Male } else { Gender::Female };
    Some(Attributes {
        age: (age * 100.0).round().max(0.0),
        gender,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_decode_picks_gender_and_scales_age() {
        assert_eq!(
            decode(&[0.2, 0.8, 0.314]),
            Some(Attributes { age: 31.0, gender: Gender::Male })
        );
        assert_eq!(
            decode(&[0.9, 0.1, 0.25]),
            Some(Attributes { age: 25.0, gender: Gender::Female })
        );
        assert_eq!(decode(&[0.5, 0.5]), None);
    }

    #[test]
    fn test_crop_is_model_sized_and_centred() {
        let mut img = RgbImage::new(300, 300);
        img.put_pixel(150, 100, Rgb([255, 255, 255]));
        let bbox = BoundingBox { x: 130.0, y: 70.0, width: 40.0, height: 60.0 };

        let crop = face_crop(&img, &bbox);
        assert_eq!(crop.dimensions(), (ATTRIBUTE_INPUT_SIZE, ATTRIBUTE_INPUT_SIZE));
        let mid = ATTRIBUTE_INPUT_SIZE / 2;
        assert!(crop.get_pixel(mid, mid).0[0] > 0);
    }

    #[test]
    fn test_tensor_is_raw_pixels() {
        let crop = RgbImage::from_pixel(ATTRIBUTE_INPUT_SIZE, ATTRIBUTE_INPUT_SIZE, Rgb([10, 20, 30]));
        let t = to_tensor(&crop);
        assert_eq!(t.shape(), &[1, 3, 96, 96]);
        assert_eq!(t[[0, 2, 7, 7]], 30.0);
    }

    #[test]
    fn test_missing_model_is_reported() {
        let err = AttributeModel::load("/nonexistent/genderage.onnx").err();
        assert!(matches!(err, Some(AttributeError::ModelNotFound(_))));
    }
}
