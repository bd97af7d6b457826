use serde::{Deserialize, Serialize};
use std::fmt;

/// Label reported when no enrolled face clears the threshold.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Axis-aligned face box in pixel coordinates of the image it was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build a box from `[x0, y0, x1, y1]` corners.
    pub fn from_corners(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        }
    }

    /// `[x0, y0, x1, y1]`.
    pub fn corners(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Map the box into another resolution by per-axis scale factors.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
        }
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let [ax0, ay0, ax1, ay1] = self.corners();
        let [bx0, by0, bx1, by1] = other.corners();
        let inter = (ax1.min(bx1) - ax0.max(bx0)).max(0.0) * (ay1.min(by1) - ay0.max(by0)).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Return a unit-length copy. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            Embedding::new(self.values.iter().map(|v| v / norm).collect())
        } else {
            self.clone()
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero-magnitude operand yields 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Female,
    Male,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Gender::Female => "Female",
            Gender::Male => "Male",
        })
    }
}

/// One face found by an embedding extractor.
#[derive(Debug, Clone)]
pub struct Face {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    /// Detector confidence.
    pub score: f32,
    /// Estimated age, when the extractor provides one.
    pub age: Option<f32>,
    pub gender: Option<Gender>,
}

/// Pick the face with the largest box area.
pub fn largest_face(faces: &[Face]) -> Option<&Face> {
    faces.iter().fold(None, |best: Option<&Face>, f| match best {
        Some(b) if b.bbox.area() >= f.bbox.area() => Some(b),
        _ => Some(f),
    })
}

/// Who a face was resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }

    pub fn label(&self) -> &str {
        match self {
            Identity::Known(label) => label,
            Identity::Unknown => UNKNOWN_LABEL,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of resolving a single embedding against the database.
///
/// `similarity` is the best score seen even when the identity is unknown, so
/// a close miss can be told apart from no signal at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub identity: Identity,
    pub similarity: f32,
}

/// A resolved face, ready for display.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub bbox: BoundingBox,
    pub identity: Identity,
    pub similarity: f32,
    pub age: Option<f32>,
    pub gender: Option<Gender>,
}

impl MatchResult {
    pub fn from_face(face: &Face, resolution: Resolution) -> Self {
        Self {
            bbox: face.bbox,
            identity: resolution.identity,
            similarity: resolution.similarity,
            age: face.age,
            gender: face.gender,
        }
    }
}
