//! facewatch-core — face database, identity resolution and embedding extraction.
//!
//! Extraction runs SCRFD detection, ArcFace recognition and optional
//! gender/age estimation on ONNX Runtime; resolution is a linear cosine scan
//! over the enrolled embeddings.

pub mod alignment;
pub mod attributes;
pub mod database;
pub mod detector;
pub mod extractor;
pub mod recognizer;
pub mod resolver;
pub mod store;
pub mod types;

pub use attributes::{AttributeError, AttributeModel, Attributes};
pub use database::{DatabaseError, DatabaseStats, FaceDatabase, FaceEntry, IntegrityIssue, IntegrityReport};
pub use extractor::{recognize, EmbeddingExtractor, ExtractError, ModelInfo, OnnxExtractor};
pub use resolver::{verify, CosineResolver, Resolver, Verification, VERIFY_THRESHOLD};
pub use store::{FaceStore, StoreError};
pub use types::{
    largest_face, BoundingBox, Embedding, Face, Gender, Identity, MatchResult, Resolution, UNKNOWN_LABEL,
};
