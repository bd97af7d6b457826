//! Identity resolution: nearest-neighbour cosine search over the database.

use crate::database::FaceDatabase;
use crate::types::{Embedding, Identity, Resolution};

/// Fixed threshold for one-to-one verification.
pub const VERIFY_THRESHOLD: f32 = 0.5;

/// Strategy for resolving a probe embedding against an enrolled database.
pub trait Resolver {
    fn resolve(&self, probe: &Embedding, database: &FaceDatabase, threshold: f32) -> Resolution;
}

/// Linear-scan cosine resolver.
///
/// Picks the entry with the highest similarity; on ties the lowest index
/// wins. A best score `>= threshold` yields that entry's label, anything
/// lower yields [`Identity::Unknown`] with the best score still attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineResolver;

impl Resolver for CosineResolver {
    fn resolve(&self, probe: &Embedding, database: &FaceDatabase, threshold: f32) -> Resolution {
        if database.is_empty() {
            return Resolution {
                identity: Identity::Unknown,
                similarity: 0.0,
            };
        }

        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx = 0usize;

        for (i, candidate) in database.flat_embeddings().iter().enumerate() {
            let sim = probe.similarity(candidate);
            if sim > best_sim {
                best_sim = sim;
                best_idx = i;
            }
        }

        let identity = if best_sim >= threshold {
            Identity::Known(database.flat_labels()[best_idx].clone())
        } else {
            Identity::Unknown
        };

        Resolution {
            identity,
            // NaN probes never beat the initial value.
            similarity: if best_sim == f32::NEG_INFINITY { 0.0 } else { best_sim },
        }
    }
}

/// Result of comparing two embeddings one-to-one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verification {
    pub similarity: f32,
    pub verified: bool,
}

/// Decide whether two embeddings belong to the same person.
pub fn verify(a: &Embedding, b: &Embedding) -> Verification {
    let similarity = a.similarity(b);
    Verification {
        similarity,
        verified: similarity >= VERIFY_THRESHOLD,
    }
}
