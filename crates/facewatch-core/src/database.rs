//! In-memory face database.
//!
//! Keeps two views of the same entries: a per-label map used for display and
//! management, and flat `embeddings` / `labels` arrays used by the resolver's
//! linear scan. Every mutation keeps both views holding the same multiset.
//! Labels keep their first-enrollment order, which is also the order the
//! flat arrays are rebuilt in after a removal.

use crate::types::{Embedding, UNKNOWN_LABEL};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum DatabaseError {
    #[error("label must not be empty")]
    EmptyLabel,
    #[error("label \"{0}\" is reserved for unrecognised faces")]
    ReservedLabel(String),
    #[error("embedding must not be empty")]
    EmptyEmbedding,
    #[error("embedding contains non-finite values")]
    NonFinite,
    #[error("embedding dimension {actual} does not match database dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// One enrolled embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEntry {
    pub embedding: Embedding,
    /// Where the embedding came from (usually an image path).
    pub source_ref: String,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStats {
    pub total_people: usize,
    pub total_faces: usize,
    pub people: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityIssue {
    /// Flat embeddings and flat labels differ in length.
    FlatLengthMismatch { embeddings: usize, labels: usize },
    /// The per-label map and the flat arrays disagree on entry count.
    MapCountMismatch { map: usize, flat: usize },
    /// A source reference names a file that no longer exists.
    MissingSource { label: String, source_ref: String },
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityIssue::FlatLengthMismatch { embeddings, labels } => {
                write!(f, "{embeddings} embeddings but {labels} labels")
            }
            IntegrityIssue::MapCountMismatch { map, flat } => {
                write!(f, "{map} entries by label but {flat} in the search arrays")
            }
            IntegrityIssue::MissingSource { label, source_ref } => {
                write!(f, "{label}: missing source file {source_ref}")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegrityReport {
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FaceDatabase {
    people: IndexMap<String, Vec<FaceEntry>>,
    embeddings: Vec<Embedding>,
    labels: Vec<String>,
}

impl FaceDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an embedding for `label`, stamped with the current time.
    pub fn enroll(
        &mut self,
        label: &str,
        embedding: Embedding,
        source_ref: &str,
    ) -> Result<(), DatabaseError> {
        self.enroll_entry(
            label,
            FaceEntry {
                embedding,
                source_ref: source_ref.to_string(),
                enrolled_at: Utc::now(),
            },
        )
    }

    /// Append a fully-formed entry (used when loading from storage).
    pub fn enroll_entry(&mut self, label: &str, entry: FaceEntry) -> Result<(), DatabaseError> {
        self.validate(label, &entry.embedding)?;

        self.embeddings.push(entry.embedding.clone());
        self.labels.push(label.to_string());
        self.people.entry(label.to_string()).or_default().push(entry);
        Ok(())
    }

    /// Remove every entry of `label`. Returns false when the label is absent.
    ///
    /// The flat arrays are rebuilt from the map rather than patched in place.
    pub fn remove(&mut self, label: &str) -> bool {
        if self.people.shift_remove(label).is_none() {
            return false;
        }
        self.rebuild_flat();
        tracing::debug!(label, remaining = self.embeddings.len(), "removed label");
        true
    }

    fn rebuild_flat(&mut self) {
        self.embeddings.clear();
        self.labels.clear();
        for (label, entries) in &self.people {
            for entry in entries {
                self.embeddings.push(entry.embedding.clone());
                self.labels.push(label.clone());
            }
        }
    }

    fn validate(&self, label: &str, embedding: &Embedding) -> Result<(), DatabaseError> {
        let trimmed = label.trim();
        if trimmed.is_empty() {
            return Err(DatabaseError::EmptyLabel);
        }
        if trimmed == UNKNOWN_LABEL {
            return Err(DatabaseError::ReservedLabel(label.to_string()));
        }
        if embedding.values.is_empty() {
            return Err(DatabaseError::EmptyEmbedding);
        }
        if embedding.values.iter().any(|v| !v.is_finite()) {
            return Err(DatabaseError::NonFinite);
        }
        if let Some(expected) = self.dimension() {
            if embedding.dimension() != expected {
                return Err(DatabaseError::DimensionMismatch {
                    expected,
                    actual: embedding.dimension(),
                });
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            total_people: self.people.len(),
            total_faces: self.embeddings.len(),
            people: self
                .people
                .iter()
                .map(|(label, entries)| (label.clone(), entries.len()))
                .collect(),
        }
    }

    /// Check the flat/map invariant and that file-backed sources still exist.
    pub fn check_integrity(&self) -> IntegrityReport {
        let mut issues = Vec::new();

        if self.embeddings.len() != self.labels.len() {
            issues.push(IntegrityIssue::FlatLengthMismatch {
                embeddings: self.embeddings.len(),
                labels: self.labels.len(),
            });
        }

        let map_count: usize = self.people.values().map(Vec::len).sum();
        if map_count != self.embeddings.len() {
            issues.push(IntegrityIssue::MapCountMismatch {
                map: map_count,
                flat: self.embeddings.len(),
            });
        }

        for (label, entries) in &self.people {
            for entry in entries {
                if !entry.source_ref.is_empty() && !Path::new(&entry.source_ref).exists() {
                    issues.push(IntegrityIssue::MissingSource {
                        label: label.clone(),
                        source_ref: entry.source_ref.clone(),
                    });
                }
            }
        }

        IntegrityReport { issues }
    }

    /// Embedding dimension shared by all entries, `None` when empty.
    pub fn dimension(&self) -> Option<usize> {
        self.embeddings.first().map(Embedding::dimension)
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.people.contains_key(label)
    }

    /// Enrolled labels in first-enrollment order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.people.keys().map(String::as_str)
    }

    pub fn entries(&self, label: &str) -> &[FaceEntry] {
        self.people.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate `(label, entry)` pairs, grouped by label in first-enrollment order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FaceEntry)> {
        self.people
            .iter()
            .flat_map(|(label, entries)| entries.iter().map(move |e| (label.as_str(), e)))
    }

    /// Flat embedding array searched by the resolver.
    pub fn flat_embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    /// Flat label array, index-aligned with [`flat_embeddings`](Self::flat_embeddings).
    pub fn flat_labels(&self) -> &[String] {
        &self.labels
    }
}
