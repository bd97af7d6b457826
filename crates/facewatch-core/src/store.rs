//! SQLite persistence for the face database.
//!
//! Saves are explicit and replace the stored contents wholesale; nothing is
//! written behind the caller's back.

use crate::database::{DatabaseError, FaceDatabase, FaceEntry};
use crate::extractor::ModelInfo;
use crate::types::Embedding;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

const SCHEMA_VERSION: i32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt embedding blob for row {row}: {len} bytes")]
    CorruptEmbedding { row: i64, len: usize },
    #[error("invalid timestamp for row {row}: {value}")]
    CorruptTimestamp { row: i64, value: String },
    #[error("stored entry rejected: {0}")]
    Rejected(#[from] DatabaseError),
    #[error("unsupported schema version {0}")]
    SchemaVersion(i32),
}

pub struct FaceStore {
    conn: Connection,
}

impl FaceStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::with_connection(Connection::open(path)?)?;
        tracing::debug!(path = %path.display(), "opened face store");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS faces (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        label       TEXT NOT NULL,
                        embedding   BLOB NOT NULL,
                        source_ref  TEXT NOT NULL,
                        enrolled_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS faces_label ON faces(label);",
                )?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            }
            SCHEMA_VERSION => {}
            other => return Err(StoreError::SchemaVersion(other)),
        }
        Ok(Self { conn })
    }

    /// Load every stored entry, in insertion order.
    pub fn load(&self) -> Result<FaceDatabase, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, label, embedding, source_ref, enrolled_at FROM faces ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut db = FaceDatabase::new();
        for row in rows {
            let (id, label, blob, source_ref, enrolled_at) = row?;
            let embedding = decode_embedding(&blob).ok_or(StoreError::CorruptEmbedding {
                row: id,
                len: blob.len(),
            })?;
            let enrolled_at = DateTime::parse_from_rfc3339(&enrolled_at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| StoreError::CorruptTimestamp {
                    row: id,
                    value: enrolled_at.clone(),
                })?;
            db.enroll_entry(
                &label,
                FaceEntry {
                    embedding,
                    source_ref,
                    enrolled_at,
                },
            )?;
        }

        tracing::info!(people = db.stats().total_people, faces = db.len(), "face database loaded");
        Ok(db)
    }

    /// Replace the stored contents with `db` in a single transaction.
    pub fn save(&mut self, db: &FaceDatabase) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM faces", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO faces (label, embedding, source_ref, enrolled_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (label, entry) in db.iter() {
                insert.execute(params![
                    label,
                    encode_embedding(&entry.embedding),
                    entry.source_ref,
                    entry.enrolled_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        tracing::info!(faces = db.len(), "face database saved");
        Ok(())
    }

    /// Write a consistent copy of the store to `dest`.
    pub fn backup(&self, dest: &Path) -> Result<(), StoreError> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.conn
            .execute("VACUUM INTO ?1", params![dest.to_string_lossy().into_owned()])?;
        tracing::info!(dest = %dest.display(), "face store backed up");
        Ok(())
    }
}

/// Summary document for `db export`.
pub fn export_info(db: &FaceDatabase, models: &ModelInfo) -> serde_json::Value {
    serde_json::json!({
        "database_stats": db.stats(),
        "export_timestamp": Utc::now().to_rfc3339(),
        "model_info": models,
    })
}

fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding.values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Option<Embedding> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some(Embedding::new(values))
}
