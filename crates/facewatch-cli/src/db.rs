//! `facewatch db` subcommands.

use anyhow::{bail, Context, Result};
use facewatch_core::{largest_face, EmbeddingExtractor, FaceDatabase, FaceStore, ModelInfo};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Image files directly inside `dir`, sorted by name.
pub fn images_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    images.sort();
    Ok(images)
}

/// Enroll the largest face of `path` under `label`. Returns false when the
/// image cannot be read, extraction fails, or no face is found, so one bad
/// file does not abort a batch.
pub fn enroll_image<E: EmbeddingExtractor + ?Sized>(
    extractor: &mut E,
    db: &mut FaceDatabase,
    label: &str,
    path: &Path,
) -> Result<bool> {
    let image = match image::open(path) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not load image");
            return Ok(false);
        }
    };

    let faces = match extractor.extract(&image) {
        Ok(faces) => faces,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "face extraction failed");
            return Ok(false);
        }
    };
    let Some(face) = largest_face(&faces) else {
        tracing::warn!(path = %path.display(), "no face detected");
        return Ok(false);
    };

    db.enroll(label, face.embedding.clone(), &path.to_string_lossy())?;
    tracing::info!(label, path = %path.display(), "face enrolled");
    Ok(true)
}

pub fn enroll_images<E: EmbeddingExtractor + ?Sized>(
    extractor: &mut E,
    db: &mut FaceDatabase,
    label: &str,
    paths: &[PathBuf],
) -> Result<usize> {
    let mut added = 0;
    for path in paths {
        if enroll_image(extractor, db, label, path)? {
            added += 1;
        }
    }
    Ok(added)
}

/// Enroll `root/<label>/<image>` for every label directory under `root`.
pub fn load_structured<E: EmbeddingExtractor + ?Sized>(
    extractor: &mut E,
    db: &mut FaceDatabase,
    root: &Path,
) -> Result<usize> {
    if !root.is_dir() {
        bail!("directory not found: {}", root.display());
    }

    let mut people: Vec<PathBuf> = std::fs::read_dir(root)
        .with_context(|| format!("reading {}", root.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    people.sort();

    let mut added = 0;
    for dir in people {
        let Some(label) = dir.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            continue;
        };
        added += enroll_images(extractor, db, &label, &images_in(&dir)?)?;
    }
    Ok(added)
}

pub fn print_list(db: &FaceDatabase) {
    let stats = db.stats();
    println!("Total people: {}", stats.total_people);
    println!("Total faces:  {}", stats.total_faces);
    for (label, count) in &stats.people {
        println!("  - {label}: {count} face(s)");
    }
}

/// Print integrity findings. Returns true when the database is clean.
pub fn print_integrity(db: &FaceDatabase) -> bool {
    let report = db.check_integrity();
    if report.is_ok() {
        println!("Database integrity check passed");
        return true;
    }
    println!("Issues found:");
    for issue in &report.issues {
        println!("  - {issue}");
    }
    false
}

pub fn export(db: &FaceDatabase, models: &ModelInfo, out: &Path) -> Result<()> {
    let doc = facewatch_core::store::export_info(db, models);
    let text = serde_json::to_string_pretty(&doc)?;
    std::fs::write(out, text).with_context(|| format!("writing {}", out.display()))?;
    println!("Database info exported to {}", out.display());
    Ok(())
}

pub fn open_store(path: &Path) -> Result<(FaceStore, FaceDatabase)> {
    let store = FaceStore::open(path).with_context(|| format!("opening face store {}", path.display()))?;
    let db = store.load().context("loading face database")?;
    Ok((store, db))
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::{BoundingBox, Embedding, ExtractError, Face};
    use image::{Rgb, RgbImage};

    /// One face per image, embedding taken from the top-left pixel.
    struct FromPixel;

    impl EmbeddingExtractor for FromPixel {
        fn extract(&mut self, image: &RgbImage) -> Result<Vec<Face>, ExtractError> {
            let [r, g, b] = image.get_pixel(0, 0).0;
            if (r, g, b) == (0, 0, 0) {
                return Ok(Vec::new());
            }
            Ok(vec![Face {
                bbox: BoundingBox { x: 0.0, y: 0.0, width: 4.0, height: 4.0 },
                embedding: Embedding::new(vec![r as f32, g as f32, b as f32]),
                score: 1.0,
                age: None,
                gender: None,
            }])
        }
    }

    /// Fails on the `fail_on`-th call (1-based), otherwise behaves like `FromPixel`.
    struct FailsOnce {
        calls: usize,
        fail_on: usize,
    }

    impl EmbeddingExtractor for FailsOnce {
        fn extract(&mut self, image: &RgbImage) -> Result<Vec<Face>, ExtractError> {
            self.calls += 1;
            if self.calls == self.fail_on {
                return Err(ExtractError::Other("inference failed".into()));
            }
            FromPixel.extract(image)
        }
    }

    fn write_png(path: &Path, color: [u8; 3]) {
        RgbImage::from_pixel(8, 8, Rgb(color)).save(path).unwrap();
    }

    #[test]
    fn test_image_extensions() {
        assert!(is_image(Path::new("a/b.JPG")));
        assert!(is_image(Path::new("x.bmp")));
        assert!(!is_image(Path::new("notes.txt")));
        assert!(!is_image(Path::new("noext")));
    }

    #[test]
    fn test_load_structured_directory() {
        let dir = tempfile::tempdir().unwrap();
        for (person, colors) in [("alice", vec![[200, 10, 10], [190, 20, 10]]), ("bob", vec![[10, 200, 10], [0, 0, 0]])] {
            let p = dir.path().join(person);
            std::fs::create_dir(&p).unwrap();
            for (i, c) in colors.into_iter().enumerate() {
                write_png(&p.join(format!("{i}.png")), c);
            }
            std::fs::write(p.join("readme.txt"), "ignored").unwrap();
        }

        let mut db = FaceDatabase::new();
        let added = load_structured(&mut FromPixel, &mut db, dir.path()).unwrap();
        assert_eq!(added, 3);
        assert_eq!(db.entries("alice").len(), 2);
        assert_eq!(db.entries("bob").len(), 1);
        assert!(db.check_integrity().is_ok());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let mut db = FaceDatabase::new();
        assert!(load_structured(&mut FromPixel, &mut db, Path::new("/no/such/root")).is_err());
    }

    #[test]
    fn test_unreadable_image_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("broken.jpg");
        std::fs::write(&bogus, b"not an image").unwrap();

        let mut db = FaceDatabase::new();
        assert!(!enroll_image(&mut FromPixel, &mut db, "x", &bogus).unwrap());
        assert!(db.is_empty());
    }

    #[test]
    fn test_extraction_error_skips_image_and_keeps_batch() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..3)
            .map(|i| {
                let p = dir.path().join(format!("{i}.png"));
                write_png(&p, [100 + i as u8, 10, 10]);
                p
            })
            .collect();

        let mut extractor = FailsOnce { calls: 0, fail_on: 2 };
        let mut db = FaceDatabase::new();
        let added = enroll_images(&mut extractor, &mut db, "alice", &paths).unwrap();

        assert_eq!(added, 2);
        let sources: Vec<&str> = db.entries("alice").iter().map(|e| e.source_ref.as_str()).collect();
        assert_eq!(sources, vec![paths[0].to_str().unwrap(), paths[2].to_str().unwrap()]);
    }

    #[test]
    fn test_export_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = FaceDatabase::new();
        db.enroll("alice", Embedding::new(vec![1.0, 0.0]), "").unwrap();
        let out = dir.path().join("info.json");

        export(&db, &ModelInfo::in_dir(Path::new("/m")), &out).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(doc["database_stats"]["total_faces"], 1);
    }
}
