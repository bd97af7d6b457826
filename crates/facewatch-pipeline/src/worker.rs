//! Matching worker: the one background thread that runs extraction.

use crate::cache::{MatchSnapshot, ResultCache};
use crate::queue::{InferenceJob, IntakeReceiver, Pop};
use facewatch_core::{EmbeddingExtractor, ExtractError, FaceDatabase, MatchResult, Resolver};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Keep a result if its identity is known or its similarity clears `noise_floor`.
pub fn keep_result(result: &MatchResult, noise_floor: f32) -> bool {
    result.identity.is_known() || result.similarity > noise_floor
}

pub struct MatchingWorker<E, R> {
    pub(crate) extractor: E,
    pub(crate) resolver: R,
    pub(crate) database: Arc<FaceDatabase>,
    pub(crate) threshold: f32,
    pub(crate) noise_floor: f32,
    pub(crate) idle_poll: Duration,
    pub(crate) intake: IntakeReceiver,
    pub(crate) cache: Arc<ResultCache>,
    pub(crate) stop: Arc<AtomicBool>,
}

impl<E: EmbeddingExtractor, R: Resolver> MatchingWorker<E, R> {
    /// Run until the stop flag is raised or the intake queue closes.
    pub fn run(mut self) {
        tracing::info!("matching worker started");
        let mut processed = 0u64;
        let mut failed = 0u64;

        while !self.stop.load(Ordering::Acquire) {
            let job = match self.intake.pop() {
                Pop::Job(job) => job,
                Pop::Empty => {
                    std::thread::sleep(self.idle_poll);
                    continue;
                }
                Pop::Closed => break,
            };

            let sequence = job.sequence;
            let scale = job.scale;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(&job)));
            match outcome {
                Ok(Ok(results)) => {
                    processed += 1;
                    self.cache.publish(MatchSnapshot {
                        results,
                        scale,
                        sequence,
                        published_at: Instant::now(),
                    });
                }
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::debug!(frame = sequence, error = %e, "frame skipped");
                }
                Err(_) => {
                    failed += 1;
                    tracing::debug!(frame = sequence, "extractor panicked; frame skipped");
                }
            }
        }

        tracing::info!(processed, failed, "matching worker exiting");
    }

    /// Extract, resolve and filter one job.
    fn process(&mut self, job: &InferenceJob) -> Result<Vec<MatchResult>, ExtractError> {
        let faces = self.extractor.extract(&job.image)?;
        let results: Vec<MatchResult> = faces
            .iter()
            .map(|face| {
                let resolution = self.resolver.resolve(&face.embedding, &self.database, self.threshold);
                MatchResult::from_face(face, resolution)
            })
            .filter(|r| keep_result(r, self.noise_floor))
            .collect();

        for r in results.iter().filter(|r| r.identity.is_known()) {
            tracing::debug!(frame = job.sequence, label = r.identity.label(), similarity = r.similarity, "recognized");
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{intake_queue, ScaleFactors};
    use facewatch_core::{BoundingBox, CosineResolver, Embedding, Face, Identity};
    use image::RgbImage;
    use std::collections::VecDeque;

    /// Replays a script of per-call outcomes; `None` panics.
    struct Scripted(VecDeque<Option<Result<Vec<Face>, ExtractError>>>);

    impl EmbeddingExtractor for Scripted {
        fn extract(&mut self, _image: &RgbImage) -> Result<Vec<Face>, ExtractError> {
            match self.0.pop_front() {
                Some(Some(outcome)) => outcome,
                Some(None) => panic!("scripted panic"),
                None => Ok(Vec::new()),
            }
        }
    }

    fn face(values: &[f32]) -> Face {
        Face {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 5.0, height: 5.0 },
            embedding: Embedding::new(values.to_vec()),
            score: 0.9,
            age: None,
            gender: None,
        }
    }

    fn database() -> Arc<FaceDatabase> {
        let mut db = FaceDatabase::new();
        db.enroll("alice", Embedding::new(vec![1.0, 0.0]), "").unwrap();
        Arc::new(db)
    }

    fn job(sequence: u64) -> InferenceJob {
        InferenceJob {
            image: RgbImage::new(2, 2),
            scale: ScaleFactors::IDENTITY,
            sequence,
        }
    }

    fn worker(
        script: Vec<Option<Result<Vec<Face>, ExtractError>>>,
    ) -> (MatchingWorker<Scripted, CosineResolver>, crate::queue::IntakeSender, Arc<ResultCache>, Arc<AtomicBool>) {
        let (tx, rx) = intake_queue(8);
        let cache = Arc::new(ResultCache::new());
        let stop = Arc::new(AtomicBool::new(false));
        let worker = MatchingWorker {
            extractor: Scripted(script.into()),
            resolver: CosineResolver,
            database: database(),
            threshold: 0.5,
            noise_floor: 0.15,
            idle_poll: Duration::from_millis(1),
            intake: rx,
            cache: Arc::clone(&cache),
            stop: Arc::clone(&stop),
        };
        (worker, tx, cache, stop)
    }

    #[test]
    fn test_noise_floor_filter() {
        let result = |identity, similarity| MatchResult {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0 },
            identity,
            similarity,
            age: None,
            gender: None,
        };
        assert!(keep_result(&result(Identity::Known("a".into()), 0.0), 0.15));
        assert!(keep_result(&result(Identity::Unknown, 0.3), 0.15));
        assert!(!keep_result(&result(Identity::Unknown, 0.15), 0.15));
        assert!(!keep_result(&result(Identity::Unknown, -0.4), 0.15));
    }

    #[test]
    fn test_worker_survives_failures_and_publishes_later_frames() {
        let (worker, tx, cache, _stop) = worker(vec![
            Some(Err(ExtractError::Other("bad frame".into()))),
            None,
            Some(Ok(vec![face(&[1.0, 0.0]), face(&[0.0, 1.0]), face(&[0.5, 0.5])])),
        ]);
        for seq in 0..3 {
            tx.push(job(seq));
        }
        drop(tx);
        worker.run();

        let snap = cache.latest().expect("third frame published");
        assert_eq!(snap.sequence, 2);
        // alice kept, orthogonal unknown (0.0) filtered, diagonal unknown (~0.707) is Known at 0.5.
        assert_eq!(snap.results.len(), 2);
        assert!(snap.results.iter().all(|r| r.identity.is_known()));
    }

    #[test]
    fn test_worker_stops_on_flag() {
        let (worker, _tx, cache, stop) = worker(Vec::new());
        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(10));
        stop.store(true, Ordering::Release);
        handle.join().unwrap();
        assert!(cache.latest().is_none());
    }

    #[test]
    fn test_empty_extraction_publishes_empty_list() {
        let (worker, tx, cache, _stop) = worker(vec![Some(Ok(Vec::new()))]);
        tx.push(job(7));
        drop(tx);
        worker.run();
        let snap = cache.latest().unwrap();
        assert_eq!(snap.sequence, 7);
        assert!(snap.results.is_empty());
    }
}
