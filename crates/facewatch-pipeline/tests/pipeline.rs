use facewatch_core::{BoundingBox, Embedding, EmbeddingExtractor, ExtractError, Face, FaceDatabase, Identity};
use facewatch_pipeline::{Dispatch, Overlay, OverlayStyle, Pipeline, PipelineConfig, PipelineState};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reads the probe embedding out of the top-left pixel: red means alice,
/// green means bob, blue fails extraction, anything else is a stranger.
struct PixelCoded {
    calls: Arc<AtomicUsize>,
}

impl EmbeddingExtractor for PixelCoded {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<Face>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let [r, g, b] = image.get_pixel(0, 0).0;
        let values = if r > 200 {
            vec![1.0, 0.0, 0.0]
        } else if g > 200 {
            vec![0.0, 1.0, 0.0]
        } else if b > 200 {
            return Err(ExtractError::Other("unreadable frame".into()));
        } else {
            vec![0.0, 0.0, 1.0]
        };
        Ok(vec![Face {
            bbox: BoundingBox { x: 40.0, y: 30.0, width: 80.0, height: 60.0 },
            embedding: Embedding::new(values),
            score: 0.95,
            age: None,
            gender: None,
        }])
    }
}

fn database() -> Arc<FaceDatabase> {
    let mut db = FaceDatabase::new();
    db.enroll("alice", Embedding::new(vec![1.0, 0.0, 0.0]), "alice/1.jpg").unwrap();
    db.enroll("bob", Embedding::new(vec![0.0, 1.0, 0.0]), "bob/1.jpg").unwrap();
    Arc::new(db)
}

fn frame(color: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(640, 480, Rgb(color))
}

fn wait_for<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(v) = probe() {
            return Some(v);
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    None
}

fn config() -> PipelineConfig {
    PipelineConfig {
        decimation: 1,
        threshold: 0.5,
        ..PipelineConfig::default()
    }
}

#[test]
fn start_submit_read_stop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = facewatch_pipeline::start(
        database(),
        PixelCoded { calls: Arc::clone(&calls) },
        config(),
    )
    .unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);
    assert!(pipeline.latest_results().is_none());

    assert_eq!(pipeline.submit(&frame([255, 0, 0])), Dispatch::Queued);
    let snap = wait_for(Duration::from_secs(2), || pipeline.latest_results()).expect("results published");
    assert_eq!(snap.results.len(), 1);
    assert_eq!(snap.results[0].identity, Identity::Known("alice".into()));
    assert!((snap.results[0].similarity - 1.0).abs() < 1e-6);

    // Boxes come back in inference space with the factor to reach display space.
    let boxes = Overlay::layout(Some(&snap), 640, 480, &OverlayStyle::default());
    assert_eq!(boxes[0].rect, BoundingBox { x: 80.0, y: 60.0, width: 160.0, height: 120.0 });
    assert_eq!(boxes[0].caption, "alice (1.00)");

    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.submit(&frame([255, 0, 0])), Dispatch::Closed);
}

#[test]
fn results_are_replaced_not_merged() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = facewatch_pipeline::start(
        database(),
        PixelCoded { calls: Arc::clone(&calls) },
        config(),
    )
    .unwrap();

    pipeline.submit(&frame([255, 0, 0]));
    wait_for(Duration::from_secs(2), || {
        pipeline.latest_results().filter(|s| s.sequence == 0)
    })
    .expect("alice frame processed");

    pipeline.submit(&frame([0, 255, 0]));
    let snap = wait_for(Duration::from_secs(2), || {
        pipeline.latest_results().filter(|s| s.sequence == 1)
    })
    .expect("bob frame processed");
    assert_eq!(snap.results.len(), 1);
    assert_eq!(snap.results[0].identity, Identity::Known("bob".into()));

    // A stranger is orthogonal to both; it falls under the noise floor and
    // the published list is empty, clearing the overlay.
    pipeline.submit(&frame([10, 10, 10]));
    let snap = wait_for(Duration::from_secs(2), || {
        pipeline.latest_results().filter(|s| s.sequence == 2)
    })
    .expect("stranger frame processed");
    assert!(snap.results.is_empty());
}

#[test]
fn worker_keeps_running_after_bad_frame() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = facewatch_pipeline::start(
        database(),
        PixelCoded { calls: Arc::clone(&calls) },
        config(),
    )
    .unwrap();

    pipeline.submit(&frame([0, 0, 255]));
    wait_for(Duration::from_secs(2), || (calls.load(Ordering::SeqCst) >= 1).then_some(()))
        .expect("bad frame attempted");
    assert!(pipeline.latest_results().is_none());

    pipeline.submit(&frame([255, 0, 0]));
    let snap = wait_for(Duration::from_secs(2), || pipeline.latest_results()).expect("worker survived");
    assert_eq!(snap.results[0].identity, Identity::Known("alice".into()));
}

#[test]
fn decimation_bounds_extraction_calls() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::new(
        database(),
        PipelineConfig {
            decimation: 8,
            ..config()
        },
    )
    .unwrap();
    pipeline.start(PixelCoded { calls: Arc::clone(&calls) }).unwrap();

    let frame = frame([255, 0, 0]);
    for _ in 0..24 {
        pipeline.submit(&frame);
        std::thread::sleep(Duration::from_millis(2));
    }
    pipeline.stop();

    let counters = pipeline.counters();
    assert_eq!(counters.offered, 24);
    assert_eq!(counters.queued + counters.dropped, 3);
    assert!(calls.load(Ordering::SeqCst) <= 3);
}

#[test]
fn render_without_results_leaves_frame_untouched() {
    let pipeline = Pipeline::new(database(), config()).unwrap();
    let overlay = Overlay::new(OverlayStyle::default(), None);
    let mut image = frame([7, 7, 7]);
    overlay.render(&mut image, pipeline.latest_results().as_deref());
    assert!(image.pixels().all(|p| *p == Rgb([7, 7, 7])));
}
