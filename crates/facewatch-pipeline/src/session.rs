//! Capture/render loop: the pipeline's producer side.

use crate::dispatcher::{Dispatch, DispatchCounters};
use crate::pipeline::{Pipeline, PipelineError, PipelineState};
use crate::render::Overlay;
use facewatch_core::EmbeddingExtractor;
use facewatch_hw::{Camera, CameraError};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

const FPS_LOG_INTERVAL: u64 = 90;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Produces display frames; blocks until the next one is ready.
pub trait FrameSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn next_frame(&mut self) -> Result<RgbImage, Self::Error>;
}

/// Shows frames. `Ok(false)` means the viewer was closed.
pub trait FrameSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn present(&mut self, frame: &RgbImage) -> Result<bool, Self::Error>;
}

impl FrameSource for Camera {
    type Error = CameraError;

    fn next_frame(&mut self) -> Result<RgbImage, CameraError> {
        Ok(self.capture_frame()?.image)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// The source failed before the pipeline started.
    #[error("capture source unavailable: {0}")]
    SourceUnavailable(BoxError),
    #[error("capture failed: {0}")]
    Source(BoxError),
    #[error("display failed: {0}")]
    Sink(BoxError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    SinkClosed,
    StopRequested,
    WorkerGone,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionStats {
    pub frames_displayed: u64,
    pub frames_submitted: u64,
    pub frames_dropped: u64,
    pub elapsed: Duration,
    pub reason: StopReason,
}

impl SessionStats {
    pub fn average_fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames_displayed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Run a live session over an idle pipeline.
///
/// A first frame is captured before the worker starts; if that fails the
/// pipeline stays idle. The loop ends on sink close, on `stop`, or on a
/// capture/display error, and always stops the pipeline before returning.
pub fn run_session<S, K, E>(
    source: &mut S,
    sink: &mut K,
    pipeline: &mut Pipeline,
    extractor: E,
    overlay: &Overlay,
    stop: &AtomicBool,
) -> Result<SessionStats, SessionError>
where
    S: FrameSource,
    K: FrameSink,
    E: EmbeddingExtractor + Send + 'static,
{
    let first = source
        .next_frame()
        .map_err(|e| SessionError::SourceUnavailable(Box::new(e)))?;
    tracing::info!(width = first.width(), height = first.height(), "first frame captured");

    pipeline.start(extractor)?;
    let started = Instant::now();
    let outcome = drive(source, sink, pipeline, overlay, stop, first, started);
    // Measured before the worker join so shutdown does not count against FPS.
    let elapsed = started.elapsed();
    pipeline.stop();

    let reason = outcome?;
    let DispatchCounters { queued, dropped, .. } = pipeline.counters();
    let stats = SessionStats {
        // Every displayed frame is offered to the dispatcher exactly once.
        frames_displayed: pipeline.counters().offered,
        frames_submitted: queued,
        frames_dropped: dropped,
        elapsed,
        reason,
    };
    tracing::info!(
        displayed = stats.frames_displayed,
        submitted = stats.frames_submitted,
        dropped = stats.frames_dropped,
        fps = stats.average_fps(),
        reason = ?stats.reason,
        "session ended"
    );
    Ok(stats)
}

fn drive<S: FrameSource, K: FrameSink>(
    source: &mut S,
    sink: &mut K,
    pipeline: &mut Pipeline,
    overlay: &Overlay,
    stop: &AtomicBool,
    first: RgbImage,
    started: Instant,
) -> Result<StopReason, SessionError> {
    let mut frame = first;
    let mut window_start = started;

    loop {
        if stop.load(Ordering::Acquire) {
            return Ok(StopReason::StopRequested);
        }

        if pipeline.submit(&frame) == Dispatch::Closed && pipeline.state() == PipelineState::Running {
            tracing::warn!("matching worker exited unexpectedly");
            return Ok(StopReason::WorkerGone);
        }

        let snapshot = pipeline.latest_results();
        overlay.render(&mut frame, snapshot.as_deref());

        if !sink.present(&frame).map_err(|e| SessionError::Sink(Box::new(e)))? {
            return Ok(StopReason::SinkClosed);
        }

        let shown = pipeline.counters().offered;
        if shown % FPS_LOG_INTERVAL == 0 {
            let fps = FPS_LOG_INTERVAL as f64 / window_start.elapsed().as_secs_f64().max(f64::EPSILON);
            tracing::debug!(frames = shown, fps, "render rate");
            window_start = Instant::now();
        }

        frame = source.next_frame().map_err(|e| SessionError::Source(Box::new(e)))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineConfig;
    use crate::render::OverlayStyle;
    use facewatch_core::{BoundingBox, Embedding, ExtractError, Face, FaceDatabase};
    use image::Rgb;
    use std::sync::Arc;

    #[derive(Debug, Error)]
    #[error("no more frames")]
    struct Exhausted;

    struct Frames {
        remaining: usize,
    }

    impl FrameSource for Frames {
        type Error = Exhausted;

        fn next_frame(&mut self) -> Result<RgbImage, Exhausted> {
            if self.remaining == 0 {
                return Err(Exhausted);
            }
            self.remaining -= 1;
            Ok(RgbImage::new(64, 48))
        }
    }

    /// Closes after `limit` frames; records whether any overlay pixel was drawn.
    struct Viewer {
        limit: usize,
        shown: usize,
        saw_overlay: bool,
        delay: Duration,
    }

    impl FrameSink for Viewer {
        type Error = Exhausted;

        fn present(&mut self, frame: &RgbImage) -> Result<bool, Exhausted> {
            self.shown += 1;
            self.saw_overlay |= frame.pixels().any(|p| *p == Rgb([0, 255, 0]));
            std::thread::sleep(self.delay);
            Ok(self.shown < self.limit)
        }
    }

    struct OneFace;

    impl EmbeddingExtractor for OneFace {
        fn extract(&mut self, _image: &RgbImage) -> Result<Vec<Face>, ExtractError> {
            Ok(vec![Face {
                bbox: BoundingBox { x: 4.0, y: 4.0, width: 8.0, height: 8.0 },
                embedding: Embedding::new(vec![1.0, 0.0]),
                score: 0.9,
                age: None,
                gender: None,
            }])
        }
    }

    /// Signals when extraction begins, then holds the worker busy.
    struct Busy {
        started: Arc<AtomicBool>,
        hold: Duration,
    }

    impl EmbeddingExtractor for Busy {
        fn extract(&mut self, _image: &RgbImage) -> Result<Vec<Face>, ExtractError> {
            self.started.store(true, Ordering::Release);
            std::thread::sleep(self.hold);
            Ok(Vec::new())
        }
    }

    /// Closes on the first frame once the worker is mid-extraction.
    struct CloseWhenBusy {
        started: Arc<AtomicBool>,
    }

    impl FrameSink for CloseWhenBusy {
        type Error = Exhausted;

        fn present(&mut self, _frame: &RgbImage) -> Result<bool, Exhausted> {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !self.started.load(Ordering::Acquire) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(false)
        }
    }

    fn pipeline() -> Pipeline {
        let mut db = FaceDatabase::new();
        db.enroll("alice", Embedding::new(vec![1.0, 0.0]), "").unwrap();
        let config = PipelineConfig {
            decimation: 2,
            inference_size: (32, 24),
            ..PipelineConfig::default()
        };
        Pipeline::new(Arc::new(db), config).unwrap()
    }

    fn overlay() -> Overlay {
        Overlay::new(OverlayStyle::default(), None)
    }

    #[test]
    fn test_unavailable_source_keeps_pipeline_idle() {
        let mut pipeline = pipeline();
        let mut viewer = Viewer { limit: 10, shown: 0, saw_overlay: false, delay: Duration::ZERO };
        let stop = AtomicBool::new(false);

        let err = run_session(&mut Frames { remaining: 0 }, &mut viewer, &mut pipeline, OneFace, &overlay(), &stop)
            .unwrap_err();
        assert!(matches!(err, SessionError::SourceUnavailable(_)));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(viewer.shown, 0);
    }

    #[test]
    fn test_session_runs_until_viewer_closes() {
        let mut pipeline = pipeline();
        let mut viewer = Viewer { limit: 40, shown: 0, saw_overlay: false, delay: Duration::from_millis(2) };
        let stop = AtomicBool::new(false);

        let stats = run_session(
            &mut Frames { remaining: 1000 },
            &mut viewer,
            &mut pipeline,
            OneFace,
            &overlay(),
            &stop,
        )
        .unwrap();

        assert_eq!(stats.reason, StopReason::SinkClosed);
        assert_eq!(stats.frames_displayed, 40);
        assert_eq!(stats.frames_submitted + stats.frames_dropped, 20);
        assert!(viewer.saw_overlay);
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_elapsed_excludes_worker_shutdown() {
        let mut pipeline = pipeline();
        let started = Arc::new(AtomicBool::new(false));
        let extractor = Busy { started: Arc::clone(&started), hold: Duration::from_millis(400) };
        let mut sink = CloseWhenBusy { started };
        let stop = AtomicBool::new(false);

        let wall = Instant::now();
        let stats = run_session(&mut Frames { remaining: 10 }, &mut sink, &mut pipeline, extractor, &overlay(), &stop)
            .unwrap();
        let wall = wall.elapsed();

        assert_eq!(stats.reason, StopReason::SinkClosed);
        assert!(wall >= Duration::from_millis(300), "stop returned before the worker finished: {wall:?}");
        assert!(stats.elapsed < Duration::from_millis(300), "elapsed included shutdown: {:?}", stats.elapsed);
    }

    #[test]
    fn test_stop_flag_ends_session() {
        let mut pipeline = pipeline();
        let mut viewer = Viewer { limit: usize::MAX, shown: 0, saw_overlay: false, delay: Duration::ZERO };
        let stop = AtomicBool::new(true);

        let stats = run_session(&mut Frames { remaining: 5 }, &mut viewer, &mut pipeline, OneFace, &overlay(), &stop)
            .unwrap();
        assert_eq!(stats.reason, StopReason::StopRequested);
        assert_eq!(stats.frames_displayed, 0);
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }

    #[test]
    fn test_source_failure_mid_session_stops_pipeline() {
        let mut pipeline = pipeline();
        let mut viewer = Viewer { limit: usize::MAX, shown: 0, saw_overlay: false, delay: Duration::ZERO };
        let stop = AtomicBool::new(false);

        let err = run_session(&mut Frames { remaining: 3 }, &mut viewer, &mut pipeline, OneFace, &overlay(), &stop)
            .unwrap_err();
        assert!(matches!(err, SessionError::Source(_)));
        assert_eq!(viewer.shown, 3);
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }
}
