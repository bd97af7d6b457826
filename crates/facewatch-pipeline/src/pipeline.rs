//! Pipeline controller and lifecycle.
//!
//! `Idle -> Running -> Stopping -> Stopped`. The controller owns the state;
//! the worker only watches the stop flag.

use crate::cache::{MatchSnapshot, ResultCache};
use crate::dispatcher::{Dispatch, DispatchCounters, FrameDispatcher};
use crate::queue::{intake_queue, INTAKE_CAPACITY};
use crate::worker::MatchingWorker;
use facewatch_core::{CosineResolver, EmbeddingExtractor, FaceDatabase};
use image::RgbImage;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid pipeline setting: {0}")]
    InvalidConfig(String),
    #[error("pipeline already started (state: {0})")]
    AlreadyStarted(PipelineState),
    #[error("failed to spawn matching worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
        })
    }
}

/// Tunables for one pipeline instance.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Resolver acceptance threshold.
    pub threshold: f32,
    /// Submit every Kth captured frame.
    pub decimation: u32,
    /// Frames are downsized to this before extraction.
    pub inference_size: (u32, u32),
    /// Unknown results at or below this similarity are discarded.
    pub noise_floor: f32,
    pub idle_poll: Duration,
    pub join_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            decimation: 8,
            inference_size: (320, 240),
            noise_floor: 0.15,
            idle_poll: Duration::from_millis(1),
            join_timeout: Duration::from_secs(1),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.decimation == 0 {
            return Err(PipelineError::InvalidConfig("decimation must be at least 1".into()));
        }
        if self.inference_size.0 == 0 || self.inference_size.1 == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "inference size must be non-zero, got {}x{}",
                self.inference_size.0, self.inference_size.1
            )));
        }
        if !(-1.0..=1.0).contains(&self.threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "threshold must be within [-1, 1], got {}",
                self.threshold
            )));
        }
        if !self.noise_floor.is_finite() {
            return Err(PipelineError::InvalidConfig("noise floor must be finite".into()));
        }
        Ok(())
    }
}

struct Active {
    dispatcher: FrameDispatcher,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

pub struct Pipeline {
    database: Arc<FaceDatabase>,
    config: PipelineConfig,
    state: PipelineState,
    cache: Arc<ResultCache>,
    active: Option<Active>,
    counters: DispatchCounters,
}

impl Pipeline {
    /// An idle pipeline over a loaded database.
    pub fn new(database: Arc<FaceDatabase>, config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            database,
            config,
            state: PipelineState::Idle,
            cache: Arc::new(ResultCache::new()),
            active: None,
            counters: DispatchCounters::default(),
        })
    }

    /// Spawn the matching worker. Only valid from `Idle`.
    pub fn start<E>(&mut self, extractor: E) -> Result<(), PipelineError>
    where
        E: EmbeddingExtractor + Send + 'static,
    {
        if self.state != PipelineState::Idle {
            return Err(PipelineError::AlreadyStarted(self.state));
        }

        let (tx, rx) = intake_queue(INTAKE_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let worker = MatchingWorker {
            extractor,
            resolver: CosineResolver,
            database: Arc::clone(&self.database),
            threshold: self.config.threshold,
            noise_floor: self.config.noise_floor,
            idle_poll: self.config.idle_poll,
            intake: rx,
            cache: Arc::clone(&self.cache),
            stop: Arc::clone(&stop),
        };

        let handle = std::thread::Builder::new()
            .name("facewatch-worker".into())
            .spawn(move || worker.run())?;

        self.active = Some(Active {
            dispatcher: FrameDispatcher::new(tx, self.config.decimation, self.config.inference_size),
            stop,
            worker: handle,
        });
        self.state = PipelineState::Running;
        tracing::info!(
            faces = self.database.len(),
            threshold = self.config.threshold,
            decimation = self.config.decimation,
            "pipeline running"
        );
        Ok(())
    }

    /// Offer a captured frame for matching. Never blocks.
    pub fn submit(&mut self, frame: &RgbImage) -> Dispatch {
        match (&mut self.active, self.state) {
            (Some(active), PipelineState::Running) => active.dispatcher.offer(frame),
            _ => Dispatch::Closed,
        }
    }

    /// Most recent results, or `None` before the first publish.
    pub fn latest_results(&self) -> Option<Arc<MatchSnapshot>> {
        self.cache.latest()
    }

    /// Signal the worker and wait up to the join timeout. A worker still
    /// busy after the deadline is detached. Idempotent.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            if self.state == PipelineState::Idle {
                self.state = PipelineState::Stopped;
            }
            return;
        };

        self.state = PipelineState::Stopping;
        tracing::info!("pipeline stopping");
        self.counters = active.dispatcher.counters();
        active.stop.store(true, Ordering::Release);
        // Closing the queue also ends a worker that is between jobs.
        drop(active.dispatcher);

        let deadline = Instant::now() + self.config.join_timeout;
        while !active.worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(self.config.idle_poll.max(Duration::from_millis(1)));
        }

        if active.worker.is_finished() {
            if active.worker.join().is_err() {
                tracing::warn!("matching worker panicked");
            }
        } else {
            tracing::warn!(
                timeout_ms = self.config.join_timeout.as_millis() as u64,
                "matching worker did not stop in time; detaching"
            );
        }

        self.state = PipelineState::Stopped;
        tracing::info!(
            queued = self.counters.queued,
            dropped = self.counters.dropped,
            "pipeline stopped"
        );
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Dispatch counters; frozen once the pipeline stops.
    pub fn counters(&self) -> DispatchCounters {
        self.active
            .as_ref()
            .map(|a| a.dispatcher.counters())
            .unwrap_or(self.counters)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build and start a pipeline in one step.
pub fn start<E>(
    database: Arc<FaceDatabase>,
    extractor: E,
    config: PipelineConfig,
) -> Result<Pipeline, PipelineError>
where
    E: EmbeddingExtractor + Send + 'static,
{
    let mut pipeline = Pipeline::new(database, config)?;
    pipeline.start(extractor)?;
    Ok(pipeline)
}
