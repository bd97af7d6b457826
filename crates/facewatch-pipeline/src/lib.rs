//! facewatch-pipeline — live recognition without stalling the display.
//!
//! The capture loop offers every frame to a [`FrameDispatcher`], which
//! downsizes every Kth one into a two-slot intake queue. A single
//! [`MatchingWorker`] thread drains the queue, resolves faces against the
//! [`FaceDatabase`](facewatch_core::FaceDatabase) and publishes each result
//! list wholesale into the [`ResultCache`]. The render side reads whatever
//! snapshot is current and never waits on the worker.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod pipeline;
pub mod queue;
pub mod render;
pub mod session;
pub mod worker;

pub use cache::{MatchSnapshot, ResultCache};
pub use config::{Config, ConfigError};
pub use dispatcher::{Dispatch, DispatchCounters, FrameDispatcher};
pub use pipeline::{start, Pipeline, PipelineConfig, PipelineError, PipelineState};
pub use queue::{ScaleFactors, INTAKE_CAPACITY};
pub use render::{find_system_font, load_font, Overlay, OverlayBox, OverlayError, OverlayStyle};
pub use session::{run_session, FrameSink, FrameSource, SessionError, SessionStats, StopReason};
pub use worker::{keep_result, MatchingWorker};
