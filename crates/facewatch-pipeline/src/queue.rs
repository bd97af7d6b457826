//! Bounded intake queue between the capture loop and the matching worker.
//!
//! A push onto a full queue is refused immediately; the producer never
//! blocks and queued frames are never evicted.

use image::RgbImage;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

/// Maximum frames waiting for the worker.
pub const INTAKE_CAPACITY: usize = 2;

/// Per-axis factors mapping inference coordinates to display coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactors {
    pub x: f32,
    pub y: f32,
}

impl ScaleFactors {
    pub const IDENTITY: ScaleFactors = ScaleFactors { x: 1.0, y: 1.0 };

    /// Factors that map `inference` sized coordinates onto `display`.
    pub fn between(display: (u32, u32), inference: (u32, u32)) -> Self {
        Self {
            x: display.0 as f32 / inference.0.max(1) as f32,
            y: display.1 as f32 / inference.1.max(1) as f32,
        }
    }
}

/// A downsized frame waiting for matching.
#[derive(Debug, Clone)]
pub struct InferenceJob {
    pub image: RgbImage,
    /// Maps boxes found in `image` back to the captured frame.
    pub scale: ScaleFactors,
    /// Index of the captured frame this job was cut from.
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue full; the job was discarded.
    Refused,
    /// The worker side is gone.
    Closed,
}

pub struct IntakeSender {
    tx: mpsc::Sender<InferenceJob>,
}

pub struct IntakeReceiver {
    rx: mpsc::Receiver<InferenceJob>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Pop {
    Job(Box<InferenceJob>),
    Empty,
    Closed,
}

pub fn intake_queue(capacity: usize) -> (IntakeSender, IntakeReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IntakeSender { tx }, IntakeReceiver { rx })
}

impl IntakeSender {
    /// Non-blocking push.
    pub fn push(&self, job: InferenceJob) -> PushOutcome {
        match self.tx.try_send(job) {
            Ok(()) => PushOutcome::Queued,
            Err(TrySendError::Full(_)) => PushOutcome::Refused,
            Err(TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    /// Frames currently waiting.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// No room for another job right now.
    pub fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }

    /// The receiving worker has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl IntakeReceiver {
    /// Non-blocking pop of the oldest job.
    pub fn pop(&mut self) -> Pop {
        match self.rx.try_recv() {
            Ok(job) => Pop::Job(Box::new(job)),
            Err(TryRecvError::Empty) => Pop::Empty,
            Err(TryRecvError::Disconnected) => Pop::Closed,
        }
    }
}

impl PartialEq for InferenceJob {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence && self.scale == other.scale && self.image == other.image
    }
}

impl Eq for InferenceJob {}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(sequence: u64) -> InferenceJob {
        InferenceJob {
            image: RgbImage::new(2, 2),
            scale: ScaleFactors::IDENTITY,
            sequence,
        }
    }

    #[test]
    fn test_third_push_is_refused_without_blocking() {
        let (tx, mut rx) = intake_queue(INTAKE_CAPACITY);
        assert_eq!(tx.push(job(0)), PushOutcome::Queued);
        assert_eq!(tx.push(job(1)), PushOutcome::Queued);
        assert_eq!(tx.push(job(2)), PushOutcome::Refused);
        assert_eq!(tx.pending(), 2);
        assert!(tx.is_full());

        assert_eq!(rx.pop(), Pop::Job(Box::new(job(0))));
        assert_eq!(rx.pop(), Pop::Job(Box::new(job(1))));
        assert_eq!(rx.pop(), Pop::Empty);
    }

    #[test]
    fn test_space_frees_after_pop() {
        let (tx, mut rx) = intake_queue(INTAKE_CAPACITY);
        tx.push(job(0));
        tx.push(job(1));
        assert!(matches!(rx.pop(), Pop::Job(j) if j.sequence == 0));
        assert_eq!(tx.push(job(2)), PushOutcome::Queued);
        assert!(matches!(rx.pop(), Pop::Job(j) if j.sequence == 1));
        assert!(matches!(rx.pop(), Pop::Job(j) if j.sequence == 2));
    }

    #[test]
    fn test_closed_ends() {
        let (tx, rx) = intake_queue(INTAKE_CAPACITY);
        drop(rx);
        assert_eq!(tx.push(job(0)), PushOutcome::Closed);

        let (tx, mut rx) = intake_queue(INTAKE_CAPACITY);
        drop(tx);
        assert_eq!(rx.pop(), Pop::Closed);
    }

    #[test]
    fn test_scale_between() {
        let s = ScaleFactors::between((640, 480), (320, 240));
        assert_eq!(s, ScaleFactors { x: 2.0, y: 2.0 });
    }

    #[test]
    fn test_closed_when_receiver_dropped() {
        let (tx, rx) = intake_queue(INTAKE_CAPACITY);
        assert!(!tx.is_closed());
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.push(job(0)), PushOutcome::Closed);
    }
}
