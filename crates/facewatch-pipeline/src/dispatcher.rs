//! Frame dispatcher: decimates the capture stream and feeds the intake queue.

use crate::queue::{InferenceJob, IntakeSender, PushOutcome, ScaleFactors};
use image::imageops::{self, FilterType};
use image::RgbImage;

/// What happened to one offered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Not a Kth frame.
    Skipped,
    Queued,
    /// Kth frame, but the queue was full.
    Dropped,
    /// Worker is gone.
    Closed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchCounters {
    pub offered: u64,
    pub queued: u64,
    pub dropped: u64,
}

pub struct FrameDispatcher {
    sender: IntakeSender,
    decimation: u32,
    inference_size: (u32, u32),
    counters: DispatchCounters,
}

impl FrameDispatcher {
    /// `decimation` of 0 is treated as 1.
    pub fn new(sender: IntakeSender, decimation: u32, inference_size: (u32, u32)) -> Self {
        Self {
            sender,
            decimation: decimation.max(1),
            inference_size: (inference_size.0.max(1), inference_size.1.max(1)),
            counters: DispatchCounters::default(),
        }
    }

    /// Offer a captured frame. Every Kth frame (starting with the first) is
    /// downsized and pushed; the caller never blocks. A Kth frame arriving at
    /// a full queue is dropped before it is resized.
    pub fn offer(&mut self, frame: &RgbImage) -> Dispatch {
        let index = self.counters.offered;
        self.counters.offered += 1;

        if index % u64::from(self.decimation) != 0 {
            return Dispatch::Skipped;
        }

        if self.sender.is_closed() {
            return Dispatch::Closed;
        }
        // Single producer: if there is room now, the push below cannot be refused.
        if self.sender.is_full() {
            return self.drop_frame(index);
        }

        let (w, h) = self.inference_size;
        let image = if frame.dimensions() == (w, h) {
            frame.clone()
        } else {
            imageops::resize(frame, w, h, FilterType::Triangle)
        };
        let job = InferenceJob {
            image,
            scale: ScaleFactors::between(frame.dimensions(), (w, h)),
            sequence: index,
        };

        match self.sender.push(job) {
            PushOutcome::Queued => {
                self.counters.queued += 1;
                Dispatch::Queued
            }
            PushOutcome::Refused => self.drop_frame(index),
            PushOutcome::Closed => Dispatch::Closed,
        }
    }

    fn drop_frame(&mut self, index: u64) -> Dispatch {
        self.counters.dropped += 1;
        tracing::trace!(frame = index, "intake queue full; frame dropped");
        Dispatch::Dropped
    }

    pub fn counters(&self) -> DispatchCounters {
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{intake_queue, Pop, INTAKE_CAPACITY};

    #[test]
    fn test_every_kth_frame_submitted() {
        let (tx, mut rx) = intake_queue(64);
        let mut dispatcher = FrameDispatcher::new(tx, 8, (4, 3));
        let frame = RgbImage::new(8, 6);

        let outcomes: Vec<Dispatch> = (0..24).map(|_| dispatcher.offer(&frame)).collect();
        let queued: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == Dispatch::Queued)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(queued, vec![0, 8, 16]);

        let mut seqs = Vec::new();
        while let Pop::Job(job) = rx.pop() {
            assert_eq!(job.image.dimensions(), (4, 3));
            assert_eq!(job.scale, ScaleFactors { x: 2.0, y: 2.0 });
            seqs.push(job.sequence);
        }
        assert_eq!(seqs, vec![0, 8, 16]);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (tx, _rx) = intake_queue(INTAKE_CAPACITY);
        let mut dispatcher = FrameDispatcher::new(tx, 1, (2, 2));
        let frame = RgbImage::new(4, 4);

        assert_eq!(dispatcher.offer(&frame), Dispatch::Queued);
        assert_eq!(dispatcher.offer(&frame), Dispatch::Queued);
        assert_eq!(dispatcher.offer(&frame), Dispatch::Dropped);
        assert_eq!(
            dispatcher.counters(),
            DispatchCounters { offered: 3, queued: 2, dropped: 1 }
        );
    }

    #[test]
    fn test_full_queue_keeps_queued_jobs_untouched() {
        let (tx, mut rx) = intake_queue(INTAKE_CAPACITY);
        let mut dispatcher = FrameDispatcher::new(tx, 1, (2, 2));

        for shade in [10u8, 20, 30, 40] {
            dispatcher.offer(&RgbImage::from_pixel(4, 4, image::Rgb([shade; 3])));
        }
        assert_eq!(dispatcher.counters().dropped, 2);

        let mut shades = Vec::new();
        while let Pop::Job(job) = rx.pop() {
            shades.push(job.image.get_pixel(0, 0).0[0]);
        }
        assert_eq!(shades, vec![10, 20]);
    }

    #[test]
    fn test_closed_queue_reports_closed_even_when_full() {
        let (tx, rx) = intake_queue(1);
        let mut dispatcher = FrameDispatcher::new(tx, 1, (2, 2));
        let frame = RgbImage::new(2, 2);
        assert_eq!(dispatcher.offer(&frame), Dispatch::Queued);
        drop(rx);
        assert_eq!(dispatcher.offer(&frame), Dispatch::Closed);
        assert_eq!(dispatcher.counters().dropped, 0);
    }

    #[test]
    fn test_zero_decimation_behaves_as_one() {
        let (tx, _rx) = intake_queue(8);
        let mut dispatcher = FrameDispatcher::new(tx, 0, (2, 2));
        let frame = RgbImage::new(2, 2);
        assert_eq!(dispatcher.offer(&frame), Dispatch::Queued);
        assert_eq!(dispatcher.offer(&frame), Dispatch::Queued);
    }
}
