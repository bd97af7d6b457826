//! Single-slot holder for the worker's most recent results.
//!
//! Readers get an `Arc` to a complete snapshot. A publish swaps the slot; a
//! published list is never touched again.

use crate::queue::ScaleFactors;
use facewatch_core::MatchResult;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// One published result list, with the scale that maps its boxes to display space.
#[derive(Debug, Clone)]
pub struct MatchSnapshot {
    pub results: Vec<MatchResult>,
    pub scale: ScaleFactors,
    /// Captured-frame index the results were computed from.
    pub sequence: u64,
    pub published_at: Instant,
}

pub struct ResultCache {
    slot: watch::Sender<Option<Arc<MatchSnapshot>>>,
}

impl ResultCache {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Replace the cached results wholesale.
    pub fn publish(&self, snapshot: MatchSnapshot) {
        self.slot.send_replace(Some(Arc::new(snapshot)));
    }

    /// Latest snapshot, or `None` if nothing has been published yet.
    pub fn latest(&self) -> Option<Arc<MatchSnapshot>> {
        self.slot.borrow().clone()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}
