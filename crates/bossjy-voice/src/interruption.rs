//! Barge-in: the assistant stops talking the moment the user starts.
//!
//! The controller sits on the recognizer's raw event path, ahead of the
//! orchestrator's inbound queue, so a cancellation does not wait behind other
//! pending work.

use crate::orchestrator::PipelineState;
use crate::playback::PlaybackSlot;
use crate::recognizer::RecognizerEvent;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct InterruptionController {
    floor: PlaybackSlot,
    state: watch::Receiver<PipelineState>,
}

impl InterruptionController {
    pub fn new(floor: PlaybackSlot, state: watch::Receiver<PipelineState>) -> Self {
        Self { floor, state }
    }

    /// Cancel active playback if `event` is speech heard while speaking.
    /// Returns the id of the handle this call cancelled.
    pub fn observe(&self, event: &RecognizerEvent) -> Option<u64> {
        let RecognizerEvent::Utterance(utterance) = event else {
            return None;
        };
        if *self.state.borrow() != PipelineState::Speaking {
            return None;
        }
        let cancelled = self.floor.cancel_active();
        if let Some(id) = cancelled {
            info!(
                "⚡ Barge-in: user speaking ({}), playback #{} cancelled",
                if utterance.is_final { "final" } else { "partial" },
                id
            );
        }
        cancelled
    }
}
