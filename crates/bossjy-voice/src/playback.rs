//! Playback handles and the single-occupancy playback slot ("the floor").
//!
//! At most one [`PlaybackHandle`] is active at any time. A handle ends exactly once,
//! either completed or cancelled; whichever happens first wins and the other call
//! becomes a no-op.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ACTIVE: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug)]
struct HandleInner {
    id: u64,
    token: CancellationToken,
    status: AtomicU8,
}

/// One in-flight synthesis + playback operation.
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    inner: Arc<HandleInner>,
}

impl PlaybackHandle {
    fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                token: CancellationToken::new(),
                status: AtomicU8::new(ACTIVE),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Token observed by the synthesizer; cancelled exactly when the handle is.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn status(&self) -> PlaybackStatus {
        match self.inner.status.load(Ordering::Acquire) {
            ACTIVE => PlaybackStatus::Active,
            COMPLETED => PlaybackStatus::Completed,
            _ => PlaybackStatus::Cancelled,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status() == PlaybackStatus::Active
    }

    /// Cancel the playback. Returns `true` only for the call that actually ended it.
    pub fn cancel(&self) -> bool {
        let won = self
            .inner
            .status
            .compare_exchange(ACTIVE, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.inner.token.cancel();
            debug!("playback #{} cancelled", self.inner.id);
        }
        won
    }

    /// Mark natural completion. Returns `false` if the handle was already cancelled.
    pub fn complete(&self) -> bool {
        self.inner
            .status
            .compare_exchange(ACTIVE, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Shared slot holding the current playback handle, if any.
#[derive(Debug, Clone, Default)]
pub struct PlaybackSlot {
    current: Arc<Mutex<Option<PlaybackHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl PlaybackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<PlaybackHandle>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Occupy the slot with a fresh handle. A handle still active in the slot is
    /// cancelled first so the one-active-handle invariant holds.
    pub fn begin(&self) -> PlaybackHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = PlaybackHandle::new(id);
        let mut slot = self.lock();
        if let Some(previous) = slot.take() {
            if previous.cancel() {
                warn!("playback #{} was still active when #{} began", previous.id(), id);
            }
        }
        *slot = Some(handle.clone());
        handle
    }

    /// Handle currently holding the floor, if it is still active.
    pub fn active(&self) -> Option<PlaybackHandle> {
        self.lock().as_ref().filter(|h| h.is_active()).cloned()
    }

    /// Cancel whatever is playing. Returns the id of the handle this call cancelled.
    pub fn cancel_active(&self) -> Option<u64> {
        let slot = self.lock();
        slot.as_ref().filter(|h| h.cancel()).map(|h| h.id())
    }

    /// Empty the slot if it still holds handle `id`.
    pub fn release(&self, id: u64) -> bool {
        let mut slot = self.lock();
        if slot.as_ref().map(|h| h.id()) == Some(id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Cancel and drop the current handle.
    pub fn clear(&self) -> Option<u64> {
        let mut slot = self.lock();
        slot.take().map(|h| {
            h.cancel();
            h.id()
        })
    }

    /// 0 or 1.
    pub fn active_count(&self) -> usize {
        usize::from(self.active().is_some())
    }
}
