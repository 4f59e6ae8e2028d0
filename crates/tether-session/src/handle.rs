//! A cloneable handle for poking the controller from external code.

use crate::coordinator::GenerationCounter;
use crate::health::Visibility;
use crate::reconcile::ReprobeGuard;
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A cloneable handle for poking the controller from external code.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) generation: GenerationCounter,
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    pub(crate) abort_requested: Arc<AtomicBool>,
    pub(crate) visibility: Arc<Mutex<Visibility>>,
    pub(crate) reprobe: Arc<Mutex<ReprobeGuard>>,
    pub(crate) wake: Arc<Notify>,
    pub(crate) is_streaming: Arc<AtomicBool>,
}

impl SessionHandle {
    pub(crate) fn new(generation: GenerationCounter) -> Self {
        Self {
            generation,
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            abort_requested: Arc::new(AtomicBool::new(false)),
            visibility: Arc::new(Mutex::new(Visibility::Foreground)),
            reprobe: Arc::new(Mutex::new(ReprobeGuard::default())),
            wake: Arc::new(Notify::new()),
            is_streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request an abort of the running turn (deferred while tools run).
    pub fn abort(&self) {
        self.abort_requested.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Report page visibility changes.
    pub fn set_visibility(&self, visibility: Visibility) {
        *self.visibility.lock() = visibility;
        if visibility == Visibility::Background {
            self.reprobe.lock().on_background(self.is_streaming());
        }
        self.wake.notify_one();
    }

    /// Stop applying records from the current connection, e.g. on navigation away.
    pub fn supersede(&self) {
        self.generation.advance();
        self.cancel.lock().cancel();
        self.wake.notify_one();
    }

    /// Whether a stream is currently being driven.
    pub fn is_streaming(&self) -> bool {
        self.is_streaming.load(Ordering::Acquire)
    }

    pub fn visibility(&self) -> Visibility {
        *self.visibility.lock()
    }

    pub(crate) fn take_abort_request(&self) -> bool {
        self.abort_requested.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn fresh_cancel_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        self.is_streaming.store(streaming, Ordering::Release);
    }
}
