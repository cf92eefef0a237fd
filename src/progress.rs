//! Progress reporting and cancellation.
//!
//! A run reports on a single 0-100 scale: preprocessing owns the first 30
//! points and encoding the remaining 70.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::ConversionResult;

/// Share of the progress scale owned by preprocessing.
pub const PREPROCESS_BUDGET: u8 = 30;

/// Represents the stage a progress update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressPhase {
    /// Normalizing and sharpening source frames
    Preprocessing,
    /// Encoder is consuming processed frames
    Encoding,
}

/// A single progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    /// Overall completion, 0 to 100
    pub percent: u8,
}

/// Receives progress and the terminal result of a run.
///
/// `on_complete` is called exactly once per run, after the last
/// `on_progress`.
pub trait ConversionObserver: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
    fn on_complete(&self, result: &ConversionResult);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConversionObserver for NoopObserver {
    fn on_progress(&self, _event: ProgressEvent) {}
    fn on_complete(&self, _result: &ConversionResult) {}
}

/// Cooperative cancellation flag shared between the caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Forwards progress to an observer, clamping to 100 and never letting the
/// reported value go backwards.
pub(crate) struct ProgressTracker<'a> {
    observer: &'a dyn ConversionObserver,
    last: Mutex<Option<u8>>,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(observer: &'a dyn ConversionObserver) -> Self {
        Self {
            observer,
            last: Mutex::new(None),
        }
    }

    pub(crate) fn report(&self, phase: ProgressPhase, percent: u8) {
        let percent = percent.min(100);
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if last.is_some_and(|prev| percent <= prev) {
            return;
        }
        *last = Some(percent);
        self.observer.on_progress(ProgressEvent { phase, percent });
    }

    pub(crate) fn last(&self) -> Option<u8> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}
