//! Channel types for the mirror pipeline.
//!
//! Producers (generator, watcher, session replay) -> Scheduler -> Status reducer.
//! Both hops are unbounded: backpressure comes from the admission gate, not
//! from the queues.

use crate::error::MirrorError;
use crate::storage::Entry;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

// =============================================================================
// WorkItem: producers -> Scheduler
// =============================================================================

/// One side of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// User-facing URL
    pub url: String,
    pub entry: Entry,
}

/// A single copy or delete, carrying everything a worker needs.
///
/// Check `error` first: an item with an error has no payload guarantees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// 1-based position in the planned sequence; 0 for error items
    pub seq: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Endpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Endpoint>,

    /// Index of the target client this item writes to
    pub target_slot: usize,

    /// Running totals at creation time
    pub total_count: u64,
    pub total_bytes: u64,

    #[serde(skip)]
    pub error: Option<Arc<MirrorError>>,
}

/// What a well-formed item asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Copy,
    Delete,
}

impl WorkItem {
    pub fn copy(
        source: Endpoint,
        target: Endpoint,
        target_slot: usize,
        totals: (u64, u64),
    ) -> Self {
        Self {
            seq: totals.0,
            source: Some(source),
            target: Some(target),
            target_slot,
            total_count: totals.0,
            total_bytes: totals.1,
            error: None,
        }
    }

    pub fn delete(target: Endpoint, target_slot: usize, totals: (u64, u64)) -> Self {
        Self {
            seq: totals.0,
            source: None,
            target: Some(target),
            target_slot,
            total_count: totals.0,
            total_bytes: totals.1,
            error: None,
        }
    }

    /// An item that only reports a failure. Never counted.
    pub fn failed(
        source: Option<Endpoint>,
        target: Option<Endpoint>,
        target_slot: usize,
        error: MirrorError,
    ) -> Self {
        Self {
            seq: 0,
            source,
            target,
            target_slot,
            total_count: 0,
            total_bytes: 0,
            error: Some(Arc::new(error)),
        }
    }

    pub fn with_error(mut self, error: MirrorError) -> Self {
        self.error = Some(Arc::new(error));
        self
    }

    pub fn action(&self) -> Option<Action> {
        if self.error.is_some() {
            return None;
        }
        match (&self.source, &self.target) {
            (Some(_), Some(_)) => Some(Action::Copy),
            (None, Some(_)) => Some(Action::Delete),
            _ => None,
        }
    }

    /// Bytes this item moves (0 for deletes)
    pub fn size(&self) -> u64 {
        self.source.as_ref().map(|s| s.entry.size).unwrap_or(0)
    }

    /// Key the item is about, source side preferred
    pub fn key(&self) -> &str {
        self.source
            .as_ref()
            .or(self.target.as_ref())
            .map(|e| e.entry.key.as_str())
            .unwrap_or_default()
    }
}

// =============================================================================
// Running totals shared by producers
// =============================================================================

/// Monotonic (count, bytes) totals. The generator and the watcher both grow
/// them; the pair is updated under one lock so a returned snapshot is never
/// torn between two concurrent records.
#[derive(Debug, Default)]
pub struct RunningTotals {
    inner: Mutex<(u64, u64)>,
}

impl RunningTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from a resumed session's totals.
    pub fn starting_at(count: u64, bytes: u64) -> Self {
        Self {
            inner: Mutex::new((count, bytes)),
        }
    }

    /// Count one item of `bytes` and return the totals including it.
    pub fn record(&self, bytes: u64) -> (u64, u64) {
        let mut totals = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        totals.0 += 1;
        totals.1 += bytes;
        *totals
    }

    pub fn snapshot(&self) -> (u64, u64) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// StatusEvent: Scheduler -> Status reducer
// =============================================================================

#[derive(Debug)]
pub enum StatusEvent {
    /// Item is about to be dispatched and is not yet in the session log
    Planned(WorkItem),
    /// Transfer or removal finished
    Completed(WorkItem),
    /// Fake mode: reported as done, no I/O happened
    Simulated(WorkItem),
    /// Finished in an earlier run of this session
    Replayed(WorkItem),
    /// Source vanished before it could be read; treated as done, not reported
    Dropped(WorkItem),
    /// `item.error` says why
    Failed(WorkItem),
}

// =============================================================================
// Channel types
// =============================================================================

pub type WorkSender = mpsc::UnboundedSender<WorkItem>;
pub type WorkReceiver = mpsc::UnboundedReceiver<WorkItem>;
pub type StatusSender = mpsc::UnboundedSender<StatusEvent>;
pub type StatusReceiver = mpsc::UnboundedReceiver<StatusEvent>;

pub fn work_channel() -> (WorkSender, WorkReceiver) {
    mpsc::unbounded_channel()
}

pub fn status_channel() -> (StatusSender, StatusReceiver) {
    mpsc::unbounded_channel()
}
