//! Scan requests and their dispatch order.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A queued scan as reported by the job queue.
///
/// Only the fields needed for ordering and tier matching are kept.
/// Timestamps are Unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub id: String,
    /// Size of the scan in the queue's unit of work.
    pub size_metric: u64,
    /// Explicit position in the queue, if the queue assigned one.
    pub queue_position: Option<u32>,
    pub queued_on: Option<u64>,
    pub created_on: Option<u64>,
}

impl ScanRequest {
    pub fn new(id: impl Into<String>, size_metric: u64) -> Self {
        Self {
            id: id.into(),
            size_metric,
            queue_position: None,
            queued_on: None,
            created_on: None,
        }
    }

    pub fn with_queue_position(mut self, position: u32) -> Self {
        self.queue_position = Some(position);
        self
    }

    pub fn with_queued_on(mut self, at: u64) -> Self {
        self.queued_on = Some(at);
        self
    }

    pub fn with_created_on(mut self, at: u64) -> Self {
        self.created_on = Some(at);
        self
    }
}

/// Total order used to dispatch queued scans.
///
/// 1. Explicit queue position, ascending; scans without one sort after
///    those with one.
/// 2. Enqueue time, ascending; a missing time sorts first.
/// 3. Creation time, ascending; a missing time sorts first.
pub fn dispatch_order(a: &ScanRequest, b: &ScanRequest) -> Ordering {
    let position = |r: &ScanRequest| (r.queue_position.is_none(), r.queue_position);

    position(a)
        .cmp(&position(b))
        .then_with(|| a.queued_on.cmp(&b.queued_on))
        .then_with(|| a.created_on.cmp(&b.created_on))
}

/// Sort a queue snapshot into dispatch order (stable).
pub fn sort_queue(queue: &mut [ScanRequest]) {
    queue.sort_by(dispatch_order);
}
