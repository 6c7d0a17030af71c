// src/ccp/correlation.rs

//! Scatter/gather bookkeeping for requests awaiting replies.
//!
//! The tracker enforces no deadlines. An entry stays resident until all of its
//! expected replies arrive or somebody calls [`CorrelationTracker::cancel`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::ccp::Dispatch;
use crate::error::{Error, Result};

/// Receives each reply that matches a pending request
pub trait ReplyCallback: Send + Sync {
    fn on_reply(&self, dispatch: &Dispatch);
}

impl<F> ReplyCallback for F
where
    F: Fn(&Dispatch) + Send + Sync,
{
    fn on_reply(&self, dispatch: &Dispatch) {
        self(dispatch)
    }
}

struct PendingRequest {
    callback: Arc<dyn ReplyCallback>,
    remaining: usize,
    registered_at: Instant,
}

/// Pending request table, keyed by the request's event id
#[derive(Default)]
pub struct CorrelationTracker {
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl fmt::Debug for CorrelationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationTracker")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request expecting `expected_count` replies.
    ///
    /// Must happen before the publish that can trigger those replies.
    pub fn register(
        &self,
        event_id: u64,
        callback: Arc<dyn ReplyCallback>,
        expected_count: usize,
    ) -> Result<()> {
        if expected_count == 0 {
            return Err(Error::correlation(
                event_id,
                "A pending request must expect at least one reply",
            ));
        }

        let mut pending = self.pending.lock();
        if pending.contains_key(&event_id) {
            return Err(Error::correlation(
                event_id,
                format!("Event {} already has a pending request", event_id),
            ));
        }
        pending.insert(
            event_id,
            PendingRequest {
                callback,
                remaining: expected_count,
                registered_at: Instant::now(),
            },
        );
        tracing::trace!("Registered event {} expecting {} replies", event_id, expected_count);
        Ok(())
    }

    /// Routes one reply to its pending request.
    ///
    /// Returns `false` when nothing is waiting on `correlation_id` (late,
    /// duplicate, or unsolicited replies); those are dropped silently.
    pub fn on_reply(&self, correlation_id: u64, dispatch: &Dispatch) -> bool {
        let callback = {
            let mut pending = self.pending.lock();
            let Some(entry) = pending.get_mut(&correlation_id) else {
                return false;
            };
            entry.remaining -= 1;
            let callback = Arc::clone(&entry.callback);
            if entry.remaining == 0 {
                if let Some(done) = pending.remove(&correlation_id) {
                    tracing::trace!(
                        "Event {} complete after {:?}",
                        correlation_id,
                        done.registered_at.elapsed()
                    );
                }
            }
            callback
        };

        // Invoked outside the lock so callbacks may issue requests of their own.
        callback.on_reply(dispatch);
        true
    }

    /// Drops a pending request. Later replies to it are ignored.
    pub fn cancel(&self, event_id: u64) -> bool {
        self.pending.lock().remove(&event_id).is_some()
    }

    /// Replies still expected for `event_id`
    pub fn remaining(&self, event_id: u64) -> Option<usize> {
        self.pending.lock().get(&event_id).map(|entry| entry.remaining)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
