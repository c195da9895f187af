use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Waiters;
use crate::error::Error;
use crate::registry::RequestRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TimeoutEntry {
    fire_at: DateTime<Utc>,
    request_id: Uuid,
}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.request_id.cmp(&other.request_id))
    }
}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Time-ordered set of `(fire_at, request_id)` entries feeding the scheduler.
/// Adding an entry nudges the scheduler awake in case the new deadline is
/// earlier than the one it is sleeping toward.
pub struct TimeoutQueue {
    entries: Mutex<BinaryHeap<Reverse<TimeoutEntry>>>,
    added: Notify,
}

impl TimeoutQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(BinaryHeap::new()),
            added: Notify::new(),
        }
    }

    pub fn schedule(&self, fire_at: DateTime<Utc>, request_id: Uuid) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(Reverse(TimeoutEntry {
                fire_at,
                request_id,
            }));
        }
        self.added.notify_one();
    }

    fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.peek().map(|Reverse(entry)| entry.fire_at))
    }

    fn pop_due(&self, now: DateTime<Utc>) -> Option<TimeoutEntry> {
        let mut entries = self.entries.lock().ok()?;
        if entries
            .peek()
            .is_some_and(|Reverse(entry)| entry.fire_at <= now)
        {
            entries.pop().map(|Reverse(entry)| entry)
        } else {
            None
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

/// Background loop that expires pending requests at their deadline.
///
/// Sleeps until the next fire time (or a wakeup nudge when a new entry is
/// added earlier), then transitions each due request to `timeout` and signals
/// its waiters. Requests that already settled are skipped.
pub struct TimeoutScheduler {
    queue: Arc<TimeoutQueue>,
    registry: Arc<RequestRegistry>,
    waiters: Arc<Waiters>,
}

impl TimeoutScheduler {
    pub(crate) fn new(
        queue: Arc<TimeoutQueue>,
        registry: Arc<RequestRegistry>,
        waiters: Arc<Waiters>,
    ) -> Self {
        Self {
            queue,
            registry,
            waiters,
        }
    }

    /// Run the scheduler loop. Blocks until cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let now = Utc::now();
            while let Some(entry) = self.queue.pop_due(now) {
                self.fire(entry.request_id);
            }

            match self.queue.next_deadline() {
                Some(deadline) => {
                    let sleep_for = (deadline - Utc::now())
                        .to_std()
                        .unwrap_or(std::time::Duration::ZERO);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!("timeout scheduler shutting down");
                            return;
                        }
                        _ = self.queue.added.notified() => {}
                        _ = tokio::time::sleep(sleep_for) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!("timeout scheduler shutting down");
                            return;
                        }
                        _ = self.queue.added.notified() => {}
                    }
                }
            }
        }
    }

    fn fire(&self, request_id: Uuid) {
        match self.registry.timeout(request_id) {
            Ok(()) => {
                tracing::info!(request_id = %request_id, "request timed out");
                self.waiters.signal(request_id);
            }
            Err(Error::AlreadyTerminal(_)) | Err(Error::NotFound(_)) => {
                tracing::debug!(request_id = %request_id, "timeout fired on settled request");
            }
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "failed to time out request");
            }
        }
    }
}
