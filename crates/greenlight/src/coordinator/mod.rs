use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::directory::SessionDirectory;
use crate::error::Error;
use crate::registry::RequestRegistry;
use crate::transport::ChatTransport;
use crate::types::{HitlRequest, ReplySelection};

mod timeout;
pub use timeout::{TimeoutQueue, TimeoutScheduler};

/// Choice replies whose option text matches one of these are recorded as not
/// approved. A conservative default: the option set is authored by the agent,
/// and strict consumers should inspect `response` directly.
const DENY_OPTIONS: [&str; 4] = ["cancel", "reject", "deny", "no"];

/// Free-text replies matching one of these (case-insensitive, trimmed) are
/// recorded as approved; anything else is not.
const APPROVE_KEYWORDS: [&str; 5] = ["yes", "approve", "ok", "confirm", "accept"];

fn choice_approved(option_text: &str) -> bool {
    let normalized = option_text.trim().to_lowercase();
    !DENY_OPTIONS.contains(&normalized.as_str())
}

fn free_text_approved(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    APPROVE_KEYWORDS.contains(&normalized.as_str())
}

/// Outcome of feeding a human reply back through the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The reply won the transition; the request is now completed.
    Recorded { response: String, approved: bool },
    /// The request is unknown or already terminal; the reply was dropped.
    /// The human may be told the request is no longer accepting responses.
    Stale,
    /// The reply was malformed (e.g. an out-of-range option index) and was
    /// dropped without touching the request.
    Invalid,
}

/// Parameters for a new HITL submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitParams {
    pub session_id: String,
    pub client_id: String,
    pub message: String,
    pub options: Vec<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub timeout_seconds: Option<u64>,
}

/// Per-request completion signals for `wait` callers.
///
/// A broadcast channel is created lazily on subscription and torn down when
/// the request settles (signal) or the last waiter leaves (release).
pub(crate) struct Waiters {
    channels: RwLock<HashMap<Uuid, broadcast::Sender<()>>>,
}

impl Waiters {
    fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn subscribe(&self, id: Uuid) -> broadcast::Receiver<()> {
        if let Ok(mut channels) = self.channels.write() {
            channels
                .entry(id)
                .or_insert_with(|| broadcast::channel(8).0)
                .subscribe()
        } else {
            // Poisoned lock: hand back a receiver that closes immediately so
            // the waiter degrades to polling the registry.
            broadcast::channel(1).0.subscribe()
        }
    }

    pub(crate) fn signal(&self, id: Uuid) {
        if let Ok(mut channels) = self.channels.write()
            && let Some(tx) = channels.remove(&id)
        {
            let _ = tx.send(());
        }
    }

    fn release(&self, id: Uuid) {
        if let Ok(mut channels) = self.channels.write()
            && let Some(tx) = channels.get(&id)
            && tx.receiver_count() == 0
        {
            channels.remove(&id);
        }
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.channels.read().map(|c| c.len()).unwrap_or(0)
    }
}

/// The request coordination engine: accepts submissions, enforces the
/// invariants, drives the request state machine, wakes waiters and feeds the
/// timeout queue. All shared state lives in the store; the coordinator holds
/// no lock across a chat-transport call.
pub struct Coordinator {
    directory: Arc<SessionDirectory>,
    registry: Arc<RequestRegistry>,
    transport: Arc<dyn ChatTransport>,
    waiters: Arc<Waiters>,
    timeouts: Arc<TimeoutQueue>,
    default_timeout_seconds: u64,
    max_pending_requests: usize,
}

impl Coordinator {
    pub fn new(
        directory: Arc<SessionDirectory>,
        registry: Arc<RequestRegistry>,
        transport: Arc<dyn ChatTransport>,
        default_timeout_seconds: u64,
        max_pending_requests: usize,
    ) -> Self {
        Self {
            directory,
            registry,
            transport,
            waiters: Arc::new(Waiters::new()),
            timeouts: Arc::new(TimeoutQueue::new()),
            default_timeout_seconds,
            max_pending_requests,
        }
    }

    /// Build the background scheduler that fires request timeouts. Spawn its
    /// `run` once at startup.
    pub fn timeout_scheduler(&self) -> TimeoutScheduler {
        TimeoutScheduler::new(
            self.timeouts.clone(),
            self.registry.clone(),
            self.waiters.clone(),
        )
    }

    /// Submit a new HITL request: validate, route through the session
    /// binding, persist, deliver the prompt, and schedule the timeout.
    ///
    /// The caller observes either a successfully submitted request or an
    /// error, never a dangling pending request. A transport failure rolls
    /// the freshly created record back to `canceled`.
    pub async fn submit(&self, params: SubmitParams) -> Result<HitlRequest, Error> {
        if params.session_id.trim().is_empty() {
            return Err(Error::InvalidArgument("session_id must not be empty".into()));
        }
        if params.client_id.trim().is_empty() {
            return Err(Error::InvalidArgument("client_id must not be empty".into()));
        }
        if params.message.trim().is_empty() {
            return Err(Error::InvalidArgument("message must not be empty".into()));
        }
        let timeout_seconds = params.timeout_seconds.unwrap_or(self.default_timeout_seconds);
        if timeout_seconds == 0 {
            return Err(Error::InvalidArgument(
                "timeout_seconds must be positive".into(),
            ));
        }

        let session = self.directory.lookup(&params.session_id)?;
        if !session.active {
            return Err(Error::SessionInactive(params.session_id));
        }

        let mut request = HitlRequest::new(
            Uuid::new_v4(),
            params.session_id,
            params.client_id,
            params.message,
            params.options,
            params.metadata,
            timeout_seconds,
        );

        // The counted insert enforces the backpressure ceiling atomically;
        // concurrent submissions can never push the pending count past it.
        match self
            .registry
            .create_bounded(request.clone(), self.max_pending_requests)
        {
            Ok(()) => {}
            Err(Error::Duplicate(_)) => {
                // Astronomically unlikely with v4 ids; one retry with a
                // fresh id per the contract.
                request.id = Uuid::new_v4();
                self.registry
                    .create_bounded(request.clone(), self.max_pending_requests)?;
            }
            Err(e) => return Err(e),
        }

        match self
            .transport
            .send_prompt(session.human_address, &request)
            .await
        {
            Ok(message_id) => {
                request.transport_message_id = Some(message_id);
                // The prompt is already in front of the human; losing the
                // message handle is not worth failing the submission over.
                if let Err(e) = self
                    .registry
                    .attach_transport_message(request.id, message_id)
                {
                    tracing::warn!(
                        request_id = %request.id,
                        error = %e,
                        "failed to persist transport message id"
                    );
                }
            }
            Err(e) => {
                if let Err(rollback) = self.registry.cancel(request.id) {
                    tracing::error!(
                        request_id = %request.id,
                        error = %rollback,
                        "failed to roll back request after transport error"
                    );
                }
                self.waiters.signal(request.id);
                tracing::warn!(
                    request_id = %request.id,
                    error = %e,
                    "prompt delivery failed, request canceled"
                );
                return Err(e);
            }
        }

        self.timeouts.schedule(request.deadline(), request.id);
        tracing::info!(
            request_id = %request.id,
            client_id = %request.client_id,
            session_id = %request.session_id,
            timeout_seconds,
            "HITL request submitted"
        );
        Ok(request)
    }

    /// Pure read of the current request state.
    pub fn poll(&self, id: Uuid) -> Result<HitlRequest, Error> {
        self.registry.get(id)
    }

    /// Wait until the request becomes terminal or `wait_budget` elapses with
    /// `WaitElapsed` (a timeout of the wait, not of the request). Dropping
    /// the returned future leaves the request untouched.
    pub async fn wait(&self, id: Uuid, wait_budget: Duration) -> Result<HitlRequest, Error> {
        let deadline = tokio::time::Instant::now() + wait_budget;
        let mut rx = self.waiters.subscribe(id);

        let result = loop {
            match self.registry.get(id) {
                Ok(request) if request.status.is_terminal() => break Ok(request),
                Ok(_) => {}
                Err(e) => break Err(e),
            }

            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(())) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    // Signal already consumed by channel teardown. Degrade to
                    // bounded polling: short pause, fresh subscription, re-read.
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    rx = self.waiters.subscribe(id);
                }
                Err(_) => break Err(Error::WaitElapsed),
            }
        };

        drop(rx);
        self.waiters.release(id);
        result
    }

    /// Agent-initiated cancellation; transitions the request and wakes all
    /// waiters.
    pub fn cancel(&self, id: Uuid) -> Result<(), Error> {
        self.registry.cancel(id)?;
        self.waiters.signal(id);
        tracing::info!(request_id = %id, "request canceled");
        Ok(())
    }

    /// Snapshot of pending requests, oldest first.
    pub fn list_pending(&self) -> Result<Vec<HitlRequest>, Error> {
        self.registry.list_pending()
    }

    /// Feed a parsed human reply back into the state machine. Unknown,
    /// already-terminal, or malformed replies are dropped and logged; the
    /// winner of a race with cancel/timeout is whichever transition commits
    /// first.
    pub fn deliver_reply(&self, id: Uuid, selection: ReplySelection) -> Result<ReplyOutcome, Error> {
        let request = match self.registry.get(id) {
            Ok(request) => request,
            Err(Error::NotFound(_)) => {
                tracing::warn!(request_id = %id, "reply for unknown request dropped");
                return Ok(ReplyOutcome::Stale);
            }
            Err(e) => return Err(e),
        };
        if request.status.is_terminal() {
            tracing::debug!(request_id = %id, status = ?request.status, "reply for settled request dropped");
            return Ok(ReplyOutcome::Stale);
        }

        let (response, approved) = match selection {
            ReplySelection::Choice { option_index } => match request.options.get(option_index) {
                Some(text) => (text.clone(), choice_approved(text)),
                None => {
                    tracing::warn!(
                        request_id = %id,
                        option_index,
                        options = request.options.len(),
                        "choice reply with out-of-range option index dropped"
                    );
                    return Ok(ReplyOutcome::Invalid);
                }
            },
            ReplySelection::FreeText(text) => {
                let trimmed = text.trim().to_string();
                let approved = free_text_approved(&trimmed);
                (trimmed, approved)
            }
        };

        match self.registry.complete(id, &response, approved) {
            Ok(()) => {}
            Err(Error::AlreadyTerminal(_)) => {
                tracing::debug!(request_id = %id, "reply lost the settlement race");
                return Ok(ReplyOutcome::Stale);
            }
            Err(e) => return Err(e),
        }
        self.waiters.signal(id);
        tracing::info!(request_id = %id, approved, "human reply recorded");
        Ok(ReplyOutcome::Recorded { response, approved })
    }

    /// Re-arm timeouts for every pending request, from
    /// `created_at + timeout_seconds`. Called once at startup when the store
    /// is durable so prompts submitted before a restart still expire.
    pub fn restore_pending_timeouts(&self) -> Result<usize, Error> {
        let pending = self.registry.list_pending()?;
        let count = pending.len();
        for request in pending {
            self.timeouts.schedule(request.deadline(), request.id);
        }
        if count > 0 {
            tracing::info!(count, "re-scheduled timeouts for pending requests");
        }
        Ok(count)
    }
}
