use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Error;
use crate::types::{HitlRequest, RequestStatus, Session};

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Narrow persistence interface the session directory, request registry and
/// coordinator depend on. Conditional updates are atomic compare-and-set on
/// the request status; readers never observe a torn value.
pub trait Store: Send + Sync {
    /// Insert a new session. Fails with `Duplicate` if the id exists,
    /// active or deactivated.
    fn create_session(&self, session: Session) -> Result<(), Error>;

    /// Explicit re-registration: replace an existing *deactivated* session
    /// with a fresh active binding. Fails with `Duplicate` if the existing
    /// record is still active, `NotFound` if absent.
    fn reregister_session(&self, session: Session) -> Result<(), Error>;

    /// Tombstone a session. `NotFound` if absent; idempotent ok when the
    /// session is already deactivated.
    fn deactivate_session(&self, session_id: &str) -> Result<(), Error>;

    fn get_session(&self, session_id: &str) -> Result<Option<Session>, Error>;

    fn list_active_sessions(&self) -> Result<Vec<Session>, Error>;

    /// Active sessions bound to a client, ordered by `created_at` ascending.
    fn active_sessions_for_client(&self, client_id: &str) -> Result<Vec<Session>, Error>;

    /// Insert a new pending request. Fails with `Duplicate` on id collision.
    fn create_request(&self, request: HitlRequest) -> Result<(), Error>;

    /// Counted insert: verify the pending count is below `max_pending` and
    /// insert in one atomic operation, so concurrent submissions can never
    /// push the pending count past the ceiling. Fails with `Overloaded` at
    /// or above the ceiling, `Duplicate` on id collision.
    fn create_request_bounded(
        &self,
        request: HitlRequest,
        max_pending: usize,
    ) -> Result<(), Error>;

    fn get_request(&self, id: Uuid) -> Result<Option<HitlRequest>, Error>;

    /// Atomic `pending → completed`, setting `response`, `approved` and
    /// `responded_at` together. `AlreadyTerminal` on any non-pending state.
    fn update_request_response(
        &self,
        id: Uuid,
        response: &str,
        approved: bool,
        now: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Atomic `pending → canceled`; `AlreadyTerminal` otherwise.
    fn cancel_request(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), Error>;

    /// Atomic `pending → timeout`; `AlreadyTerminal` otherwise.
    fn timeout_request(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), Error>;

    /// Record the chat message handle for a still-pending request. A request
    /// that already settled keeps its frozen attributes; the call is then a
    /// no-op.
    fn attach_transport_message(&self, id: Uuid, transport_message_id: i32) -> Result<(), Error>;

    /// Snapshot of pending requests, ordered by `created_at` ascending.
    fn list_pending_requests(&self) -> Result<Vec<HitlRequest>, Error>;
}

/// In-memory store backed by `std::sync::RwLock` maps.
///
/// Uses `std::sync::RwLock` (not tokio) because locks are never held across
/// `.await` boundaries. No durability: pending requests are lost on restart.
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    requests: RwLock<HashMap<Uuid, HitlRequest>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            requests: RwLock::new(HashMap::new()),
        }
    }

    /// Apply a terminal transition if the request is still pending.
    fn transition(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut HitlRequest),
    ) -> Result<(), Error> {
        let mut requests = self
            .requests
            .write()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("request {id}")))?;
        if request.status.is_terminal() {
            return Err(Error::AlreadyTerminal(id));
        }
        apply(request);
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for InMemoryStore {
    fn create_session(&self, session: Session) -> Result<(), Error> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        if sessions.contains_key(&session.session_id) {
            return Err(Error::Duplicate(format!("session {}", session.session_id)));
        }
        sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    fn reregister_session(&self, session: Session) -> Result<(), Error> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        match sessions.get(&session.session_id) {
            None => Err(Error::NotFound(format!("session {}", session.session_id))),
            Some(existing) if existing.active => {
                Err(Error::Duplicate(format!("session {}", session.session_id)))
            }
            Some(_) => {
                sessions.insert(session.session_id.clone(), session);
                Ok(())
            }
        }
    }

    fn deactivate_session(&self, session_id: &str) -> Result<(), Error> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        session.active = false;
        Ok(())
    }

    fn get_session(&self, session_id: &str) -> Result<Option<Session>, Error> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        Ok(sessions.get(session_id).cloned())
    }

    fn list_active_sessions(&self) -> Result<Vec<Session>, Error> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        let mut active: Vec<Session> = sessions.values().filter(|s| s.active).cloned().collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    fn active_sessions_for_client(&self, client_id: &str) -> Result<Vec<Session>, Error> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        let mut matching: Vec<Session> = sessions
            .values()
            .filter(|s| s.active && s.client_id == client_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }

    fn create_request(&self, request: HitlRequest) -> Result<(), Error> {
        let mut requests = self
            .requests
            .write()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        if requests.contains_key(&request.id) {
            return Err(Error::Duplicate(format!("request {}", request.id)));
        }
        requests.insert(request.id, request);
        Ok(())
    }

    fn create_request_bounded(
        &self,
        request: HitlRequest,
        max_pending: usize,
    ) -> Result<(), Error> {
        // Count and insert under one write lock so the ceiling holds under
        // concurrent submissions.
        let mut requests = self
            .requests
            .write()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        if requests.contains_key(&request.id) {
            return Err(Error::Duplicate(format!("request {}", request.id)));
        }
        let pending = requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .count();
        if pending >= max_pending {
            return Err(Error::Overloaded(max_pending));
        }
        requests.insert(request.id, request);
        Ok(())
    }

    fn get_request(&self, id: Uuid) -> Result<Option<HitlRequest>, Error> {
        let requests = self
            .requests
            .read()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        Ok(requests.get(&id).cloned())
    }

    fn update_request_response(
        &self,
        id: Uuid,
        response: &str,
        approved: bool,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.transition(id, |request| {
            request.status = RequestStatus::Completed;
            request.response = Some(response.to_string());
            request.approved = approved;
            request.responded_at = Some(now);
        })
    }

    fn cancel_request(&self, id: Uuid, _now: DateTime<Utc>) -> Result<(), Error> {
        self.transition(id, |request| {
            request.status = RequestStatus::Canceled;
        })
    }

    fn timeout_request(&self, id: Uuid, _now: DateTime<Utc>) -> Result<(), Error> {
        self.transition(id, |request| {
            request.status = RequestStatus::Timeout;
        })
    }

    fn attach_transport_message(&self, id: Uuid, transport_message_id: i32) -> Result<(), Error> {
        let mut requests = self
            .requests
            .write()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("request {id}")))?;
        if request.status == RequestStatus::Pending {
            request.transport_message_id = Some(transport_message_id);
        }
        Ok(())
    }

    fn list_pending_requests(&self) -> Result<Vec<HitlRequest>, Error> {
        let requests = self
            .requests
            .read()
            .map_err(|e| Error::Store(format!("lock poisoned: {e}")))?;
        let mut pending: Vec<HitlRequest> = requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn make_request(id: Uuid) -> HitlRequest {
        HitlRequest::new(
            id,
            "s1",
            "c1",
            "Deploy?",
            vec!["Deploy".into(), "Cancel".into()],
            StdHashMap::new(),
            300,
        )
    }

    #[test]
    fn create_and_get_session() {
        let store = InMemoryStore::new();
        store.create_session(Session::new("s1", "c1", 42)).unwrap();

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.client_id, "c1");
        assert_eq!(session.human_address, 42);
        assert!(session.active);
    }

    #[test]
    fn create_session_duplicate_rejected() {
        let store = InMemoryStore::new();
        store.create_session(Session::new("s1", "c1", 42)).unwrap();
        let err = store
            .create_session(Session::new("s1", "c2", 43))
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn create_session_rejects_deactivated_id() {
        let store = InMemoryStore::new();
        store.create_session(Session::new("s1", "c1", 42)).unwrap();
        store.deactivate_session("s1").unwrap();

        // Plain registration takes the rejecting default even for tombstones.
        let err = store
            .create_session(Session::new("s1", "c1", 42))
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn reregister_replaces_deactivated() {
        let store = InMemoryStore::new();
        store.create_session(Session::new("s1", "c1", 42)).unwrap();
        store.deactivate_session("s1").unwrap();

        store
            .reregister_session(Session::new("s1", "c2", 99))
            .unwrap();
        let session = store.get_session("s1").unwrap().unwrap();
        assert!(session.active);
        assert_eq!(session.client_id, "c2");
        assert_eq!(session.human_address, 99);
    }

    #[test]
    fn reregister_active_rejected() {
        let store = InMemoryStore::new();
        store.create_session(Session::new("s1", "c1", 42)).unwrap();
        let err = store
            .reregister_session(Session::new("s1", "c2", 99))
            .unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn reregister_unknown_rejected() {
        let store = InMemoryStore::new();
        let err = store
            .reregister_session(Session::new("ghost", "c1", 42))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn deactivate_is_idempotent() {
        let store = InMemoryStore::new();
        store.create_session(Session::new("s1", "c1", 42)).unwrap();
        store.deactivate_session("s1").unwrap();
        store.deactivate_session("s1").unwrap();
        assert!(!store.get_session("s1").unwrap().unwrap().active);
    }

    #[test]
    fn deactivate_unknown_returns_not_found() {
        let store = InMemoryStore::new();
        let err = store.deactivate_session("ghost").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn list_active_excludes_tombstones() {
        let store = InMemoryStore::new();
        store.create_session(Session::new("s1", "c1", 1)).unwrap();
        store.create_session(Session::new("s2", "c2", 2)).unwrap();
        store.deactivate_session("s1").unwrap();

        let active = store.list_active_sessions().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "s2");
    }

    #[test]
    fn active_sessions_for_client_ordered_oldest_first() {
        let store = InMemoryStore::new();
        let mut older = Session::new("s1", "c1", 1);
        older.created_at = Utc::now() - chrono::Duration::hours(2);
        let mut newer = Session::new("s2", "c1", 2);
        newer.created_at = Utc::now() - chrono::Duration::hours(1);
        store.create_session(newer).unwrap();
        store.create_session(older).unwrap();
        store.create_session(Session::new("s3", "other", 3)).unwrap();

        let matching = store.active_sessions_for_client("c1").unwrap();
        assert_eq!(matching.len(), 2);
        assert_eq!(matching[0].session_id, "s1");
        assert_eq!(matching[1].session_id, "s2");
    }

    #[test]
    fn create_and_get_request() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.create_request(make_request(id)).unwrap();

        let request = store.get_request(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.message, "Deploy?");
    }

    #[test]
    fn create_request_duplicate_rejected() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.create_request(make_request(id)).unwrap();
        let err = store.create_request(make_request(id)).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn get_unknown_request_returns_none() {
        let store = InMemoryStore::new();
        assert!(store.get_request(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn bounded_create_below_ceiling() {
        let store = InMemoryStore::new();
        store
            .create_request_bounded(make_request(Uuid::new_v4()), 2)
            .unwrap();
        store
            .create_request_bounded(make_request(Uuid::new_v4()), 2)
            .unwrap();
    }

    #[test]
    fn bounded_create_rejects_at_ceiling() {
        let store = InMemoryStore::new();
        store
            .create_request_bounded(make_request(Uuid::new_v4()), 1)
            .unwrap();
        let err = store
            .create_request_bounded(make_request(Uuid::new_v4()), 1)
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded(1)));
    }

    #[test]
    fn bounded_create_duplicate_detected_before_ceiling() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.create_request_bounded(make_request(id), 1).unwrap();
        let err = store.create_request_bounded(make_request(id), 1).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn bounded_create_ignores_settled_requests() {
        let store = InMemoryStore::new();
        let settled = Uuid::new_v4();
        store.create_request_bounded(make_request(settled), 1).unwrap();
        store.cancel_request(settled, Utc::now()).unwrap();

        // Terminal requests do not count toward the pending ceiling.
        store
            .create_request_bounded(make_request(Uuid::new_v4()), 1)
            .unwrap();
    }

    #[test]
    fn bounded_create_holds_ceiling_under_concurrency() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                store.create_request_bounded(make_request(Uuid::new_v4()), 5)
            }));
        }

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Result::is_ok)
            .count();
        assert_eq!(accepted, 5, "exactly the ceiling may be admitted");
        assert_eq!(store.list_pending_requests().unwrap().len(), 5);
    }

    #[test]
    fn update_response_sets_fields_together() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.create_request(make_request(id)).unwrap();

        let now = Utc::now();
        store
            .update_request_response(id, "Deploy", true, now)
            .unwrap();

        let request = store.get_request(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Completed);
        assert_eq!(request.response.as_deref(), Some("Deploy"));
        assert!(request.approved);
        assert_eq!(request.responded_at, Some(now));
    }

    #[test]
    fn transitions_are_mutually_exclusive() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.create_request(make_request(id)).unwrap();
        let now = Utc::now();

        store.cancel_request(id, now).unwrap();

        let err = store
            .update_request_response(id, "Deploy", true, now)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyTerminal(_)));
        let err = store.timeout_request(id, now).unwrap_err();
        assert!(matches!(err, Error::AlreadyTerminal(_)));
        let err = store.cancel_request(id, now).unwrap_err();
        assert!(matches!(err, Error::AlreadyTerminal(_)));

        let request = store.get_request(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Canceled);
    }

    #[test]
    fn timeout_transition() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.create_request(make_request(id)).unwrap();
        store.timeout_request(id, Utc::now()).unwrap();

        let request = store.get_request(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Timeout);
        assert!(request.response.is_none());
    }

    #[test]
    fn transition_on_unknown_returns_not_found() {
        let store = InMemoryStore::new();
        let err = store.cancel_request(Uuid::new_v4(), Utc::now()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn attach_transport_message_while_pending() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.create_request(make_request(id)).unwrap();
        store.attach_transport_message(id, 777).unwrap();

        let request = store.get_request(id).unwrap().unwrap();
        assert_eq!(request.transport_message_id, Some(777));
    }

    #[test]
    fn attach_transport_message_noop_after_terminal() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        store.create_request(make_request(id)).unwrap();
        store.cancel_request(id, Utc::now()).unwrap();

        store.attach_transport_message(id, 777).unwrap();
        let request = store.get_request(id).unwrap().unwrap();
        assert!(request.transport_message_id.is_none());
    }

    #[test]
    fn list_pending_ordered_by_created_at() {
        let store = InMemoryStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let terminal = Uuid::new_v4();

        let mut older = make_request(first);
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = make_request(second);
        store.create_request(newer).unwrap();
        store.create_request(older).unwrap();
        store.create_request(make_request(terminal)).unwrap();
        store.cancel_request(terminal, Utc::now()).unwrap();

        let pending = store.list_pending_requests().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[1].id, second);
    }

    #[test]
    fn concurrent_transitions_single_winner() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(InMemoryStore::new());
        let id = Uuid::new_v4();
        store.create_request(make_request(id)).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                let now = Utc::now();
                match i % 3 {
                    0 => store.update_request_response(id, "Deploy", true, now),
                    1 => store.cancel_request(id, now),
                    _ => store.timeout_request(id, now),
                }
            }));
        }

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Result::is_ok)
            .count();
        assert_eq!(winners, 1, "exactly one transition must win");

        let request = store.get_request(id).unwrap().unwrap();
        assert!(request.status.is_terminal());
    }
}
