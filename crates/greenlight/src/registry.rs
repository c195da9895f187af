use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::Error;
use crate::store::Store;
use crate::types::HitlRequest;

/// Canonical state of every HITL request. The sole mutator of request state;
/// transitions are single-writer per id through the store's conditional
/// updates, so exactly one of complete/cancel/timeout wins.
pub struct RequestRegistry {
    store: Arc<dyn Store>,
}

impl RequestRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Insert a pending request. Fails with `Duplicate` on id collision; the
    /// caller retries with a fresh id.
    pub fn create(&self, request: HitlRequest) -> Result<(), Error> {
        self.store.create_request(request)
    }

    /// Counted insert under the pending ceiling: the count check and the
    /// insert are one atomic store operation, so concurrent submissions can
    /// never push the pending count past `max_pending`. Fails with
    /// `Overloaded` at or above the ceiling.
    pub fn create_bounded(&self, request: HitlRequest, max_pending: usize) -> Result<(), Error> {
        self.store.create_request_bounded(request, max_pending)
    }

    pub fn get(&self, id: Uuid) -> Result<HitlRequest, Error> {
        self.store
            .get_request(id)?
            .ok_or_else(|| Error::NotFound(format!("request {id}")))
    }

    /// Atomic `pending → completed`; records the response, the approval
    /// verdict and the response time together.
    pub fn complete(&self, id: Uuid, response: &str, approved: bool) -> Result<(), Error> {
        self.store
            .update_request_response(id, response, approved, Utc::now())
    }

    /// Atomic `pending → canceled`.
    pub fn cancel(&self, id: Uuid) -> Result<(), Error> {
        self.store.cancel_request(id, Utc::now())
    }

    /// Atomic `pending → timeout`.
    pub fn timeout(&self, id: Uuid) -> Result<(), Error> {
        self.store.timeout_request(id, Utc::now())
    }

    /// Persist the chat message handle onto a still-pending request.
    pub fn attach_transport_message(&self, id: Uuid, message_id: i32) -> Result<(), Error> {
        self.store.attach_transport_message(id, message_id)
    }

    /// Snapshot of pending requests, oldest first.
    pub fn list_pending(&self) -> Result<Vec<HitlRequest>, Error> {
        self.store.list_pending_requests()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::RequestStatus;
    use std::collections::HashMap;

    fn make_registry() -> RequestRegistry {
        RequestRegistry::new(Arc::new(InMemoryStore::new()))
    }

    fn make_request(id: Uuid) -> HitlRequest {
        HitlRequest::new(id, "s1", "c1", "Deploy?", Vec::new(), HashMap::new(), 300)
    }

    #[test]
    fn create_and_get() {
        let registry = make_registry();
        let id = Uuid::new_v4();
        registry.create(make_request(id)).unwrap();

        let request = registry.get(id).unwrap();
        assert_eq!(request.status, RequestStatus::Pending);
    }

    #[test]
    fn get_unknown_not_found() {
        let registry = make_registry();
        let err = registry.get(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn create_bounded_enforces_ceiling() {
        let registry = make_registry();
        registry
            .create_bounded(make_request(Uuid::new_v4()), 1)
            .unwrap();
        let err = registry
            .create_bounded(make_request(Uuid::new_v4()), 1)
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded(1)));
    }

    #[test]
    fn create_bounded_frees_slot_after_settlement() {
        let registry = make_registry();
        let id = Uuid::new_v4();
        registry.create_bounded(make_request(id), 1).unwrap();
        registry.cancel(id).unwrap();

        registry
            .create_bounded(make_request(Uuid::new_v4()), 1)
            .unwrap();
    }

    #[test]
    fn complete_sets_response_and_time() {
        let registry = make_registry();
        let id = Uuid::new_v4();
        registry.create(make_request(id)).unwrap();

        registry.complete(id, "yes", true).unwrap();

        let request = registry.get(id).unwrap();
        assert_eq!(request.status, RequestStatus::Completed);
        assert_eq!(request.response.as_deref(), Some("yes"));
        assert!(request.approved);
        assert!(request.responded_at.unwrap() >= request.created_at);
    }

    #[test]
    fn at_most_one_winner() {
        let registry = make_registry();
        let id = Uuid::new_v4();
        registry.create(make_request(id)).unwrap();

        registry.timeout(id).unwrap();

        assert!(matches!(
            registry.complete(id, "yes", true).unwrap_err(),
            Error::AlreadyTerminal(_)
        ));
        assert!(matches!(
            registry.cancel(id).unwrap_err(),
            Error::AlreadyTerminal(_)
        ));
        assert!(matches!(
            registry.timeout(id).unwrap_err(),
            Error::AlreadyTerminal(_)
        ));
        assert_eq!(registry.get(id).unwrap().status, RequestStatus::Timeout);
    }

    #[test]
    fn list_pending_excludes_settled() {
        let registry = make_registry();
        let keep = Uuid::new_v4();
        let settle = Uuid::new_v4();
        registry.create(make_request(keep)).unwrap();
        registry.create(make_request(settle)).unwrap();
        registry.cancel(settle).unwrap();

        let pending = registry.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, keep);
    }

    #[test]
    fn attach_transport_message_persists() {
        let registry = make_registry();
        let id = Uuid::new_v4();
        registry.create(make_request(id)).unwrap();
        registry.attach_transport_message(id, 1234).unwrap();
        assert_eq!(registry.get(id).unwrap().transport_message_id, Some(1234));
    }
}
