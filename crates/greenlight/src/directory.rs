use std::sync::Arc;

use crate::error::Error;
use crate::store::Store;
use crate::types::Session;

/// Binds `(session_id, client_id)` pairs to human addresses on the chat
/// transport and owns the session lifecycle. The sole mutator of session
/// state; all mutation goes through the store, which guarantees atomicity of
/// a single operation.
pub struct SessionDirectory {
    store: Arc<dyn Store>,
}

impl SessionDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create an active binding. Registration of an existing `session_id` is
    /// rejected, deactivated or not; use [`reregister`](Self::reregister) to
    /// revive a tombstoned session explicitly.
    pub fn register(
        &self,
        session_id: &str,
        client_id: &str,
        human_address: i64,
    ) -> Result<Session, Error> {
        validate_binding(session_id, client_id)?;
        let session = Session::new(session_id, client_id, human_address);
        self.store.create_session(session.clone())?;
        tracing::info!(session_id, client_id, human_address, "session registered");
        Ok(session)
    }

    /// Explicit re-registration of a deactivated session under a fresh
    /// binding. Fails with `Duplicate` while the session is still active.
    pub fn reregister(
        &self,
        session_id: &str,
        client_id: &str,
        human_address: i64,
    ) -> Result<Session, Error> {
        validate_binding(session_id, client_id)?;
        let session = Session::new(session_id, client_id, human_address);
        self.store.reregister_session(session.clone())?;
        tracing::info!(session_id, client_id, human_address, "session re-registered");
        Ok(session)
    }

    /// Mark the session deactivated. Idempotent: deactivating an already
    /// deactivated session returns ok.
    pub fn deactivate(&self, session_id: &str) -> Result<(), Error> {
        self.store.deactivate_session(session_id)?;
        tracing::info!(session_id, "session deactivated");
        Ok(())
    }

    /// Resolve the human address for the single active session bound to a
    /// client. With multiple active bindings (not recommended) the
    /// oldest-created one wins and a warning is recorded.
    pub fn resolve(&self, client_id: &str) -> Result<Session, Error> {
        let mut active = self.store.active_sessions_for_client(client_id)?;
        if active.len() > 1 {
            tracing::warn!(
                client_id,
                active_sessions = active.len(),
                "multiple active sessions for client, routing to the oldest"
            );
        }
        if active.is_empty() {
            return Err(Error::NotFound(format!(
                "active session for client {client_id}"
            )));
        }
        Ok(active.remove(0))
    }

    pub fn lookup(&self, session_id: &str) -> Result<Session, Error> {
        self.store
            .get_session(session_id)?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    /// Snapshot of active sessions, for status surfaces only.
    pub fn active_sessions(&self) -> Result<Vec<Session>, Error> {
        self.store.list_active_sessions()
    }
}

fn validate_binding(session_id: &str, client_id: &str) -> Result<(), Error> {
    if session_id.trim().is_empty() {
        return Err(Error::InvalidArgument("session_id must not be empty".into()));
    }
    if client_id.trim().is_empty() {
        return Err(Error::InvalidArgument("client_id must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn make_directory() -> SessionDirectory {
        SessionDirectory::new(Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn register_and_lookup() {
        let directory = make_directory();
        directory.register("s1", "c1", 42).unwrap();

        let session = directory.lookup("s1").unwrap();
        assert_eq!(session.client_id, "c1");
        assert_eq!(session.human_address, 42);
        assert!(session.active);
    }

    #[test]
    fn register_empty_fields_rejected() {
        let directory = make_directory();
        let err = directory.register("", "c1", 42).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = directory.register("s1", "  ", 42).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn register_duplicate_rejected() {
        let directory = make_directory();
        directory.register("s1", "c1", 42).unwrap();
        let err = directory.register("s1", "c1", 42).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn register_after_deactivation_still_rejected() {
        let directory = make_directory();
        directory.register("s1", "c1", 42).unwrap();
        directory.deactivate("s1").unwrap();
        let err = directory.register("s1", "c1", 42).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn reregister_revives_tombstone() {
        let directory = make_directory();
        directory.register("s1", "c1", 42).unwrap();
        directory.deactivate("s1").unwrap();

        let session = directory.reregister("s1", "c2", 99).unwrap();
        assert!(session.active);
        assert_eq!(session.client_id, "c2");
        assert_eq!(directory.lookup("s1").unwrap().human_address, 99);
    }

    #[test]
    fn reregister_active_session_rejected() {
        let directory = make_directory();
        directory.register("s1", "c1", 42).unwrap();
        let err = directory.reregister("s1", "c2", 99).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn deactivate_is_idempotent() {
        let directory = make_directory();
        directory.register("s1", "c1", 42).unwrap();
        directory.deactivate("s1").unwrap();
        directory.deactivate("s1").unwrap();
        assert!(!directory.lookup("s1").unwrap().active);
    }

    #[test]
    fn deactivate_unknown_not_found() {
        let directory = make_directory();
        let err = directory.deactivate("ghost").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn resolve_single_active_binding() {
        let directory = make_directory();
        directory.register("s1", "c1", 42).unwrap();

        let session = directory.resolve("c1").unwrap();
        assert_eq!(session.session_id, "s1");
        assert_eq!(session.human_address, 42);
    }

    #[test]
    fn resolve_no_active_binding() {
        let directory = make_directory();
        let err = directory.resolve("c1").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn resolve_skips_deactivated() {
        let directory = make_directory();
        directory.register("s1", "c1", 42).unwrap();
        directory.deactivate("s1").unwrap();
        let err = directory.resolve("c1").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn resolve_multiple_picks_oldest() {
        let store = Arc::new(InMemoryStore::new());
        let directory = SessionDirectory::new(store.clone());

        let mut older = Session::new("s-old", "c1", 1);
        older.created_at = chrono::Utc::now() - chrono::Duration::hours(1);
        store.create_session(older).unwrap();
        directory.register("s-new", "c1", 2).unwrap();

        let session = directory.resolve("c1").unwrap();
        assert_eq!(session.session_id, "s-old");
    }

    #[test]
    fn active_sessions_snapshot() {
        let directory = make_directory();
        directory.register("s1", "c1", 1).unwrap();
        directory.register("s2", "c2", 2).unwrap();
        directory.deactivate("s1").unwrap();

        let active = directory.active_sessions().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "s2");
    }

    #[test]
    fn lookup_unknown_not_found() {
        let directory = make_directory();
        let err = directory.lookup("ghost").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
