//! Registry of identified sessions.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use relay_core::{SessionId, SessionInfo};

use crate::{error::RegistryError, session::Session};

/// Concurrent map of session id to active session.
///
/// Only identified sessions are admitted, and admission is what makes a
/// session `Active`. Lookups skip sessions that have since closed but not
/// yet been removed, so the visible set is exactly the active one.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit an identified session and mark it active.
    ///
    /// # Errors
    /// Returns error if the session has no identity, is not pending, or
    /// its id is already taken. The registry is unchanged on error.
    pub fn put(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        if session.identity().is_none() {
            return Err(RegistryError::Unidentified(session.id().clone()));
        }

        let mut sessions = self.write();
        if sessions.contains_key(session.id()) {
            return Err(RegistryError::Occupied(session.id().clone()));
        }
        if !session.activate() {
            return Err(RegistryError::NotPending(session.id().clone()));
        }
        sessions.insert(session.id().clone(), session);
        Ok(())
    }

    /// Look up an active session.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.read()
            .get(id)
            .filter(|session| session.is_active())
            .cloned()
    }

    /// Remove a session. Removing an absent id is a no-op.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.write().remove(id)
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.write().drain().map(|(_, session)| session).collect()
    }

    /// Run `f` over every active session while holding the read lock.
    ///
    /// Mutations wait until iteration ends. `f` must not call back into
    /// the registry.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Session>)) {
        for session in self.read().values().filter(|s| s.is_active()) {
            f(session);
        }
    }

    /// Clone out every active session.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions = Vec::new();
        self.for_each(|session| sessions.push(Arc::clone(session)));
        sessions
    }

    /// Operator view of every active session, oldest first.
    #[must_use]
    pub fn infos(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.snapshot().iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        infos
    }

    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.get(id).is_some()
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().values().filter(|s| s.is_active()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
