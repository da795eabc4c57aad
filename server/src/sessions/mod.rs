//! Session registry.
//!
//! [`SessionRegistry`] is the single authority for creating, looking up and
//! tearing down sessions. A session is inserted when a submit succeeds and
//! removed the first time anything tears it down: a transport endpoint
//! disconnecting, the program exiting, or server shutdown.
//!
//! ## Concurrency
//!
//! The map is behind an `RwLock`. Lookups take a read lock; create and teardown
//! take a write lock. `create` holds the write lock across the limit check and
//! the insert. No lock is held while a session is being closed.

pub mod pipe;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::RegistryError;
use session::Session;

/// Maps session ids to live sessions.
///
/// Cloneable; all clones share the same inner map.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Allocate a session with a fresh id and register it.
    pub async fn create(&self) -> Result<Arc<Session>, RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::Full(self.max_sessions));
        }

        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone()));
        sessions.insert(id.clone(), Arc::clone(&session));
        info!("Session {id} created, total: {}", sessions.len());
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Close `session` and forget it.
    ///
    /// Safe to call from every endpoint of the session: only the first call
    /// does anything and returns `true`.
    pub async fn teardown(&self, session: &Arc<Session>, reason: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&session.id) {
                Some(entry) if Arc::ptr_eq(entry, session) => {
                    sessions.remove(&session.id);
                    true
                }
                _ => false,
            }
        };
        let closed = session.close();
        if removed || closed {
            info!("Session {} torn down ({reason})", session.id);
        }
        removed || closed
    }

    /// Tear down every session (used during shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        for session in drained {
            session.close();
        }
        if count > 0 {
            info!("Shut down {count} session(s)");
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session::SessionState;

    #[tokio::test]
    async fn create_lookup_teardown() {
        let registry = SessionRegistry::new(4);
        let session = registry.create().await.unwrap();
        assert_eq!(registry.session_count().await, 1);

        let found = registry.get(&session.id).await.unwrap();
        assert!(Arc::ptr_eq(&found, &session));
        assert!(registry.get("no-such-session").await.is_none());

        assert!(registry.teardown(&session, "test").await);
        assert!(!registry.teardown(&session, "test again").await);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.get(&session.id).await.is_none());
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let registry = SessionRegistry::new(16);
        let a = registry.create().await.unwrap();
        let b = registry.create().await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn enforces_session_limit() {
        let registry = SessionRegistry::new(1);
        let first = registry.create().await.unwrap();
        assert!(matches!(
            registry.create().await,
            Err(RegistryError::Full(1))
        ));
        registry.teardown(&first, "free a slot").await;
        assert!(registry.create().await.is_ok());
    }

    #[tokio::test]
    async fn close_all_closes_everything() {
        let registry = SessionRegistry::new(8);
        let a = registry.create().await.unwrap();
        let b = registry.create().await.unwrap();
        registry.close_all().await;
        assert_eq!(registry.session_count().await, 0);
        assert!(a.stdin.is_closed() && b.portchan.is_closed());
    }
}
