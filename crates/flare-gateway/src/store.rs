//! In-memory session catalog.
//!
//! Stands in for the relational store behind the admin surface so the
//! daemon runs end-to-end without external services. Honours the same
//! contract: `validate` at coordinator start, best-effort `touch_activity`.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::time::Duration;

use flare_core::{SessionId, SessionMeta, SessionStore, StoreError};

#[derive(Debug, Clone)]
struct StoredSession {
    name: Option<String>,
    expires_at: DateTime<Utc>,
    is_active: bool,
    last_activity_at: DateTime<Utc>,
}

/// In-memory implementation of [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, StoredSession>,
}

impl MemorySessionStore {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session expiring `lifetime` from now and return its id.
    pub fn create_session(&self, name: Option<String>, lifetime: Duration) -> SessionId {
        let session_id = SessionId::new();
        let now = Utc::now();
        let lifetime =
            TimeDelta::from_std(lifetime).unwrap_or_else(|_| TimeDelta::hours(24));
        let expires_at = now.checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.sessions.insert(
            session_id,
            StoredSession {
                name,
                expires_at,
                is_active: true,
                last_activity_at: now,
            },
        );
        session_id
    }

    /// Mark a session inactive, as the admin surface does when the host
    /// ends it. Returns whether the session existed.
    pub fn end_session(&self, session_id: SessionId) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(mut entry) => {
                entry.is_active = false;
                true
            },
            None => false,
        }
    }

    /// Last recorded activity for a session.
    #[must_use]
    pub fn last_activity(&self, session_id: SessionId) -> Option<DateTime<Utc>> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.last_activity_at)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn validate(&self, session_id: SessionId) -> Result<SessionMeta, StoreError> {
        self.sessions
            .get(&session_id)
            .map(|entry| SessionMeta {
                expires_at: entry.expires_at,
                is_active: entry.is_active,
                name: entry.name.clone(),
            })
            .ok_or(StoreError::NotFound(session_id))
    }

    async fn touch_activity(&self, session_id: SessionId) -> Result<(), StoreError> {
        match self.sessions.get_mut(&session_id) {
            Some(mut entry) => {
                entry.last_activity_at = Utc::now();
                Ok(())
            },
            None => Err(StoreError::NotFound(session_id)),
        }
    }
}
