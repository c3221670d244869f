//! Process-wide map from session id to its live coordinator.
//!
//! The directory holds the authoritative handle for every live session.
//! Starting a coordinator is an atomic check-and-insert gated on the durable
//! catalog: at most one coordinator exists per session id at any instant.
//! When a coordinator ends it calls back into the directory, which drops the
//! entry, idempotently and without racing a concurrent `get_or_start`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use flare_core::{EndReason, SessionId, SessionMeta, SessionStore, StoreError};

use crate::coordinator::{CoordinatorHandle, SessionCoordinator};
use crate::error::SessionError;
use crate::limits::SessionLimits;

/// Registry of live session coordinators.
///
/// Dependency-injected and owned by the process lifetime; tests instantiate
/// their own.
pub struct SessionDirectory {
    sessions: DashMap<SessionId, CoordinatorHandle>,
    store: Arc<dyn SessionStore>,
    limits: SessionLimits,
}

impl SessionDirectory {
    /// Create a directory backed by the given session catalog.
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, limits: SessionLimits) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            store,
            limits,
        })
    }

    /// Resolve a session to its coordinator, starting one if the catalog
    /// validates the session as live.
    ///
    /// # Errors
    ///
    /// [`SessionError::SessionNotFound`] if the catalog has no such session,
    /// [`SessionError::SessionEnded`] if it is inactive or past its
    /// deadline, and [`SessionError::CatalogUnavailable`] if the catalog
    /// cannot be reached.
    pub async fn get_or_start(
        self: &Arc<Self>,
        session_id: SessionId,
    ) -> Result<CoordinatorHandle, SessionError> {
        if let Some(handle) = self.lookup(session_id) {
            return Ok(handle);
        }

        // Validate against the catalog before (not inside) the map entry:
        // the lock must not be held across an await.
        let meta = self
            .store
            .validate(session_id)
            .await
            .map_err(|err| match err {
                StoreError::NotFound(_) => SessionError::SessionNotFound(session_id),
                StoreError::Unavailable(msg) => SessionError::CatalogUnavailable(msg),
            })?;
        if !meta.is_startable(Utc::now()) {
            return Err(SessionError::SessionEnded);
        }

        let handle = match self.sessions.entry(session_id) {
            Entry::Occupied(mut occupied) => {
                // A concurrent caller won the insert, or a dead entry is
                // awaiting its removal callback. Replace only the latter.
                if occupied.get().is_closed() {
                    let fresh = self.start_coordinator(session_id, &meta);
                    occupied.insert(fresh.clone());
                    fresh
                } else {
                    occupied.get().clone()
                }
            },
            Entry::Vacant(vacant) => {
                let fresh = self.start_coordinator(session_id, &meta);
                vacant.insert(fresh.clone());
                fresh
            },
        };
        Ok(handle)
    }

    /// Look up the live coordinator for a session.
    ///
    /// Entries whose coordinator has already ended are invisible; the
    /// removal callback reclaims them.
    #[must_use]
    pub fn lookup(&self, session_id: SessionId) -> Option<CoordinatorHandle> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    /// Number of live coordinators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no coordinator is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// End every live session with the given reason and wait for each
    /// coordinator to finish. Used for graceful process shutdown.
    pub async fn end_all(&self, reason: EndReason) {
        let handles: Vec<CoordinatorHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(sessions = handles.len(), %reason, "Ending all sessions");
        for handle in handles {
            handle.end(reason).await;
            handle.closed().await;
        }
    }

    fn start_coordinator(
        self: &Arc<Self>,
        session_id: SessionId,
        meta: &SessionMeta,
    ) -> CoordinatorHandle {
        let directory = Arc::downgrade(self);
        info!(session = %session_id, sessions = self.sessions.len(), "Starting session coordinator");
        SessionCoordinator::spawn(
            session_id,
            meta,
            self.limits,
            Arc::clone(&self.store),
            move |ended| {
                if let Some(directory) = directory.upgrade() {
                    directory.on_coordinator_ended(ended);
                }
            },
        )
    }

    /// Remove the entry for an ended coordinator.
    ///
    /// Idempotent, and safe against the race where `get_or_start` has
    /// already replaced the entry with a fresh coordinator: only a closed
    /// handle is removed.
    fn on_coordinator_ended(&self, session_id: SessionId) {
        let removed = self
            .sessions
            .remove_if(&session_id, |_, handle| handle.is_closed());
        if removed.is_some() {
            debug!(session = %session_id, sessions = self.sessions.len(), "Session removed from directory");
        }
    }
}
