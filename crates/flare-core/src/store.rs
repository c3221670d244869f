//! Seam to the persistent session catalog.
//!
//! The engine never owns durable state: it reads session validity when a
//! coordinator is started and writes last-activity timestamps best-effort.
//! Deployments provide their own implementation over the relational store;
//! the gateway ships an in-memory one for development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::ids::SessionId;

/// Durable metadata for one session, as the catalog sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    /// Absolute wall-clock deadline after which the session is over.
    pub expires_at: DateTime<Utc>,
    /// Whether the catalog still considers the session live.
    pub is_active: bool,
    /// Optional human-readable session name.
    pub name: Option<String>,
}

impl SessionMeta {
    /// Whether the session can accept a new coordinator right now.
    #[must_use]
    pub fn is_startable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now < self.expires_at
    }
}

/// Read/write access to the durable session catalog.
///
/// Consulted only off the hot path: `validate` at coordinator start,
/// `touch_activity` throttled and fire-and-forget.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Look up a session's durable metadata.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the catalog has no such session;
    /// [`StoreError::Unavailable`] if the catalog cannot be reached.
    async fn validate(&self, session_id: SessionId) -> Result<SessionMeta, StoreError>;

    /// Record activity on a session.
    ///
    /// Best-effort: callers log failures and carry on.
    ///
    /// # Errors
    ///
    /// [`StoreError`] when the write cannot be performed.
    async fn touch_activity(&self, session_id: SessionId) -> Result<(), StoreError>;
}
