//! Error types for the session engine.

use thiserror::Error;

use flare_core::{ParticipantId, ProfileError, SessionId};

/// Errors produced by session engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No live or durable session with this identifier.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The session is ending or has ended; no new joins, no new frames.
    #[error("session has ended")]
    SessionEnded,

    /// The participant cap would be exceeded.
    #[error("session is full ({max} participants)")]
    CapacityExceeded {
        /// The configured cap.
        max: usize,
    },

    /// The participant already exists with a live attachment.
    #[error("participant already joined: {0}")]
    Duplicate(ParticipantId),

    /// No such participant in this session.
    #[error("participant not found: {0}")]
    NotFound(ParticipantId),

    /// The update's client timestamp is not newer than the stored one.
    #[error("location update is not newer than the stored one")]
    StaleLocation,

    /// The coordinator mailbox is saturated; joins and attaches are
    /// rejected until it drains.
    #[error("session coordinator overloaded")]
    Overloaded,

    /// The participant profile failed validation.
    #[error("invalid participant profile: {0}")]
    InvalidProfile(#[from] ProfileError),

    /// The durable session catalog could not be reached.
    #[error("session catalog unavailable: {0}")]
    CatalogUnavailable(String),
}
