//! Flare Core - Foundation types for the Flare location-sharing backend.
//!
//! This crate provides:
//! - Identifier newtypes (`SessionId`, `ParticipantId`)
//! - The validated, immutable [`LocationRecord`] value object
//! - Participant profile types with join-time validation
//! - The WebSocket wire frames (`ClientFrame`, `ServerFrame`)
//! - The `SessionStore` and `CredentialVerifier` seams consumed by the
//!   session engine and the gateway

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod auth;
pub mod error;
pub mod ids;
pub mod location;
pub mod profile;
pub mod protocol;
pub mod store;

pub use auth::{CredentialVerifier, VerifiedCredential};
pub use error::{LocationError, ProfileError, StoreError, VerifyError};
pub use ids::{ParticipantId, SessionId};
pub use location::LocationRecord;
pub use profile::{MAX_DISPLAY_NAME_CHARS, ParticipantProfile};
pub use protocol::{
    ClientFrame, EndReason, ErrorCode, LeaveReason, LocationSnapshot, ParticipantSnapshot,
    ServerFrame,
};
pub use store::{SessionMeta, SessionStore};

