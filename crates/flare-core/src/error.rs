//! Error types for Flare foundation operations.

use thiserror::Error;

use crate::ids::SessionId;

/// Errors raised when constructing a [`crate::LocationRecord`].
///
/// A rejected fix never mutates any session state; the gateway replies with
/// a non-fatal `error` frame and keeps the connection open.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    /// A numeric field was NaN or infinite.
    #[error("non-finite {field}: {value}")]
    NonFinite {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// Latitude outside the [-90, 90] range.
    #[error("latitude out of range: {0}")]
    LatitudeOutOfRange(f64),

    /// Longitude outside the [-180, 180] range.
    #[error("longitude out of range: {0}")]
    LongitudeOutOfRange(f64),

    /// Accuracy must be non-negative.
    #[error("negative accuracy: {0}")]
    NegativeAccuracy(f64),
}

/// Errors raised when validating a participant profile at join time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfileError {
    /// Display name was empty.
    #[error("display name is empty")]
    EmptyDisplayName,

    /// Display name exceeded the maximum length.
    #[error("display name too long: {chars} chars (max {max})")]
    DisplayNameTooLong {
        /// Observed length in characters.
        chars: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// Avatar colour was not a `#RRGGBB` hex literal.
    #[error("invalid avatar color: {0:?}")]
    InvalidAvatarColor(String),
}

/// Errors produced by a [`crate::SessionStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No session with the given identifier exists in the catalog.
    #[error("session not found in catalog: {0}")]
    NotFound(SessionId),

    /// The backing catalog could not be reached.
    #[error("session catalog unavailable: {0}")]
    Unavailable(String),
}

/// Errors produced by a [`crate::CredentialVerifier`] implementation.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The credential is unknown, expired, or malformed.
    #[error("credential rejected")]
    Unauthorized,

    /// The verifier backend could not be reached.
    #[error("credential verifier unavailable: {0}")]
    Unavailable(String),
}
