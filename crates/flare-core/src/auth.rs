//! Seam to the attachment-credential verifier.
//!
//! The admin surface issues short-lived bearer tokens when a join is
//! accepted; the gateway hands each token to a verifier before any data
//! frame is processed. The binding is strict: the verifier alone decides
//! which `(session, participant)` pair a transport speaks for, and frames
//! never carry session identifiers.

use async_trait::async_trait;

use crate::error::VerifyError;
use crate::ids::{ParticipantId, SessionId};
use crate::profile::ParticipantProfile;

/// The `(session, participant)` binding a credential resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCredential {
    /// Session the attachment belongs to.
    pub session_id: SessionId,
    /// Participant the attachment speaks for.
    pub participant_id: ParticipantId,
    /// Display profile issued with the credential.
    pub profile: ParticipantProfile,
}

/// Validates opaque attachment credentials.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Resolve a bearer token to its session/participant binding.
    ///
    /// # Errors
    ///
    /// [`VerifyError::Unauthorized`] for unknown, expired, or malformed
    /// tokens; [`VerifyError::Unavailable`] when the verifier backend is
    /// down. Both close the transport before any frame is processed.
    async fn verify(&self, token: &str) -> Result<VerifiedCredential, VerifyError>;
}
