//! Credential verification for attachments.
//!
//! The credential travels as a `token` query parameter on the WebSocket
//! upgrade request (`GET /attach?token=…`) and is resolved to a strict
//! `(session, participant)` binding before any data frame is read. Frames
//! themselves never name a session, so a token cannot be replayed against a
//! different session.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use flare_core::{
    CredentialVerifier, ParticipantId, ParticipantProfile, SessionId, VerifiedCredential,
    VerifyError,
};

/// Pull the bearer token out of an upgrade request's query string.
#[must_use]
pub(crate) fn token_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
}

/// In-memory token table implementing [`CredentialVerifier`].
///
/// Backs the `flared` dev daemon and the test suites; production
/// deployments verify against the admin surface that issued the token.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: DashMap<String, VerifiedCredential>,
}

impl StaticTokenVerifier {
    /// Create an empty token table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing token.
    pub fn insert(&self, token: impl Into<String>, credential: VerifiedCredential) {
        self.tokens.insert(token.into(), credential);
    }

    /// Mint a fresh opaque token bound to `(session, participant)`.
    pub fn issue(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        profile: ParticipantProfile,
    ) -> String {
        let token = Uuid::new_v4().to_string();
        self.insert(
            token.clone(),
            VerifiedCredential {
                session_id,
                participant_id,
                profile,
            },
        );
        token
    }

    /// Drop a token, e.g. when its session ends.
    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }
}

#[async_trait]
impl CredentialVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedCredential, VerifyError> {
        self.tokens
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or(VerifyError::Unauthorized)
    }
}
