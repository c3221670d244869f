//! Participant profile types.

use serde::{Deserialize, Serialize};

use crate::error::ProfileError;

/// Maximum display-name length in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 30;

/// Display profile carried by a participant.
///
/// Issued by the admin surface alongside the attachment credential and
/// validated again by the engine before the participant is admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    /// Human-readable name shown to other participants.
    pub display_name: String,
    /// Avatar colour as a `#RRGGBB` hex literal.
    pub avatar_color: String,
}

impl ParticipantProfile {
    /// Build a validated profile.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError`] for an empty or over-long display name, or
    /// an avatar colour that is not a 7-character `#RRGGBB` literal.
    pub fn new(
        display_name: impl Into<String>,
        avatar_color: impl Into<String>,
    ) -> Result<Self, ProfileError> {
        let profile = Self {
            display_name: display_name.into(),
            avatar_color: avatar_color.into(),
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Re-check the profile invariants.
    ///
    /// Used by the engine on profiles that arrived through deserialization
    /// rather than [`ParticipantProfile::new`].
    ///
    /// # Errors
    ///
    /// Same conditions as [`ParticipantProfile::new`].
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.display_name.is_empty() {
            return Err(ProfileError::EmptyDisplayName);
        }
        let chars = self.display_name.chars().count();
        if chars > MAX_DISPLAY_NAME_CHARS {
            return Err(ProfileError::DisplayNameTooLong {
                chars,
                max: MAX_DISPLAY_NAME_CHARS,
            });
        }
        if !is_hex_color(&self.avatar_color) {
            return Err(ProfileError::InvalidAvatarColor(self.avatar_color.clone()));
        }
        Ok(())
    }
}

/// `#RRGGBB` check: exactly seven ASCII characters, leading `#`, six hex
/// digits.
fn is_hex_color(value: &str) -> bool {
    let mut chars = value.chars();
    chars.next() == Some('#')
        && value.len() == 7
        && chars.all(|c| c.is_ascii_hexdigit())
}
