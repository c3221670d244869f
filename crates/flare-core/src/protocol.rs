//! WebSocket wire protocol frames.
//!
//! Text frames carrying JSON, tagged by a `type` field. The client-to-server
//! set is deliberately tiny (`location_update`, `ping`); everything else
//! flows server-to-client. Decoding at the gateway boundary establishes that
//! only well-formed variants ever reach a session coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::ParticipantId;
use crate::location::LocationRecord;

// ── Client → server ──────────────────────────────────────────

/// Frames a client may send after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A fresh GPS fix from the device.
    LocationUpdate {
        /// Latitude in decimal degrees.
        lat: f64,
        /// Longitude in decimal degrees.
        lng: f64,
        /// Horizontal accuracy in meters.
        accuracy: f64,
        /// Device wall-clock timestamp, ISO-8601 UTC.
        timestamp: DateTime<Utc>,
        /// Speed over ground in m/s, if the device reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        /// Heading in degrees from true north, if the device reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
        /// Altitude in meters, if the device reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        altitude: Option<f64>,
    },
    /// Keepalive. Touches participant liveness; the server replies `pong`.
    Ping,
}

impl ClientFrame {
    /// Decode a frame from JSON text.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error for malformed or unknown
    /// frames; the gateway answers those with a non-fatal `error` frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode the frame as JSON text.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Server → client ──────────────────────────────────────────

/// Participant entry in an `initial_participants` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    /// Participant identifier.
    pub participant_id: ParticipantId,
    /// Display name.
    pub display_name: String,
    /// Avatar colour (`#RRGGBB`).
    pub avatar_color: String,
    /// Wall-clock time of the participant's last inbound message.
    pub last_seen: DateTime<Utc>,
    /// Whether the participant currently has a live attachment.
    pub is_active: bool,
}

/// Location entry in an `initial_locations` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSnapshot {
    /// Participant the fix belongs to.
    pub participant_id: ParticipantId,
    /// Latitude in decimal degrees.
    pub lat: f64,
    /// Longitude in decimal degrees.
    pub lng: f64,
    /// Horizontal accuracy in meters.
    pub accuracy: f64,
    /// Device wall-clock timestamp of the fix.
    pub timestamp: DateTime<Utc>,
}

impl LocationSnapshot {
    /// Build a snapshot entry from a stored record.
    #[must_use]
    pub fn from_record(participant_id: ParticipantId, record: &LocationRecord) -> Self {
        Self {
            participant_id,
            lat: record.latitude(),
            lng: record.longitude(),
            accuracy: record.accuracy_m(),
            timestamp: record.client_timestamp(),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The absolute session deadline was reached.
    Expired,
    /// The host ended the session explicitly.
    EndedByCreator,
    /// No participants remained for the idle grace period.
    Idle,
    /// Sent only to an attachment replaced by a newer one.
    Superseded,
    /// An internal invariant violation closed the coordinator.
    InternalError,
    /// The hosting process is shutting down.
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Expired => "expired",
            Self::EndedByCreator => "ended_by_creator",
            Self::Idle => "idle",
            Self::Superseded => "superseded",
            Self::InternalError => "internal_error",
            Self::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

/// Why a participant left a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// The participant left or their transport closed for good.
    Left,
    /// The absence timer fired with no re-attachment.
    Timeout,
    /// The participant exceeded the protocol-error threshold.
    ProtocolError,
    /// The outbound queue could not accept a lifecycle frame.
    Unresponsive,
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Left => "left",
            Self::Timeout => "timeout",
            Self::ProtocolError => "protocol_error",
            Self::Unresponsive => "unresponsive",
        };
        f.write_str(label)
    }
}

/// Machine-readable code carried by an `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A location fix failed validation.
    InvalidLocation,
    /// The frame was not valid JSON or not a known frame type.
    InvalidFrame,
    /// The per-connection inbound rate limit was exceeded.
    RateLimited,
    /// The credential was rejected or did not match the session.
    Unauthorized,
    /// The session does not exist in the catalog.
    SessionNotFound,
    /// The session is at its participant cap.
    SessionFull,
    /// The coordinator mailbox is saturated.
    Overloaded,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InvalidLocation => "invalid_location",
            Self::InvalidFrame => "invalid_frame",
            Self::RateLimited => "rate_limited",
            Self::Unauthorized => "unauthorized",
            Self::SessionNotFound => "session_not_found",
            Self::SessionFull => "session_full",
            Self::Overloaded => "overloaded",
        };
        f.write_str(label)
    }
}

/// Frames the server pushes to attached clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Reply to a client `ping`.
    Pong,
    /// Snapshot of the other participants, sent right after attach.
    InitialParticipants {
        /// Every other participant in the session.
        participants: Vec<ParticipantSnapshot>,
    },
    /// Snapshot of the other participants' fresh locations, sent after
    /// `initial_participants`.
    InitialLocations {
        /// Non-stale fixes, one per participant at most.
        locations: Vec<LocationSnapshot>,
    },
    /// A participant joined the session.
    ParticipantJoined {
        /// Participant identifier.
        participant_id: ParticipantId,
        /// Display name.
        display_name: String,
        /// Avatar colour (`#RRGGBB`).
        avatar_color: String,
    },
    /// A participant left the session.
    ParticipantLeft {
        /// Participant identifier.
        participant_id: ParticipantId,
        /// Why the participant left.
        reason: LeaveReason,
    },
    /// Another participant's location fix.
    LocationUpdate {
        /// Originating participant.
        participant_id: ParticipantId,
        /// Latitude in decimal degrees.
        lat: f64,
        /// Longitude in decimal degrees.
        lng: f64,
        /// Horizontal accuracy in meters.
        accuracy: f64,
        /// Device wall-clock timestamp of the fix.
        timestamp: DateTime<Utc>,
    },
    /// The session is over; always the final frame on a connection.
    SessionEnded {
        /// Why the session ended.
        reason: EndReason,
    },
    /// Non-fatal, per-frame validation failure.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

impl ServerFrame {
    /// Build a `location_update` broadcast frame from a stored record.
    #[must_use]
    pub fn location_update(participant_id: ParticipantId, record: &LocationRecord) -> Self {
        Self::LocationUpdate {
            participant_id,
            lat: record.latitude(),
            lng: record.longitude(),
            accuracy: record.accuracy_m(),
            timestamp: record.client_timestamp(),
        }
    }

    /// Build a non-fatal `error` frame.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Lifecycle frames must never be silently dropped by queue eviction.
    #[must_use]
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            Self::ParticipantJoined { .. } | Self::ParticipantLeft { .. } | Self::SessionEnded { .. }
        )
    }

    /// Encode the frame as JSON text.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a frame from JSON text.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error. Used by test clients; the
    /// production client is the mobile app.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
