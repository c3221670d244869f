//! Gateway configuration.
//!
//! Loaded once at startup from a TOML file; every absent key falls back to
//! its documented default, so an empty file (or no file at all) yields a
//! runnable configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use flare_session::SessionLimits;

use crate::error::{GatewayError, GatewayResult};

/// Main gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener settings.
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Engine bounds applied to every session.
    #[serde(default)]
    pub limits: LimitSettings,

    /// Per-attachment transport settings.
    #[serde(default)]
    pub attachment: AttachmentConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Address the WebSocket listener binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

/// Engine bounds applied to every session coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Maximum participants per session.
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,

    /// Per-attachment outbound queue capacity, in frames.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Coordinator command mailbox capacity.
    #[serde(default = "default_session_backlog")]
    pub session_backlog: usize,

    /// Seconds after which a stored location is stale.
    #[serde(default = "default_location_ttl_secs")]
    pub location_ttl_secs: u64,

    /// Seconds an empty session lingers before ending itself.
    #[serde(default = "default_idle_grace_secs")]
    pub idle_grace_secs: u64,

    /// Seconds a detached participant may stay absent before removal.
    #[serde(default = "default_absence_timeout_secs")]
    pub absence_timeout_secs: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_participants: default_max_participants(),
            outbound_queue: default_outbound_queue(),
            session_backlog: default_session_backlog(),
            location_ttl_secs: default_location_ttl_secs(),
            idle_grace_secs: default_idle_grace_secs(),
            absence_timeout_secs: default_absence_timeout_secs(),
        }
    }
}

/// Per-attachment transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Maximum inbound messages per second per attachment.
    #[serde(default = "default_inbound_rate")]
    pub inbound_rate: u32,

    /// Seconds a single transport write may take before the transport is
    /// considered dead.
    #[serde(default = "default_write_deadline_secs")]
    pub write_deadline_secs: u64,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            inbound_rate: default_inbound_rate(),
            write_deadline_secs: default_write_deadline_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:9470".to_string()
}

fn default_max_participants() -> usize {
    50
}

fn default_outbound_queue() -> usize {
    64
}

fn default_session_backlog() -> usize {
    4096
}

fn default_location_ttl_secs() -> u64 {
    30
}

fn default_idle_grace_secs() -> u64 {
    60
}

fn default_absence_timeout_secs() -> u64 {
    60
}

fn default_inbound_rate() -> u32 {
    20
}

fn default_write_deadline_secs() -> u64 {
    5
}

impl GatewayConfig {
    /// Load configuration from a TOML file, or defaults when `path` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML for
    /// this schema, or fails validation.
    pub fn load(path: Option<&Path>) -> GatewayResult<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)?
            },
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every value the engine depends on.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] naming the offending key.
    pub fn validate(&self) -> GatewayResult<()> {
        self.listen_addr()?;
        if self.limits.max_participants == 0 {
            return Err(GatewayError::Config(
                "limits.max_participants must be at least 1".into(),
            ));
        }
        if self.limits.outbound_queue == 0 {
            return Err(GatewayError::Config(
                "limits.outbound_queue must be at least 1".into(),
            ));
        }
        if self.limits.session_backlog == 0 {
            return Err(GatewayError::Config(
                "limits.session_backlog must be at least 1".into(),
            ));
        }
        if self.limits.location_ttl_secs == 0 {
            return Err(GatewayError::Config(
                "limits.location_ttl_secs must be at least 1".into(),
            ));
        }
        if self.attachment.inbound_rate == 0 {
            return Err(GatewayError::Config(
                "attachment.inbound_rate must be at least 1".into(),
            ));
        }
        if self.attachment.write_deadline_secs == 0 {
            return Err(GatewayError::Config(
                "attachment.write_deadline_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The parsed listener address.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] when the address does not parse.
    pub fn listen_addr(&self) -> GatewayResult<SocketAddr> {
        self.gateway.listen_addr.parse().map_err(|_| {
            GatewayError::Config(format!(
                "gateway.listen_addr is not a socket address: {:?}",
                self.gateway.listen_addr
            ))
        })
    }

    /// Engine bounds in the form the session crate consumes.
    #[must_use]
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_participants: self.limits.max_participants,
            outbound_queue: self.limits.outbound_queue,
            session_backlog: self.limits.session_backlog,
            location_ttl: Duration::from_secs(self.limits.location_ttl_secs),
            idle_grace: Duration::from_secs(self.limits.idle_grace_secs),
            absence_timeout: Duration::from_secs(self.limits.absence_timeout_secs),
        }
    }

    /// The per-attachment write deadline.
    #[must_use]
    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.attachment.write_deadline_secs)
    }
}
