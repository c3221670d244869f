//! Error types for the gateway.

use flare_session::SessionError;

/// Convenience alias used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors produced by the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A configuration value failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem or socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for this schema.
    #[error("invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// `WebSocket` transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// Engine-level failure surfaced through the endpoint.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A transport write exceeded the write deadline.
    #[error("write deadline exceeded; transport is dead")]
    TransportDead,

    /// The attachment credential was rejected.
    #[error("unauthorized")]
    Unauthorized,
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
