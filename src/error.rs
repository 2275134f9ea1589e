/// Error types shared across the engine
use thiserror::Error;

/// Errors raised by the framed transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("frame encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors raised by playback backends
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("credential expired or not yet issued")]
    CredentialExpired,
    #[error("credential rejected by provider")]
    CredentialRejected,
    #[error("no active output device")]
    NoActiveDevice,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response status {0}")]
    Status(u16),
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("command timed out")]
    Timeout,
    #[error("{0}")]
    Command(String),
}

impl ProviderError {
    /// Whether retrying the same command later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::NoActiveDevice)
    }
}

/// Errors decoding inbound named events
#[derive(Error, Debug)]
pub enum EventError {
    #[error("unknown event: {0}")]
    Unknown(String),
    #[error("missing argument {index} for {event}")]
    MissingArgument { event: String, index: usize },
    #[error("invalid payload for {event}: {source}")]
    InvalidPayload {
        event: String,
        source: serde_json::Error,
    },
}

/// Errors loading or saving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to determine config directory")]
    NoConfigDir,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Layered(#[from] config::ConfigError),
    #[error("toml serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}
