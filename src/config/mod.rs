/// Configuration management
use crate::error::ConfigError;
#[cfg(unix)]
use crate::providers::mpv::MpvSettings;
use crate::providers::soundcloud::DEFAULT_STREAM_TIMEOUT;
use crate::providers::spotify::{RetrySettings, DEFAULT_API_BASE};
use crate::providers::youtube::DEFAULT_VOLUME_SCALE;
use crate::session::SessionSettings;
use crate::transport::TransportSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Prefix for environment overrides, e.g. `ECHONEST__SERVER__URL`
pub const ENV_PREFIX: &str = "ECHONEST";

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub spotify: SpotifyConfig,
    pub youtube: YoutubeConfig,
    pub soundcloud: SoundcloudConfig,
    pub airhorn: AirhornConfig,
    pub session: SessionConfig,
}

/// General application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Queue server endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Websocket URL of the queue server (ws:// or wss://)
    pub url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5000/socket".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let defaults = TransportSettings::default();
        Self {
            heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
            reconnect_interval_ms: defaults.reconnect_interval.as_millis() as u64,
        }
    }
}

/// Spotify Web API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotifyConfig {
    pub enabled: bool,
    pub api_base_url: String,
    /// Delay between attempts when no device is active yet
    pub retry_delay_ms: u64,
    pub retry_attempts: u32,
}

impl Default for SpotifyConfig {
    fn default() -> Self {
        let retry = RetrySettings::default();
        Self {
            enabled: true,
            api_base_url: DEFAULT_API_BASE.to_string(),
            retry_delay_ms: retry.delay.as_millis() as u64,
            retry_attempts: retry.attempts,
        }
    }
}

/// YouTube playback through a local mpv instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YoutubeConfig {
    pub enabled: bool,
    /// Factor applied to the shared volume before it reaches the player
    pub volume_scale: f64,
    pub mpv_binary: String,
    pub ipc_socket: PathBuf,
}

impl Default for YoutubeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volume_scale: DEFAULT_VOLUME_SCALE,
            mpv_binary: "mpv".to_string(),
            ipc_socket: std::env::temp_dir().join("echonest-player-mpv.sock"),
        }
    }
}

/// SoundCloud streams resolved by the server and played locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundcloudConfig {
    pub enabled: bool,
    /// How long to wait for a stream reply before asking again
    pub stream_timeout_ms: u64,
}

impl Default for SoundcloudConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stream_timeout_ms: DEFAULT_STREAM_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AirhornConfig {
    pub enabled: bool,
    /// Where sounds are fetched from; the queue server's origin when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for AirhornConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Take the producer role as soon as the session starts
    pub producer_on_start: bool,
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, writing the defaults there first when
    /// the file does not exist. Environment overrides are applied on top.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let content = toml::to_string_pretty(&Self::default())?;
            std::fs::write(path, content)?;
            tracing::info!(path = %path.display(), "Wrote default configuration");
        }

        let config: Config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get configuration directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("echonest-player");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.server.url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.server.url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl(format!(
                "{}: scheme must be ws or wss",
                self.server.url
            )));
        }
        self.airhorn_base_url()?;
        Ok(())
    }

    /// Explicit origin for airhorn sounds, normalized to end in `/`
    pub fn airhorn_base_url(&self) -> Result<Option<Url>, ConfigError> {
        let Some(base) = &self.airhorn.base_url else {
            return Ok(None);
        };
        let mut url =
            Url::parse(base).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", base, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "{}: scheme must be http or https",
                base
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(Some(url))
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.soundcloud.stream_timeout_ms)
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            heartbeat_interval: Duration::from_millis(self.transport.heartbeat_interval_ms),
            reconnect_interval: Duration::from_millis(self.transport.reconnect_interval_ms),
        }
    }

    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            delay: Duration::from_millis(self.spotify.retry_delay_ms),
            attempts: self.spotify.retry_attempts,
        }
    }

    #[cfg(unix)]
    pub fn mpv_settings(&self) -> MpvSettings {
        MpvSettings {
            binary: self.youtube.mpv_binary.clone(),
            socket_path: self.youtube.ipc_socket.clone(),
            ..MpvSettings::default()
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            producer_on_start: self.session.producer_on_start,
        }
    }
}
