/// Airhorn sound effects played over the music by the producer
use crate::error::ProviderError;
use crate::providers::soundcloud::AudioOutput;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Sound effects are served next to the queue server's static assets
const SOUND_PATH: &str = "static/audio/";
const SOUND_EXTENSION: &str = "mp3";

/// Output level for an airhorn: its own gain scaled by the local level
pub fn airhorn_level(gain: f64, effective: u8) -> u8 {
    if !gain.is_finite() {
        return 0;
    }
    (gain * f64::from(effective)).clamp(0.0, 100.0).round() as u8
}

/// Plays named airhorn sounds fetched from the queue server
pub struct Airhorns {
    base_url: Url,
    output: Arc<dyn AudioOutput>,
}

impl Airhorns {
    pub fn new(base_url: Url, output: Arc<dyn AudioOutput>) -> Self {
        Self { base_url, output }
    }

    /// Derive the HTTP origin from the websocket URL of the queue server
    pub fn from_server_url(server_url: &str, output: Arc<dyn AudioOutput>) -> Result<Self, ProviderError> {
        let mut url = Url::parse(server_url)
            .map_err(|e| ProviderError::Command(format!("invalid server url {}: {}", server_url, e)))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            other => {
                return Err(ProviderError::Command(format!(
                    "unsupported server scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ProviderError::Command(format!("cannot derive http url from {}", server_url)))?;
        url.set_path("/");
        url.set_query(None);
        url.set_fragment(None);
        Ok(Self::new(url, output))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// URL of the named sound. Names are plain file stems.
    pub fn sound_url(&self, name: &str) -> Result<Url, ProviderError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ProviderError::Command(format!("invalid airhorn name: {:?}", name)));
        }
        self.base_url
            .join(&format!("{}{}.{}", SOUND_PATH, name, SOUND_EXTENSION))
            .map_err(|e| ProviderError::Command(format!("invalid airhorn url: {}", e)))
    }

    /// Start the named sound at `level` percent
    pub fn play(&self, name: &str, level: u8) -> Result<(), ProviderError> {
        let url = self.sound_url(name)?;
        debug!(%url, "Fetching airhorn");
        self.output.play(name, url.as_str(), Duration::ZERO, level)?;
        info!(name, level, "Airhorn");
        Ok(())
    }
}
