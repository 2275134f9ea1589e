/// YouTube backend driving an embedded video player
use super::{LoadOutcome, PlaybackBackend};
use crate::error::ProviderError;
use crate::models::Source;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Output scale applied to the shared volume for embedded video
pub const DEFAULT_VOLUME_SCALE: f64 = 0.75;

/// Embedded player state, mirroring the iframe player's states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Unstarted,
    Ended,
    Playing,
    Paused,
    Buffering,
    Cued,
}

impl PlayerState {
    /// States in which the loaded video counts as the one being played
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PlayerState::Unstarted | PlayerState::Playing | PlayerState::Buffering
        )
    }
}

/// An embedded video player instance
#[async_trait]
pub trait EmbeddedPlayer: Send + Sync {
    async fn load_video(&self, video_id: &str, start_seconds: f64) -> Result<(), ProviderError>;
    async fn stop_video(&self) -> Result<(), ProviderError>;
    /// Set output level on the player's own 0-100 scale
    async fn set_volume(&self, level: f64) -> Result<(), ProviderError>;
    async fn volume(&self) -> Result<f64, ProviderError>;
    async fn video_id(&self) -> Result<Option<String>, ProviderError>;
    async fn state(&self) -> Result<PlayerState, ProviderError>;
}

/// YouTube driver.
///
/// The player becomes usable asynchronously. Until [`YoutubeDriver::attach`]
/// delivers it, every command is dropped rather than queued.
pub struct YoutubeDriver {
    player: RwLock<Option<Arc<dyn EmbeddedPlayer>>>,
    ready: AtomicBool,
    volume_scale: f64,
}

impl YoutubeDriver {
    pub fn new(volume_scale: f64) -> Self {
        Self {
            player: RwLock::new(None),
            ready: AtomicBool::new(false),
            volume_scale,
        }
    }

    /// Ready signal: the embedded player can now take commands
    pub fn attach(&self, player: Arc<dyn EmbeddedPlayer>) {
        *self.player.write().unwrap_or_else(|e| e.into_inner()) = Some(player);
        self.ready.store(true, Ordering::SeqCst);
        info!("YouTube player ready");
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn player(&self) -> Option<Arc<dyn EmbeddedPlayer>> {
        if !self.is_ready() {
            return None;
        }
        self.player.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for YoutubeDriver {
    fn default() -> Self {
        Self::new(DEFAULT_VOLUME_SCALE)
    }
}

#[async_trait]
impl PlaybackBackend for YoutubeDriver {
    fn source(&self) -> Source {
        Source::Youtube
    }

    async fn load(&self, id: &str, position: f64) -> Result<LoadOutcome, ProviderError> {
        let Some(player) = self.player() else {
            debug!(video = id, "YouTube player not ready, ignoring load");
            return Ok(LoadOutcome::Ignored);
        };
        player.load_video(id, position.max(0.0)).await?;
        info!(video = id, position, "YouTube video loaded");
        Ok(LoadOutcome::Started)
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        match self.player() {
            Some(player) => player.stop_video().await,
            None => Ok(()),
        }
    }

    async fn set_volume(&self, percent: u8) -> Result<(), ProviderError> {
        match self.player() {
            Some(player) => player.set_volume(f64::from(percent) * self.volume_scale).await,
            None => Ok(()),
        }
    }

    async fn current_volume(&self) -> Option<u8> {
        let player = self.player()?;
        let level = player.volume().await.ok()?;
        if self.volume_scale <= 0.0 {
            return None;
        }
        Some((level / self.volume_scale).round().clamp(0.0, 100.0) as u8)
    }

    async fn currently_playing_id(&self) -> Option<String> {
        let player = self.player()?;
        let state = player.state().await.ok()?;
        if !state.is_active() {
            return None;
        }
        player.video_id().await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePlayer {
        loaded: Mutex<Option<(String, f64)>>,
        state: Mutex<Option<PlayerState>>,
        volume: Mutex<f64>,
        stops: Mutex<usize>,
    }

    #[async_trait]
    impl EmbeddedPlayer for FakePlayer {
        async fn load_video(&self, video_id: &str, start_seconds: f64) -> Result<(), ProviderError> {
            *self.loaded.lock().unwrap() = Some((video_id.to_string(), start_seconds));
            *self.state.lock().unwrap() = Some(PlayerState::Unstarted);
            Ok(())
        }

        async fn stop_video(&self) -> Result<(), ProviderError> {
            *self.stops.lock().unwrap() += 1;
            *self.state.lock().unwrap() = Some(PlayerState::Ended);
            Ok(())
        }

        async fn set_volume(&self, level: f64) -> Result<(), ProviderError> {
            *self.volume.lock().unwrap() = level;
            Ok(())
        }

        async fn volume(&self) -> Result<f64, ProviderError> {
            Ok(*self.volume.lock().unwrap())
        }

        async fn video_id(&self) -> Result<Option<String>, ProviderError> {
            Ok(self.loaded.lock().unwrap().as_ref().map(|(id, _)| id.clone()))
        }

        async fn state(&self) -> Result<PlayerState, ProviderError> {
            Ok(self.state.lock().unwrap().unwrap_or(PlayerState::Cued))
        }
    }

    #[tokio::test]
    async fn test_commands_before_ready_are_dropped() {
        let driver = YoutubeDriver::default();
        assert_eq!(driver.load("vid", 3.0).await.unwrap(), LoadOutcome::Ignored);
        driver.set_volume(80).await.unwrap();
        driver.stop().await.unwrap();

        let player = Arc::new(FakePlayer::default());
        driver.attach(player.clone());

        // Nothing from before the ready signal was replayed.
        assert!(player.loaded.lock().unwrap().is_none());
        assert_eq!(*player.stops.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_and_same_id_predicate() {
        let driver = YoutubeDriver::default();
        let player = Arc::new(FakePlayer::default());
        driver.attach(player.clone());

        assert_eq!(driver.load("vid", 42.0).await.unwrap(), LoadOutcome::Started);
        assert_eq!(*player.loaded.lock().unwrap(), Some(("vid".to_string(), 42.0)));
        assert!(driver.is_playing("vid").await);

        *player.state.lock().unwrap() = Some(PlayerState::Paused);
        assert!(!driver.is_playing("vid").await);

        *player.state.lock().unwrap() = Some(PlayerState::Buffering);
        assert!(driver.is_playing("vid").await);
    }

    #[tokio::test]
    async fn test_volume_is_scaled() {
        let driver = YoutubeDriver::new(0.75);
        let player = Arc::new(FakePlayer::default());
        driver.attach(player.clone());

        driver.set_volume(80).await.unwrap();
        assert_eq!(*player.volume.lock().unwrap(), 60.0);
        assert_eq!(driver.current_volume().await, Some(80));
    }
}
