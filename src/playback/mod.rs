/// Playback coordination: keeps the producing backend in step with pushed state
pub mod audio;

pub use audio::RodioOutput;

use crate::error::ProviderError;
use crate::models::{NowPlaying, PlayerPosition, Source};
use crate::providers::{BackendRegistry, BackendReport, LoadOutcome, PlaybackBackend};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest the session loop waits on any single backend command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    ActiveOn(Source),
    Paused,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "idle"),
            PlaybackState::ActiveOn(source) => write!(f, "playing on {}", source),
            PlaybackState::Paused => write!(f, "paused"),
        }
    }
}

/// What the producer should be rendering, derived from a push
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackTarget {
    pub src: Option<String>,
    pub track_id: Option<String>,
    pub position: f64,
    pub paused: bool,
}

impl PlaybackTarget {
    pub fn from_now_playing(now_playing: &NowPlaying) -> Self {
        Self {
            src: now_playing.src.clone(),
            track_id: now_playing.track_id.clone(),
            position: now_playing.position(),
            paused: now_playing.paused,
        }
    }

    /// Position pushes carry no pause flag; it comes from the last NowPlaying
    pub fn from_position(position: &PlayerPosition, paused: bool) -> Self {
        Self {
            src: Some(position.src.clone()),
            track_id: Some(position.track_id.clone()),
            position: position.position.max(0.0),
            paused,
        }
    }
}

/// Playback Coordinator.
///
/// Only acts while this client is the producer. At most one provider emits
/// audio at a time; each provider has a memo of the last id committed to it so
/// duplicate pushes do not restart playback.
pub struct Coordinator {
    backends: BackendRegistry,
    producer: bool,
    active: Option<Source>,
    paused: bool,
    memos: HashMap<Source, String>,
    command_timeout: Duration,
}

impl Coordinator {
    pub fn new(backends: BackendRegistry) -> Self {
        Self {
            backends,
            producer: false,
            active: None,
            paused: false,
            memos: HashMap::new(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Run a backend command, giving up once the command timeout passes
    async fn bounded<T>(
        &self,
        source: Source,
        command: &'static str,
        fut: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%source, command, timeout = ?self.command_timeout, "Backend command timed out");
                Err(ProviderError::Timeout)
            }
        }
    }

    async fn still_playing(&self, backend: &dyn PlaybackBackend, track_id: &str) -> bool {
        let check = async { Ok(backend.is_playing(track_id).await) };
        self.bounded(backend.source(), "is_playing", check)
            .await
            .unwrap_or(false)
    }

    pub fn is_producer(&self) -> bool {
        self.producer
    }

    pub fn active(&self) -> Option<Source> {
        self.active
    }

    pub fn state(&self) -> PlaybackState {
        if self.paused {
            PlaybackState::Paused
        } else {
            match self.active {
                Some(source) => PlaybackState::ActiveOn(source),
                None => PlaybackState::Idle,
            }
        }
    }

    pub fn memo(&self, source: Source) -> Option<&str> {
        self.memos.get(&source).map(String::as_str)
    }

    pub fn active_backend(&self) -> Option<Arc<dyn PlaybackBackend>> {
        self.active.and_then(|source| self.backends.get(source))
    }

    pub fn backend(&self, source: Source) -> Option<Arc<dyn PlaybackBackend>> {
        self.backends.get(source)
    }

    /// Toggle the producer role. Turning it off silences every backend and
    /// forgets what was committed.
    pub async fn set_producer(&mut self, producer: bool) {
        if self.producer == producer {
            return;
        }
        self.producer = producer;
        if producer {
            info!("Now producing audio");
            return;
        }

        info!("Stopped producing audio");
        self.stop_all(None).await;
        self.memos.clear();
        self.active = None;
        self.paused = false;
    }

    /// Reconcile backends against a pushed update
    pub async fn apply(&mut self, target: &PlaybackTarget, volume: u8) {
        if !self.producer {
            return;
        }

        if target.paused {
            if !self.paused {
                info!("Playback paused, stopping all backends");
            }
            self.stop_all(None).await;
            self.memos.clear();
            self.active = None;
            self.paused = true;
            return;
        }
        self.paused = false;

        let Some(track_id) = target.track_id.as_deref() else {
            debug!("Update without a track id, nothing to play");
            return;
        };

        let source = match target.src.as_deref().map(str::parse::<Source>) {
            Some(Ok(source)) => source,
            _ => {
                if self.active.is_some() {
                    warn!(src = ?target.src, "Cannot render this source, silencing backends");
                    self.stop_all(None).await;
                    self.active = None;
                }
                return;
            }
        };

        if self.active != Some(source) {
            info!(from = ?self.active, to = %source, "Switching playback provider");
            self.stop_all(Some(source)).await;
            self.active = Some(source);
        }

        self.commit(source, track_id, target.position, volume).await;
    }

    async fn commit(&mut self, source: Source, track_id: &str, position: f64, volume: u8) {
        let Some(backend) = self.backends.get(source) else {
            warn!(%source, "No backend registered");
            return;
        };

        if self.memos.get(&source).map(String::as_str) == Some(track_id)
            && self.still_playing(backend.as_ref(), track_id).await
        {
            debug!(%source, track_id, "Already playing, skipping load");
            return;
        }

        match self
            .bounded(source, "load", backend.load(track_id, position))
            .await
        {
            Ok(LoadOutcome::Ignored) => {
                debug!(%source, track_id, "Backend not ready, load ignored");
                self.memos.remove(&source);
            }
            Ok(outcome) => {
                info!(%source, track_id, position, ?outcome, "Committed track");
                self.memos.insert(source, track_id.to_string());
                if let Err(e) = self
                    .bounded(source, "set_volume", backend.set_volume(volume))
                    .await
                {
                    warn!(%source, "Failed to set volume: {}", e);
                }
            }
            Err(e) => {
                warn!(%source, track_id, "Load failed: {}", e);
                self.memos.remove(&source);
            }
        }
    }

    /// Stop every backend except `keep`
    async fn stop_all(&self, keep: Option<Source>) {
        for backend in self.backends.get_all() {
            if Some(backend.source()) == keep {
                continue;
            }
            if let Err(e) = self
                .bounded(backend.source(), "stop", backend.stop())
                .await
            {
                warn!(source = %backend.source(), "Failed to stop backend: {}", e);
            }
        }
    }

    /// Drive the active backend to a new local output level
    pub async fn set_output_volume(&self, volume: u8) {
        if !self.producer || self.paused {
            return;
        }
        if let Some(backend) = self.active_backend() {
            if let Err(e) = self
                .bounded(backend.source(), "set_volume", backend.set_volume(volume))
                .await
            {
                warn!(source = %backend.source(), "Failed to set volume: {}", e);
            }
        }
    }

    /// A fresh playback credential arrived
    pub async fn on_playback_token_refreshed(&mut self, target: &PlaybackTarget, volume: u8) {
        if !self.producer || target.paused {
            return;
        }
        if self.active == Some(Source::Spotify) && self.memos.contains_key(&Source::Spotify) {
            if let Some(backend) = self.backends.get(Source::Spotify) {
                if let Err(e) = self
                    .bounded(Source::Spotify, "resume", backend.resume())
                    .await
                {
                    warn!("Failed to resume Spotify: {}", e);
                }
            }
            return;
        }
        self.apply(target, volume).await;
    }

    /// Forget a commit that a backend could not carry out, so a later push
    /// retries it
    pub fn handle_report(&mut self, report: &BackendReport) {
        let source = report.source();
        let matches = match self.memos.get(&source) {
            Some(memo) => memo == report.id() || memo_matches_uri(source, memo, report.id()),
            None => false,
        };
        if matches {
            info!(%source, id = report.id(), "Clearing memo after backend report");
            self.memos.remove(&source);
        } else {
            debug!(%source, id = report.id(), "Report for an item no longer committed");
        }
    }
}

fn memo_matches_uri(source: Source, memo: &str, reported: &str) -> bool {
    source == Source::Spotify && crate::providers::spotify::track_uri(memo) == reported
}
