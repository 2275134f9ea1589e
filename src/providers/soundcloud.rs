/// SoundCloud backend: resolves a stream through the server, then plays it locally
use super::{LoadOutcome, PlaybackBackend};
use crate::error::ProviderError;
use crate::events::{ClientEvent, EventSink};
use crate::models::{Source, StreamFailed, StreamResolved};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a stream request may wait for its reply before it is asked again
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Local audio sink for resolved streams
pub trait AudioOutput: Send + Sync {
    /// Begin playing `url` from `start`. Returns once playback is scheduled.
    fn play(&self, track_id: &str, url: &str, start: Duration, volume: u8) -> Result<(), ProviderError>;
    fn stop(&self);
    fn set_volume(&self, percent: u8);
}

/// Outcome of feeding a resolution reply to the driver
#[derive(Debug, Clone, PartialEq)]
pub enum StreamReply {
    /// The reply matched the current request and playback started
    Committed,
    /// The reply belongs to a request that is no longer current
    Stale,
    /// The current request failed and was abandoned
    Failed { track_id: String, reason: String },
}

/// A stream request awaiting its reply
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStream {
    pub track_id: String,
    pub position: f64,
    pub requested_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
enum StreamState {
    Idle,
    Pending(PendingStream),
    Playing { track_id: String },
}

impl StreamState {
    fn track_id(&self) -> Option<&str> {
        match self {
            StreamState::Idle => None,
            StreamState::Pending(pending) => Some(&pending.track_id),
            StreamState::Playing { track_id } => Some(track_id),
        }
    }
}

/// SoundCloud driver.
///
/// `load` only records a pending request and asks the server for a stream;
/// the reply is matched against the still-current request by track id. A
/// request left unanswered past the stream timeout no longer counts as
/// playing, so the next position update asks again.
pub struct SoundcloudDriver {
    events: Arc<dyn EventSink>,
    output: Arc<dyn AudioOutput>,
    state: Mutex<StreamState>,
    volume: AtomicU8,
    stream_timeout: Duration,
}

impl SoundcloudDriver {
    pub fn new(events: Arc<dyn EventSink>, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            events,
            output,
            state: Mutex::new(StreamState::Idle),
            volume: AtomicU8::new(100),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The request currently awaiting resolution, if any
    pub fn pending(&self) -> Option<PendingStream> {
        match &*self.state() {
            StreamState::Pending(pending) => Some(pending.clone()),
            _ => None,
        }
    }

    /// Commit a resolved stream if it answers the current request
    pub fn on_stream_resolved(&self, reply: StreamResolved) -> StreamReply {
        let mut state = self.state();
        let pending = match &*state {
            StreamState::Pending(pending) if pending.track_id == reply.track_id => pending.clone(),
            _ => {
                debug!(track_id = %reply.track_id, "Discarding stale stream reply");
                return StreamReply::Stale;
            }
        };

        let Some(url) = reply.stream_url.filter(|url| !url.is_empty()) else {
            warn!(track_id = %pending.track_id, "Stream reply carried no URL");
            *state = StreamState::Idle;
            return StreamReply::Failed {
                track_id: pending.track_id,
                reason: "no stream url".to_string(),
            };
        };

        let start = Duration::from_secs_f64(pending.position.max(0.0));
        let volume = self.volume.load(Ordering::SeqCst);
        match self.output.play(&pending.track_id, &url, start, volume) {
            Ok(()) => {
                info!(
                    track_id = %pending.track_id,
                    position = pending.position,
                    waited_ms = pending.requested_at.elapsed().as_millis() as u64,
                    "SoundCloud stream committed"
                );
                *state = StreamState::Playing {
                    track_id: pending.track_id,
                };
                StreamReply::Committed
            }
            Err(e) => {
                warn!(track_id = %pending.track_id, "Failed to start stream: {}", e);
                *state = StreamState::Idle;
                StreamReply::Failed {
                    track_id: pending.track_id,
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Abandon the current request when the server could not resolve it
    pub fn on_stream_error(&self, failure: StreamFailed) -> StreamReply {
        let mut state = self.state();
        if state.track_id() != Some(failure.track_id.as_str()) {
            debug!(track_id = %failure.track_id, "Ignoring stream error for stale request");
            return StreamReply::Stale;
        }
        let reason = failure.error.unwrap_or_else(|| "unknown error".to_string());
        warn!(track_id = %failure.track_id, "Stream resolution failed: {}", reason);
        *state = StreamState::Idle;
        drop(state);
        self.output.stop();
        StreamReply::Failed {
            track_id: failure.track_id,
            reason,
        }
    }
}

#[async_trait]
impl PlaybackBackend for SoundcloudDriver {
    fn source(&self) -> Source {
        Source::Soundcloud
    }

    async fn load(&self, id: &str, position: f64) -> Result<LoadOutcome, ProviderError> {
        let replaced = {
            let mut state = self.state();
            let replaced = !matches!(*state, StreamState::Idle);
            *state = StreamState::Pending(PendingStream {
                track_id: id.to_string(),
                position,
                requested_at: Instant::now(),
            });
            replaced
        };
        if replaced {
            self.output.stop();
        }
        self.events.send_event(ClientEvent::GetStream(id.to_string()));
        debug!(track_id = id, position, "Requested SoundCloud stream");
        Ok(LoadOutcome::Requested)
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        let was_active = {
            let mut state = self.state();
            let was_active = !matches!(*state, StreamState::Idle);
            *state = StreamState::Idle;
            was_active
        };
        if was_active {
            self.output.stop();
        }
        Ok(())
    }

    async fn set_volume(&self, percent: u8) -> Result<(), ProviderError> {
        self.volume.store(percent.min(100), Ordering::SeqCst);
        self.output.set_volume(percent.min(100));
        Ok(())
    }

    async fn current_volume(&self) -> Option<u8> {
        Some(self.volume.load(Ordering::SeqCst))
    }

    async fn currently_playing_id(&self) -> Option<String> {
        match &*self.state() {
            StreamState::Pending(pending) if pending.requested_at.elapsed() >= self.stream_timeout => {
                debug!(
                    track_id = %pending.track_id,
                    waited_ms = pending.requested_at.elapsed().as_millis() as u64,
                    "Stream request unanswered"
                );
                None
            }
            state => state.track_id().map(str::to_string),
        }
    }
}
