/// Playback backend trait and drivers
#[cfg(unix)]
pub mod mpv;
pub mod soundcloud;
pub mod spotify;
pub mod youtube;

use crate::error::ProviderError;
use crate::models::Source;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Result of asking a backend to load an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The play command was dispatched
    Started,
    /// A playable reference was requested; playback starts when it arrives
    Requested,
    /// The backend is not ready and dropped the command
    Ignored,
}

/// Asynchronous outcome reported by a backend after `load` returned
#[derive(Debug, Clone, PartialEq)]
pub enum BackendReport {
    /// Bounded retries ran out without the command succeeding
    RetriesExhausted { source: Source, id: String },
    /// Playback of a loaded item failed
    Failed {
        source: Source,
        id: String,
        reason: String,
    },
}

impl BackendReport {
    pub fn source(&self) -> Source {
        match self {
            BackendReport::RetriesExhausted { source, .. } => *source,
            BackendReport::Failed { source, .. } => *source,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            BackendReport::RetriesExhausted { id, .. } => id,
            BackendReport::Failed { id, .. } => id,
        }
    }
}

pub type ReportSender = mpsc::UnboundedSender<BackendReport>;
pub type ReportReceiver = mpsc::UnboundedReceiver<BackendReport>;

/// Uniform control surface over a provider-specific playback API
#[async_trait]
pub trait PlaybackBackend: Send + Sync {
    /// Provider rendered by this backend
    fn source(&self) -> Source;

    /// Start playing `id` at `position` seconds
    async fn load(&self, id: &str, position: f64) -> Result<LoadOutcome, ProviderError>;

    /// Silence the backend. Stopping an idle backend is a no-op.
    async fn stop(&self) -> Result<(), ProviderError>;

    async fn set_volume(&self, percent: u8) -> Result<(), ProviderError>;

    /// True output level, when the provider can report it
    async fn current_volume(&self) -> Option<u8>;

    async fn currently_playing_id(&self) -> Option<String>;

    /// Same-id predicate used to skip redundant restarts
    async fn is_playing(&self, id: &str) -> bool {
        self.currently_playing_id().await.as_deref() == Some(id)
    }

    /// Continue the loaded item after an interruption
    async fn resume(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Backend registry keyed by provider
pub struct BackendRegistry {
    backends: HashMap<Source, Arc<dyn PlaybackBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    pub fn register(&mut self, backend: Arc<dyn PlaybackBackend>) {
        self.backends.insert(backend.source(), backend);
    }

    pub fn get(&self, source: Source) -> Option<Arc<dyn PlaybackBackend>> {
        self.backends.get(&source).cloned()
    }

    /// Registered backends in a stable provider order
    pub fn get_all(&self) -> Vec<Arc<dyn PlaybackBackend>> {
        Source::ALL
            .iter()
            .filter_map(|source| self.get(*source))
            .collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
