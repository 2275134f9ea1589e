/// Echonest Player - client playback engine for a shared listening queue
pub mod airhorn;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod models;
pub mod playback;
pub mod providers;
pub mod session;
pub mod transport;
pub mod volume;

pub use config::Config;
pub use error::{ConfigError, EventError, ProviderError, TransportError};
pub use events::{ClientEvent, EventSink, ServerEvent};
pub use models::{NowPlaying, Source};
pub use playback::{Coordinator, PlaybackState};
pub use providers::{BackendRegistry, PlaybackBackend};
pub use session::{Session, SessionCommand, SessionHandle, SessionStatus};
pub use transport::Connection;
