/// Session: the single owner of client playback state and its event loop
use crate::airhorn::{airhorn_level, Airhorns};
use crate::credentials::{CredentialCache, CredentialKind};
use crate::events::{ClientEvent, EventSink, ServerEvent};
use crate::models::{NowPlaying, Source};
use crate::playback::{Coordinator, PlaybackState, PlaybackTarget};
use crate::providers::soundcloud::{SoundcloudDriver, StreamReply};
use crate::providers::{BackendRegistry, BackendReport, ReportReceiver};
use crate::transport::Connection;
use crate::volume::{LocalVolume, Toggle};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Local controls fed into the session loop
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    ToggleProducer,
    ToggleMute,
    /// Ask the server to pause the shared queue
    Pause,
    Unpause,
    /// Ask the server to change the shared volume
    ChangeVolume(u8),
    /// The interactive reauthorization flow finished
    ReauthorizationComplete,
    Shutdown,
}

/// Starts the interactive provider re-authorization flow
pub trait Reauthorizer: Send + Sync {
    fn reauthorize(&self, url: &str);
}

/// Reauthorizer that only logs the URL
pub struct LogReauthorizer;

impl Reauthorizer for LogReauthorizer {
    fn reauthorize(&self, url: &str) {
        info!(url, "Provider authorization required");
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    /// Take the producer role as soon as the session starts
    pub producer_on_start: bool,
}

/// Snapshot of the session, published after every event
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub connected: bool,
    pub producer: bool,
    pub state: PlaybackState,
    pub muted: bool,
    pub effective_volume: u8,
    pub shared_volume: u8,
    pub now_playing: NowPlaying,
    /// Seconds left in the current item, from the last position push
    pub remaining: Option<f64>,
    pub playback_token: bool,
    pub search_token: bool,
    pub updated_at: DateTime<Utc>,
}

/// Everything a session is assembled from
pub struct SessionParts {
    pub connection: Connection,
    pub credentials: CredentialCache,
    pub backends: BackendRegistry,
    /// Driver that receives stream replies, when SoundCloud is enabled
    pub soundcloud: Option<Arc<SoundcloudDriver>>,
    /// Sound effects player, when airhorns are enabled
    pub airhorns: Option<Airhorns>,
    pub reports: ReportReceiver,
    pub reauthorizer: Arc<dyn Reauthorizer>,
    pub settings: SessionSettings,
}

/// Cloneable control surface for a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Queue a command. Returns false once the session has stopped.
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }
}

pub struct Session {
    connection: Connection,
    credentials: CredentialCache,
    coordinator: Coordinator,
    volume: LocalVolume,
    soundcloud: Option<Arc<SoundcloudDriver>>,
    airhorns: Option<Airhorns>,
    reauthorizer: Arc<dyn Reauthorizer>,
    settings: SessionSettings,
    now_playing: NowPlaying,
    remaining: Option<f64>,
    inbound: mpsc::UnboundedReceiver<ServerEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    reports: ReportReceiver,
    mute_tx: mpsc::UnboundedSender<Option<u8>>,
    mute_rx: mpsc::UnboundedReceiver<Option<u8>>,
    status_tx: watch::Sender<SessionStatus>,
}

impl Session {
    /// Build a session and subscribe it to the server events it consumes
    pub fn new(parts: SessionParts) -> (Self, SessionHandle) {
        let SessionParts {
            connection,
            credentials,
            backends,
            soundcloud,
            airhorns,
            reports,
            reauthorizer,
            settings,
        } = parts;

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        for name in ServerEvent::NAMES {
            let tx = inbound_tx.clone();
            connection.on(name, move |args| match ServerEvent::decode(name, args) {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(event = name, "Dropping undecodable event: {}", e),
            });
        }

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (mute_tx, mute_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(backends);
        let volume = LocalVolume::default();
        let now_playing = NowPlaying::default();
        let (status_tx, status) = watch::channel(snapshot(
            &connection,
            &credentials,
            &coordinator,
            &volume,
            &now_playing,
            None,
        ));

        let session = Self {
            connection,
            credentials,
            coordinator,
            volume,
            soundcloud,
            airhorns,
            reauthorizer,
            settings,
            now_playing,
            remaining: None,
            inbound,
            commands,
            reports,
            mute_tx,
            mute_rx,
            status_tx,
        };

        let handle = SessionHandle {
            commands: commands_tx,
            status,
        };
        (session, handle)
    }

    pub fn status(&self) -> SessionStatus {
        snapshot(
            &self.connection,
            &self.credentials,
            &self.coordinator,
            &self.volume,
            &self.now_playing,
            self.remaining,
        )
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn current_target(&self) -> PlaybackTarget {
        PlaybackTarget::from_now_playing(&self.now_playing)
    }

    /// Run until shut down
    pub async fn run(mut self) {
        self.start().await;

        loop {
            let deadline = self.credentials.next_deadline();
            tokio::select! {
                Some(event) = self.inbound.recv() => self.handle_server_event(event).await,
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(report) = self.reports.recv() => self.coordinator.handle_report(&report),
                Some(level) = self.mute_rx.recv() => self.on_mute_read(level).await,
                _ = wait_for(deadline) => self.on_credential_deadline(),
            }
            self.publish_status();
        }

        info!("Session shutting down");
        self.coordinator.set_producer(false).await;
        self.connection.close();
        self.publish_status();
    }

    async fn start(&mut self) {
        info!(
            connection = %self.connection.id(),
            url = %self.connection.url(),
            "Session starting"
        );
        self.connection.send_event(ClientEvent::FetchNowPlaying);
        self.connection.send_event(ClientEvent::RequestVolume);
        self.credentials
            .request(CredentialKind::Search, &self.connection, Instant::now());

        if self.settings.producer_on_start {
            self.toggle_producer().await;
        }
        self.publish_status();
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        let now = Instant::now();
        match event {
            ServerEvent::NowPlayingUpdate(update) => {
                if update.title.is_some() {
                    info!(
                        title = update.title.as_deref().unwrap_or_default(),
                        src = update.src.as_deref().unwrap_or_default(),
                        paused = update.paused,
                        "Now playing"
                    );
                    self.remaining = None;
                }
                self.now_playing.apply_update(update);
                let target = self.current_target();
                self.coordinator.apply(&target, self.volume.effective()).await;
            }
            ServerEvent::PlayerPosition(position) => {
                if let Some(duration) = self.now_playing.duration {
                    self.remaining = Some((duration - position.position).max(0.0));
                }
                let target = PlaybackTarget::from_position(&position, self.now_playing.paused);
                self.coordinator.apply(&target, self.volume.effective()).await;
            }
            ServerEvent::Volume(percent) => {
                debug!(percent, "Shared volume update");
                if let Some(level) = self.volume.on_shared_volume(percent) {
                    self.coordinator.set_output_volume(level).await;
                }
            }
            ServerEvent::AuthTokenUpdate(grant) => {
                if self.credentials.on_update(CredentialKind::Playback, grant, now) {
                    let target = self.current_target();
                    self.coordinator
                        .on_playback_token_refreshed(&target, self.volume.effective())
                        .await;
                }
            }
            ServerEvent::SearchTokenUpdate(grant) => {
                self.credentials.on_update(CredentialKind::Search, grant, now);
            }
            ServerEvent::AuthTokenRefresh(url) => {
                if self.credentials.take_reauthorization() {
                    info!("Starting provider reauthorization");
                    self.reauthorizer.reauthorize(&url);
                } else {
                    debug!("Ignoring unsolicited reauthorization request");
                }
            }
            ServerEvent::StreamResolved(reply) => {
                if let Some(driver) = &self.soundcloud {
                    let outcome = driver.on_stream_resolved(reply);
                    self.on_stream_reply(outcome);
                }
            }
            ServerEvent::StreamError(failure) => {
                if let Some(driver) = &self.soundcloud {
                    let outcome = driver.on_stream_error(failure);
                    self.on_stream_reply(outcome);
                }
            }
            ServerEvent::DoAirhorn { volume, name } => {
                self.on_airhorn(volume, &name);
                self.connection.send_event(ClientEvent::FetchAirhorns);
            }
        }
    }

    /// Only the producer sounds airhorns, at a level that follows local mute
    fn on_airhorn(&self, gain: f64, name: &str) {
        if !self.coordinator.is_producer() {
            debug!(name, "Not producing, skipping airhorn");
            return;
        }
        let Some(airhorns) = &self.airhorns else {
            return;
        };
        let level = airhorn_level(gain, self.volume.effective());
        if level == 0 {
            debug!(name, "Airhorn silenced");
            return;
        }
        if let Err(e) = airhorns.play(name, level) {
            warn!(name, "Failed to play airhorn: {}", e);
        }
    }

    fn on_stream_reply(&mut self, outcome: StreamReply) {
        if let StreamReply::Failed { track_id, reason } = outcome {
            self.coordinator.handle_report(&BackendReport::Failed {
                source: Source::Soundcloud,
                id: track_id,
                reason,
            });
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ToggleProducer => self.toggle_producer().await,
            SessionCommand::ToggleMute => self.toggle_mute().await,
            SessionCommand::Pause => self.connection.send_event(ClientEvent::Pause),
            SessionCommand::Unpause => self.connection.send_event(ClientEvent::Unpause),
            SessionCommand::ChangeVolume(percent) => self
                .connection
                .send_event(ClientEvent::ChangeVolume(percent.min(100))),
            SessionCommand::ReauthorizationComplete => {
                if self.credentials.reauthorization_in_flight() {
                    self.credentials
                        .complete_reauthorization(&self.connection, Instant::now());
                } else {
                    debug!("No reauthorization in progress");
                }
            }
            SessionCommand::Shutdown => {}
        }
    }

    async fn toggle_producer(&mut self) {
        if self.coordinator.is_producer() {
            self.coordinator.set_producer(false).await;
            return;
        }

        self.coordinator.set_producer(true).await;
        let now = Instant::now();
        let has_token = self.credentials.is_held(CredentialKind::Playback, now);
        if !has_token {
            self.credentials.arm_reauthorization();
            self.credentials
                .request(CredentialKind::Playback, &self.connection, now);
        }

        // Spotify has to wait for its credential; the others can start now.
        let target = self.current_target();
        if has_token || self.now_playing.source() != Some(Source::Spotify) {
            self.coordinator.apply(&target, self.volume.effective()).await;
        }
        self.connection.send_event(ClientEvent::RequestVolume);
    }

    async fn toggle_mute(&mut self) {
        match self.volume.begin_toggle() {
            Toggle::Rejected => debug!("Mute toggle already in flight"),
            Toggle::Unmuted(level) => {
                info!(level, "Local mute off");
                self.coordinator.set_output_volume(level).await;
            }
            Toggle::ReadLevel => {
                let backend = self.coordinator.active_backend();
                let reply = self.mute_tx.clone();
                tokio::spawn(async move {
                    let level = match backend {
                        Some(backend) => backend.current_volume().await,
                        None => None,
                    };
                    let _ = reply.send(level);
                });
            }
        }
    }

    async fn on_mute_read(&mut self, level: Option<u8>) {
        let effective = self.volume.complete_mute(level);
        info!(restore_to = ?level, "Local mute on");
        self.coordinator.set_output_volume(effective).await;
    }

    fn on_credential_deadline(&mut self) {
        self.credentials
            .poll_expired(&self.connection, Instant::now());
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn snapshot(
    connection: &Connection,
    credentials: &CredentialCache,
    coordinator: &Coordinator,
    volume: &LocalVolume,
    now_playing: &NowPlaying,
    remaining: Option<f64>,
) -> SessionStatus {
    let now = Instant::now();
    SessionStatus {
        connected: connection.is_open(),
        producer: coordinator.is_producer(),
        state: coordinator.state(),
        muted: volume.is_muted(),
        effective_volume: volume.effective(),
        shared_volume: volume.shared_volume(),
        now_playing: now_playing.clone(),
        remaining,
        playback_token: credentials.is_held(CredentialKind::Playback, now),
        search_token: credentials.is_held(CredentialKind::Search, now),
        updated_at: Utc::now(),
    }
}
