/// Spotify backend: remote-controls the listener's active Spotify device
use super::{BackendReport, LoadOutcome, PlaybackBackend, ReportSender};
use crate::error::ProviderError;
use crate::models::Source;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const DEFAULT_API_BASE: &str = "https://api.spotify.com/v1";

/// Playback state reported by `GET /me/player`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerState {
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub progress_ms: Option<u64>,
    #[serde(default)]
    pub device: Option<Device>,
    #[serde(default)]
    pub item: Option<Item>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub volume_percent: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Item {
    pub uri: String,
}

#[derive(Debug, Serialize)]
struct PlayRequest<'a> {
    uris: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    position_ms: Option<u64>,
}

/// Bearer-authenticated player endpoints
#[async_trait]
pub trait SpotifyApi: Send + Sync + 'static {
    async fn play(&self, token: &str, uri: &str, position_ms: Option<u64>) -> Result<(), ProviderError>;
    async fn resume(&self, token: &str) -> Result<(), ProviderError>;
    async fn pause(&self, token: &str) -> Result<(), ProviderError>;
    async fn set_volume(&self, token: &str, percent: u8) -> Result<(), ProviderError>;
    async fn player_state(&self, token: &str) -> Result<Option<PlayerState>, ProviderError>;
}

/// Spotify Web API client
pub struct WebApiClient {
    base_url: String,
    client: Client,
}

impl WebApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Default for WebApiClient {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE)
    }
}

/// Map a Web API status onto the provider error taxonomy
fn check_status(status: StatusCode) -> Result<(), ProviderError> {
    match status {
        status if status.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED => Err(ProviderError::CredentialRejected),
        StatusCode::NOT_FOUND => Err(ProviderError::NoActiveDevice),
        status => Err(ProviderError::Status(status.as_u16())),
    }
}

/// `204 No Content` means no device has an active session
fn player_state_from(status: StatusCode, body: &[u8]) -> Result<Option<PlayerState>, ProviderError> {
    check_status(status)?;
    if status == StatusCode::NO_CONTENT || body.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(body)?))
}

#[async_trait]
impl SpotifyApi for WebApiClient {
    async fn play(&self, token: &str, uri: &str, position_ms: Option<u64>) -> Result<(), ProviderError> {
        let response = self
            .client
            .put(self.url("/me/player/play"))
            .bearer_auth(token)
            .json(&PlayRequest {
                uris: [uri],
                position_ms,
            })
            .send()
            .await?;
        check_status(response.status())
    }

    async fn resume(&self, token: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .put(self.url("/me/player/play"))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;
        check_status(response.status())
    }

    async fn pause(&self, token: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .put(self.url("/me/player/pause"))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;
        check_status(response.status())
    }

    async fn set_volume(&self, token: &str, percent: u8) -> Result<(), ProviderError> {
        let response = self
            .client
            .put(self.url("/me/player/volume"))
            .bearer_auth(token)
            .query(&[("volume_percent", percent.min(100))])
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;
        check_status(response.status())
    }

    async fn player_state(&self, token: &str) -> Result<Option<PlayerState>, ProviderError> {
        let response = self
            .client
            .get(self.url("/me/player"))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        player_state_from(status, &body)
    }
}

/// Fixed-delay retry policy for commands hitting "no active device"
#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    pub delay: Duration,
    pub attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            attempts: 5,
        }
    }
}

/// Expand a bare track id into a Spotify URI
pub fn track_uri(id: &str) -> String {
    if id.starts_with("spotify:") {
        id.to_string()
    } else {
        format!("spotify:track:{}", id)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Loaded {
    uri: String,
    position_ms: Option<u64>,
}

type LoadedSlot = Arc<Mutex<Option<Loaded>>>;

#[derive(Debug)]
enum DeviceCommand {
    Play { target: Loaded, generation: u64 },
    Pause,
    Volume(u8),
    Resume,
}

/// Owns the device: runs commands one at a time, in the order they were issued
struct DeviceWorker {
    api: Arc<dyn SpotifyApi>,
    token: watch::Receiver<Option<String>>,
    reports: ReportSender,
    retry: RetrySettings,
    generation: watch::Receiver<u64>,
    loaded: LoadedSlot,
    /// Level the device refused because no session was active yet
    pending_volume: Option<u8>,
}

impl DeviceWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<DeviceCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                DeviceCommand::Play { target, generation } => self.play(target, generation).await,
                DeviceCommand::Pause => self.pause().await,
                DeviceCommand::Volume(percent) => self.set_volume(percent).await,
                DeviceCommand::Resume => self.resume().await,
            }
        }
        debug!("Spotify device worker stopped");
    }

    fn token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    fn superseded(&mut self, generation: u64) -> bool {
        *self.generation.borrow_and_update() != generation
    }

    async fn play(&mut self, target: Loaded, generation: u64) {
        let mut retries_left = self.retry.attempts;
        let failure = loop {
            if self.superseded(generation) {
                debug!(uri = %target.uri, "Play command superseded");
                return;
            }
            let token = match self.token() {
                Some(token) => token,
                None => break ProviderError::CredentialExpired,
            };

            match self.api.play(&token, &target.uri, target.position_ms).await {
                Ok(()) => {
                    info!(uri = %target.uri, position_ms = ?target.position_ms, "Spotify playback started");
                    if let Some(percent) = self.pending_volume.take() {
                        self.set_volume(percent).await;
                    }
                    return;
                }
                Err(e) if e.is_retryable() && retries_left > 0 => {
                    warn!(
                        uri = %target.uri,
                        retries_left,
                        "Spotify play failed ({}), retrying in {:?}",
                        e,
                        self.retry.delay
                    );
                    retries_left -= 1;
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry.delay) => {}
                        changed = self.generation.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => break e,
            }
        };

        if self.superseded(generation) {
            return;
        }
        {
            let mut slot = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref() == Some(&target) {
                *slot = None;
            }
        }
        let report = if failure.is_retryable() {
            warn!(uri = %target.uri, "Spotify play retries exhausted");
            BackendReport::RetriesExhausted {
                source: Source::Spotify,
                id: target.uri.clone(),
            }
        } else {
            warn!(uri = %target.uri, "Spotify play failed: {}", failure);
            BackendReport::Failed {
                source: Source::Spotify,
                id: target.uri.clone(),
                reason: failure.to_string(),
            }
        };
        let _ = self.reports.send(report);
    }

    async fn pause(&mut self) {
        let Some(token) = self.token() else {
            warn!("Cannot pause Spotify without a playback credential");
            return;
        };
        match self.api.pause(&token).await {
            Ok(()) => debug!("Spotify paused"),
            Err(e) => warn!("Failed to pause Spotify: {}", e),
        }
    }

    async fn set_volume(&mut self, percent: u8) {
        let Some(token) = self.token() else {
            self.pending_volume = Some(percent);
            return;
        };
        match self.api.set_volume(&token, percent).await {
            Ok(()) => {
                self.pending_volume = None;
                debug!(percent, "Spotify volume set");
            }
            Err(e) if e.is_retryable() => {
                debug!(percent, "No active Spotify device, volume held for next play");
                self.pending_volume = Some(percent);
            }
            Err(e) => warn!(percent, "Failed to set Spotify volume: {}", e),
        }
    }

    async fn resume(&mut self) {
        let Some(token) = self.token() else {
            return;
        };
        match self.api.resume(&token).await {
            Ok(()) => info!("Spotify playback resumed"),
            Err(e) => warn!("Failed to resume Spotify: {}", e),
        }
    }
}

/// Spotify driver.
///
/// Device commands go through a single queue drained by one worker task, so
/// the session loop never waits on the Web API and a pause can never overtake
/// the play issued before it. Every `load` and `stop` bumps a generation; a
/// queued or retrying play that finds the generation moved gives up silently.
pub struct SpotifyDriver {
    api: Arc<dyn SpotifyApi>,
    token: watch::Receiver<Option<String>>,
    commands: mpsc::UnboundedSender<DeviceCommand>,
    generation: watch::Sender<u64>,
    loaded: LoadedSlot,
    volume: Mutex<Option<u8>>,
}

impl SpotifyDriver {
    /// Must be called inside a tokio runtime; the device worker is spawned here.
    pub fn new(
        api: Arc<dyn SpotifyApi>,
        token: watch::Receiver<Option<String>>,
        reports: ReportSender,
        retry: RetrySettings,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (generation, generation_rx) = watch::channel(0);
        let loaded: LoadedSlot = Arc::new(Mutex::new(None));

        let worker = DeviceWorker {
            api: Arc::clone(&api),
            token: token.clone(),
            reports,
            retry,
            generation: generation_rx,
            loaded: Arc::clone(&loaded),
            pending_volume: None,
        };
        tokio::spawn(worker.run(commands_rx));

        Self {
            api,
            token,
            commands,
            generation,
            loaded,
            volume: Mutex::new(None),
        }
    }

    fn current_token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    fn loaded(&self) -> Option<Loaded> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_loaded(&self, value: Option<Loaded>) -> Option<Loaded> {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *loaded, value)
    }

    fn next_generation(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|generation| {
            *generation += 1;
            next = *generation;
        });
        next
    }

    fn enqueue(&self, command: DeviceCommand) -> Result<(), ProviderError> {
        self.commands
            .send(command)
            .map_err(|_| ProviderError::Command("Spotify device worker stopped".to_string()))
    }
}

#[async_trait]
impl PlaybackBackend for SpotifyDriver {
    fn source(&self) -> Source {
        Source::Spotify
    }

    async fn load(&self, id: &str, position: f64) -> Result<LoadOutcome, ProviderError> {
        let position_ms = if position > 0.0 {
            Some((position * 1000.0).round() as u64)
        } else {
            None
        };
        let target = Loaded {
            uri: track_uri(id),
            position_ms,
        };

        if self.loaded().as_ref() == Some(&target) {
            debug!(uri = %target.uri, "Spotify already loaded at this position");
            return Ok(LoadOutcome::Started);
        }

        if self.current_token().is_none() {
            return Err(ProviderError::CredentialExpired);
        }
        let generation = self.next_generation();
        self.set_loaded(Some(target.clone()));
        self.enqueue(DeviceCommand::Play { target, generation })?;
        Ok(LoadOutcome::Started)
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        self.next_generation();
        if self.set_loaded(None).is_none() {
            return Ok(());
        }
        self.enqueue(DeviceCommand::Pause)
    }

    async fn set_volume(&self, percent: u8) -> Result<(), ProviderError> {
        *self.volume.lock().unwrap_or_else(|e| e.into_inner()) = Some(percent);
        self.enqueue(DeviceCommand::Volume(percent))
    }

    async fn current_volume(&self) -> Option<u8> {
        let last_set = *self.volume.lock().unwrap_or_else(|e| e.into_inner());
        let token = match self.current_token() {
            Some(token) => token,
            None => return last_set,
        };
        match self.api.player_state(&token).await {
            Ok(Some(state)) => state
                .device
                .and_then(|device| device.volume_percent)
                .or(last_set),
            Ok(None) => last_set,
            Err(e) => {
                warn!("Failed to read Spotify volume: {}", e);
                last_set
            }
        }
    }

    async fn currently_playing_id(&self) -> Option<String> {
        self.loaded().map(|loaded| loaded.uri)
    }

    async fn is_playing(&self, id: &str) -> bool {
        self.loaded().map(|loaded| loaded.uri) == Some(track_uri(id))
    }

    async fn resume(&self) -> Result<(), ProviderError> {
        if self.current_token().is_none() {
            return Err(ProviderError::CredentialExpired);
        }
        self.enqueue(DeviceCommand::Resume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    enum ApiCall {
        Play(String, Option<u64>),
        Resume,
        Pause,
        Volume(u8),
    }

    #[derive(Default)]
    struct FakeApi {
        calls: Mutex<Vec<ApiCall>>,
        play_results: Mutex<VecDeque<Result<(), ProviderError>>>,
        volume_results: Mutex<VecDeque<Result<(), ProviderError>>>,
        device_volume: Mutex<Option<u8>>,
        device_playing: Mutex<bool>,
        play_delay: Duration,
        pause_delay: Duration,
    }

    impl FakeApi {
        fn calls(&self) -> Vec<ApiCall> {
            self.calls.lock().unwrap().clone()
        }

        fn plays(&self) -> usize {
            self.calls()
                .into_iter()
                .filter(|call| matches!(call, ApiCall::Play(..)))
                .count()
        }

        fn script_play(&self, results: Vec<Result<(), ProviderError>>) {
            self.play_results.lock().unwrap().extend(results);
        }

        fn script_volume(&self, results: Vec<Result<(), ProviderError>>) {
            self.volume_results.lock().unwrap().extend(results);
        }

        fn device_playing(&self) -> bool {
            *self.device_playing.lock().unwrap()
        }
    }

    #[async_trait]
    impl SpotifyApi for FakeApi {
        async fn play(&self, _token: &str, uri: &str, position_ms: Option<u64>) -> Result<(), ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push(ApiCall::Play(uri.to_string(), position_ms));
            tokio::time::sleep(self.play_delay).await;
            let result = self.play_results.lock().unwrap().pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                *self.device_playing.lock().unwrap() = true;
            }
            result
        }

        async fn resume(&self, _token: &str) -> Result<(), ProviderError> {
            self.calls.lock().unwrap().push(ApiCall::Resume);
            *self.device_playing.lock().unwrap() = true;
            Ok(())
        }

        async fn pause(&self, _token: &str) -> Result<(), ProviderError> {
            self.calls.lock().unwrap().push(ApiCall::Pause);
            tokio::time::sleep(self.pause_delay).await;
            *self.device_playing.lock().unwrap() = false;
            Ok(())
        }

        async fn set_volume(&self, _token: &str, percent: u8) -> Result<(), ProviderError> {
            self.calls.lock().unwrap().push(ApiCall::Volume(percent));
            self.volume_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn player_state(&self, _token: &str) -> Result<Option<PlayerState>, ProviderError> {
            Ok(Some(PlayerState {
                device: Some(Device {
                    volume_percent: *self.device_volume.lock().unwrap(),
                }),
                ..Default::default()
            }))
        }
    }

    struct Fixture {
        api: Arc<FakeApi>,
        driver: SpotifyDriver,
        reports: mpsc::UnboundedReceiver<BackendReport>,
        _token: watch::Sender<Option<String>>,
    }

    fn fixture(token: Option<&str>) -> Fixture {
        fixture_with(FakeApi::default(), token)
    }

    fn fixture_with(api: FakeApi, token: Option<&str>) -> Fixture {
        let api = Arc::new(api);
        let (token_tx, token_rx) = watch::channel(token.map(str::to_string));
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let driver = SpotifyDriver::new(api.clone(), token_rx, reports_tx, RetrySettings::default());
        Fixture {
            api,
            driver,
            reports,
            _token: token_tx,
        }
    }

    #[test]
    fn test_track_uri_expansion() {
        assert_eq!(track_uri("abc"), "spotify:track:abc");
        assert_eq!(track_uri("spotify:episode:xyz"), "spotify:episode:xyz");
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(check_status(StatusCode::NO_CONTENT).is_ok());
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED),
            Err(ProviderError::CredentialRejected)
        ));
        assert!(matches!(
            check_status(StatusCode::NOT_FOUND),
            Err(ProviderError::NoActiveDevice)
        ));
        assert!(matches!(
            check_status(StatusCode::TOO_MANY_REQUESTS),
            Err(ProviderError::Status(429))
        ));
    }

    #[test]
    fn test_player_state_body() {
        assert!(player_state_from(StatusCode::NO_CONTENT, b"").unwrap().is_none());
        assert!(matches!(
            player_state_from(StatusCode::UNAUTHORIZED, b""),
            Err(ProviderError::CredentialRejected)
        ));

        let body = br#"{"is_playing":true,"progress_ms":4200,"device":{"volume_percent":35},"item":{"uri":"spotify:track:abc"}}"#;
        let state = player_state_from(StatusCode::OK, body).unwrap().unwrap();
        assert!(state.is_playing);
        assert_eq!(state.device.and_then(|d| d.volume_percent), Some(35));
        assert_eq!(state.item.map(|i| i.uri).as_deref(), Some("spotify:track:abc"));

        assert!(matches!(
            player_state_from(StatusCode::OK, b"not json"),
            Err(ProviderError::Decode(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_is_idempotent_for_same_target() {
        let fx = fixture(Some("tok"));
        fx.driver.load("abc", 12.5).await.unwrap();
        fx.driver.load("spotify:track:abc", 12.5).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            fx.api.calls(),
            vec![ApiCall::Play("spotify:track:abc".into(), Some(12_500))]
        );
        assert!(fx.driver.is_playing("abc").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_without_token_fails() {
        let fx = fixture(None);
        let result = fx.driver.load("abc", 0.0).await;
        assert!(matches!(result, Err(ProviderError::CredentialExpired)));
        assert_eq!(fx.driver.currently_playing_id().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_device_retries_then_reports_exhaustion() {
        let mut fx = fixture(Some("tok"));
        fx.api
            .script_play((0..6).map(|_| Err(ProviderError::NoActiveDevice)).collect());

        let started = tokio::time::Instant::now();
        fx.driver.load("abc", 0.0).await.unwrap();
        let report = fx.reports.recv().await.unwrap();

        assert_eq!(
            report,
            BackendReport::RetriesExhausted {
                source: Source::Spotify,
                id: "spotify:track:abc".into()
            }
        );
        assert_eq!(fx.api.calls().len(), 6);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(fx.driver.currently_playing_id().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credential_fails_without_retry() {
        let mut fx = fixture(Some("tok"));
        fx.api.script_play(vec![Err(ProviderError::CredentialRejected)]);

        fx.driver.load("abc", 0.0).await.unwrap();
        let report = fx.reports.recv().await.unwrap();

        assert_eq!(
            report,
            BackendReport::Failed {
                source: Source::Spotify,
                id: "spotify:track:abc".into(),
                reason: "credential rejected by provider".into(),
            }
        );
        assert_eq!(fx.api.plays(), 1);
        assert_eq!(fx.driver.currently_playing_id().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_device_appears() {
        let mut fx = fixture(Some("tok"));
        fx.api.script_play(vec![Err(ProviderError::NoActiveDevice), Ok(())]);

        fx.driver.load("abc", 0.0).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(fx.api.calls().len(), 2);
        assert!(fx.reports.try_recv().is_err());
        assert!(fx.driver.is_playing("abc").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retries() {
        let mut fx = fixture(Some("tok"));
        fx.api
            .script_play((0..6).map(|_| Err(ProviderError::NoActiveDevice)).collect());

        fx.driver.load("abc", 0.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.driver.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // the retry wait is cut short, so the pause does not sit behind it
        assert_eq!(
            fx.api.calls(),
            vec![ApiCall::Play("spotify:track:abc".into(), None), ApiCall::Pause]
        );
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.api.plays(), 1);
        assert!(fx.reports.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_reload_leaves_device_playing() {
        let fx = fixture_with(
            FakeApi {
                play_delay: Duration::from_millis(10),
                pause_delay: Duration::from_millis(50),
                ..Default::default()
            },
            Some("tok"),
        );

        fx.driver.load("x", 0.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.api.device_playing());

        fx.driver.stop().await.unwrap();
        fx.driver.load("x", 3.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            fx.api.calls(),
            vec![
                ApiCall::Play("spotify:track:x".into(), None),
                ApiCall::Pause,
                ApiCall::Play("spotify:track:x".into(), Some(3_000)),
            ]
        );
        assert!(fx.api.device_playing());
        assert!(fx.driver.is_playing("x").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_then_unpause_in_quick_succession() {
        let fx = fixture_with(
            FakeApi {
                pause_delay: Duration::from_millis(50),
                ..Default::default()
            },
            Some("tok"),
        );

        fx.driver.load("x", 0.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.driver.stop().await.unwrap();
        fx.driver.resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            fx.api.calls(),
            vec![
                ApiCall::Play("spotify:track:x".into(), None),
                ApiCall::Pause,
                ApiCall::Resume,
            ]
        );
        assert!(fx.api.device_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_set_during_retry_lands_after_play() {
        let fx = fixture(Some("tok"));
        fx.api.script_play(vec![Err(ProviderError::NoActiveDevice), Ok(())]);

        fx.driver.load("abc", 0.0).await.unwrap();
        fx.driver.set_volume(0).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(
            fx.api.calls(),
            vec![
                ApiCall::Play("spotify:track:abc".into(), None),
                ApiCall::Play("spotify:track:abc".into(), None),
                ApiCall::Volume(0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_volume_reapplied_after_next_play() {
        let fx = fixture(Some("tok"));
        fx.api.script_volume(vec![Err(ProviderError::NoActiveDevice)]);

        fx.driver.set_volume(0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.driver.load("abc", 0.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            fx.api.calls(),
            vec![
                ApiCall::Volume(0),
                ApiCall::Play("spotify:track:abc".into(), None),
                ApiCall::Volume(0),
            ]
        );

        // applied once; later plays leave the level alone
        fx.driver.load("def", 0.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.api.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_issues_nothing() {
        let fx = fixture(Some("tok"));
        fx.driver.stop().await.unwrap();
        fx.driver.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fx.api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_volume_prefers_device_level() {
        let fx = fixture(Some("tok"));
        fx.driver.set_volume(40).await.unwrap();
        assert_eq!(fx.driver.current_volume().await, Some(40));

        *fx.api.device_volume.lock().unwrap() = Some(65);
        assert_eq!(fx.driver.current_volume().await, Some(65));
    }
}
