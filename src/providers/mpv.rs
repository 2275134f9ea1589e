/// Embedded player backed by an `mpv` process driven over its JSON IPC socket
use super::youtube::{EmbeddedPlayer, PlayerState};
use crate::error::ProviderError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// How to start the player process
#[derive(Debug, Clone)]
pub struct MpvSettings {
    pub binary: String,
    pub socket_path: PathBuf,
    pub connect_timeout: Duration,
}

impl Default for MpvSettings {
    fn default() -> Self {
        Self {
            binary: "mpv".to_string(),
            socket_path: std::env::temp_dir().join("echonest-player-mpv.sock"),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A running mpv instance
pub struct MpvPlayer {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    _child: Option<Child>,
}

impl MpvPlayer {
    /// Start mpv idle and connect to its IPC socket once it appears
    pub async fn launch(settings: &MpvSettings) -> Result<Arc<Self>, ProviderError> {
        let _ = std::fs::remove_file(&settings.socket_path);
        let child = Command::new(&settings.binary)
            .arg("--idle=yes")
            .arg("--no-terminal")
            .arg(format!(
                "--input-ipc-server={}",
                settings.socket_path.display()
            ))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::Command(format!("failed to start {}: {}", settings.binary, e)))?;
        info!(binary = %settings.binary, socket = %settings.socket_path.display(), "Started mpv");

        let deadline = tokio::time::Instant::now() + settings.connect_timeout;
        let stream = loop {
            match UnixStream::connect(&settings.socket_path).await {
                Ok(stream) => break stream,
                Err(e) if tokio::time::Instant::now() < deadline => {
                    trace!("mpv socket not ready yet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    return Err(ProviderError::Command(format!(
                        "mpv IPC socket never became available: {}",
                        e
                    )))
                }
            }
        };

        Ok(Self::attach_stream(stream, Some(child)))
    }

    /// Drive an already connected IPC stream
    pub fn attach_stream(stream: UnixStream, child: Option<Child>) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let pending: Pending = Arc::default();

        let replies = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => route_reply(&replies, &line),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("mpv IPC read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("mpv IPC reader stopped");
            // Dropping the senders fails every in-flight request.
            replies.lock().unwrap_or_else(|e| e.into_inner()).clear();
        });

        Arc::new(Self {
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            _child: child,
        })
    }

    async fn command(&self, args: Value) -> Result<Value, ProviderError> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, tx);

        let mut line = json!({ "command": args, "request_id": request_id }).to_string();
        line.push('\n');
        trace!("mpv <- {}", line.trim_end());
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&request_id);
                return Err(ProviderError::Command(format!("mpv IPC write failed: {}", e)));
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(error))) => Err(ProviderError::Command(format!("mpv: {}", error))),
            Ok(Err(_)) => Err(ProviderError::Command("mpv IPC connection closed".to_string())),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&request_id);
                Err(ProviderError::Command("mpv request timed out".to_string()))
            }
        }
    }

    async fn get_bool(&self, property: &str) -> Result<bool, ProviderError> {
        let value = self.command(json!(["get_property", property])).await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

fn route_reply(pending: &Pending, line: &str) {
    let message: Value = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(_) => {
            trace!("mpv sent non-JSON line: {}", line);
            return;
        }
    };
    if let Some(event) = message.get("event").and_then(Value::as_str) {
        trace!(event, "mpv event");
        return;
    }
    let Some(request_id) = message.get("request_id").and_then(Value::as_u64) else {
        return;
    };
    let sender = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&request_id);
    if let Some(sender) = sender {
        let result = match message.get("error").and_then(Value::as_str) {
            Some("success") | None => Ok(message.get("data").cloned().unwrap_or(Value::Null)),
            Some(error) => Err(error.to_string()),
        };
        let _ = sender.send(result);
    }
}

/// Watch URL for a video id
pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// Extract the video id from a watch or short URL
pub fn video_id_from_url(path: &str) -> Option<String> {
    let url = Url::parse(path).ok()?;
    if url.host_str() == Some("youtu.be") {
        return url
            .path_segments()?
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }
    url.query_pairs()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.into_owned())
}

#[async_trait]
impl EmbeddedPlayer for MpvPlayer {
    async fn load_video(&self, video_id: &str, start_seconds: f64) -> Result<(), ProviderError> {
        self.command(json!(["set_property", "start", format!("{:.3}", start_seconds)]))
            .await?;
        self.command(json!(["loadfile", watch_url(video_id), "replace"]))
            .await?;
        self.command(json!(["set_property", "pause", false])).await?;
        Ok(())
    }

    async fn stop_video(&self) -> Result<(), ProviderError> {
        self.command(json!(["stop"])).await.map(|_| ())
    }

    async fn set_volume(&self, level: f64) -> Result<(), ProviderError> {
        self.command(json!(["set_property", "volume", level.clamp(0.0, 100.0)]))
            .await
            .map(|_| ())
    }

    async fn volume(&self) -> Result<f64, ProviderError> {
        let value = self.command(json!(["get_property", "volume"])).await?;
        value
            .as_f64()
            .ok_or_else(|| ProviderError::Command("mpv returned a non-numeric volume".to_string()))
    }

    async fn video_id(&self) -> Result<Option<String>, ProviderError> {
        match self.command(json!(["get_property", "path"])).await {
            Ok(Value::String(path)) => Ok(video_id_from_url(&path)),
            Ok(_) => Ok(None),
            // "property unavailable" while idle
            Err(ProviderError::Command(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn state(&self) -> Result<PlayerState, ProviderError> {
        if self.get_bool("idle-active").await? {
            return Ok(PlayerState::Ended);
        }
        if self.get_bool("paused-for-cache").await.unwrap_or(false) {
            return Ok(PlayerState::Buffering);
        }
        if self.get_bool("pause").await? {
            return Ok(PlayerState::Paused);
        }
        Ok(PlayerState::Playing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_id_from_url() {
        assert_eq!(
            video_id_from_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=3").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            video_id_from_url("https://youtu.be/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(video_id_from_url("/tmp/file.mp3"), None);
    }

    /// Minimal IPC server answering every request through `respond`
    fn serve<F>(server: UnixStream, respond: F) -> tokio::task::JoinHandle<Vec<Value>>
    where
        F: Fn(&Value) -> Value + Send + 'static,
    {
        tokio::spawn(async move {
            let (reader, mut writer) = server.into_split();
            let mut lines = BufReader::new(reader).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let mut reply = respond(&request["command"]);
                reply["request_id"] = request["request_id"].clone();
                // Unsolicited events are interleaved with replies.
                writer
                    .write_all(b"{\"event\":\"playback-restart\"}\n")
                    .await
                    .unwrap();
                writer
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .unwrap();
                seen.push(request["command"].clone());
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_load_video_issues_start_then_loadfile() {
        let (client, server) = UnixStream::pair().unwrap();
        let server = serve(server, |_| json!({"error": "success"}));
        let player = MpvPlayer::attach_stream(client, None);

        player.load_video("abc", 12.0).await.unwrap();
        drop(player);

        let seen = server.await.unwrap();
        assert_eq!(seen[0], json!(["set_property", "start", "12.000"]));
        assert_eq!(
            seen[1],
            json!(["loadfile", "https://www.youtube.com/watch?v=abc", "replace"])
        );
        assert_eq!(seen[2], json!(["set_property", "pause", false]));
    }

    #[tokio::test]
    async fn test_state_and_video_id() {
        let (client, server) = UnixStream::pair().unwrap();
        let _server = serve(server, |command| match command[1].as_str() {
            Some("idle-active") => json!({"error": "success", "data": false}),
            Some("paused-for-cache") => json!({"error": "success", "data": true}),
            Some("path") => json!({"error": "success", "data": "https://www.youtube.com/watch?v=xyz"}),
            _ => json!({"error": "property unavailable"}),
        });
        let player = MpvPlayer::attach_stream(client, None);

        assert_eq!(player.state().await.unwrap(), PlayerState::Buffering);
        assert_eq!(player.video_id().await.unwrap().as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn test_error_reply_surfaces() {
        let (client, server) = UnixStream::pair().unwrap();
        let _server = serve(server, |_| json!({"error": "property unavailable"}));
        let player = MpvPlayer::attach_stream(client, None);

        let result = player.volume().await;
        assert!(matches!(result, Err(ProviderError::Command(_))));
        assert_eq!(player.video_id().await.unwrap(), None);
    }
}
