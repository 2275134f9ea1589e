/// Named events exchanged with the queue server
use crate::error::EventError;
use crate::models::{id_from_value, NowPlaying, PlayerPosition, StreamFailed, StreamResolved, TokenGrant};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Events pushed by the server that this engine consumes
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    NowPlayingUpdate(NowPlaying),
    PlayerPosition(PlayerPosition),
    Volume(u8),
    AuthTokenUpdate(TokenGrant),
    SearchTokenUpdate(TokenGrant),
    AuthTokenRefresh(String),
    StreamResolved(StreamResolved),
    StreamError(StreamFailed),
    /// Play the named sound effect; `volume` is the horn's own gain
    DoAirhorn { volume: f64, name: String },
}

impl ServerEvent {
    /// Event names to subscribe to on the transport
    pub const NAMES: [&'static str; 9] = [
        "now_playing_update",
        "player_position",
        "volume",
        "auth_token_update",
        "search_token_update",
        "auth_token_refresh",
        "stream_resolved",
        "stream_error",
        "do_airhorn",
    ];

    /// Decode a named event and its positional arguments
    pub fn decode(name: &str, args: &[Value]) -> Result<Self, EventError> {
        match name {
            "now_playing_update" => Ok(Self::NowPlayingUpdate(payload(name, args)?)),
            "player_position" => {
                let src = arg(name, args, 0)?
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| missing(name, 0))?;
                let track_id = id_from_value(arg(name, args, 1)?).ok_or_else(|| missing(name, 1))?;
                let position = number(arg(name, args, 2)?).ok_or_else(|| missing(name, 2))?;
                Ok(Self::PlayerPosition(PlayerPosition {
                    src,
                    track_id,
                    position,
                }))
            }
            "volume" => {
                let percent = number(arg(name, args, 0)?).ok_or_else(|| missing(name, 0))?;
                Ok(Self::Volume(percent.clamp(0.0, 100.0).round() as u8))
            }
            "auth_token_update" => Ok(Self::AuthTokenUpdate(payload(name, args)?)),
            "search_token_update" => Ok(Self::SearchTokenUpdate(payload(name, args)?)),
            "auth_token_refresh" => {
                let url = arg(name, args, 0)?
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| missing(name, 0))?;
                Ok(Self::AuthTokenRefresh(url))
            }
            "stream_resolved" => Ok(Self::StreamResolved(payload(name, args)?)),
            "stream_error" => Ok(Self::StreamError(payload(name, args)?)),
            "do_airhorn" => {
                let volume = number(arg(name, args, 0)?).ok_or_else(|| missing(name, 0))?;
                let sound = arg(name, args, 1)?
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| missing(name, 1))?;
                Ok(Self::DoAirhorn { volume, name: sound })
            }
            other => Err(EventError::Unknown(other.to_string())),
        }
    }
}

/// Events this engine emits towards the server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    FetchAuthToken,
    FetchSearchToken,
    FetchNowPlaying,
    RequestVolume,
    GetStream(String),
    Pause,
    Unpause,
    ChangeVolume(u8),
    FetchAirhorns,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::FetchAuthToken => "fetch_auth_token",
            ClientEvent::FetchSearchToken => "fetch_search_token",
            ClientEvent::FetchNowPlaying => "fetch_now_playing",
            ClientEvent::RequestVolume => "request_volume",
            ClientEvent::GetStream(_) => "get_stream",
            ClientEvent::Pause => "pause",
            ClientEvent::Unpause => "unpause",
            ClientEvent::ChangeVolume(_) => "change_volume",
            ClientEvent::FetchAirhorns => "fetch_airhorns",
        }
    }

    pub fn args(&self) -> Vec<Value> {
        match self {
            ClientEvent::GetStream(track_id) => vec![json!(track_id)],
            ClientEvent::ChangeVolume(percent) => vec![json!(percent)],
            _ => Vec::new(),
        }
    }
}

/// Outbound side of the transport, as seen by drivers and the session
pub trait EventSink: Send + Sync {
    fn send_event(&self, event: ClientEvent);
}

fn arg<'a>(event: &str, args: &'a [Value], index: usize) -> Result<&'a Value, EventError> {
    args.get(index).ok_or_else(|| missing(event, index))
}

fn missing(event: &str, index: usize) -> EventError {
    EventError::MissingArgument {
        event: event.to_string(),
        index,
    }
}

fn payload<T: DeserializeOwned>(event: &str, args: &[Value]) -> Result<T, EventError> {
    let value = arg(event, args, 0)?;
    serde_json::from_value(value.clone()).map_err(|source| EventError::InvalidPayload {
        event: event.to_string(),
        source,
    })
}

fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite())
}
