/// Shared data model for the playback session
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Playback provider that can render audio for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Spotify,
    Youtube,
    Soundcloud,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Spotify, Source::Youtube, Source::Soundcloud];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Spotify => "spotify",
            Source::Youtube => "youtube",
            Source::Soundcloud => "soundcloud",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spotify" => Ok(Source::Spotify),
            "youtube" => Ok(Source::Youtube),
            "soundcloud" => Ok(Source::Soundcloud),
            other => Err(format!("unknown source: {}", other)),
        }
    }
}

/// Kind of item being played
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Song,
    Episode,
    #[serde(other)]
    Other,
}

/// Server-authoritative description of the active item.
///
/// The field names follow the `now_playing_update` payload. Track ids arrive
/// as strings for Spotify/YouTube and as numbers for SoundCloud, so they are
/// normalised to strings on the way in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NowPlaying {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default, rename = "trackid", deserialize_with = "deserialize_opt_id")]
    pub track_id: Option<String>,
    #[serde(default)]
    pub pos: Option<f64>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default, rename = "type")]
    pub content_type: ContentType,
}

impl NowPlaying {
    /// Provider of the current item, if it is one this client can render
    pub fn source(&self) -> Option<Source> {
        self.src.as_deref().and_then(|s| s.parse().ok())
    }

    /// Fold an inbound update into the local copy.
    ///
    /// Updates that carry a title replace the whole description. Updates
    /// without one only toggle the pause flag (and position, when present).
    pub fn apply_update(&mut self, update: NowPlaying) {
        if update.title.is_some() {
            *self = update;
            return;
        }
        self.paused = update.paused;
        if update.pos.is_some() {
            self.pos = update.pos;
        }
    }

    pub fn position(&self) -> f64 {
        self.pos.unwrap_or(0.0).max(0.0)
    }
}

/// Low-frequency position push (`player_position`)
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerPosition {
    pub src: String,
    pub track_id: String,
    pub position: f64,
}

/// Credential issued by the server (`auth_token_update`, `search_token_update`)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    /// Remaining lifetime in seconds, as declared by the server
    #[serde(default)]
    pub time_left: f64,
}

/// Reply to a `get_stream` request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamResolved {
    #[serde(deserialize_with = "deserialize_id")]
    pub track_id: String,
    #[serde(default)]
    pub stream_url: Option<String>,
}

/// Failed `get_stream` request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamFailed {
    #[serde(deserialize_with = "deserialize_id")]
    pub track_id: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Render an id that may be a JSON string or number
pub(crate) fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    id_from_value(&value).ok_or_else(|| serde::de::Error::custom("expected string or numeric id"))
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_from_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_now_playing_from_push() {
        let np: NowPlaying = serde_json::from_value(json!({
            "title": "Song",
            "artist": "Artist",
            "src": "soundcloud",
            "trackid": 12345,
            "pos": 10,
            "paused": false,
            "duration": 180,
            "type": "song"
        }))
        .unwrap();

        assert_eq!(np.source(), Some(Source::Soundcloud));
        assert_eq!(np.track_id.as_deref(), Some("12345"));
        assert_eq!(np.position(), 10.0);
    }

    #[test]
    fn test_update_without_title_keeps_track() {
        let mut np = NowPlaying {
            title: Some("Song".into()),
            src: Some("spotify".into()),
            track_id: Some("spotify:track:abc".into()),
            ..Default::default()
        };
        np.apply_update(NowPlaying {
            paused: true,
            ..Default::default()
        });

        assert!(np.paused);
        assert_eq!(np.track_id.as_deref(), Some("spotify:track:abc"));
    }

    #[test]
    fn test_unknown_source_is_not_renderable() {
        let np = NowPlaying {
            src: Some("bandcamp".into()),
            ..Default::default()
        };
        assert_eq!(np.source(), None);
    }
}
