//! Core data model: tracks, playlists, play modes and cache rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single playable item. The `url` may be re-resolved on every play; all
/// other fields are frozen once the track is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Track {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub duration: u32,
    #[serde(default, alias = "platform")]
    pub source: String,
    #[serde(default)]
    pub artwork: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, alias = "date")]
    pub release_date: String,
    #[serde(default)]
    pub extra: serde_json::Map<String, Value>,
}

impl Track {
    /// Build a track, deriving a stable id from title + artist + source when
    /// the source did not supply one.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let mut track = Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            source: source.into(),
            ..Self::default()
        };
        track.ensure_id();
        track
    }

    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = derived_id(&format!("{}_{}_{}", self.title, self.artist, self.source));
        }
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// Stable 16-hex-char id for content that carries no native identifier.
pub fn derived_id(content: &str) -> String {
    let digest = md5::compute(content.as_bytes());
    format!("{digest:x}")[..16].to_string()
}

/// An ordered, named collection of tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Playlist {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub cover: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default, rename = "songs", alias = "tracks")]
    pub tracks: Vec<Track>,
}

impl Playlist {
    pub fn new(id: impl Into<String>, name: impl Into<String>, creator: impl Into<String>) -> Self {
        let mut playlist = Self {
            id: id.into(),
            name: name.into(),
            creator: creator.into(),
            ..Self::default()
        };
        if playlist.id.is_empty() {
            playlist.id = derived_id(&format!("{}_{}", playlist.name, playlist.creator));
        }
        playlist
    }

    pub fn add_track(&mut self, track: Track) {
        if !self.tracks.iter().any(|existing| existing.id == track.id) {
            self.tracks.push(track);
        }
    }

    pub fn remove_track(&mut self, track_id: &str) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|track| track.id != track_id);
        self.tracks.len() != before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayMode {
    #[default]
    Sequential,
    RepeatAll,
    RepeatOne,
    Shuffle,
}

impl PlayMode {
    pub fn key(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::RepeatAll => "repeat_all",
            Self::RepeatOne => "repeat_one",
            Self::Shuffle => "shuffle",
        }
    }

    /// Accepts the aliases users actually type.
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "sequential" | "off" | "none" => Some(Self::Sequential),
            "repeat_all" | "all" | "loop" => Some(Self::RepeatAll),
            "repeat_one" | "one" | "single" => Some(Self::RepeatOne),
            "shuffle" | "random" => Some(Self::Shuffle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    #[default]
    Idle,
    Playing,
    Paused,
    Buffering,
    Error,
}

/// One row of the audio cache store. Several rows may share a `file_path`
/// when their downloads hashed identically; together they form a refcount
/// class over that file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub track_id: String,
    pub file_path: String,
    pub file_size: u64,
    pub content_hash: String,
    pub created_at: String,
    pub last_accessed: String,
    pub access_count: u64,
    pub reference_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_id_is_stable_across_runs() {
        let a = Track::new("", "Lemon", "米津玄師", "bilibili");
        let b = Track::new("", "Lemon", "米津玄師", "bilibili");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 16);

        let c = Track::new("", "Lemon", "someone else", "bilibili");
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn native_id_is_kept() {
        let track = Track::new("BV1xx411c7mD", "t", "a", "bilibili");
        assert_eq!(track.id, "BV1xx411c7mD");
    }

    #[test]
    fn track_serde_round_trip() {
        let mut track = Track::new("", "Song", "Artist", "netease");
        track.duration = 213;
        track.tags = vec!["pop".into()];
        track
            .extra
            .insert("netease_id".into(), Value::from(1234567));

        let json = serde_json::to_string(&track).unwrap();
        let back: Track = serde_json::from_str(&json).unwrap();
        assert_eq!(track, back);
    }

    #[test]
    fn playlist_add_dedups_by_id() {
        let mut playlist = Playlist::new("", "Favorites", "me");
        let track = Track::new("t1", "a", "b", "local");
        playlist.add_track(track.clone());
        playlist.add_track(track);
        assert_eq!(playlist.tracks.len(), 1);
        assert!(playlist.remove_track("t1"));
        assert!(!playlist.remove_track("t1"));
    }

    #[test]
    fn play_mode_aliases() {
        assert_eq!(PlayMode::from_key("loop"), Some(PlayMode::RepeatAll));
        assert_eq!(PlayMode::from_key("random"), Some(PlayMode::Shuffle));
        assert_eq!(PlayMode::from_key("off"), Some(PlayMode::Sequential));
        assert_eq!(PlayMode::from_key("ONE"), Some(PlayMode::RepeatOne));
        assert_eq!(PlayMode::from_key("bogus"), None);
    }
}
