//! Netease Cloud Music source.
//!
//! The public API needs a self-hosted bridge (for example
//! NeteaseCloudMusicApi); search is disabled until one is configured.

use crate::error::{MeloError, Result};
use crate::models::Track;
use crate::sources::MusicSource;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

static NETEASE_HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct NeteaseSource {
    api_base: Option<String>,
}

impl NeteaseSource {
    pub fn new(api_base: Option<String>) -> Self {
        Self {
            api_base: api_base.map(|base| base.trim_end_matches('/').to_string()),
        }
    }
}

#[async_trait]
impl MusicSource for NeteaseSource {
    fn name(&self) -> &'static str {
        "netease"
    }

    fn description(&self) -> &'static str {
        "Netease Cloud Music search (needs an API bridge)"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>> {
        let Some(base) = &self.api_base else {
            debug!("netease search skipped: no api bridge configured");
            return Ok(Vec::new());
        };

        let url = format!(
            "{base}/search?keywords={}&limit={limit}",
            urlencoding::encode(query)
        );
        let payload: Value = NETEASE_HTTP_CLIENT
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .json()
            .await?;
        if payload.get("code").and_then(Value::as_i64) != Some(200) {
            return Err(MeloError::Source(
                "netease".into(),
                "api bridge returned an error".into(),
            ));
        }
        Ok(parse_songs(&payload, limit))
    }

    async fn resolve(&self, track: &Track) -> Result<Option<String>> {
        let id = track
            .extra_str("netease_id")
            .map(str::to_string)
            .unwrap_or_else(|| track.id.clone());
        if id.is_empty() {
            return Ok(None);
        }
        Ok(Some(format!("http://music.163.com/song/{id}")))
    }
}

fn parse_songs(payload: &Value, limit: usize) -> Vec<Track> {
    let songs = payload
        .pointer("/result/songs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    songs.iter().take(limit).filter_map(parse_song).collect()
}

fn parse_song(song: &Value) -> Option<Track> {
    let id = match song.get("id") {
        Some(Value::Number(id)) => id.to_string(),
        Some(Value::String(id)) => id.clone(),
        _ => return None,
    };
    let title = song.get("name").and_then(Value::as_str)?.to_string();

    let artist = song
        .get("artists")
        .and_then(Value::as_array)
        .map(|artists| {
            artists
                .iter()
                .filter_map(|artist| artist.get("name").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    let mut track = Track::new(id.clone(), title, artist, "netease");
    track.album = song
        .pointer("/album/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    track.artwork = song
        .pointer("/album/picUrl")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    // the bridge reports milliseconds
    track.duration = (song.get("duration").and_then(Value::as_u64).unwrap_or(0) / 1000) as u32;
    track.url = format!("http://music.163.com/song/{id}");
    track.extra.insert("netease_id".into(), Value::from(id));
    Some(track)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_bridge_returns_empty() {
        let source = NeteaseSource::new(None);
        assert!(source.search("anything", 10).await.unwrap().is_empty());
    }

    #[test]
    fn parse_songs_maps_fields_and_converts_ms() {
        let payload = serde_json::json!({
            "code": 200,
            "result": {
                "songs": [{
                    "id": 347230,
                    "name": "海阔天空",
                    "artists": [{"name": "Beyond"}, {"name": "黄家驹"}],
                    "album": {"name": "乐与怒", "picUrl": "https://p1.music.126.net/a.jpg"},
                    "duration": 326000
                }]
            }
        });
        let tracks = parse_songs(&payload, 10);
        assert_eq!(tracks.len(), 1);
        let track = &tracks[0];
        assert_eq!(track.id, "347230");
        assert_eq!(track.artist, "Beyond, 黄家驹");
        assert_eq!(track.album, "乐与怒");
        assert_eq!(track.duration, 326);
        assert_eq!(track.url, "http://music.163.com/song/347230");
    }

    #[tokio::test]
    async fn resolve_uses_the_native_id() {
        let source = NeteaseSource::new(None);
        let track = Track::new("347230", "t", "a", "netease");
        assert_eq!(
            source.resolve(&track).await.unwrap(),
            Some("http://music.163.com/song/347230".to_string())
        );
    }
}
