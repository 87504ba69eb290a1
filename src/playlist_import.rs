//! Remote playlist ingestion: a domain allow-list in front of an HTTP fetch,
//! then multi-format JSON parsing. Local files skip the gate and the size
//! cap but share the parsers.

use crate::config::PlaylistImportConfig;
use crate::error::{MeloError, Result};
use crate::models::{Playlist, Track};
use once_cell::sync::Lazy;
use reqwest::header::USER_AGENT;
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

static IMPORT_HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistFormat {
    MusicFreeBackup,
    Netease,
    Spotify,
    Simple,
}

pub struct PlaylistImporter {
    allowed_domains: Vec<String>,
    max_file_size: u64,
    timeout: Duration,
}

impl PlaylistImporter {
    pub fn new(config: &PlaylistImportConfig) -> Self {
        Self {
            allowed_domains: config.allowed_domains.clone(),
            max_file_size: config.max_file_size,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Only https URLs whose host is an allow-listed domain or a subdomain of
    /// one get fetched at all.
    pub fn is_safe_url(&self, url: &str) -> bool {
        let Ok(parsed) = reqwest::Url::parse(url) else {
            return false;
        };
        if parsed.scheme() != "https" {
            return false;
        }
        let Some(host) = parsed.host_str() else {
            return false;
        };
        self.allowed_domains.iter().any(|domain| {
            host == domain || host.ends_with(&format!(".{domain}"))
        })
    }

    pub async fn import_from_url(&self, url: &str) -> Result<Playlist> {
        if !self.is_safe_url(url) {
            warn!(url, "rejected unsafe playlist url");
            return Err(MeloError::Protocol(format!(
                "refusing to fetch {url}: https and an allow-listed host are required"
            )));
        }

        let response = self.fetch_with_retry(url).await?;
        if !response.status().is_success() {
            return Err(MeloError::Protocol(format!(
                "HTTP {} fetching {url}",
                response.status()
            )));
        }
        if let Some(length) = response.content_length() {
            if length > self.max_file_size {
                return Err(MeloError::Protocol(format!(
                    "document is {length} bytes, over the {} byte limit",
                    self.max_file_size
                )));
            }
        }

        let body = response.text().await?;
        if body.len() as u64 > self.max_file_size {
            return Err(MeloError::Protocol("document exceeds the size limit".into()));
        }
        let document: Value = serde_json::from_str(&body)
            .map_err(|err| MeloError::Protocol(format!("invalid JSON: {err}")))?;
        let playlist = parse_document(&document, url)?;
        info!(url, name = %playlist.name, tracks = playlist.tracks.len(), "playlist imported");
        Ok(playlist)
    }

    /// Network failures back off and retry; HTTP-level rejections do not.
    async fn fetch_with_retry(&self, url: &str) -> Result<reqwest::Response> {
        let mut last_error = None;
        for attempt in 0..3u32 {
            match IMPORT_HTTP_CLIENT
                .get(url)
                .header(USER_AGENT, "melobot/0.1")
                .timeout(self.timeout)
                .send()
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(url, attempt, %err, "playlist fetch failed");
                    last_error = Some(err);
                    if attempt < 2 {
                        let backoff = Duration::from_secs((1u64 << attempt).min(60));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_error
            .map(MeloError::Network)
            .unwrap_or(MeloError::Cancelled))
    }

    /// Same parsing as the URL path, no safety gate and no size cap.
    pub fn import_from_file(&self, path: &Path) -> Result<Playlist> {
        let raw = std::fs::read_to_string(path)?;
        let document: Value = serde_json::from_str(&raw)
            .map_err(|err| MeloError::Protocol(format!("invalid JSON: {err}")))?;
        parse_document(&document, &path.display().to_string())
    }

    pub fn export_to_file(
        &self,
        playlist: &Playlist,
        path: &Path,
        format: PlaylistFormat,
    ) -> Result<()> {
        let document = match format {
            PlaylistFormat::Simple => serde_json::to_value(playlist)
                .map_err(|err| MeloError::Protocol(err.to_string()))?,
            PlaylistFormat::MusicFreeBackup => to_musicfree_document(playlist),
            _ => {
                return Err(MeloError::Protocol(format!(
                    "export is only supported for simple and MusicFree formats, not {format:?}"
                )))
            }
        };
        std::fs::write(path, serde_json::to_string_pretty(&document).unwrap_or_default())?;
        Ok(())
    }
}

/// First matching shape wins; the order is fixed.
pub fn detect_format(document: &Value) -> Option<PlaylistFormat> {
    if document.get("musicSheets").is_some_and(Value::is_array) {
        return Some(PlaylistFormat::MusicFreeBackup);
    }
    if document.pointer("/playlist/tracks").is_some() {
        return Some(PlaylistFormat::Netease);
    }
    if document.pointer("/tracks/items").is_some() {
        return Some(PlaylistFormat::Spotify);
    }
    if document.get("name").is_some() && document.get("songs").is_some() {
        return Some(PlaylistFormat::Simple);
    }
    None
}

pub fn parse_document(document: &Value, source: &str) -> Result<Playlist> {
    match detect_format(document) {
        Some(PlaylistFormat::MusicFreeBackup) => parse_musicfree(document, source),
        Some(PlaylistFormat::Netease) => parse_netease(document, source),
        Some(PlaylistFormat::Spotify) => parse_spotify(document, source),
        Some(PlaylistFormat::Simple) => parse_simple(document),
        None => parse_simple(document)
            .map_err(|_| MeloError::Protocol(format!("unknown playlist format from {source}"))),
    }
}

fn parse_simple(document: &Value) -> Result<Playlist> {
    let mut playlist: Playlist = serde_json::from_value(document.clone())
        .map_err(|err| MeloError::Protocol(format!("not a simple playlist: {err}")))?;
    if playlist.id.is_empty() {
        playlist = Playlist {
            id: crate::models::derived_id(&format!("{}_{}", playlist.name, playlist.creator)),
            ..playlist
        };
    }
    for track in &mut playlist.tracks {
        track.ensure_id();
    }
    Ok(playlist)
}

fn parse_musicfree(document: &Value, source: &str) -> Result<Playlist> {
    let sheets = document
        .get("musicSheets")
        .and_then(Value::as_array)
        .filter(|sheets| !sheets.is_empty())
        .ok_or_else(|| MeloError::Protocol(format!("no musicSheets in {source}")))?;
    if sheets.len() > 1 {
        info!(count = sheets.len(), "backup has multiple sheets, importing the first");
    }
    let sheet = &sheets[0];

    let mut playlist = Playlist::new(
        str_of(sheet, "id"),
        non_empty(str_of(sheet, "platform"), "Imported Playlist"),
        "melobot",
    );
    playlist.description = format!("Imported from {source}");

    for item in sheet
        .get("musicList")
        .and_then(Value::as_array)
        .unwrap_or(&Vec::new())
    {
        if let Some(track) = parse_musicfree_song(item) {
            playlist.add_track(track);
        }
    }
    Ok(playlist)
}

const MUSICFREE_CORE_KEYS: [&str; 10] = [
    "id", "title", "artist", "album", "duration", "platform", "artwork", "tags", "date", "url",
];

fn parse_musicfree_song(item: &Value) -> Option<Track> {
    let title = str_of(item, "title");
    if title.is_empty() {
        return None;
    }
    let platform = str_of(item, "platform");
    let bvid = str_of(item, "bvid");

    let url = if platform == "bilibili" && !bvid.is_empty() {
        format!("https://www.bilibili.com/video/{bvid}")
    } else {
        str_of(item, "url")
    };

    let mut track = Track::new(str_of(item, "id"), title, str_of(item, "artist"), platform);
    track.album = str_of(item, "album");
    track.duration = num_of(item, "duration") as u32;
    track.artwork = str_of(item, "artwork");
    track.url = url;
    track.release_date = str_of(item, "date");
    track.tags = item
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    // keep everything the format carries beyond the core fields (aid, bvid,
    // per-platform ids) so exports reproduce the document
    if let Some(object) = item.as_object() {
        for (key, value) in object {
            if !MUSICFREE_CORE_KEYS.contains(&key.as_str()) {
                track.extra.insert(key.clone(), value.clone());
            }
        }
    }
    Some(track)
}

fn to_musicfree_document(playlist: &Playlist) -> Value {
    let music_list: Vec<Value> = playlist
        .tracks
        .iter()
        .map(|track| {
            let mut item = Map::new();
            item.insert("id".into(), Value::from(track.id.clone()));
            item.insert("title".into(), Value::from(track.title.clone()));
            item.insert("artist".into(), Value::from(track.artist.clone()));
            item.insert("album".into(), Value::from(track.album.clone()));
            item.insert("duration".into(), Value::from(track.duration));
            item.insert("platform".into(), Value::from(track.source.clone()));
            item.insert("artwork".into(), Value::from(track.artwork.clone()));
            item.insert("tags".into(), Value::from(track.tags.clone()));
            item.insert("date".into(), Value::from(track.release_date.clone()));
            item.insert("url".into(), Value::from(track.url.clone()));
            for (key, value) in &track.extra {
                item.insert(key.clone(), value.clone());
            }
            Value::Object(item)
        })
        .collect();

    serde_json::json!({
        "musicSheets": [{
            "id": playlist.id,
            "platform": playlist.name,
            "musicList": music_list,
        }]
    })
}

fn parse_netease(document: &Value, source: &str) -> Result<Playlist> {
    let header = document
        .get("playlist")
        .ok_or_else(|| MeloError::Protocol(format!("no playlist object in {source}")))?;

    let mut playlist = Playlist::new(
        str_of(header, "id"),
        non_empty(str_of(header, "name"), "Netease Playlist"),
        header
            .pointer("/creator/nickname")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
    );
    playlist.description = str_of(header, "description");
    playlist.cover = str_of(header, "coverImgUrl");
    playlist.tags = string_list(header.get("tags"));

    for item in header
        .get("tracks")
        .and_then(Value::as_array)
        .unwrap_or(&Vec::new())
    {
        let id = str_of(item, "id");
        let title = str_of(item, "name");
        if title.is_empty() {
            continue;
        }
        let artist = item
            .get("artists")
            .and_then(Value::as_array)
            .map(|artists| {
                artists
                    .iter()
                    .filter_map(|artist| artist.get("name").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .filter(|joined| !joined.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        let mut track = Track::new(id.clone(), title, artist, "netease");
        track.album = item
            .pointer("/album/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        track.artwork = item
            .pointer("/album/picUrl")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        // milliseconds in this format
        track.duration = (num_of(item, "duration") / 1000) as u32;
        track.url = format!("http://music.163.com/song/{id}");
        track.extra.insert("netease_id".into(), Value::from(id));
        playlist.add_track(track);
    }
    Ok(playlist)
}

fn parse_spotify(document: &Value, source: &str) -> Result<Playlist> {
    let mut playlist = Playlist::new(
        str_of(document, "id"),
        non_empty(str_of(document, "name"), "Spotify Playlist"),
        document
            .pointer("/owner/display_name")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string(),
    );
    playlist.description = str_of(document, "description");
    playlist.cover = document
        .pointer("/images/0/url")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let items = document
        .pointer("/tracks/items")
        .and_then(Value::as_array)
        .ok_or_else(|| MeloError::Protocol(format!("no tracks.items in {source}")))?;
    for item in items {
        let Some(entry) = item.get("track") else {
            continue;
        };
        let id = str_of(entry, "id");
        let title = str_of(entry, "name");
        if title.is_empty() {
            continue;
        }
        let artist = entry
            .get("artists")
            .and_then(Value::as_array)
            .map(|artists| {
                artists
                    .iter()
                    .filter_map(|artist| artist.get("name").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .filter(|joined| !joined.is_empty())
            .unwrap_or_else(|| "Unknown".to_string());

        let mut track = Track::new(id.clone(), title, artist, "spotify");
        track.album = entry
            .pointer("/album/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        track.artwork = entry
            .pointer("/album/images/0/url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        track.duration = (num_of(entry, "duration_ms") / 1000) as u32;
        track.url = entry
            .pointer("/external_urls/spotify")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        track.extra.insert("spotify_id".into(), Value::from(id));
        playlist.add_track(track);
    }
    Ok(playlist)
}

fn str_of(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        _ => String::new(),
    }
}

fn num_of(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn non_empty(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}
