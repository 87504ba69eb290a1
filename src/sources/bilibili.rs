//! Bilibili video search as a music source.
//!
//! Search goes through the public web search API, which wants a browser-ish
//! user agent and the buvid cookies handed out by the fingerprint endpoint.
//! Resolution just returns the canonical video URL; the extractor pulls the
//! audio stream out of it.

use crate::error::{MeloError, Result};
use crate::models::Track;
use crate::sources::MusicSource;
use crate::utils::{clean_title, parse_duration};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::header::{COOKIE, REFERER, USER_AGENT};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

static BILI_HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const SPI_URL: &str = "https://api.bilibili.com/x/frontend/finger/spi";
const SEARCH_URL: &str = "https://api.bilibili.com/x/web-interface/search/type";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const MUSIC_KEYWORDS: [&str; 20] = [
    "音乐", "music", "歌", "song", "翻唱", "cover", "mv", "live", "演唱", "钢琴", "piano",
    "吉他", "guitar", "纯音乐", "bgm", "原创", "original", "伴奏", "ost", "remix",
];

pub struct BilibiliSource {
    cookie: RwLock<Option<String>>,
}

impl BilibiliSource {
    pub fn new() -> Self {
        Self {
            cookie: RwLock::new(None),
        }
    }

    /// Fetch and cache the buvid cookies. Search degrades without them, so a
    /// failure here is logged and ignored.
    async fn ensure_cookie(&self) -> Option<String> {
        if let Some(cookie) = self.cookie.read().await.clone() {
            return Some(cookie);
        }

        let response = BILI_HTTP_CLIENT
            .get(SPI_URL)
            .header(USER_AGENT, DESKTOP_UA)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .ok()?;
        let payload: Value = response.json().await.ok()?;
        if payload.get("code").and_then(Value::as_i64) != Some(0) {
            warn!("bilibili fingerprint endpoint refused, searching without cookies");
            return None;
        }
        let data = payload.get("data")?;
        let b3 = data.get("b_3").and_then(Value::as_str)?;
        let b4 = data.get("b_4").and_then(Value::as_str).unwrap_or_default();
        let cookie = format!("buvid3={b3}; buvid4={b4}");
        *self.cookie.write().await = Some(cookie.clone());
        Some(cookie)
    }
}

impl Default for BilibiliSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MusicSource for BilibiliSource {
    fn name(&self) -> &'static str {
        "bilibili"
    }

    fn version(&self) -> &'static str {
        "2.0.0"
    }

    fn description(&self) -> &'static str {
        "Bilibili video search"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>> {
        let page_size = (limit * 2).clamp(1, 50);
        let url = format!(
            "{SEARCH_URL}?search_type=video&page=1&page_size={page_size}&keyword={}",
            urlencoding::encode(query)
        );

        let mut request = BILI_HTTP_CLIENT
            .get(&url)
            .header(USER_AGENT, DESKTOP_UA)
            .header(REFERER, "https://search.bilibili.com/")
            .timeout(REQUEST_TIMEOUT);
        if let Some(cookie) = self.ensure_cookie().await {
            request = request.header(COOKIE, cookie);
        }

        let payload: Value = request.send().await?.json().await?;
        if payload.get("code").and_then(Value::as_i64) != Some(0) {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown api error");
            return Err(MeloError::Source("bilibili".into(), message.to_string()));
        }

        let items = payload
            .pointer("/data/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let all: Vec<Track> = items.iter().filter_map(format_media).collect();

        // prefer music-looking uploads, but never return nothing because the
        // filter was too eager
        let mut filtered: Vec<Track> = all
            .iter()
            .filter(|track| {
                let description = track.extra_str("description").unwrap_or_default();
                is_music_related(&track.title, description)
            })
            .cloned()
            .collect();
        if filtered.is_empty() {
            filtered = all;
        }
        filtered.truncate(limit);
        debug!(query, results = filtered.len(), "bilibili search finished");
        Ok(filtered)
    }

    async fn resolve(&self, track: &Track) -> Result<Option<String>> {
        if let Some(bvid) = track.extra_str("bvid").filter(|bvid| !bvid.is_empty()) {
            return Ok(Some(format!("https://www.bilibili.com/video/{bvid}")));
        }
        Ok((!track.url.is_empty()).then(|| track.url.clone()))
    }
}

/// Map one search result into a track. Results without a bvid are skipped.
fn format_media(item: &Value) -> Option<Track> {
    let bvid = item.get("bvid").and_then(Value::as_str)?.to_string();
    let title = clean_title(item.get("title").and_then(Value::as_str).unwrap_or_default());
    if title.is_empty() {
        return None;
    }

    let mut artwork = item
        .get("pic")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if artwork.starts_with("//") {
        artwork = format!("https:{artwork}");
    }

    let duration = match item.get("duration") {
        Some(Value::String(clock)) => parse_duration(clock),
        Some(Value::Number(secs)) => secs.as_u64().unwrap_or(0) as u32,
        _ => 0,
    };

    let mut track = Track::new(
        bvid.clone(),
        title,
        item.get("author").and_then(Value::as_str).unwrap_or("未知艺术家"),
        "bilibili",
    );
    track.album = "Bilibili".to_string();
    track.duration = duration;
    track.artwork = artwork;
    track.url = format!("https://www.bilibili.com/video/{bvid}");
    track.extra.insert("bvid".into(), Value::from(bvid));
    if let Some(aid) = item.get("aid").and_then(Value::as_i64) {
        track.extra.insert("aid".into(), Value::from(aid));
    }
    if let Some(description) = item.get("description").and_then(Value::as_str) {
        track
            .extra
            .insert("description".into(), Value::from(description));
    }
    Some(track)
}

fn is_music_related(title: &str, description: &str) -> bool {
    let text = format!("{title} {description}").to_lowercase();
    MUSIC_KEYWORDS.iter().any(|keyword| text.contains(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> Value {
        serde_json::json!({
            "bvid": "BV1xx411c7mD",
            "aid": 170001,
            "title": "<em class=\"keyword\">Lemon</em> 翻唱",
            "author": "somebody",
            "duration": "4:21",
            "pic": "//i0.hdslb.com/bfs/pic.jpg",
            "description": "acoustic cover",
            "play": 123456
        })
    }

    #[test]
    fn format_media_maps_fields() {
        let track = format_media(&sample_item()).unwrap();
        assert_eq!(track.id, "BV1xx411c7mD");
        assert_eq!(track.title, "Lemon 翻唱");
        assert_eq!(track.artist, "somebody");
        assert_eq!(track.duration, 261);
        assert_eq!(track.artwork, "https://i0.hdslb.com/bfs/pic.jpg");
        assert_eq!(track.url, "https://www.bilibili.com/video/BV1xx411c7mD");
        assert_eq!(track.extra_str("bvid"), Some("BV1xx411c7mD"));
        assert_eq!(track.source, "bilibili");
    }

    #[test]
    fn format_media_skips_items_without_bvid() {
        assert!(format_media(&serde_json::json!({"title": "no id"})).is_none());
    }

    #[test]
    fn music_filter_matches_either_field() {
        assert!(is_music_related("Lemon 翻唱", ""));
        assert!(is_music_related("random upload", "piano cover included"));
        assert!(!is_music_related("cooking stream", "today we fry rice"));
    }

    #[tokio::test]
    async fn resolve_prefers_bvid() {
        let source = BilibiliSource::new();
        let track = format_media(&sample_item()).unwrap();
        assert_eq!(
            source.resolve(&track).await.unwrap(),
            Some("https://www.bilibili.com/video/BV1xx411c7mD".to_string())
        );

        let mut bare = Track::new("x", "t", "a", "bilibili");
        bare.url = "https://example.com/v".into();
        assert_eq!(
            source.resolve(&bare).await.unwrap(),
            Some("https://example.com/v".to_string())
        );
    }
}
