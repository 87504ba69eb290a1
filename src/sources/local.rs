//! Local audio files as a source: scans the configured music directories and
//! matches the query against file names.

use crate::error::Result;
use crate::models::{derived_id, Track};
use crate::sources::MusicSource;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const LOCAL_AUDIO_EXTENSIONS: [&str; 7] = ["mp3", "m4a", "opus", "ogg", "wav", "flac", "aac"];

pub struct LocalSource {
    music_dirs: Vec<PathBuf>,
}

impl LocalSource {
    pub fn new(music_dirs: Vec<PathBuf>) -> Self {
        Self { music_dirs }
    }

    pub fn with_default_dirs(configured: &[String]) -> Self {
        let mut dirs: Vec<PathBuf> = configured.iter().map(PathBuf::from).collect();
        if let Some(home_music) = dirs::audio_dir() {
            dirs.push(home_music);
        }
        Self::new(dirs)
    }
}

#[async_trait]
impl MusicSource for LocalSource {
    fn name(&self) -> &'static str {
        "local"
    }

    fn description(&self) -> &'static str {
        "Local audio files"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>> {
        let needle = query.to_lowercase();
        let mut results = Vec::new();

        for dir in &self.music_dirs {
            if !dir.is_dir() {
                continue;
            }
            debug!(dir = %dir.display(), "scanning local music directory");
            for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
                if results.len() >= limit {
                    return Ok(results);
                }
                let path = entry.path();
                if !path.is_file() || !has_audio_extension(path) {
                    continue;
                }
                let file_name = entry.file_name().to_string_lossy();
                if !file_name.to_lowercase().contains(&needle) {
                    continue;
                }
                if let Some(track) = track_from_path(path) {
                    results.push(track);
                }
            }
        }
        Ok(results)
    }

    async fn resolve(&self, track: &Track) -> Result<Option<String>> {
        let Some(file_path) = track.extra_str("file_path") else {
            return Ok(None);
        };
        if Path::new(file_path).is_file() {
            Ok(Some(format!("file://{file_path}")))
        } else {
            Ok(None)
        }
    }
}

fn has_audio_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            LOCAL_AUDIO_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

fn track_from_path(path: &Path) -> Option<Track> {
    let stem = path.file_stem()?.to_string_lossy();
    let (artist, title) = parse_file_name(&stem);
    let absolute = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned();

    let mut track = Track::new(
        format!("local_{}", derived_id(&absolute)),
        title,
        artist,
        "local",
    );
    track.album = "Local music".to_string();
    track.url = format!("file://{absolute}");
    track.extra.insert("file_path".into(), Value::from(absolute));
    if let Ok(metadata) = path.metadata() {
        track
            .extra
            .insert("file_size".into(), Value::from(metadata.len()));
    }
    Some(track)
}

/// Pull `Artist - Title` out of a file name where possible; otherwise the
/// whole stem is the title.
fn parse_file_name(stem: &str) -> (String, String) {
    for separator in [" - ", " – ", "_", "|"] {
        if let Some((artist, title)) = stem.split_once(separator) {
            let artist = artist.trim();
            let title = title.trim();
            if !artist.is_empty() && !title.is_empty() {
                return (artist.to_string(), title.to_string());
            }
        }
    }
    ("Unknown Artist".to_string(), stem.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_parsing() {
        assert_eq!(
            parse_file_name("Beyond - 海阔天空"),
            ("Beyond".to_string(), "海阔天空".to_string())
        );
        assert_eq!(
            parse_file_name("artist_track"),
            ("artist".to_string(), "track".to_string())
        );
        assert_eq!(
            parse_file_name("justatitle"),
            ("Unknown Artist".to_string(), "justatitle".to_string())
        );
    }

    #[tokio::test]
    async fn search_matches_file_names_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Beyond - Amani.mp3"), b"x").unwrap();
        std::fs::write(dir.path().join("Other Tune.flac"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let source = LocalSource::new(vec![dir.path().to_path_buf()]);
        let results = source.search("amani", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        let track = &results[0];
        assert_eq!(track.artist, "Beyond");
        assert_eq!(track.title, "Amani");
        assert!(track.id.starts_with("local_"));
        assert!(track.url.starts_with("file://"));
        assert!(track.extra_str("file_path").is_some());
    }

    #[tokio::test]
    async fn search_honors_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("song {i}.mp3")), b"x").unwrap();
        }
        let source = LocalSource::new(vec![dir.path().to_path_buf()]);
        assert_eq!(source.search("song", 3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn resolve_checks_the_file_still_exists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Beyond - Amani.mp3");
        std::fs::write(&file, b"x").unwrap();

        let source = LocalSource::new(vec![dir.path().to_path_buf()]);
        let track = source.search("amani", 1).await.unwrap().pop().unwrap();
        assert!(source.resolve(&track).await.unwrap().is_some());

        std::fs::remove_file(&file).unwrap();
        assert!(source.resolve(&track).await.unwrap().is_none());
    }
}
