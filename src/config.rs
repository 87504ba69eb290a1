//! YAML configuration with tolerant validation: out-of-range values are
//! clamped and logged rather than rejected.

use crate::error::{MeloError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sources: SourcesConfig,
    pub cache: CacheConfig,
    pub playback: PlaybackConfig,
    pub playlist_import: PlaylistImportConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub enabled: Vec<String>,
    pub search_timeout_secs: u64,
    pub max_results: usize,
    /// Ranking bonus per source tag; unknown tags fall back to `default_priority`.
    pub priority: HashMap<String, i64>,
    pub default_priority: i64,
    /// Base URL of a self-hosted netease API bridge. Search is disabled
    /// without one.
    pub netease_api_base: Option<String>,
    pub local_music_dirs: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["bilibili".into(), "netease".into(), "local".into()],
            search_timeout_secs: 10,
            max_results: 20,
            priority: HashMap::from([
                ("bilibili".to_string(), 20),
                ("netease".to_string(), 15),
                ("local".to_string(), 10),
            ]),
            default_priority: 5,
            netease_api_base: None,
            local_music_dirs: vec!["./music".into(), "./data/music".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size_bytes: u64,
    pub max_concurrent_downloads: usize,
    pub download_timeout_secs: u64,
    pub min_access_interval_secs: u64,
    pub audio_format: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 10 * 1024 * 1024 * 1024,
            max_concurrent_downloads: 3,
            download_timeout_secs: 300,
            min_access_interval_secs: 3600,
            audio_format: "opus".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub default_volume: f32,
    pub buffer_size: u32,
    pub audio_bitrate: String,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: 0.5,
            buffer_size: 1024,
            audio_bitrate: "128k".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistImportConfig {
    pub allowed_domains: Vec<String>,
    pub max_file_size: u64,
    pub timeout_secs: u64,
}

impl Default for PlaylistImportConfig {
    fn default() -> Self {
        Self {
            allowed_domains: vec![
                "github.com".into(),
                "raw.githubusercontent.com".into(),
                "gist.github.com".into(),
                "gist.githubusercontent.com".into(),
                "gitlab.com".into(),
                "cdn.jsdelivr.net".into(),
                "unpkg.com".into(),
            ],
            max_file_size: 5 * 1024 * 1024,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for everything the bot persists. Defaults to the platform data
    /// directory, falling back to `./data`.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_prefix: "melobot".to_string(),
        }
    }
}

const SUPPORTED_AUDIO_FORMATS: [&str; 4] = ["opus", "mp3", "aac", "ogg"];

impl Config {
    /// Load from a YAML file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)?;
            serde_yaml::from_str::<Config>(&raw)
                .map_err(|err| MeloError::Config(format!("{}: {err}", path.display())))?
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            Config::default()
        };
        config.validate();
        Ok(config)
    }

    /// Clamp out-of-range values instead of failing the boot.
    pub fn validate(&mut self) {
        if self.cache.max_size_bytes == 0 {
            warn!("cache.max_size_bytes is zero, restoring default");
            self.cache.max_size_bytes = CacheConfig::default().max_size_bytes;
        }
        let clamped = self.cache.max_concurrent_downloads.clamp(1, 16);
        if clamped != self.cache.max_concurrent_downloads {
            warn!(
                requested = self.cache.max_concurrent_downloads,
                "cache.max_concurrent_downloads out of range, clamping"
            );
            self.cache.max_concurrent_downloads = clamped;
        }
        if !SUPPORTED_AUDIO_FORMATS.contains(&self.cache.audio_format.as_str()) {
            warn!(format = %self.cache.audio_format, "unsupported audio format, using opus");
            self.cache.audio_format = "opus".to_string();
        }
        if !(0.0..=1.0).contains(&self.playback.default_volume) {
            warn!(
                volume = self.playback.default_volume,
                "playback.default_volume out of range, using 0.5"
            );
            self.playback.default_volume = 0.5;
        }
        if self.sources.max_results == 0 {
            self.sources.max_results = SourcesConfig::default().max_results;
        }
        if self.playlist_import.allowed_domains.is_empty() {
            warn!("playlist_import.allowed_domains is empty, restoring defaults");
            self.playlist_import.allowed_domains =
                PlaylistImportConfig::default().allowed_domains;
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.storage.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_dir()
                .map(|dir| dir.join("melobot"))
                .unwrap_or_else(|| PathBuf::from("./data")),
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir().join("audio_cache")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("melobot.db")
    }

    pub fn playlists_dir(&self) -> PathBuf {
        self.data_dir().join("playlists")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.data_dir().join("plugins")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }
}
