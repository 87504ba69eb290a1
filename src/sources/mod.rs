//! Pluggable music sources and the registry that fans searches out to them.

pub mod bilibili;
pub mod local;
pub mod netease;

pub use bilibili::BilibiliSource;
pub use local::LocalSource;
pub use netease::NeteaseSource;

use crate::config::SourcesConfig;
use crate::error::{MeloError, Result};
use crate::models::Track;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A named source of tracks. Implementations search their backend and
/// resolve a track to something the extractor can consume.
#[async_trait]
pub trait MusicSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn description(&self) -> &'static str {
        ""
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>>;

    /// Resolve the track to a playable URL, re-checked on every play.
    async fn resolve(&self, track: &Track) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub enabled: bool,
}

struct RegisteredSource {
    source: Arc<dyn MusicSource>,
    enabled: AtomicBool,
}

pub struct SourceRegistry {
    sources: Vec<RegisteredSource>,
    priority: HashMap<String, i64>,
    default_priority: i64,
    search_timeout: Duration,
}

impl SourceRegistry {
    pub fn new(config: &SourcesConfig) -> Self {
        Self {
            sources: Vec::new(),
            priority: config.priority.clone(),
            default_priority: config.default_priority,
            search_timeout: Duration::from_secs(config.search_timeout_secs),
        }
    }

    /// Register a source; it starts enabled iff named in `enabled_names`.
    pub fn register(&mut self, source: Arc<dyn MusicSource>, enabled_names: &[String]) {
        let enabled = enabled_names.iter().any(|name| name == source.name());
        self.sources.push(RegisteredSource {
            source,
            enabled: AtomicBool::new(enabled),
        });
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        for registered in &self.sources {
            if registered.source.name() == name {
                registered.enabled.store(enabled, Ordering::SeqCst);
                return true;
            }
        }
        false
    }

    pub fn infos(&self) -> Vec<SourceInfo> {
        self.sources
            .iter()
            .map(|registered| SourceInfo {
                name: registered.source.name(),
                version: registered.source.version(),
                description: registered.source.description(),
                enabled: registered.enabled.load(Ordering::SeqCst),
            })
            .collect()
    }

    pub fn enabled_sources(&self) -> Vec<&'static str> {
        self.sources
            .iter()
            .filter(|registered| registered.enabled.load(Ordering::SeqCst))
            .map(|registered| registered.source.name())
            .collect()
    }

    /// Search one source (when filtered) or fan out to every enabled source
    /// concurrently. A source that errors or misses its deadline contributes
    /// nothing; the whole call only fails when every source failed and
    /// nothing came back.
    pub async fn search(
        &self,
        query: &str,
        source_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Track>> {
        let limit = limit.max(1);
        let targets: Vec<&RegisteredSource> = self
            .sources
            .iter()
            .filter(|registered| registered.enabled.load(Ordering::SeqCst))
            .filter(|registered| {
                source_filter.is_none_or(|name| registered.source.name() == name)
            })
            .collect();
        if targets.is_empty() {
            return Err(MeloError::NotFound(match source_filter {
                Some(name) => format!("no enabled source named {name}"),
                None => "no sources are enabled".to_string(),
            }));
        }

        let per_source_limit = limit.div_ceil(targets.len());
        let searches = targets.iter().map(|registered| {
            let source = registered.source.clone();
            async move {
                let outcome = tokio::time::timeout(
                    self.search_timeout,
                    source.search(query, per_source_limit),
                )
                .await;
                (source.name(), outcome)
            }
        });

        let mut tracks = Vec::new();
        let mut failed = 0usize;
        let mut last_error = None;
        let outcomes = futures_util::future::join_all(searches).await;
        let total = outcomes.len();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(Ok(found)) => {
                    debug!(source = name, results = found.len(), "search returned");
                    tracks.extend(found);
                }
                Ok(Err(err)) => {
                    warn!(source = name, %err, "source search failed");
                    failed += 1;
                    last_error = Some(err);
                }
                Err(_) => {
                    warn!(source = name, "source search missed its deadline");
                }
            }
        }

        if tracks.is_empty() && failed == total {
            if let Some(err) = last_error {
                return Err(err);
            }
        }

        let mut ranked = rank_and_dedup(tracks, query, &self.priority, self.default_priority);
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Route URL resolution to the source that produced the track. Tracks
    /// from unknown sources fall back to whatever URL they carry.
    pub async fn resolve_play_url(&self, track: &Track) -> Result<Option<String>> {
        for registered in &self.sources {
            if registered.source.name() == track.source {
                return registered.source.resolve(track).await;
            }
        }
        Ok((!track.url.is_empty()).then(|| track.url.clone()))
    }
}

/// Collapse case-insensitive (title, artist) duplicates keeping the first
/// occurrence, then order by descending score. The sort is stable, so ties
/// keep their input order.
fn rank_and_dedup(
    tracks: Vec<Track>,
    query: &str,
    priority: &HashMap<String, i64>,
    default_priority: i64,
) -> Vec<Track> {
    let query_lower = query.to_lowercase();
    let mut seen = HashSet::new();
    let mut scored: Vec<(i64, Track)> = Vec::with_capacity(tracks.len());
    for track in tracks {
        let key = format!(
            "{}_{}",
            track.title.to_lowercase(),
            track.artist.to_lowercase()
        );
        if !seen.insert(key) {
            continue;
        }
        let score = score_track(&track, &query_lower, priority, default_priority);
        scored.push((score, track));
    }
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, track)| track).collect()
}

fn score_track(
    track: &Track,
    query_lower: &str,
    priority: &HashMap<String, i64>,
    default_priority: i64,
) -> i64 {
    let title = track.title.to_lowercase();
    let artist = track.artist.to_lowercase();
    let mut score = 0;
    if title == query_lower {
        score += 100;
    } else if title.contains(query_lower) {
        score += 50;
    }
    if artist.contains(query_lower) {
        score += 30;
    }
    score
        + priority
            .get(&track.source)
            .copied()
            .unwrap_or(default_priority)
}
