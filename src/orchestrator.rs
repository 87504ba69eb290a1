//! Glue layer: chat commands in, voice-transport calls out.
//!
//! Track-completion callbacks fire on the transport's own thread; transports
//! post a [`CompletionEvent`] to the completion channel instead of touching
//! player state. The completion loop drains that channel on the runtime and
//! drives auto-advance.

use crate::cache::CacheEngine;
use crate::config::Config;
use crate::error::{MeloError, Result};
use crate::models::{PlayMode, PlayerStatus, Track};
use crate::player::GuildPlayer;
use crate::playlist_import::{PlaylistFormat, PlaylistImporter};
use crate::sources::SourceRegistry;
use crate::store::MetadataStore;
use crate::utils::format_mib;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Posted by the voice transport when a track finishes (or dies).
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub guild_id: u64,
    pub error: Option<String>,
}

/// The chat platform's voice layer. `play_file` starts playback and must
/// post a [`CompletionEvent`] when the file ends; it must never mutate
/// player state from its own thread.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn ensure_connected(
        &self,
        guild_id: u64,
        channel_id: Option<u64>,
        user_id: u64,
    ) -> Result<()>;
    async fn play_file(&self, guild_id: u64, path: &Path, volume: f32) -> Result<()>;
    async fn stop(&self, guild_id: u64) -> Result<()>;
    async fn is_playing(&self, guild_id: u64) -> bool;
    async fn disconnect(&self, guild_id: u64) -> Result<()>;
}

pub struct Orchestrator {
    registry: SourceRegistry,
    cache: CacheEngine,
    store: MetadataStore,
    importer: PlaylistImporter,
    transport: Arc<dyn VoiceTransport>,
    players: Mutex<HashMap<u64, Arc<GuildPlayer>>>,
    completion_tx: mpsc::UnboundedSender<CompletionEvent>,
    default_volume: f32,
    max_results: usize,
}

impl Orchestrator {
    pub fn new(
        registry: SourceRegistry,
        cache: CacheEngine,
        store: MetadataStore,
        importer: PlaylistImporter,
        transport: Arc<dyn VoiceTransport>,
        config: &Config,
        completion_tx: mpsc::UnboundedSender<CompletionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cache,
            store,
            importer,
            transport,
            players: Mutex::new(HashMap::new()),
            completion_tx,
            default_volume: config.playback.default_volume,
            max_results: config.sources.max_results,
        })
    }

    /// Hand this to transports so their foreign-thread callbacks can reach
    /// the scheduler.
    pub fn completion_sender(&self) -> mpsc::UnboundedSender<CompletionEvent> {
        self.completion_tx.clone()
    }

    pub fn spawn_completion_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<CompletionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.on_completion(event).await;
            }
        })
    }

    /// Cancel in-flight downloads on the way out.
    pub fn shutdown(&self) {
        self.cache.shutdown();
    }

    fn player(&self, guild_id: u64) -> Arc<GuildPlayer> {
        let mut players = self.players.lock().unwrap_or_else(|err| err.into_inner());
        players
            .entry(guild_id)
            .or_insert_with(|| Arc::new(GuildPlayer::new(guild_id, self.default_volume)))
            .clone()
    }

    async fn on_completion(&self, event: CompletionEvent) {
        let player = self.player(event.guild_id);
        let Some(_guard) = player.try_begin_advance() else {
            return;
        };
        if let Some(next) = player.next_after_end(event.error).await {
            if let Err(err) = self.start_playback(event.guild_id, next).await {
                warn!(guild = event.guild_id, %err, "failed to start next track");
                player.mark_error(err.to_string()).await;
            }
        }
    }

    /// Resolve, cache and hand the file to the voice transport.
    async fn start_playback(&self, guild_id: u64, mut track: Track) -> Result<()> {
        let player = self.player(guild_id);
        player.mark_buffering().await;

        if let Some(url) = self.registry.resolve_play_url(&track).await? {
            track.url = url;
        }
        let path = self.cache.get(&track).await?;
        let volume = player.snapshot().await.volume;
        self.transport.play_file(guild_id, &path, volume).await?;
        player.start(track.clone()).await;
        if let Err(err) = self.store.append_history(&track.id, 0) {
            warn!(%err, "failed to record play history");
        }
        Ok(())
    }

    /// Parse and run one chat command, returning the reply text. Failures
    /// come back as a single `✗` line, never as a panic or a stack trace.
    pub async fn handle_command(&self, guild_id: u64, user_id: u64, input: &str) -> String {
        let input = input.trim();
        let (command, args) = match input.split_once(char::is_whitespace) {
            Some((command, args)) => (command, args.trim()),
            None => (input, ""),
        };

        let result = match command.to_ascii_lowercase().as_str() {
            "play" => self.cmd_play(guild_id, user_id, args).await,
            "search" => self.cmd_search(args).await,
            "pause" => self.cmd_pause(guild_id).await,
            "resume" => self.cmd_resume(guild_id).await,
            "stop" => self.cmd_stop(guild_id).await,
            "skip" => self.cmd_skip(guild_id).await,
            "previous" => self.cmd_previous(guild_id).await,
            "now" => self.cmd_now(guild_id).await,
            "queue" => self.cmd_queue(guild_id).await,
            "shuffle" => self.cmd_shuffle(guild_id).await,
            "repeat" => self.cmd_repeat(guild_id, args).await,
            "volume" => self.cmd_volume(guild_id, args).await,
            "history" => self.cmd_history().await,
            "playlist" => self.cmd_playlist(guild_id, args).await,
            "cache" => self.cmd_cache(args).await,
            "sources" => self.cmd_sources().await,
            "help" | "" => Ok(help_text()),
            _ => Ok(format!("Unknown command `{command}`. Try `help`.")),
        };
        result.unwrap_or_else(|err| format!("✗ {err}"))
    }

    async fn cmd_play(&self, guild_id: u64, user_id: u64, query: &str) -> Result<String> {
        if query.is_empty() {
            return Ok("Usage: play <query>".to_string());
        }
        self.transport
            .ensure_connected(guild_id, None, user_id)
            .await?;

        let results = self.registry.search(query, None, self.max_results).await?;
        let Some(track) = results.into_iter().next() else {
            return Err(MeloError::NotFound(format!("no results for `{query}`")));
        };
        self.store.upsert_track(&track)?;

        let player = self.player(guild_id);
        let index = player.enqueue(track.clone()).await;
        let status = player.snapshot().await.status;
        if matches!(status, PlayerStatus::Idle | PlayerStatus::Error) {
            let starting = player.jump_to(index).await.unwrap_or(track);
            self.start_playback(guild_id, starting.clone()).await?;
            Ok(format!("▶ Now playing: {}", describe(&starting)))
        } else {
            Ok(format!(
                "➕ Queued at #{}: {}",
                index + 1,
                describe(&track)
            ))
        }
    }

    async fn cmd_search(&self, query: &str) -> Result<String> {
        if query.is_empty() {
            return Ok("Usage: search <query>".to_string());
        }
        let results = self.registry.search(query, None, self.max_results).await?;
        if results.is_empty() {
            return Err(MeloError::NotFound(format!("no results for `{query}`")));
        }
        let mut lines = vec![format!("Results for `{query}`:")];
        for (i, track) in results.iter().enumerate().take(10) {
            lines.push(format!(
                "{}. {} [{}] {}",
                i + 1,
                describe(track),
                track.source,
                clock(track.duration)
            ));
        }
        Ok(lines.join("\n"))
    }

    async fn cmd_pause(&self, guild_id: u64) -> Result<String> {
        if self.player(guild_id).pause().await {
            Ok("⏸ Paused.".to_string())
        } else {
            Err(MeloError::Playback("nothing is playing".into()))
        }
    }

    async fn cmd_resume(&self, guild_id: u64) -> Result<String> {
        if self.player(guild_id).resume().await {
            Ok("▶ Resumed.".to_string())
        } else {
            Err(MeloError::Playback("nothing is paused".into()))
        }
    }

    async fn cmd_stop(&self, guild_id: u64) -> Result<String> {
        // set Idle first so the transport's completion event is a no-op
        self.player(guild_id).stop().await;
        self.transport.stop(guild_id).await?;
        Ok("⏹ Stopped.".to_string())
    }

    /// Skip asks the transport to stop and lets the completion callback do
    /// the advancing; advancing here as well would double-step the queue.
    async fn cmd_skip(&self, guild_id: u64) -> Result<String> {
        let status = self.player(guild_id).snapshot().await.status;
        if !matches!(status, PlayerStatus::Playing | PlayerStatus::Paused) {
            return Err(MeloError::Playback("nothing to skip".into()));
        }
        self.transport.stop(guild_id).await?;
        Ok("⏭ Skipping…".to_string())
    }

    async fn cmd_previous(&self, guild_id: u64) -> Result<String> {
        let player = self.player(guild_id);
        let Some(track) = player.previous_track().await else {
            return Err(MeloError::Playback("already at the start of the queue".into()));
        };
        self.start_playback(guild_id, track.clone()).await?;
        Ok(format!("▶ Now playing: {}", describe(&track)))
    }

    async fn cmd_now(&self, guild_id: u64) -> Result<String> {
        let state = self.player(guild_id).snapshot().await;
        Ok(match (&state.current, state.status) {
            (Some(track), status) => format!(
                "{:?} — {} [{} mode]",
                status,
                describe(track),
                state.queue.play_mode.key()
            ),
            (None, _) => "Nothing is playing.".to_string(),
        })
    }

    async fn cmd_queue(&self, guild_id: u64) -> Result<String> {
        let state = self.player(guild_id).snapshot().await;
        if state.queue.is_empty() {
            return Ok("The queue is empty.".to_string());
        }
        let mut lines = vec![format!(
            "Queue ({} tracks, {} mode):",
            state.queue.len(),
            state.queue.play_mode.key()
        )];
        for (i, track) in state.queue.tracks.iter().enumerate().take(10) {
            let marker = if i == state.queue.current_index {
                "▶"
            } else {
                " "
            };
            lines.push(format!("{marker} {}. {}", i + 1, describe(track)));
        }
        if state.queue.len() > 10 {
            lines.push(format!("… and {} more", state.queue.len() - 10));
        }
        Ok(lines.join("\n"))
    }

    async fn cmd_shuffle(&self, guild_id: u64) -> Result<String> {
        let player = self.player(guild_id);
        player.shuffle_queue().await;
        Ok("🔀 Queue shuffled.".to_string())
    }

    async fn cmd_repeat(&self, guild_id: u64, args: &str) -> Result<String> {
        let Some(mode) = PlayMode::from_key(args) else {
            return Ok("Usage: repeat off|all|one|shuffle".to_string());
        };
        self.player(guild_id).set_mode(mode).await;
        Ok(format!("Play mode set to {}.", mode.key()))
    }

    async fn cmd_volume(&self, guild_id: u64, args: &str) -> Result<String> {
        let Ok(percent) = args.parse::<u32>() else {
            return Ok("Usage: volume <0..100>".to_string());
        };
        let applied = self
            .player(guild_id)
            .set_volume(percent.min(100) as f32 / 100.0)
            .await;
        Ok(format!("🔊 Volume set to {:.0}%.", applied * 100.0))
    }

    async fn cmd_history(&self) -> Result<String> {
        let recent = self.store.recent_history(10)?;
        if recent.is_empty() {
            return Ok("No play history yet.".to_string());
        }
        let mut lines = vec!["Recently played:".to_string()];
        for (i, track) in recent.iter().enumerate() {
            lines.push(format!("{}. {}", i + 1, describe(track)));
        }
        Ok(lines.join("\n"))
    }

    async fn cmd_playlist(&self, guild_id: u64, args: &str) -> Result<String> {
        let (sub, rest) = match args.split_once(char::is_whitespace) {
            Some((sub, rest)) => (sub, rest.trim()),
            None => (args, ""),
        };
        match sub.to_ascii_lowercase().as_str() {
            "list" | "" => {
                let playlists = self.store.list_playlists()?;
                if playlists.is_empty() {
                    return Ok("No playlists saved.".to_string());
                }
                let mut lines = vec!["Playlists:".to_string()];
                for summary in playlists {
                    lines.push(format!(
                        "- {} ({} tracks, by {})",
                        summary.name, summary.track_count, summary.creator
                    ));
                }
                Ok(lines.join("\n"))
            }
            "import" => {
                if rest.is_empty() {
                    return Ok("Usage: playlist import <url|file>".to_string());
                }
                let playlist = if rest.starts_with("http://") || rest.starts_with("https://") {
                    self.importer.import_from_url(rest).await?
                } else {
                    self.importer.import_from_file(Path::new(rest))?
                };
                self.store.upsert_playlist(&playlist)?;
                Ok(format!(
                    "✔ Imported `{}` with {} tracks.",
                    playlist.name,
                    playlist.tracks.len()
                ))
            }
            "play" => {
                if rest.is_empty() {
                    return Ok("Usage: playlist play <name>".to_string());
                }
                let id = self
                    .store
                    .find_playlist_by_name(rest)?
                    .ok_or_else(|| MeloError::NotFound(format!("playlist `{rest}`")))?;
                let playlist = self
                    .store
                    .load_playlist(&id)?
                    .ok_or_else(|| MeloError::NotFound(format!("playlist `{rest}`")))?;
                if playlist.tracks.is_empty() {
                    return Err(MeloError::Playback(format!(
                        "playlist `{}` is empty",
                        playlist.name
                    )));
                }

                let player = self.player(guild_id);
                player.enqueue_all(playlist.tracks.clone(), true).await;
                let Some(first) = player.jump_to(0).await else {
                    return Err(MeloError::Playback(format!(
                        "playlist `{}` is empty",
                        playlist.name
                    )));
                };
                self.start_playback(guild_id, first).await?;
                Ok(format!(
                    "▶ Playing playlist `{}` ({} tracks).",
                    playlist.name,
                    playlist.tracks.len()
                ))
            }
            "export" => {
                let (name, path) = rest
                    .rsplit_once(char::is_whitespace)
                    .map(|(name, path)| (name.trim(), path.trim()))
                    .unwrap_or(("", ""));
                if name.is_empty() || path.is_empty() {
                    return Ok("Usage: playlist export <name> <file>".to_string());
                }
                let id = self
                    .store
                    .find_playlist_by_name(name)?
                    .ok_or_else(|| MeloError::NotFound(format!("playlist `{name}`")))?;
                let playlist = self
                    .store
                    .load_playlist(&id)?
                    .ok_or_else(|| MeloError::NotFound(format!("playlist `{name}`")))?;
                self.importer
                    .export_to_file(&playlist, Path::new(path), PlaylistFormat::Simple)?;
                Ok(format!("✔ Exported `{}` to {path}.", playlist.name))
            }
            other => Ok(format!(
                "Unknown playlist subcommand `{other}`. Try list, import, play or export."
            )),
        }
    }

    async fn cmd_cache(&self, args: &str) -> Result<String> {
        match args.to_ascii_lowercase().as_str() {
            "" | "status" => {
                let stats = self.cache.stats()?;
                Ok(format!(
                    "Cache: {} files, {} MiB / {} MiB ({:.1}%), avg access {:.1}",
                    stats.total_files,
                    format_mib(stats.total_bytes),
                    format_mib(stats.max_bytes),
                    stats.usage_percent,
                    stats.avg_access_count
                ))
            }
            "clear" => {
                let removed = self.cache.clear()?;
                Ok(format!("✔ Cache cleared, removed {removed} files."))
            }
            "cleanup" => {
                let removed = self.cache.cleanup_orphans()?;
                Ok(format!("✔ Cleanup removed {removed} orphaned files."))
            }
            other => Ok(format!(
                "Unknown cache subcommand `{other}`. Try status, clear or cleanup."
            )),
        }
    }

    async fn cmd_sources(&self) -> Result<String> {
        let mut lines = vec!["Sources:".to_string()];
        for info in self.registry.infos() {
            lines.push(format!(
                "- {} {} [{}] {}",
                info.name,
                info.version,
                if info.enabled { "enabled" } else { "disabled" },
                info.description
            ));
        }
        Ok(lines.join("\n"))
    }
}

fn describe(track: &Track) -> String {
    if track.artist.is_empty() {
        track.title.clone()
    } else {
        format!("{} — {}", track.title, track.artist)
    }
}

fn clock(duration: u32) -> String {
    format!("{}:{:02}", duration / 60, duration % 60)
}

fn help_text() -> String {
    [
        "Commands:",
        "  play <query>            search and play the best match",
        "  search <query>          list matches across sources",
        "  pause / resume / stop   control playback",
        "  skip / previous         move through the queue",
        "  now / queue             show what's playing",
        "  shuffle                 reorder the queue randomly",
        "  repeat off|all|one|shuffle",
        "  volume <0..100>",
        "  history                 recently played tracks",
        "  playlist list|import <url|file>|play <name>|export <name> <file>",
        "  cache [status|clear|cleanup]",
        "  sources                 list music sources",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::error::Result;
    use crate::extractor::AudioExtractor;
    use crate::sources::MusicSource;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct TestSource {
        tracks: Vec<Track>,
    }

    #[async_trait]
    impl MusicSource for TestSource {
        fn name(&self) -> &'static str {
            "bilibili"
        }

        async fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>> {
            let needle = query.to_lowercase();
            Ok(self
                .tracks
                .iter()
                .filter(|track| track.title.to_lowercase().contains(&needle))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn resolve(&self, track: &Track) -> Result<Option<String>> {
            Ok(Some(track.url.clone()))
        }
    }

    struct BytesExtractor;

    #[async_trait]
    impl AudioExtractor for BytesExtractor {
        async fn extract(
            &self,
            url: &str,
            out_template: &str,
            _timeout: Duration,
            _retries: u32,
        ) -> Result<PathBuf> {
            let path = PathBuf::from(out_template.replace(".%(ext)s", ".mp3"));
            std::fs::write(&path, url.as_bytes())?;
            Ok(path)
        }
    }

    struct RecordingTransport {
        plays: Mutex<Vec<(u64, PathBuf)>>,
        stops: AtomicUsize,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                plays: Mutex::new(Vec::new()),
                stops: AtomicUsize::new(0),
            }
        }

        fn play_count(&self) -> usize {
            self.plays.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl VoiceTransport for RecordingTransport {
        async fn ensure_connected(
            &self,
            _guild_id: u64,
            _channel_id: Option<u64>,
            _user_id: u64,
        ) -> Result<()> {
            Ok(())
        }

        async fn play_file(&self, guild_id: u64, path: &Path, _volume: f32) -> Result<()> {
            self.plays.lock().unwrap().push((guild_id, path.to_path_buf()));
            Ok(())
        }

        async fn stop(&self, _guild_id: u64) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_playing(&self, _guild_id: u64) -> bool {
            false
        }

        async fn disconnect(&self, _guild_id: u64) -> Result<()> {
            Ok(())
        }
    }

    fn test_track(id: &str, title: &str) -> Track {
        let mut track = Track::new(id, title, "artist", "bilibili");
        track.url = format!("https://v/{id}");
        track
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        transport: Arc<RecordingTransport>,
        _dir: tempfile::TempDir,
    }

    fn harness(tracks: Vec<Track>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();

        let mut registry = SourceRegistry::new(&config.sources);
        registry.register(Arc::new(TestSource { tracks }), &["bilibili".to_string()]);

        let cache_config = CacheConfig {
            max_size_bytes: 1 << 30,
            ..CacheConfig::default()
        };
        let cache = CacheEngine::new(
            dir.path().join("audio_cache"),
            &cache_config,
            Arc::new(BytesExtractor),
        )
        .unwrap();
        let store = MetadataStore::new(&dir.path().join("melobot.db")).unwrap();
        let importer = PlaylistImporter::new(&config.playlist_import);
        let transport = Arc::new(RecordingTransport::new());
        let (tx, _rx) = mpsc::unbounded_channel();

        let orchestrator = Orchestrator::new(
            registry,
            cache,
            store,
            importer,
            transport.clone(),
            &config,
            tx,
        );
        Harness {
            orchestrator,
            transport,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn play_starts_immediately_when_idle_then_queues() {
        let harness = harness(vec![
            test_track("a", "Lemon"),
            test_track("b", "Lemon Tea"),
        ]);
        let reply = harness.orchestrator.handle_command(1, 2, "play lemon").await;
        assert!(reply.starts_with("▶ Now playing"), "got: {reply}");
        assert_eq!(harness.transport.play_count(), 1);

        let reply = harness
            .orchestrator
            .handle_command(1, 2, "play lemon tea")
            .await;
        assert!(reply.starts_with("➕ Queued"), "got: {reply}");
        assert_eq!(harness.transport.play_count(), 1);

        let state = harness.orchestrator.player(1).snapshot().await;
        assert_eq!(state.status, PlayerStatus::Playing);
        assert_eq!(state.queue.len(), 2);
    }

    #[tokio::test]
    async fn no_results_is_a_single_error_line() {
        let harness = harness(vec![]);
        let reply = harness
            .orchestrator
            .handle_command(1, 2, "play nothing here")
            .await;
        assert!(reply.starts_with("✗ "), "got: {reply}");
        assert!(!reply.contains('\n'));
    }

    #[tokio::test]
    async fn completion_advances_and_plays_the_next_track() {
        let harness = harness(vec![
            test_track("a", "Lemon"),
            test_track("b", "Lemon Tea"),
        ]);
        harness.orchestrator.handle_command(1, 2, "play lemon").await;
        harness
            .orchestrator
            .handle_command(1, 2, "play lemon tea")
            .await;

        harness
            .orchestrator
            .on_completion(CompletionEvent {
                guild_id: 1,
                error: None,
            })
            .await;

        assert_eq!(harness.transport.play_count(), 2);
        let state = harness.orchestrator.player(1).snapshot().await;
        assert_eq!(state.current.as_ref().unwrap().id, "b");

        // queue exhausted: the next completion goes back to idle
        harness
            .orchestrator
            .on_completion(CompletionEvent {
                guild_id: 1,
                error: None,
            })
            .await;
        let state = harness.orchestrator.player(1).snapshot().await;
        assert_eq!(state.status, PlayerStatus::Idle);
    }

    #[tokio::test]
    async fn reentrant_completions_advance_only_once() {
        let harness = harness(vec![
            test_track("a", "Lemon"),
            test_track("b", "Lemon Tea"),
        ]);
        harness.orchestrator.handle_command(1, 2, "play lemon").await;
        harness
            .orchestrator
            .handle_command(1, 2, "play lemon tea")
            .await;

        let player = harness.orchestrator.player(1);
        let _guard = player.try_begin_advance().unwrap();
        harness
            .orchestrator
            .on_completion(CompletionEvent {
                guild_id: 1,
                error: None,
            })
            .await;
        // the held guard swallowed the event
        assert_eq!(harness.transport.play_count(), 1);
    }

    #[tokio::test]
    async fn skip_defers_to_the_completion_callback() {
        let harness = harness(vec![test_track("a", "Lemon")]);
        harness.orchestrator.handle_command(1, 2, "play lemon").await;

        let reply = harness.orchestrator.handle_command(1, 2, "skip").await;
        assert!(reply.starts_with("⏭"), "got: {reply}");
        assert_eq!(harness.transport.stops.load(Ordering::SeqCst), 1);
        // no direct advance happened
        assert_eq!(harness.transport.play_count(), 1);

        let reply = harness.orchestrator.handle_command(2, 2, "skip").await;
        assert!(reply.starts_with("✗ "), "got: {reply}");
    }

    #[tokio::test]
    async fn stop_then_completion_stays_idle() {
        let harness = harness(vec![
            test_track("a", "Lemon"),
            test_track("b", "Lemon Tea"),
        ]);
        harness.orchestrator.handle_command(1, 2, "play lemon").await;
        harness
            .orchestrator
            .handle_command(1, 2, "play lemon tea")
            .await;
        harness.orchestrator.handle_command(1, 2, "stop").await;

        harness
            .orchestrator
            .on_completion(CompletionEvent {
                guild_id: 1,
                error: None,
            })
            .await;
        let state = harness.orchestrator.player(1).snapshot().await;
        assert_eq!(state.status, PlayerStatus::Idle);
        assert_eq!(harness.transport.play_count(), 1);
    }

    #[tokio::test]
    async fn control_commands_report_usage_and_state() {
        let harness = harness(vec![test_track("a", "Lemon")]);
        assert!(harness
            .orchestrator
            .handle_command(1, 2, "pause")
            .await
            .starts_with("✗ "));

        harness.orchestrator.handle_command(1, 2, "play lemon").await;
        assert_eq!(
            harness.orchestrator.handle_command(1, 2, "pause").await,
            "⏸ Paused."
        );
        assert_eq!(
            harness.orchestrator.handle_command(1, 2, "resume").await,
            "▶ Resumed."
        );

        let reply = harness.orchestrator.handle_command(1, 2, "volume 30").await;
        assert!(reply.contains("30%"), "got: {reply}");
        let reply = harness.orchestrator.handle_command(1, 2, "volume loud").await;
        assert!(reply.starts_with("Usage"), "got: {reply}");

        let reply = harness.orchestrator.handle_command(1, 2, "repeat all").await;
        assert!(reply.contains("repeat_all"), "got: {reply}");

        let reply = harness.orchestrator.handle_command(1, 2, "queue").await;
        assert!(reply.contains("▶ 1."), "got: {reply}");

        let reply = harness.orchestrator.handle_command(1, 2, "bogus").await;
        assert!(reply.contains("Unknown command"), "got: {reply}");
    }

    #[tokio::test]
    async fn cache_and_sources_commands_render() {
        let harness = harness(vec![test_track("a", "Lemon")]);
        harness.orchestrator.handle_command(1, 2, "play lemon").await;

        let reply = harness.orchestrator.handle_command(1, 2, "cache").await;
        assert!(reply.starts_with("Cache: 1 files"), "got: {reply}");

        let reply = harness.orchestrator.handle_command(1, 2, "cache clear").await;
        assert!(reply.contains("removed 1"), "got: {reply}");

        let reply = harness.orchestrator.handle_command(1, 2, "sources").await;
        assert!(reply.contains("bilibili"), "got: {reply}");

        let reply = harness.orchestrator.handle_command(1, 2, "history").await;
        assert!(reply.contains("Lemon"), "got: {reply}");
    }

    #[tokio::test]
    async fn playlist_import_play_and_export_flow() {
        let harness = harness(vec![]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "name": "Road Trip",
                "songs": [
                    {"id": "a", "title": "One", "artist": "A", "platform": "bilibili",
                     "url": "https://v/a"},
                    {"id": "b", "title": "Two", "artist": "B", "platform": "bilibili",
                     "url": "https://v/b"}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let reply = harness
            .orchestrator
            .handle_command(1, 2, &format!("playlist import {}", path.display()))
            .await;
        assert!(reply.contains("Road Trip"), "got: {reply}");
        assert!(reply.contains("2 tracks"), "got: {reply}");

        let reply = harness.orchestrator.handle_command(1, 2, "playlist list").await;
        assert!(reply.contains("Road Trip (2 tracks"), "got: {reply}");

        let reply = harness
            .orchestrator
            .handle_command(1, 2, "playlist play road trip")
            .await;
        assert!(reply.contains("Playing playlist"), "got: {reply}");
        assert_eq!(harness.transport.play_count(), 1);
        let state = harness.orchestrator.player(1).snapshot().await;
        assert_eq!(state.queue.len(), 2);

        let export_path = dir.path().join("out.json");
        let reply = harness
            .orchestrator
            .handle_command(
                1,
                2,
                &format!("playlist export Road Trip {}", export_path.display()),
            )
            .await;
        assert!(reply.starts_with("✔ Exported"), "got: {reply}");
        assert!(export_path.exists());

        let reply = harness
            .orchestrator
            .handle_command(1, 2, "playlist play nope")
            .await;
        assert!(reply.starts_with("✗ "), "got: {reply}");
    }
}
