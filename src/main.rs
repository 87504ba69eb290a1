//! Console front-end: boots the core with the yt-dlp extractor and a stub
//! voice transport, then maps stdin lines to chat commands for guild 0.
//! The real chat adapter plugs in through the same `VoiceTransport` trait.

use async_trait::async_trait;
use melobot::cache::CacheEngine;
use melobot::config::Config;
use melobot::error::Result;
use melobot::extractor::YtDlpExtractor;
use melobot::orchestrator::{CompletionEvent, Orchestrator, VoiceTransport};
use melobot::playlist_import::PlaylistImporter;
use melobot::sources::{BilibiliSource, LocalSource, NeteaseSource, SourceRegistry};
use melobot::store::MetadataStore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Pretends to be a voice channel: "playback" lasts until `stop` is called,
/// at which point the completion event fires, exactly like a real transport's
/// end-of-track callback.
struct ConsoleTransport {
    completion_tx: mpsc::UnboundedSender<CompletionEvent>,
    playing: Mutex<HashMap<u64, PathBuf>>,
}

impl ConsoleTransport {
    fn new(completion_tx: mpsc::UnboundedSender<CompletionEvent>) -> Self {
        Self {
            completion_tx,
            playing: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VoiceTransport for ConsoleTransport {
    async fn ensure_connected(
        &self,
        guild_id: u64,
        _channel_id: Option<u64>,
        _user_id: u64,
    ) -> Result<()> {
        info!(guild = guild_id, "voice connection ready (console stub)");
        Ok(())
    }

    async fn play_file(&self, guild_id: u64, path: &Path, volume: f32) -> Result<()> {
        println!("[voice] playing {} at {:.0}%", path.display(), volume * 100.0);
        self.playing
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(guild_id, path.to_path_buf());
        Ok(())
    }

    async fn stop(&self, guild_id: u64) -> Result<()> {
        let was_playing = self
            .playing
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(&guild_id)
            .is_some();
        if was_playing {
            let _ = self.completion_tx.send(CompletionEvent {
                guild_id,
                error: None,
            });
        }
        Ok(())
    }

    async fn is_playing(&self, guild_id: u64) -> bool {
        self.playing
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .contains_key(&guild_id)
    }

    async fn disconnect(&self, guild_id: u64) -> Result<()> {
        self.stop(guild_id).await
    }
}

fn config_path_from_args() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    PathBuf::from("config.yaml")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load(&config_path_from_args())?;

    std::fs::create_dir_all(config.log_dir())?;
    let file_appender =
        tracing_appender::rolling::daily(config.log_dir(), &config.logging.file_prefix);
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .with_writer(file_writer.and(std::io::stderr))
        .init();
    info!(data_dir = %config.data_dir().display(), "melobot starting");

    std::fs::create_dir_all(config.playlists_dir())?;
    std::fs::create_dir_all(config.plugins_dir())?;

    let extractor = Arc::new(YtDlpExtractor::new(config.cache.audio_format.clone()));
    let cache = CacheEngine::new(config.cache_dir(), &config.cache, extractor)?;
    let store = MetadataStore::new(&config.database_path())?;
    let importer = PlaylistImporter::new(&config.playlist_import);

    let mut registry = SourceRegistry::new(&config.sources);
    let enabled = config.sources.enabled.clone();
    registry.register(Arc::new(BilibiliSource::new()), &enabled);
    registry.register(
        Arc::new(NeteaseSource::new(config.sources.netease_api_base.clone())),
        &enabled,
    );
    registry.register(
        Arc::new(LocalSource::with_default_dirs(&config.sources.local_music_dirs)),
        &enabled,
    );

    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(ConsoleTransport::new(completion_tx.clone()));
    let orchestrator = Orchestrator::new(
        registry,
        cache,
        store,
        importer,
        transport,
        &config,
        completion_tx,
    );
    Arc::clone(&orchestrator).spawn_completion_loop(completion_rx);

    println!("melobot console. Type `help` for commands, `quit` to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        let reply = orchestrator.handle_command(0, 0, line).await;
        println!("{reply}");
    }

    orchestrator.shutdown();
    info!("melobot stopped");
    Ok(())
}
