//! Content-addressed audio cache with reference counting and LRU eviction.
//!
//! One row per track id; rows whose downloads hashed identically share a
//! single file on disk and form a refcount class over it. The SQLite store
//! lives inside the cache root and is the authority for what is on disk.

use crate::cache::download::DownloadCoordinator;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::extractor::AudioExtractor;
use crate::models::{CacheEntry, Track};
use crate::utils::sanitize_file_component;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const STORE_FILE: &str = "cache.db";
const TEMP_SUBDIR: &str = "tmp";
const HASH_WINDOW: usize = 8192;
const LOW_WATER_RATIO: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub total_files: u64,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub usage_percent: f64,
    pub avg_access_count: f64,
    pub oldest: Option<String>,
    pub newest: Option<String>,
}

pub struct CacheEngine {
    root: PathBuf,
    max_size: u64,
    min_access_interval: chrono::Duration,
    conn: Mutex<Connection>,
    coordinator: DownloadCoordinator,
}

impl CacheEngine {
    pub fn new(
        root: PathBuf,
        config: &CacheConfig,
        extractor: Arc<dyn AudioExtractor>,
    ) -> Result<Self> {
        fs::create_dir_all(&root)?;
        let temp_dir = root.join(TEMP_SUBDIR);
        let coordinator = DownloadCoordinator::new(
            extractor,
            temp_dir,
            config.max_concurrent_downloads,
            Duration::from_secs(config.download_timeout_secs),
        )?;

        let conn = Connection::open(root.join(STORE_FILE))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audio_cache (
                track_id TEXT PRIMARY KEY,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_accessed TEXT NOT NULL,
                access_count INTEGER DEFAULT 0,
                reference_count INTEGER DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_content_hash ON audio_cache(content_hash);
            CREATE INDEX IF NOT EXISTS idx_last_accessed ON audio_cache(last_accessed);",
        )?;

        Ok(Self {
            root,
            max_size: config.max_size_bytes,
            min_access_interval: chrono::Duration::seconds(
                config.min_access_interval_secs as i64,
            ),
            conn: Mutex::new(conn),
            coordinator,
        })
    }

    /// Return a playable file for the track, downloading and caching it on a
    /// miss. `track.url` must already be resolved.
    pub async fn get(&self, track: &Track) -> Result<PathBuf> {
        // local tracks play straight from the user's file; the cache never
        // learns about them
        if track.source == "local" {
            if let Some(file_path) = track.extra_str("file_path") {
                let path = PathBuf::from(file_path);
                if path.is_file() {
                    return Ok(path);
                }
            }
        }

        if let Some(entry) = self.entry_for(&track.id)? {
            let path = PathBuf::from(&entry.file_path);
            if path.is_file() {
                self.touch(&track.id)?;
                debug!(track = %track.title, "cache hit");
                return Ok(path);
            }
        }

        info!(track = %track.title, "cache miss, downloading");
        self.fetch_and_store(track).await
    }

    async fn fetch_and_store(&self, track: &Track) -> Result<PathBuf> {
        let temp = self.coordinator.fetch(&track.url).await?;
        let hash = content_hash(&temp)?;
        let path = self.commit_download(track, &temp, &hash)?;
        self.ensure_budget()?;
        Ok(path)
    }

    /// Decide between referencing an existing identical file and keeping the
    /// fresh download. Runs entirely under the writer lock so two downloads
    /// finishing together cannot both keep their copy.
    fn commit_download(&self, track: &Track, temp: &Path, hash: &str) -> Result<PathBuf> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        let now = now_stamp();

        if let Some(shared) = find_live_file_by_hash(&conn, hash)? {
            fs::remove_file(temp)?;
            let size = fs::metadata(&shared)?.len();
            conn.execute(
                "INSERT OR REPLACE INTO audio_cache
                 (track_id, file_path, file_size, content_hash, created_at,
                  last_accessed, access_count, reference_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 1)",
                params![
                    track.id,
                    shared.to_string_lossy(),
                    size as i64,
                    hash,
                    now,
                    now
                ],
            )?;
            conn.execute(
                "UPDATE audio_cache SET reference_count = reference_count + 1
                 WHERE file_path = ?1 AND track_id != ?2",
                params![shared.to_string_lossy(), track.id],
            )?;
            info!(track = %track.title, "duplicate audio, referenced existing file");
            return Ok(shared);
        }

        let extension = temp
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("mp3")
            .to_string();
        let dest = self
            .root
            .join(format!("{}.{extension}", sanitize_file_component(&track.id)));
        fs::rename(temp, &dest)?;
        let size = fs::metadata(&dest)?.len();
        conn.execute(
            "INSERT OR REPLACE INTO audio_cache
             (track_id, file_path, file_size, content_hash, created_at,
              last_accessed, access_count, reference_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 1)",
            params![
                track.id,
                dest.to_string_lossy(),
                size as i64,
                hash,
                now,
                now
            ],
        )?;
        Ok(dest)
    }

    /// Evict least-recently-accessed files until usage drops below the
    /// low-water mark. Entries touched within the minimum access interval are
    /// never force-evicted, even if that leaves the cache over budget.
    pub fn ensure_budget(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        let mut remaining = total_size(&conn)?;
        if remaining <= self.max_size {
            return Ok(());
        }
        info!(
            used = remaining,
            max = self.max_size,
            "cache over budget, evicting"
        );

        let candidates: Vec<(String, String, u64)> = {
            let mut stmt = conn.prepare(
                "SELECT file_path, MAX(last_accessed) AS la, file_size
                 FROM audio_cache
                 WHERE reference_count > 0
                 GROUP BY file_path
                 ORDER BY la ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let low_water = (self.max_size as f64 * LOW_WATER_RATIO) as u64;
        let now = Utc::now();
        let mut evicted = 0usize;

        for (file_path, last_accessed, file_size) in candidates {
            if remaining <= low_water {
                break;
            }
            let recently_used = DateTime::parse_from_rfc3339(&last_accessed)
                .map(|stamp| now.signed_duration_since(stamp) < self.min_access_interval)
                .unwrap_or(false);
            if recently_used {
                continue;
            }
            if let Err(err) = fs::remove_file(&file_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(file_path = %file_path, %err, "failed to evict cache file");
                    continue;
                }
            }
            conn.execute(
                "DELETE FROM audio_cache WHERE file_path = ?1",
                params![file_path],
            )?;
            remaining = remaining.saturating_sub(file_size);
            evicted += 1;
        }

        if remaining > self.max_size && evicted == 0 {
            warn!(
                used = remaining,
                max = self.max_size,
                "cache over budget but every candidate was accessed too recently"
            );
        } else {
            info!(evicted, used = remaining, "eviction pass finished");
        }
        Ok(())
    }

    /// Drop this track's reference; the backing file goes away with the last
    /// reference.
    pub fn remove(&self, track_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        let Some(entry) = entry_row(&conn, track_id)? else {
            return Ok(false);
        };

        conn.execute(
            "UPDATE audio_cache SET reference_count = reference_count - 1
             WHERE file_path = ?1",
            params![entry.file_path],
        )?;
        conn.execute(
            "DELETE FROM audio_cache WHERE track_id = ?1",
            params![track_id],
        )?;

        let references: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audio_cache WHERE file_path = ?1",
            params![entry.file_path],
            |row| row.get(0),
        )?;
        if references == 0 {
            if let Err(err) = fs::remove_file(&entry.file_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(file_path = %entry.file_path, %err, "failed to remove cache file");
                }
            } else {
                info!(file_path = %entry.file_path, "removed cache file");
            }
        }
        Ok(true)
    }

    /// Wipe every row and every cached file, keeping only the store itself.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.root)?.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.file_name().and_then(|name| name.to_str()) == Some(STORE_FILE) {
                continue;
            }
            if fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        conn.execute("DELETE FROM audio_cache", [])?;
        info!(removed, "cache cleared");
        Ok(removed)
    }

    /// Reconcile disk and store: unknown files are unlinked, rows whose file
    /// vanished are dropped.
    pub fn cleanup_orphans(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());

        let known: Vec<String> = {
            let mut stmt = conn.prepare("SELECT DISTINCT file_path FROM audio_cache")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut removed = 0usize;
        for entry in fs::read_dir(&self.root)?.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.file_name().and_then(|name| name.to_str()) == Some(STORE_FILE) {
                continue;
            }
            let path_str = path.to_string_lossy().into_owned();
            if !known.iter().any(|known_path| *known_path == path_str) {
                if fs::remove_file(&path).is_ok() {
                    debug!(path = %path_str, "removed orphaned file");
                    removed += 1;
                }
            }
        }

        for file_path in known {
            if !Path::new(&file_path).exists() {
                conn.execute(
                    "DELETE FROM audio_cache WHERE file_path = ?1",
                    params![file_path],
                )?;
            }
        }
        info!(removed, "orphan sweep finished");
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        let total_bytes = total_size(&conn)?;
        let (total_files, avg_access_count, oldest, newest) = conn.query_row(
            "SELECT COUNT(DISTINCT file_path), AVG(access_count),
                    MIN(created_at), MAX(created_at)
             FROM audio_cache",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as u64,
                    row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;

        Ok(CacheStats {
            total_files,
            total_bytes,
            max_bytes: self.max_size,
            usage_percent: if self.max_size == 0 {
                0.0
            } else {
                total_bytes as f64 / self.max_size as f64 * 100.0
            },
            avg_access_count,
            oldest,
            newest,
        })
    }

    /// Cancel in-flight downloads; the engine itself stays usable.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }

    fn entry_for(&self, track_id: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        entry_row(&conn, track_id)
    }

    fn touch(&self, track_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        conn.execute(
            "UPDATE audio_cache
             SET last_accessed = ?1, access_count = access_count + 1
             WHERE track_id = ?2",
            params![now_stamp(), track_id],
        )?;
        Ok(())
    }
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn entry_row(conn: &Connection, track_id: &str) -> Result<Option<CacheEntry>> {
    let entry = conn
        .query_row(
            "SELECT track_id, file_path, file_size, content_hash, created_at,
                    last_accessed, access_count, reference_count
             FROM audio_cache WHERE track_id = ?1",
            params![track_id],
            |row| {
                Ok(CacheEntry {
                    track_id: row.get(0)?,
                    file_path: row.get(1)?,
                    file_size: row.get::<_, i64>(2)? as u64,
                    content_hash: row.get(3)?,
                    created_at: row.get(4)?,
                    last_accessed: row.get(5)?,
                    access_count: row.get::<_, i64>(6)? as u64,
                    reference_count: row.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(entry)
}

fn find_live_file_by_hash(conn: &Connection, hash: &str) -> Result<Option<PathBuf>> {
    let path: Option<String> = conn
        .query_row(
            "SELECT file_path FROM audio_cache
             WHERE content_hash = ?1 AND reference_count > 0
             LIMIT 1",
            params![hash],
            |row| row.get(0),
        )
        .optional()?;
    Ok(path.map(PathBuf::from).filter(|path| path.is_file()))
}

fn total_size(conn: &Connection) -> Result<u64> {
    let mut stmt = conn.prepare("SELECT DISTINCT file_path, file_size FROM audio_cache")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut total = 0u64;
    for row in rows {
        let (path, size) = row?;
        if Path::new(&path).exists() {
            total += size as u64;
        }
    }
    Ok(total)
}

/// Cheap probabilistic content hash: MD5 over three 8 KiB windows (head,
/// middle, tail), or the whole file when it fits in those windows anyway.
/// A dedup hint, not an integrity check.
pub fn content_hash(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let size = file.metadata()?.len();
    let mut context = md5::Context::new();

    if size <= (HASH_WINDOW * 3) as u64 {
        let mut all = Vec::with_capacity(size as usize);
        file.read_to_end(&mut all)?;
        context.consume(&all);
    } else {
        let mut window = vec![0u8; HASH_WINDOW];
        for offset in [0, size / 2, size - HASH_WINDOW as u64] {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut window)?;
            context.consume(&window);
        }
    }
    Ok(format!("{:x}", context.compute()))
}
