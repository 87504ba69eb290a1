//! Durable metadata: tracks, playlists and play history.
//!
//! Tracks referenced from playlists or history are persisted here; audio
//! bytes live in the cache engine.

use crate::error::Result;
use crate::models::{Playlist, Track};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistSummary {
    pub id: String,
    pub name: String,
    pub creator: String,
    pub updated_at: String,
    pub track_count: u64,
}

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tracks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                artist TEXT,
                album TEXT,
                duration INTEGER,
                source TEXT,
                artwork TEXT,
                url TEXT,
                tags TEXT,
                release_date TEXT,
                extra TEXT
            );
            CREATE TABLE IF NOT EXISTS playlists (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                creator TEXT,
                cover TEXT,
                tags TEXT,
                created_at TEXT,
                updated_at TEXT
            );
            CREATE TABLE IF NOT EXISTS playlist_tracks (
                playlist_id TEXT,
                track_id TEXT,
                position INTEGER,
                PRIMARY KEY (playlist_id, track_id),
                FOREIGN KEY (playlist_id) REFERENCES playlists (id),
                FOREIGN KEY (track_id) REFERENCES tracks (id)
            );
            CREATE TABLE IF NOT EXISTS play_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                track_id TEXT,
                played_at TEXT,
                duration_played INTEGER,
                FOREIGN KEY (track_id) REFERENCES tracks (id)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_track(&self, track: &Track) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        upsert_track_row(&conn, track)
    }

    pub fn get_track(&self, track_id: &str) -> Result<Option<Track>> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        let track = conn
            .query_row(
                "SELECT id, title, artist, album, duration, source, artwork, url,
                        tags, release_date, extra
                 FROM tracks WHERE id = ?1",
                params![track_id],
                track_from_row,
            )
            .optional()?;
        Ok(track)
    }

    /// Replace the playlist header and its full track list atomically.
    pub fn upsert_playlist(&self, playlist: &Playlist) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        let tx = conn.transaction()?;
        let now = now_stamp();
        let created_at = if playlist.created_at.is_empty() {
            now.clone()
        } else {
            playlist.created_at.clone()
        };

        tx.execute(
            "INSERT OR REPLACE INTO playlists
             (id, name, description, creator, cover, tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                playlist.id,
                playlist.name,
                playlist.description,
                playlist.creator,
                playlist.cover,
                serde_json::to_string(&playlist.tags).unwrap_or_default(),
                created_at,
                now,
            ],
        )?;
        tx.execute(
            "DELETE FROM playlist_tracks WHERE playlist_id = ?1",
            params![playlist.id],
        )?;
        for (position, track) in playlist.tracks.iter().enumerate() {
            upsert_track_row(&tx, track)?;
            tx.execute(
                "INSERT INTO playlist_tracks (playlist_id, track_id, position)
                 VALUES (?1, ?2, ?3)",
                params![playlist.id, track.id, position as i64],
            )?;
        }
        tx.commit()?;
        info!(playlist = %playlist.name, tracks = playlist.tracks.len(), "playlist saved");
        Ok(())
    }

    pub fn delete_playlist(&self, playlist_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        conn.execute(
            "DELETE FROM playlist_tracks WHERE playlist_id = ?1",
            params![playlist_id],
        )?;
        let deleted = conn.execute("DELETE FROM playlists WHERE id = ?1", params![playlist_id])?;
        Ok(deleted > 0)
    }

    pub fn list_playlists(&self) -> Result<Vec<PlaylistSummary>> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        let mut stmt = conn.prepare(
            "SELECT p.id, p.name, p.creator, p.updated_at, COUNT(pt.track_id)
             FROM playlists p
             LEFT JOIN playlist_tracks pt ON p.id = pt.playlist_id
             GROUP BY p.id
             ORDER BY p.updated_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PlaylistSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                creator: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                updated_at: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                track_count: row.get::<_, i64>(4)? as u64,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn load_playlist(&self, playlist_id: &str) -> Result<Option<Playlist>> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        let header = conn
            .query_row(
                "SELECT id, name, description, creator, cover, tags, created_at, updated_at
                 FROM playlists WHERE id = ?1",
                params![playlist_id],
                |row| {
                    Ok(Playlist {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        creator: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        cover: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        tags: json_list(row.get::<_, Option<String>>(5)?),
                        created_at: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                        updated_at: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                        tracks: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut playlist) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT t.id, t.title, t.artist, t.album, t.duration, t.source,
                    t.artwork, t.url, t.tags, t.release_date, t.extra
             FROM tracks t
             JOIN playlist_tracks pt ON t.id = pt.track_id
             WHERE pt.playlist_id = ?1
             ORDER BY pt.position",
        )?;
        let rows = stmt.query_map(params![playlist_id], track_from_row)?;
        for row in rows {
            playlist.tracks.push(row?);
        }
        Ok(Some(playlist))
    }

    /// Exact name first, then a unique case-insensitive prefix.
    pub fn find_playlist_by_name(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        let exact: Option<String> = conn
            .query_row(
                "SELECT id FROM playlists WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if exact.is_some() {
            return Ok(exact);
        }

        let mut stmt = conn.prepare("SELECT id, name FROM playlists")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let needle = name.to_lowercase();
        let mut matches = Vec::new();
        for row in rows {
            let (id, candidate) = row?;
            if candidate.to_lowercase().starts_with(&needle) {
                matches.push(id);
            }
        }
        Ok(if matches.len() == 1 {
            matches.pop()
        } else {
            None
        })
    }

    pub fn append_history(&self, track_id: &str, duration_played: u32) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        conn.execute(
            "INSERT INTO play_history (track_id, played_at, duration_played)
             VALUES (?1, ?2, ?3)",
            params![track_id, now_stamp(), duration_played as i64],
        )?;
        Ok(())
    }

    /// Most recently played tracks, newest first, one entry per track.
    pub fn recent_history(&self, limit: usize) -> Result<Vec<Track>> {
        let conn = self.conn.lock().unwrap_or_else(|err| err.into_inner());
        let mut stmt = conn.prepare(
            "SELECT t.id, t.title, t.artist, t.album, t.duration, t.source,
                    t.artwork, t.url, t.tags, t.release_date, t.extra,
                    MAX(h.played_at) AS last_played
             FROM tracks t
             JOIN play_history h ON t.id = h.track_id
             GROUP BY t.id
             ORDER BY last_played DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], track_from_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn upsert_track_row(conn: &Connection, track: &Track) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO tracks
         (id, title, artist, album, duration, source, artwork, url, tags,
          release_date, extra)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            track.id,
            track.title,
            track.artist,
            track.album,
            track.duration as i64,
            track.source,
            track.artwork,
            track.url,
            serde_json::to_string(&track.tags).unwrap_or_default(),
            track.release_date,
            serde_json::to_string(&track.extra).unwrap_or_default(),
        ],
    )?;
    Ok(())
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        id: row.get(0)?,
        title: row.get(1)?,
        artist: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        album: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        duration: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u32,
        source: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        artwork: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        url: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        tags: json_list(row.get::<_, Option<String>>(8)?),
        release_date: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        extra: row
            .get::<_, Option<String>>(10)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default(),
    })
}

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}
