//! Per-guild playback state machine.
//!
//! Every transition happens under the guild's mutex. Track-completion
//! callbacks arrive from the voice transport's thread via the orchestrator's
//! completion channel; they never touch this state directly. The
//! advance-in-flight flag keeps a completion that fires while an advance is
//! still starting the next track from advancing twice.

use crate::models::{PlayMode, PlayerStatus, Track};
use crate::queue::PlayQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerState {
    pub status: PlayerStatus,
    pub current: Option<Track>,
    pub position_secs: u32,
    pub volume: f32,
    pub queue: PlayQueue,
    pub last_error: Option<String>,
}

pub struct GuildPlayer {
    guild_id: u64,
    state: Mutex<PlayerState>,
    advance_in_flight: AtomicBool,
}

/// Held for the whole auto-advance, including starting the next track.
/// Dropping it re-arms the player for the next completion.
pub struct AdvanceGuard<'a> {
    player: &'a GuildPlayer,
}

impl Drop for AdvanceGuard<'_> {
    fn drop(&mut self) {
        self.player.advance_in_flight.store(false, Ordering::SeqCst);
    }
}

impl GuildPlayer {
    pub fn new(guild_id: u64, default_volume: f32) -> Self {
        Self {
            guild_id,
            state: Mutex::new(PlayerState {
                volume: default_volume.clamp(0.0, 1.0),
                ..PlayerState::default()
            }),
            advance_in_flight: AtomicBool::new(false),
        }
    }

    pub fn guild_id(&self) -> u64 {
        self.guild_id
    }

    pub async fn snapshot(&self) -> PlayerState {
        self.state.lock().await.clone()
    }

    /// Enter Playing with the given track. Valid from any status; Error in
    /// particular is recovered by a fresh start.
    pub async fn start(&self, track: Track) {
        let mut state = self.state.lock().await;
        info!(guild = self.guild_id, track = %track.title, "playing");
        state.status = PlayerStatus::Playing;
        state.current = Some(track);
        state.position_secs = 0;
        state.last_error = None;
    }

    pub async fn pause(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status == PlayerStatus::Playing {
            state.status = PlayerStatus::Paused;
            true
        } else {
            false
        }
    }

    pub async fn resume(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status == PlayerStatus::Paused {
            state.status = PlayerStatus::Playing;
            true
        } else {
            false
        }
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.status = PlayerStatus::Idle;
        state.current = None;
        state.position_secs = 0;
    }

    pub async fn set_volume(&self, volume: f32) -> f32 {
        let mut state = self.state.lock().await;
        state.volume = volume.clamp(0.0, 1.0);
        state.volume
    }

    pub async fn set_mode(&self, mode: PlayMode) {
        self.state.lock().await.queue.play_mode = mode;
    }

    pub async fn mark_buffering(&self) {
        self.state.lock().await.status = PlayerStatus::Buffering;
    }

    pub async fn mark_error(&self, message: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.status = PlayerStatus::Error;
        state.last_error = Some(message.into());
    }

    /// Append to the queue and return the new track's index.
    pub async fn enqueue(&self, track: Track) -> usize {
        let mut state = self.state.lock().await;
        state.queue.add(track, None);
        state.queue.len() - 1
    }

    pub async fn enqueue_all(&self, tracks: Vec<Track>, replace: bool) -> usize {
        let mut state = self.state.lock().await;
        if replace {
            state.queue.clear();
        }
        for track in tracks {
            state.queue.add(track, None);
        }
        state.queue.len()
    }

    /// Move the cursor to `index` and hand back the track there.
    pub async fn jump_to(&self, index: usize) -> Option<Track> {
        let mut state = self.state.lock().await;
        if index < state.queue.len() {
            state.queue.current_index = index;
            state.queue.current().cloned()
        } else {
            None
        }
    }

    pub async fn remove_from_queue(&self, index: usize) -> bool {
        self.state.lock().await.queue.remove(index)
    }

    pub async fn clear_queue(&self) {
        self.state.lock().await.queue.clear();
    }

    pub async fn shuffle_queue(&self) {
        self.state.lock().await.queue.shuffle_in_place();
    }

    pub async fn previous_track(&self) -> Option<Track> {
        self.state.lock().await.queue.previous()
    }

    /// Claim the right to run one auto-advance. `None` means another advance
    /// is already in flight and this completion must be dropped.
    pub fn try_begin_advance(&self) -> Option<AdvanceGuard<'_>> {
        if self.advance_in_flight.swap(true, Ordering::SeqCst) {
            debug!(guild = self.guild_id, "re-entrant advance suppressed");
            None
        } else {
            Some(AdvanceGuard { player: self })
        }
    }

    /// Apply a track-completion event: record any error, pick the next track
    /// per the play mode, and fall back to Idle when the queue is done. The
    /// caller starts actual playback for the returned track.
    pub async fn next_after_end(&self, error: Option<String>) -> Option<Track> {
        let mut state = self.state.lock().await;
        // a completion that trails a deliberate stop must not restart playback
        if state.status == PlayerStatus::Idle {
            return None;
        }
        if let Some(message) = error {
            state.status = PlayerStatus::Error;
            state.last_error = Some(message);
        }

        match state.queue.advance() {
            Some(track) => {
                state.status = PlayerStatus::Buffering;
                state.current = Some(track.clone());
                state.position_secs = 0;
                Some(track)
            }
            None => {
                info!(guild = self.guild_id, "queue exhausted");
                state.status = PlayerStatus::Idle;
                state.current = None;
                state.position_secs = 0;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str) -> Track {
        Track::new(id, format!("Track {id}"), "artist", "local")
    }

    async fn player_with_queue(n: usize, mode: PlayMode) -> GuildPlayer {
        let player = GuildPlayer::new(1, 0.5);
        for i in 0..n {
            player.enqueue(track(&i.to_string())).await;
        }
        player.set_mode(mode).await;
        player
    }

    #[tokio::test]
    async fn pause_resume_only_from_matching_states() {
        let player = GuildPlayer::new(1, 0.5);
        assert!(!player.pause().await, "cannot pause while idle");
        player.start(track("a")).await;
        assert!(player.pause().await);
        assert_eq!(player.snapshot().await.status, PlayerStatus::Paused);
        assert!(!player.pause().await, "already paused");
        assert!(player.resume().await);
        assert_eq!(player.snapshot().await.status, PlayerStatus::Playing);
        assert!(!player.resume().await, "already playing");
    }

    #[tokio::test]
    async fn stop_clears_current() {
        let player = GuildPlayer::new(1, 0.5);
        player.start(track("a")).await;
        player.stop().await;
        let state = player.snapshot().await;
        assert_eq!(state.status, PlayerStatus::Idle);
        assert!(state.current.is_none());
    }

    #[tokio::test]
    async fn start_recovers_from_error() {
        let player = GuildPlayer::new(1, 0.5);
        player.mark_error("extractor blew up").await;
        assert_eq!(player.snapshot().await.status, PlayerStatus::Error);
        player.start(track("a")).await;
        let state = player.snapshot().await;
        assert_eq!(state.status, PlayerStatus::Playing);
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn sequential_completions_traverse_then_idle() {
        let player = player_with_queue(3, PlayMode::Sequential).await;
        player.start(player.jump_to(0).await.unwrap()).await;

        let next = player.next_after_end(None).await.unwrap();
        assert_eq!(next.id, "1");
        let next = player.next_after_end(None).await.unwrap();
        assert_eq!(next.id, "2");
        assert!(player.next_after_end(None).await.is_none());

        let state = player.snapshot().await;
        assert_eq!(state.status, PlayerStatus::Idle);
        assert!(state.current.is_none());
    }

    #[tokio::test]
    async fn error_completion_records_and_advances_once() {
        let player = player_with_queue(2, PlayMode::Sequential).await;
        player.start(player.jump_to(0).await.unwrap()).await;

        let next = player.next_after_end(Some("stream died".into())).await;
        assert_eq!(next.unwrap().id, "1");
        let state = player.snapshot().await;
        assert_eq!(state.last_error.as_deref(), Some("stream died"));
        assert_eq!(state.status, PlayerStatus::Buffering);
    }

    #[tokio::test]
    async fn completion_after_stop_is_ignored() {
        let player = player_with_queue(3, PlayMode::Sequential).await;
        player.start(player.jump_to(0).await.unwrap()).await;
        player.stop().await;
        assert!(player.next_after_end(None).await.is_none());
        let state = player.snapshot().await;
        assert_eq!(state.status, PlayerStatus::Idle);
        assert_eq!(state.queue.current_index, 0, "queue cursor untouched");
    }

    #[tokio::test]
    async fn advance_guard_is_exclusive_until_dropped() {
        let player = GuildPlayer::new(1, 0.5);
        let guard = player.try_begin_advance().unwrap();
        assert!(player.try_begin_advance().is_none());
        drop(guard);
        assert!(player.try_begin_advance().is_some());
    }

    #[tokio::test]
    async fn volume_is_clamped() {
        let player = GuildPlayer::new(1, 0.5);
        assert_eq!(player.set_volume(3.0).await, 1.0);
        assert_eq!(player.set_volume(-0.5).await, 0.0);
        assert_eq!(player.set_volume(0.37).await, 0.37);
    }

    #[tokio::test]
    async fn enqueue_all_replace_resets_the_cursor() {
        let player = player_with_queue(3, PlayMode::Sequential).await;
        player.jump_to(2).await;
        let len = player
            .enqueue_all(vec![track("x"), track("y")], true)
            .await;
        assert_eq!(len, 2);
        let state = player.snapshot().await;
        assert_eq!(state.queue.current_index, 0);
        assert_eq!(state.queue.current().unwrap().id, "x");
    }
}
