//! Per-guild play queue: ordered tracks, a cursor and the four play modes.
//!
//! Advance/previous only move the cursor; actually starting playback is the
//! orchestrator's job.

use crate::models::{PlayMode, Track};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlayQueue {
    pub tracks: Vec<Track>,
    pub current_index: usize,
    pub play_mode: PlayMode,
    /// Past cursor positions while in shuffle mode, newest last. Bounded to
    /// the queue length.
    pub shuffle_history: Vec<usize>,
}

impl PlayQueue {
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn current(&self) -> Option<&Track> {
        self.tracks.get(self.current_index)
    }

    pub fn add(&mut self, track: Track, position: Option<usize>) {
        match position {
            Some(index) if index <= self.tracks.len() => self.tracks.insert(index, track),
            _ => self.tracks.push(track),
        }
    }

    pub fn remove(&mut self, index: usize) -> bool {
        if index >= self.tracks.len() {
            return false;
        }
        self.tracks.remove(index);
        if index < self.current_index {
            self.current_index -= 1;
        } else if index == self.current_index && self.current_index >= self.tracks.len() {
            self.current_index = 0;
        }
        // keep the history pointing at the tracks it referred to
        self.shuffle_history.retain(|&past| past != index);
        for past in &mut self.shuffle_history {
            if *past > index {
                *past -= 1;
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.current_index = 0;
        self.shuffle_history.clear();
    }

    /// Reorder the whole queue randomly, keeping the cursor on the track that
    /// was current.
    pub fn shuffle_in_place(&mut self) {
        if self.tracks.is_empty() {
            return;
        }
        let current_id = self.current().map(|track| track.id.clone());
        self.tracks.shuffle(&mut rand::thread_rng());
        self.current_index = current_id
            .and_then(|id| self.tracks.iter().position(|track| track.id == id))
            .unwrap_or(0);
        self.shuffle_history.clear();
    }

    /// Whether `advance` would yield a track.
    pub fn has_next(&self) -> bool {
        if self.tracks.is_empty() {
            return false;
        }
        match self.play_mode {
            PlayMode::RepeatOne | PlayMode::RepeatAll => true,
            PlayMode::Shuffle => self.tracks.len() > 1,
            PlayMode::Sequential => self.current_index + 1 < self.tracks.len(),
        }
    }

    /// Move the cursor to the next track per the current mode. `None` means
    /// the queue is exhausted (Sequential past the end).
    pub fn advance(&mut self) -> Option<Track> {
        self.advance_with_rng(&mut rand::thread_rng())
    }

    pub fn advance_with_rng<R: Rng>(&mut self, rng: &mut R) -> Option<Track> {
        if self.tracks.is_empty() {
            return None;
        }
        match self.play_mode {
            PlayMode::RepeatOne => self.current().cloned(),
            PlayMode::Sequential => {
                let next = self.current_index + 1;
                if next < self.tracks.len() {
                    self.current_index = next;
                    self.current().cloned()
                } else {
                    // leave the cursor past the end so position reporting
                    // shows exhaustion
                    self.current_index = self.tracks.len();
                    None
                }
            }
            PlayMode::RepeatAll => {
                self.current_index = (self.current_index + 1) % self.tracks.len();
                self.current().cloned()
            }
            PlayMode::Shuffle => self.next_shuffle(rng),
        }
    }

    pub fn previous(&mut self) -> Option<Track> {
        if self.tracks.is_empty() {
            return None;
        }
        match self.play_mode {
            PlayMode::RepeatOne => self.current().cloned(),
            PlayMode::Sequential => {
                if self.current_index == 0 {
                    None
                } else {
                    self.current_index -= 1;
                    self.current().cloned()
                }
            }
            PlayMode::RepeatAll => {
                self.current_index =
                    (self.current_index + self.tracks.len() - 1) % self.tracks.len();
                self.current().cloned()
            }
            PlayMode::Shuffle => {
                if self.shuffle_history.len() > 1 {
                    self.shuffle_history.pop();
                    if let Some(&last) = self.shuffle_history.last() {
                        self.current_index = last;
                    }
                }
                self.current().cloned()
            }
        }
    }

    fn next_shuffle<R: Rng>(&mut self, rng: &mut R) -> Option<Track> {
        let len = self.tracks.len();
        if len <= 1 {
            return self.current().cloned();
        }

        let mut available: Vec<usize> = (0..len).collect();

        // once enough history exists, keep the trailing third of it out of
        // the draw to avoid near-term repeats
        if self.shuffle_history.len() >= len / 2 {
            let window = len / 3;
            let recent: HashSet<usize> = self
                .shuffle_history
                .iter()
                .rev()
                .take(window)
                .copied()
                .collect();
            available.retain(|index| !recent.contains(index));
        }
        if available.is_empty() {
            available = (0..len).collect();
        }
        available.retain(|&index| index != self.current_index);

        if let Some(&choice) = available.choose(rng) {
            self.current_index = choice;
            self.shuffle_history.push(choice);
            if self.shuffle_history.len() > len {
                let excess = self.shuffle_history.len() - len;
                self.shuffle_history.drain(..excess);
            }
        }
        self.current().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn queue_of(n: usize, mode: PlayMode) -> PlayQueue {
        let mut queue = PlayQueue {
            play_mode: mode,
            ..PlayQueue::default()
        };
        for i in 0..n {
            queue.add(
                Track::new(format!("t{i}"), format!("Track {i}"), "artist", "local"),
                None,
            );
        }
        queue
    }

    #[test]
    fn sequential_advances_then_exhausts() {
        let mut queue = queue_of(3, PlayMode::Sequential);
        assert_eq!(queue.advance().unwrap().id, "t1");
        assert_eq!(queue.advance().unwrap().id, "t2");
        assert!(queue.advance().is_none());
        assert_eq!(queue.current_index, 3);
        assert!(!queue.has_next());
    }

    #[test]
    fn repeat_all_wraps_modulo_len() {
        let mut queue = queue_of(3, PlayMode::RepeatAll);
        for n in 1..=7 {
            let track = queue.advance().unwrap();
            assert_eq!(track.id, format!("t{}", n % 3));
        }
        assert_eq!(queue.current_index, 1);
        assert!(queue.has_next());
    }

    #[test]
    fn repeat_one_stays_put() {
        let mut queue = queue_of(3, PlayMode::RepeatOne);
        for _ in 0..5 {
            assert_eq!(queue.advance().unwrap().id, "t0");
        }
        assert_eq!(queue.current_index, 0);
    }

    #[test]
    fn shuffle_never_repeats_current_and_respects_window() {
        let mut queue = queue_of(9, PlayMode::Shuffle);
        let mut rng = StdRng::seed_from_u64(7);
        let len = queue.len();
        for _ in 0..40 {
            let before = queue.current_index;
            let history_before = queue.shuffle_history.clone();
            queue.advance_with_rng(&mut rng).unwrap();
            let picked = queue.current_index;
            assert_ne!(picked, before);
            if history_before.len() >= len / 2 {
                let window: Vec<usize> = history_before
                    .iter()
                    .rev()
                    .take(len / 3)
                    .copied()
                    .collect();
                assert!(!window.contains(&picked));
            }
            assert!(queue.shuffle_history.len() <= len);
        }
    }

    #[test]
    fn shuffle_previous_pops_history() {
        let mut queue = queue_of(5, PlayMode::Shuffle);
        let mut rng = StdRng::seed_from_u64(3);
        queue.advance_with_rng(&mut rng);
        let first = queue.current_index;
        queue.advance_with_rng(&mut rng);
        assert_ne!(queue.current_index, first);
        queue.previous();
        assert_eq!(queue.current_index, first);
    }

    #[test]
    fn sequential_previous_refuses_below_zero() {
        let mut queue = queue_of(3, PlayMode::Sequential);
        assert!(queue.previous().is_none());
        queue.advance();
        assert_eq!(queue.previous().unwrap().id, "t0");
    }

    #[test]
    fn remove_fixes_cursor_and_history() {
        let mut queue = queue_of(4, PlayMode::Shuffle);
        queue.current_index = 2;
        queue.shuffle_history = vec![0, 3, 2];
        assert!(queue.remove(0));
        assert_eq!(queue.current_index, 1);
        assert_eq!(queue.shuffle_history, vec![2, 1]);
        for &past in &queue.shuffle_history {
            assert!(past < queue.len());
        }
    }

    #[test]
    fn remove_current_at_tail_resets_cursor() {
        let mut queue = queue_of(2, PlayMode::Sequential);
        queue.advance();
        assert!(queue.remove(1));
        assert_eq!(queue.current_index, 0);
    }

    #[test]
    fn shuffle_in_place_keeps_current_track() {
        let mut queue = queue_of(8, PlayMode::Sequential);
        queue.current_index = 4;
        let current_id = queue.current().unwrap().id.clone();
        queue.shuffle_in_place();
        assert_eq!(queue.current().unwrap().id, current_id);
    }
}
