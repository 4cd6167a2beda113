//! Ordered, de-duplicated playlist shared by the HLS, x-mpegurl and PLS
//! parsers.
//!
//! Entries are served front to back. Served entries stay around (marked
//! `played`) so a live refresh that repeats them is recognised, but only
//! the most recent `RETENTION_WINDOW` of them are kept.

use std::collections::VecDeque;

use tracing::debug;
use url::Url;

pub const RETENTION_WINDOW: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub uri: Url,
    pub played: bool,
    pub duration_ms: Option<u64>,
    /// Timeline break before this entry.
    pub discontinuity: bool,
    pub title: Option<String>,
}

impl PlaylistEntry {
    pub fn new(uri: Url) -> Self {
        Self {
            uri,
            played: false,
            duration_ms: None,
            discontinuity: false,
            title: None,
        }
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Playlist {
    /// Where this list was fetched from; live refreshes go back here.
    source: Url,
    entries: VecDeque<PlaylistEntry>,
    played: usize,
    complete: bool,
    target_duration_s: Option<u64>,
    media_sequence: Option<u64>,
}

impl Playlist {
    pub fn new(source: Url) -> Self {
        Self {
            source,
            entries: VecDeque::new(),
            played: 0,
            complete: false,
            target_duration_s: None,
            media_sequence: None,
        }
    }

    pub fn source(&self) -> &Url {
        &self.source
    }

    /// Append `entry` unless its URI is already retained. Returns whether it
    /// was added.
    pub fn push(&mut self, entry: PlaylistEntry) -> bool {
        if self.entries.iter().any(|e| e.uri == entry.uri) {
            debug!(uri = %entry.uri, "duplicate playlist entry dropped");
            return false;
        }
        self.entries.push_back(PlaylistEntry {
            played: false,
            ..entry
        });
        true
    }

    /// Serve the oldest unplayed entry.
    pub fn next_entry(&mut self) -> Option<PlaylistEntry> {
        let entry = self.entries.get_mut(self.played)?;
        entry.played = true;
        let served = entry.clone();
        self.played += 1;
        while self.played > RETENTION_WINDOW {
            self.entries.pop_front();
            self.played -= 1;
        }
        Some(served)
    }

    /// Entries not yet served.
    pub fn remaining(&self) -> usize {
        self.entries.len() - self.played
    }

    /// Retained entries, served ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &PlaylistEntry> {
        self.entries.iter()
    }

    /// `true` for finite (VOD) lists, `false` while a live list may grow.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn set_complete(&mut self, complete: bool) {
        self.complete = complete;
    }

    pub fn target_duration_s(&self) -> Option<u64> {
        self.target_duration_s
    }

    pub fn set_target_duration_s(&mut self, secs: u64) {
        self.target_duration_s = Some(secs);
    }

    pub fn media_sequence(&self) -> Option<u64> {
        self.media_sequence
    }

    pub fn set_media_sequence(&mut self, seq: u64) {
        self.media_sequence = Some(seq);
    }

    /// Fold a refreshed copy of this list in. Returns how many new entries
    /// were appended.
    pub fn merge(&mut self, fresh: Playlist) -> usize {
        self.complete = fresh.complete;
        if fresh.target_duration_s.is_some() {
            self.target_duration_s = fresh.target_duration_s;
        }
        if fresh.media_sequence.is_some() {
            self.media_sequence = fresh.media_sequence;
        }
        let mut added = 0;
        for entry in fresh.entries {
            if self.push(entry) {
                added += 1;
            }
        }
        added
    }

    /// Skip whole unplayed entries that fit inside `offset_ms`. Returns the
    /// offset left over inside the first entry that will play. Skipping stops
    /// at the first entry without a known duration.
    pub fn skip_offset(&mut self, offset_ms: u64) -> u64 {
        let mut left = offset_ms;
        while left > 0 {
            let Some(duration) = self.entries.get(self.played).and_then(|e| e.duration_ms) else {
                break;
            };
            if duration > left {
                break;
            }
            left -= duration;
            self.next_entry();
        }
        if left != offset_ms {
            debug!(offset_ms, left, "skipped playlist entries for offset");
        }
        left
    }
}
