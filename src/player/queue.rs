use crate::state::{QueueEntry, Track};

/// Ordered playlist of one room. `current < len` whenever non-empty, `0` when empty.
#[derive(Debug, Default)]
pub struct RoomQueue {
    entries: Vec<QueueEntry>,
    current: usize,
    /// The entry at `current` replaced a removed one and has not been started.
    fresh:   bool,
}

impl RoomQueue {
    pub fn push(&mut self, track: Track, requested_by: &str) -> usize {
        self.entries.push(QueueEntry { track, requested_by: requested_by.into() });
        self.entries.len()
    }

    /// Bounds-checked; keeps `current` pointing at the same entry when possible.
    /// Removing the current entry makes its successor the next one to play.
    pub fn remove(&mut self, index: usize) -> Option<QueueEntry> {
        if index >= self.entries.len() { return None; }
        let gone = self.entries.remove(index);

        if index < self.current {
            self.current -= 1;
        } else if index == self.current {
            if self.current < self.entries.len() {
                self.fresh = true;
            } else {
                self.current = self.entries.len().saturating_sub(1);
                self.fresh = false;
            }
        }
        Some(gone)
    }

    /// Moves to the next entry; `false` when already at the last one.
    /// An unplayed replacement at `current` counts as the next entry.
    pub fn forward(&mut self) -> bool {
        if std::mem::take(&mut self.fresh) && self.current < self.entries.len() {
            return true;
        }
        if self.current + 1 < self.entries.len() {
            self.current += 1;
            true
        } else {
            false
        }
    }

    pub fn back(&mut self) -> bool {
        self.fresh = false;
        if self.current > 0 {
            self.current -= 1;
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current = 0;
        self.fresh = false;
    }

    /// The entry at `current` is being played.
    pub fn mark_started(&mut self) { self.fresh = false; }

    pub fn current(&self) -> Option<&QueueEntry> { self.entries.get(self.current) }
    pub fn current_index(&self) -> usize { self.current }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn entries(&self) -> &[QueueEntry] { &self.entries }
}
