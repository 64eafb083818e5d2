use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::llm::media::DecodedImage;

pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Stable for the entry's lifetime; indices shift on every push.
    pub id: u64,
    pub image: DecodedImage,
    pub engine: String,
    pub aspect_ratio: String,
    pub created_at: DateTime<Utc>,
    upscaled: Option<Vec<u8>>,
}

impl HistoryEntry {
    pub fn upscaled(&self) -> Option<&[u8]> {
        self.upscaled.as_deref()
    }
}

/// Most-recent-first generation results, bounded by `capacity`.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    capacity: usize,
    next_id: u64,
    entries: VecDeque<HistoryEntry>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            next_id: 0,
            entries: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Inserts at the head and returns the evicted oldest entry, if any.
    pub fn push(
        &mut self,
        image: DecodedImage,
        engine: &str,
        aspect_ratio: &str,
        created_at: DateTime<Utc>,
    ) -> Option<HistoryEntry> {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_front(HistoryEntry {
            id,
            image,
            engine: engine.to_string(),
            aspect_ratio: aspect_ratio.to_string(),
            created_at,
            upscaled: None,
        });
        if self.entries.len() > self.capacity {
            return self.entries.pop_back();
        }
        None
    }

    pub fn get(&self, index: usize) -> Option<&HistoryEntry> {
        self.entries.get(index)
    }

    pub fn index_of(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    /// Caches an upscaled rendering. Returns false when the entry was evicted meanwhile.
    pub fn cache_upscaled(&mut self, id: u64, png: Vec<u8>) -> bool {
        match self.index_of(id) {
            Some(index) => {
                self.entries[index].upscaled = Some(png);
                true
            }
            None => false,
        }
    }
}
