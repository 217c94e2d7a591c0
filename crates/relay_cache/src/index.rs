// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashMap;

/// Tracks which blobs are cached, how big they are, and how old their messages are.
#[derive(Default, Debug)]
pub(crate) struct BlobIndex {
    entries: HashMap<String, BlobEntry>,
    total_bytes: u64,
}

#[derive(Clone, Copy, Debug)]
struct BlobEntry {
    timestamp: i64,
    bytes: u64,
}

impl BlobIndex {
    pub fn insert(&mut self, key: &str, timestamp: i64, bytes: u64) {
        if let Some(old) = self
            .entries
            .insert(key.to_owned(), BlobEntry { timestamp, bytes })
        {
            self.total_bytes -= old.bytes;
        }
        self.total_bytes += bytes;
    }

    pub fn remove(&mut self, key: &str) -> Option<u64> {
        let old = self.entries.remove(key)?;
        self.total_bytes -= old.bytes;
        Some(old.bytes)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    /// Keys to evict, oldest first, to get back under `budget`. Empty when already under.
    pub fn eviction_candidates(&self, budget: u64) -> Vec<String> {
        if budget == 0 || self.total_bytes <= budget {
            return vec![];
        }
        let mut by_age: Vec<(&String, &BlobEntry)> = self.entries.iter().collect();
        by_age.sort_by(|(ka, a), (kb, b)| (a.timestamp, ka).cmp(&(b.timestamp, kb)));

        let mut excess = self.total_bytes - budget;
        let mut victims = vec![];
        for (key, entry) in by_age {
            if excess == 0 {
                break;
            }
            victims.push(key.clone());
            excess = excess.saturating_sub(entry.bytes);
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacing_an_entry_keeps_the_total_right() {
        let mut index = BlobIndex::default();
        index.insert("a", 1, 10);
        index.insert("b", 2, 5);
        index.insert("a", 3, 7);
        assert_eq!(index.total_bytes(), 12);
        assert_eq!(index.remove("a"), Some(7));
        assert_eq!(index.remove("a"), None);
        assert_eq!(index.total_bytes(), 5);
    }

    #[test]
    fn evicts_only_as_many_old_entries_as_needed() {
        let mut index = BlobIndex::default();
        index.insert("newest", 30, 40);
        index.insert("oldest", 10, 40);
        index.insert("middle", 20, 40);
        assert!(index.eviction_candidates(120).is_empty());
        assert!(index.eviction_candidates(0).is_empty());
        assert_eq!(index.eviction_candidates(100), ["oldest"]);
        assert_eq!(index.eviction_candidates(41), ["oldest", "middle"]);
        assert_eq!(index.eviction_candidates(1), ["oldest", "middle", "newest"]);
    }
}
