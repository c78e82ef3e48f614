//! Local entry store.
//!
//! A sharded concurrent map from key to entry. Mutations of one key are
//! serialized by its shard lock; lookups only take the shard read lock, except
//! for the brief removal of an entry found expired.

use crate::cache::transfer::TransferEntry;
use crate::partitioning::{segment_of, SegmentId};
use crate::types::now_ms;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A stored entry with its expiration metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Serialized value, byte-identical on every owner.
    pub value: Bytes,
    /// Creation time in milliseconds since the UNIX epoch.
    pub created_at: u64,
    /// Lifespan in milliseconds.
    pub lifespan_ms: u64,
    /// Segment of the entry's key.
    pub segment: SegmentId,
}

impl StoredEntry {
    /// An entry is expired once its full lifespan has elapsed.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) >= self.lifespan_ms
    }

    /// Absolute expiration time in milliseconds.
    pub fn expires_at(&self) -> u64 {
        self.created_at.saturating_add(self.lifespan_ms)
    }
}

/// Result of a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Live entry.
    Hit(StoredEntry),
    /// The entry had expired and was removed by this lookup.
    Expired,
    /// No entry.
    Absent,
}

/// Concurrent key to entry map.
pub struct EntryStore {
    entries: DashMap<String, StoredEntry>,

    /// Removal times of keys removed while segments migrate. A transferred
    /// copy older than the removal is discarded.
    tombstones: DashMap<String, u64>,

    /// Shortest lifespan ever stored, in milliseconds.
    shortest_lifespan_ms: AtomicU64,

    num_segments: u32,
}

impl EntryStore {
    /// Create an empty store.
    pub fn new(num_segments: u32) -> Self {
        Self {
            entries: DashMap::new(),
            tombstones: DashMap::new(),
            shortest_lifespan_ms: AtomicU64::new(u64::MAX),
            num_segments,
        }
    }

    /// Shortest lifespan of any entry stored so far.
    pub fn shortest_lifespan(&self) -> Option<Duration> {
        match self.shortest_lifespan_ms.load(Ordering::Relaxed) {
            u64::MAX => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn note_lifespan(&self, lifespan_ms: u64) {
        self.shortest_lifespan_ms.fetch_min(lifespan_ms, Ordering::Relaxed);
    }

    /// Look up a key, removing it if expired.
    pub fn lookup(&self, key: &str) -> Lookup {
        self.lookup_at(key, now_ms())
    }

    /// Look up a key as of `now`.
    pub fn lookup_at(&self, key: &str, now: u64) -> Lookup {
        match self.entries.get(key) {
            None => return Lookup::Absent,
            Some(entry) if !entry.is_expired_at(now) => return Lookup::Hit(entry.clone()),
            Some(_) => {}
        }
        // Only remove the copy we saw expire; a concurrent write stays.
        match self.entries.remove_if(key, |_, e| e.is_expired_at(now)) {
            Some(_) => Lookup::Expired,
            None => match self.entries.get(key) {
                Some(entry) if !entry.is_expired_at(now) => Lookup::Hit(entry.clone()),
                _ => Lookup::Absent,
            },
        }
    }

    /// Whether a live entry exists for `key`. Does not remove expired entries.
    pub fn contains(&self, key: &str) -> bool {
        let now = now_ms();
        self.entries
            .get(key)
            .map(|e| !e.is_expired_at(now))
            .unwrap_or(false)
    }

    /// Insert or overwrite, with creation time = now.
    pub fn install(&self, key: &str, value: Bytes, lifespan: Duration) -> StoredEntry {
        let entry = StoredEntry {
            value,
            created_at: now_ms(),
            lifespan_ms: lifespan.as_millis() as u64,
            segment: segment_of(key, self.num_segments),
        };
        self.install_entry(key, entry.clone());
        entry
    }

    /// Insert or overwrite an entry created elsewhere.
    pub fn install_entry(&self, key: &str, entry: StoredEntry) {
        self.note_lifespan(entry.lifespan_ms);
        self.tombstones.remove(key);
        self.entries.insert(key.to_string(), entry);
    }

    /// Build an entry for a replicated write.
    pub fn replicated_entry(&self, key: &str, value: Bytes, created_at: u64, lifespan_ms: u64) -> StoredEntry {
        StoredEntry {
            value,
            created_at,
            lifespan_ms,
            segment: segment_of(key, self.num_segments),
        }
    }

    /// Apply an entry received by state transfer. Local copies that are at
    /// least as new, and removals after the entry's creation, win.
    pub fn apply_transferred(&self, transferred: TransferEntry) -> bool {
        let now = now_ms();
        let transferred_lifespan = transferred.lifespan_ms;
        let entry = StoredEntry {
            segment: segment_of(&transferred.key, self.num_segments),
            value: transferred.value,
            created_at: transferred.created_at,
            lifespan_ms: transferred.lifespan_ms,
        };
        if entry.is_expired_at(now) {
            return false;
        }
        if let Some(removed_at) = self.tombstones.get(&transferred.key) {
            if *removed_at >= entry.created_at {
                return false;
            }
        }
        match self.entries.entry(transferred.key) {
            Entry::Occupied(mut existing) => {
                if existing.get().created_at >= entry.created_at {
                    return false;
                }
                existing.insert(entry);
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        self.note_lifespan(transferred_lifespan);
        true
    }

    /// Remove unconditionally.
    pub fn evict(&self, key: &str) -> Option<StoredEntry> {
        self.entries.remove(key).map(|(_, e)| e)
    }

    /// Remove a key, returning whether a live entry existed. With `tombstone`,
    /// the removal also suppresses older transferred copies.
    pub fn remove(&self, key: &str, tombstone: bool) -> bool {
        let now = now_ms();
        if tombstone {
            self.tombstones.insert(key.to_string(), now);
        }
        self.evict(key)
            .map(|e| !e.is_expired_at(now))
            .unwrap_or(false)
    }

    /// Forget all tombstones once migration has finished.
    pub fn clear_tombstones(&self) {
        self.tombstones.clear();
    }

    /// Snapshot the entries matching `predicate`. Concurrent writes may or may
    /// not be reflected, but no entry is ever observed half-written.
    pub fn scan<P>(&self, predicate: P) -> Vec<(String, StoredEntry)>
    where
        P: Fn(&str, &StoredEntry) -> bool,
    {
        self.entries
            .iter()
            .filter(|e| predicate(e.key(), e.value()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Live entries of the given segments, ready for transfer.
    pub fn segment_entries(&self, segments: &HashSet<SegmentId>) -> Vec<TransferEntry> {
        let now = now_ms();
        self.scan(|_, e| segments.contains(&e.segment) && !e.is_expired_at(now))
            .into_iter()
            .map(|(key, e)| TransferEntry {
                key,
                value: e.value,
                created_at: e.created_at,
                lifespan_ms: e.lifespan_ms,
            })
            .collect()
    }

    /// Drop entries whose segment fails `owned`. Returns the number dropped.
    pub fn retain_segments<P>(&self, owned: P) -> usize
    where
        P: Fn(SegmentId) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, e| owned(e.segment));
        before.saturating_sub(self.entries.len())
    }

    /// Keys whose entries were expired at `now`.
    pub fn expired_keys(&self, now: u64) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.value().is_expired_at(now))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Remove `key` if it is still expired at `now`.
    pub fn evict_if_expired(&self, key: &str, now: u64) -> bool {
        self.entries
            .remove_if(key, |_, e| e.is_expired_at(now))
            .is_some()
    }

    /// All keys currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of stored entries, including expired ones not reaped yet.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("entries", &self.entries.len())
            .field("tombstones", &self.tombstones.len())
            .finish()
    }
}
