//! Bounded in-memory cache of materialized media with priority eviction.
//!
//! Entries are scored by their distance to the current index in the active
//! media list. When the cache grows past capacity the lowest scored entries
//! are evicted, oldest first on ties. The entry at the current index is never
//! evicted.

use crate::media::MediaType;
use crate::resource::Resource;
use lru::LruCache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Cache shared between the navigation controller, the preload worker and
/// the periodic cleanup task.
pub type SharedCache = Arc<RwLock<MediaCache>>;

/// Canonical cached resource plus the inputs used to score it.
#[derive(Debug)]
struct CacheEntry {
    resource: Resource,
    media_type: MediaType,
    seq: u64,
}

/// Where the viewer currently is, as seen by the eviction policy.
#[derive(Debug, Clone, Default)]
pub struct Focus {
    pub current_index: usize,
    pub positions: Arc<HashMap<String, usize>>,
}

impl Focus {
    fn current_key(&self) -> Option<&str> {
        self.positions
            .iter()
            .find(|(_, &index)| index == self.current_index)
            .map(|(key, _)| key.as_str())
    }
}

/// Priority-evicting media cache.
#[derive(Debug)]
pub struct MediaCache {
    /// Insertion-ordered store. Lookups use `peek` so reads never reorder.
    entries: LruCache<String, CacheEntry>,
    capacity: usize,
    focus: Focus,
    /// Bumped on every clear; writes from older generations are dropped.
    generation: u64,
    next_seq: u64,
}

impl MediaCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity: capacity.max(1),
            focus: Focus::default(),
            generation: 0,
            next_seq: 0,
        }
    }

    pub fn shared(capacity: usize) -> SharedCache {
        Arc::new(RwLock::new(Self::new(capacity)))
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

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Update the position the eviction policy scores against.
    pub fn set_focus(&mut self, current_index: usize, positions: Arc<HashMap<String, usize>>) {
        self.focus = Focus {
            current_index,
            positions,
        };
    }

    pub fn set_current_index(&mut self, current_index: usize) {
        self.focus.current_index = current_index;
    }

    /// A consumer copy of the cached resource.
    ///
    /// A template that can no longer be cloned is treated as absent.
    pub fn get(&self, key: &str) -> Option<Resource> {
        let entry = self.entries.peek(key)?;
        let copy = entry.resource.try_clone();
        if copy.is_none() {
            tracing::debug!("Cached resource for {} could not be cloned", key);
        }
        copy
    }

    /// Insert or replace an entry, then prune back to capacity.
    pub fn put(&mut self, key: String, resource: Resource) {
        if resource.is_disposed() {
            tracing::debug!("Refusing to cache disposed resource {}", key);
            return;
        }
        let entry = CacheEntry {
            media_type: resource.media_type(),
            resource,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        if let Some(mut old) = self.entries.put(key, entry) {
            old.resource.dispose();
        }

        if self.entries.len() > self.capacity {
            let evicted = self.prune_to(self.capacity);
            tracing::debug!(
                "Cache over capacity, evicted {} entries ({} / {})",
                evicted,
                self.entries.len(),
                self.capacity
            );
        }
    }

    /// Insert only if the cache has not been cleared since `generation`.
    ///
    /// Returns false when the write was stale and dropped.
    pub fn put_if_current(&mut self, generation: u64, key: String, mut resource: Resource) -> bool {
        if generation != self.generation {
            tracing::debug!("Dropping stale cache write for {}", key);
            resource.dispose();
            return false;
        }
        self.put(key, resource);
        true
    }

    /// Remove everything and start a new generation.
    pub fn clear(&mut self) {
        for (_, entry) in self.entries.iter_mut() {
            entry.resource.dispose();
        }
        self.entries.clear();
        self.generation += 1;
    }

    /// Clear unconditionally except, optionally, the item that is playing.
    pub fn clear_aggressive(&mut self, keep: Option<&str>) {
        let kept = keep.and_then(|key| self.entries.pop(key).map(|entry| (key.to_string(), entry)));
        let dropped = self.entries.len();
        self.clear();
        if let Some((key, entry)) = kept {
            self.entries.push(key, entry);
        }
        tracing::info!("Aggressive cache clear released {} entries", dropped);
    }

    /// Periodic maintenance: prune to ~75% of capacity for headroom and release
    /// decoder buffers of videos no consumer is holding.
    ///
    /// Returns (evicted, unloaded).
    pub fn periodic_cleanup(&mut self) -> (usize, usize) {
        let target = (self.capacity * 3 / 4).max(1);
        let evicted = if self.entries.len() > target {
            self.prune_to(target)
        } else {
            0
        };

        let current_key = self.focus.current_key().map(str::to_owned);
        let mut unloaded = 0;
        for (key, entry) in self.entries.iter_mut() {
            if entry.media_type != MediaType::Video || current_key.as_deref() == Some(key.as_str())
            {
                continue;
            }
            if entry.resource.is_detached() && entry.resource.unload() {
                unloaded += 1;
            }
        }

        if evicted > 0 || unloaded > 0 {
            tracing::debug!(
                "Periodic cache cleanup: evicted {}, unloaded {} video decoders",
                evicted,
                unloaded
            );
        }
        (evicted, unloaded)
    }

    fn score(&self, key: &str, entry: &CacheEntry) -> i32 {
        let mut score = 0;
        if let Some(&index) = self.focus.positions.get(key) {
            let current = self.focus.current_index;
            let distance = index.abs_diff(current);
            score += match distance {
                0 => 200,
                1 => 100,
                2..=3 => 50,
                4..=5 => 20,
                _ => 0,
            };
            if index > current {
                score += 10;
            }
            if entry.media_type == MediaType::Image {
                score += 5;
            }
        }
        score
    }

    /// Evict lowest-priority entries until at most `target` remain.
    fn prune_to(&mut self, target: usize) -> usize {
        if self.entries.len() <= target {
            return 0;
        }
        let protected = self.focus.current_key().map(str::to_owned);

        let mut ranked: Vec<(i32, u64, String)> = self
            .entries
            .iter()
            .filter(|(key, _)| protected.as_deref() != Some(key.as_str()))
            .map(|(key, entry)| (self.score(key, entry), entry.seq, key.clone()))
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let excess = self.entries.len() - target;
        let mut evicted = 0;
        for (score, _, key) in ranked.into_iter().take(excess) {
            if let Some(mut entry) = self.entries.pop(&key) {
                tracing::debug!("Evicting {} (score {})", key, score);
                entry.resource.dispose();
                evicted += 1;
            }
        }
        evicted
    }
}

/// Run [`MediaCache::periodic_cleanup`] every `interval` until aborted.
pub fn spawn_cache_cleanup(cache: SharedCache, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            cache.write().await.periodic_cleanup();
        }
    })
}
