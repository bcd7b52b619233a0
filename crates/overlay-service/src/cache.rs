use dashmap::DashMap;
use std::time::{Duration, Instant};

use overlay_core::Owner;

use crate::types::{MergeOptions, MergeResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub file_path: String,
    pub owner: Option<Owner>,
    pub include_pending: bool,
    pub max_snapshots: Option<usize>,
}

impl CacheKey {
    pub fn new(file_path: &str, owner: Option<&Owner>, options: &MergeOptions) -> Self {
        Self {
            file_path: file_path.to_string(),
            owner: owner.cloned(),
            include_pending: options.include_pending,
            max_snapshots: options.max_snapshots,
        }
    }
}

struct CacheEntry {
    result: MergeResult,
    inserted_at: Instant,
    generation: u64,
}

/// Short-lived memo of merge results. Entries expire lazily on read; there
/// is no background sweeper.
///
/// Each file carries a generation bumped by [`invalidate`](Self::invalidate).
/// A result computed under an older generation is never served, so a merge
/// that raced a write cannot repopulate the cache with pre-write code.
pub struct MergeCache {
    entries: DashMap<CacheKey, CacheEntry>,
    generations: DashMap<String, u64>,
    ttl: Duration,
    max_entries: usize,
}

impl MergeCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Current generation of `file_path`. Read it before loading from the
    /// store and hand it to [`insert`](Self::insert).
    pub fn generation(&self, file_path: &str) -> u64 {
        self.generations.get(file_path).map_or(0, |g| *g)
    }

    pub fn get(&self, key: &CacheKey) -> Option<MergeResult> {
        let generation = self.generation(&key.file_path);
        if let Some(entry) = self.entries.get(key) {
            if entry.generation == generation && entry.inserted_at.elapsed() < self.ttl {
                tracing::trace!(file = %key.file_path, "merge cache hit");
                return Some(entry.result.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| {
            entry.generation != generation || entry.inserted_at.elapsed() >= self.ttl
        });
        tracing::trace!(file = %key.file_path, "merge cache miss");
        None
    }

    /// Insert a result computed under `generation`, first dropping expired
    /// entries and then the oldest one when the cache is full. Stale results
    /// are discarded.
    pub fn insert(&self, key: CacheKey, result: MergeResult, generation: u64) {
        if generation != self.generation(&key.file_path) {
            tracing::debug!(file = %key.file_path, "discarding merge computed before invalidation");
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.entries
                .retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
            if self.entries.len() >= self.max_entries {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|entry| entry.value().inserted_at)
                    .map(|entry| entry.key().clone());
                if let Some(oldest) = oldest {
                    self.entries.remove(&oldest);
                }
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
                generation,
            },
        );
    }

    /// Drop every entry for `file_path`, across owners and options.
    pub fn invalidate(&self, file_path: &str) {
        *self.generations.entry(file_path.to_string()).or_insert(0) += 1;
        self.entries.retain(|key, _| key.file_path != file_path);
        tracing::debug!(file = %file_path, "merge cache invalidated");
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(file: &str, user: Option<&str>) -> CacheKey {
        let owner = user.map(Owner::user);
        CacheKey::new(file, owner.as_ref(), &MergeOptions::default())
    }

    fn result(code: &str) -> MergeResult {
        MergeResult {
            success: true,
            has_overlay: true,
            merged_code: Some(code.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_hit_and_invalidate_across_owners() {
        let cache = MergeCache::new(Duration::from_secs(30), 16);
        cache.insert(key("a.tsx", None), result("shared"), 0);
        cache.insert(key("a.tsx", Some("u1")), result("mine"), 0);
        cache.insert(key("b.tsx", None), result("other"), 0);

        assert_eq!(cache.get(&key("a.tsx", Some("u1"))).unwrap().merged_code.as_deref(), Some("mine"));
        cache.invalidate("a.tsx");
        assert!(cache.get(&key("a.tsx", None)).is_none());
        assert!(cache.get(&key("a.tsx", Some("u1"))).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entries_are_dropped_on_read() {
        let cache = MergeCache::new(Duration::ZERO, 16);
        cache.insert(key("a.tsx", None), result("x"), 0);
        assert!(cache.get(&key("a.tsx", None)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_full_cache_evicts_oldest() {
        let cache = MergeCache::new(Duration::from_secs(30), 2);
        cache.insert(key("a", None), result("a"), 0);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(key("b", None), result("b"), 0);
        cache.insert(key("c", None), result("c"), 0);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("a", None)).is_none());
        assert!(cache.get(&key("c", None)).is_some());
    }

    #[test]
    fn test_result_from_before_invalidate_is_discarded() {
        let cache = MergeCache::new(Duration::from_secs(30), 16);
        let before = cache.generation("a.tsx");
        cache.invalidate("a.tsx");
        cache.insert(key("a.tsx", None), result("pre-write"), before);
        assert!(cache.get(&key("a.tsx", None)).is_none());

        let current = cache.generation("a.tsx");
        assert_eq!(current, before + 1);
        cache.insert(key("a.tsx", None), result("post-write"), current);
        assert_eq!(
            cache.get(&key("a.tsx", None)).unwrap().merged_code.as_deref(),
            Some("post-write")
        );
        assert_eq!(cache.generation("b.tsx"), 0);
    }

    #[test]
    fn test_pending_flag_is_part_of_key() {
        let cache = MergeCache::new(Duration::from_secs(30), 16);
        cache.insert(key("a", None), result("open only"), 0);
        let pending = CacheKey::new("a", None, &MergeOptions::pending());
        assert!(cache.get(&pending).is_none());
    }
}
