//! Process-scoped memoization of read results.
//!
//! Bounded (LRU), keyed by operation key and lane, invalidated by
//! edited-node intersection at commit, and resettable as a whole. An
//! invalidated entry is kept as a stale comparison point: when the
//! recomputed result is deep-equal to the stale one, the old allocation
//! is reused so downstream consumers can keep short-circuiting on
//! pointer identity.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::model::NodeId;
use crate::operations::read::ReadResult;

#[derive(Clone, Eq, Hash, PartialEq)]
struct CacheKey {
    operation: Arc<str>,
    optimistic: bool,
}

struct CacheEntry {
    result: Arc<ReadResult>,
    stale: bool,
}

/// Bounded read-result memoization. A capacity of zero disables caching
/// entirely (every fetch misses).
pub(crate) struct ResultCache {
    inner: Option<Mutex<LruCache<CacheKey, CacheEntry>>>,
}

impl ResultCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// Returns a fresh cached result, or runs `compute`, reconciling the
    /// outcome with any stale entry for the key.
    pub(crate) fn fetch_or_compute(
        &self,
        operation: &Arc<str>,
        optimistic: bool,
        compute: impl FnOnce() -> ReadResult,
    ) -> Arc<ReadResult> {
        let Some(inner) = &self.inner else {
            return Arc::new(compute());
        };
        let key = CacheKey {
            operation: Arc::clone(operation),
            optimistic,
        };
        {
            let mut cache = inner.lock();
            if let Some(entry) = cache.get(&key) {
                if !entry.stale {
                    return Arc::clone(&entry.result);
                }
            }
        }
        let computed = compute();
        let mut cache = inner.lock();
        let result = match cache.peek(&key) {
            // Unchanged content: revalidate the old allocation so pointer
            // identity survives the invalidation.
            Some(entry) if entry.stale && entry.result.results_equal(&computed) => {
                Arc::clone(&entry.result)
            }
            _ => Arc::new(computed),
        };
        cache.put(
            key,
            CacheEntry {
                result: Arc::clone(&result),
                stale: false,
            },
        );
        result
    }

    /// Marks stale every entry whose visited set intersects `edited`.
    pub(crate) fn invalidate(&self, edited: &FxHashSet<NodeId>) {
        let Some(inner) = &self.inner else {
            return;
        };
        if edited.is_empty() {
            return;
        }
        let mut cache = inner.lock();
        for (_, entry) in cache.iter_mut() {
            if !entry.stale && entry.result.entity_ids.iter().any(|id| edited.contains(id)) {
                entry.stale = true;
            }
        }
    }

    /// Drops every entry.
    pub(crate) fn reset(&self) {
        if let Some(inner) = &self.inner {
            inner.lock().clear();
        }
    }
}
