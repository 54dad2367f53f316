//! Caching layer for quota lookups.
//!
//! Quota checks sit on the request hot path. The tracker answers them from
//! a bounded LRU and only touches the store when an entry has gone stale.
//! Stale entries stay in place until the next reload replaces them.

use crate::quota::{QuotaDimension, UsageQuota};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Fresh lookups
    pub hits: u64,
    /// Lookups that required a store read
    pub misses: u64,
    /// Entries held
    pub size: usize,
    /// Hits as a percentage of lookups
    pub hit_rate: f64,
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Entry refreshed within the TTL. `None` means the organization has no plan.
    Fresh(Option<UsageQuota>),
    /// Entry older than the TTL
    Stale(Option<UsageQuota>),
    /// Nothing cached
    Missing,
}

/// LRU cache of per-organization quotas.
pub struct QuotaCache {
    entries: Mutex<LruCache<String, CachedQuota>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct CachedQuota {
    quota: Option<UsageQuota>,
    refreshed_at: Instant,
}

impl QuotaCache {
    /// Create a new quota cache.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up an organization.
    pub fn lookup(&self, organization_id: &str) -> CacheLookup {
        let mut entries = self.entries.lock();

        match entries.get(organization_id) {
            Some(cached) if cached.refreshed_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Fresh(cached.quota.clone())
            }
            Some(cached) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Stale(cached.quota.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Missing
            }
        }
    }

    /// Cached quota regardless of age, without touching the statistics.
    pub fn peek(&self, organization_id: &str) -> Option<UsageQuota> {
        self.entries
            .lock()
            .peek(organization_id)
            .and_then(|cached| cached.quota.clone())
    }

    /// Whether an entry exists, fresh or stale.
    pub fn contains(&self, organization_id: &str) -> bool {
        self.entries.lock().contains(organization_id)
    }

    /// Store a freshly loaded quota. `None` records that no plan exists.
    pub fn put(&self, organization_id: &str, quota: Option<UsageQuota>) {
        let cached = CachedQuota {
            quota,
            refreshed_at: Instant::now(),
        };
        self.entries.lock().put(organization_id.to_string(), cached);
    }

    /// Overwrite one counter of a cached quota with the store's value.
    ///
    /// The entry keeps its age; only a full reload makes it fresh again.
    pub fn set_used(&self, organization_id: &str, dimension: QuotaDimension, value: rust_decimal::Decimal) {
        let mut entries = self.entries.lock();
        if let Some(quota) = entries
            .peek_mut(organization_id)
            .and_then(|cached| cached.quota.as_mut())
        {
            quota.set_used(dimension, value);
        }
    }

    /// Drop an organization's entry.
    pub fn invalidate(&self, organization_id: &str) {
        self.entries.lock().pop(organization_id);
    }

    /// Organizations currently cached, most recently used first.
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Clear all cached entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        CacheStats {
            hits,
            misses,
            size: self.entries.lock().len(),
            hit_rate,
        }
    }
}
