//! Resolved-permission cache.
//!
//! Stores the set of permission ids each user resolved to, keyed by
//! `"{user_kind}:{user_id}"`. Values are ids only; the resolver re-hydrates
//! them from the store on read. Entries are disposable: dropping one never
//! changes an authorization result.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RbacConfig;
use crate::error::RbacResult;
use crate::types::{PermissionId, UserId};

/// Cache key for one principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: String,
    user: UserId,
}

impl CacheKey {
    /// Create a key for `user` in the `kind` namespace.
    pub fn new(kind: impl Into<String>, user: UserId) -> Self {
        Self {
            kind: kind.into(),
            user,
        }
    }

    /// The user this key belongs to.
    pub fn user(&self) -> UserId {
        self.user
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.user)
    }
}

/// Backend for cached permission-id sets.
///
/// Every method may fail (a remote backend can be unreachable); callers
/// treat a failure as a miss and resolve directly.
pub trait PermissionCache: Send + Sync {
    /// Cached id set for `key`, or `None` on a miss or an expired entry.
    fn get(&self, key: &CacheKey) -> RbacResult<Option<BTreeSet<PermissionId>>>;

    /// Store the id set for `key`.
    fn set(&self, key: &CacheKey, ids: &BTreeSet<PermissionId>) -> RbacResult<()>;

    /// Drop the entry for `key`, if any.
    fn delete(&self, key: &CacheKey) -> RbacResult<()>;

    /// Drop every entry.
    fn clear(&self) -> RbacResult<()>;

    /// Snapshot of the cache counters.
    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Reads answered from the cache
    pub hits: u64,
    /// Reads that found nothing
    pub misses: u64,
    /// Reads that found an expired entry
    pub expirations: u64,
    /// Entries dropped by `delete`
    pub invalidations: u64,
    /// Live entries
    pub entries: usize,
    /// Configured capacity
    pub max_entries: usize,
}

impl CacheStats {
    /// Fraction of reads answered from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.expirations;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CachedEntry {
    ids: BTreeSet<PermissionId>,
    cached_at: Instant,
}

impl CachedEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

/// In-process cache backed by a `DashMap`.
///
/// One instance per process, shared by every engine handle.
#[derive(Debug)]
pub struct MemoryPermissionCache {
    entries: DashMap<String, CachedEntry>,
    ttl: Duration,
    capacity: usize,
    counters: Counters,
}

impl MemoryPermissionCache {
    /// Create a cache with the given entry lifetime and capacity.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
            counters: Counters::default(),
        }
    }

    /// Create a cache sized by `config`.
    pub fn from_config(config: &RbacConfig) -> Self {
        Self::new(config.cache_ttl(), config.cache_capacity)
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| !entry.is_expired(ttl));
        before.saturating_sub(self.entries.len())
    }

    fn make_room(&self) {
        if self.entries.len() < self.capacity {
            return;
        }
        if self.purge_expired() > 0 && self.entries.len() < self.capacity {
            return;
        }

        // Still full: drop an arbitrary tenth.
        let to_remove = (self.capacity / 10).max(1);
        let mut removed = 0;
        self.entries.retain(|_, _| {
            if removed < to_remove {
                removed += 1;
                false
            } else {
                true
            }
        });
        debug!(removed, "permission cache evicted entries");
    }
}

impl Default for MemoryPermissionCache {
    fn default() -> Self {
        Self::from_config(&RbacConfig::default())
    }
}

impl PermissionCache for MemoryPermissionCache {
    fn get(&self, key: &CacheKey) -> RbacResult<Option<BTreeSet<PermissionId>>> {
        let key = key.to_string();
        if let Some(entry) = self.entries.get(&key) {
            if entry.is_expired(self.ttl) {
                drop(entry);
                self.entries.remove(&key);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entry.ids.clone()));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    fn set(&self, key: &CacheKey, ids: &BTreeSet<PermissionId>) -> RbacResult<()> {
        let key = key.to_string();
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        self.entries.insert(
            key,
            CachedEntry {
                ids: ids.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &CacheKey) -> RbacResult<()> {
        if self.entries.remove(&key.to_string()).is_some() {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn clear(&self) -> RbacResult<()> {
        self.entries.clear();
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries: self.entries.len(),
            max_entries: self.capacity,
        }
    }
}
