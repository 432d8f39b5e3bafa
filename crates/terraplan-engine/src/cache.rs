//! Lease stores backing the compute-once gate.
//!
//! A store holds two things per cache key: the published [`CacheEntry`] and
//! at most one live lease naming the worker currently computing it. Leases
//! expire after their TTL unless renewed, so a dead worker never blocks a key
//! forever.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::time::Duration;
use terraplan_core::{CacheEntry, CacheKey, PlanError};

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, PlanError>;

    /// Take the lease for `key` unless another holder has a live one.
    ///
    /// Returns `true` if `holder` now owns the lease.
    async fn try_lease(&self, key: &CacheKey, holder: &str, ttl: Duration)
        -> Result<bool, PlanError>;

    /// Extend a lease owned by `holder`. Returns `false` if it was lost.
    async fn renew(&self, key: &CacheKey, holder: &str, ttl: Duration) -> Result<bool, PlanError>;

    /// Store `entry` and drop `holder`'s lease in one step.
    ///
    /// Fails without storing anything unless `holder` still owns the lease.
    async fn publish(&self, key: &CacheKey, holder: &str, entry: &CacheEntry)
        -> Result<(), PlanError>;

    /// Drop `holder`'s lease without publishing anything.
    async fn release(&self, key: &CacheKey, holder: &str) -> Result<(), PlanError>;

    /// True if any holder has an unexpired lease on `key`.
    async fn lease_active(&self, key: &CacheKey) -> Result<bool, PlanError>;

    /// Drop expired leases, entries older than `max_age`, and then the oldest
    /// entries until at most `max_entries` remain. Returns the number of
    /// entries removed.
    async fn prune(&self, max_entries: usize, max_age: Duration) -> Result<u64, PlanError>;
}

/// Anything stored with a creation timestamp.
pub trait Timestamped {
    fn created_at(&self) -> DateTime<Utc>;
}

impl Timestamped for CacheEntry {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Remove entries older than `max_age`, then the oldest ones until at most
/// `max_entries` remain. Returns how many were removed.
pub fn prune_cache<K, V>(cache: &DashMap<K, V>, max_entries: usize, max_age: Duration) -> usize
where
    K: Clone + Eq + Hash,
    V: Timestamped,
{
    let now = Utc::now();
    let before = cache.len();
    let mut entries: Vec<(K, DateTime<Utc>)> = cache
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().created_at()))
        .collect();

    for (key, created_at) in &entries {
        let expired = now
            .signed_duration_since(*created_at)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false);
        if expired {
            cache.remove(key);
        }
    }

    if cache.len() > max_entries {
        entries.sort_by_key(|(_, created_at)| *created_at);
        for (key, _) in entries {
            if cache.len() <= max_entries {
                break;
            }
            cache.remove(&key);
        }
    }
    before.saturating_sub(cache.len())
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: DateTime<Utc>,
}

pub(crate) fn expiry(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Process-local store; gates sharing one instance coordinate with each other.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: DashMap<CacheKey, Lease>,
    entries: DashMap<CacheKey, CacheEntry>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry directly, e.g. results computed before this process.
    pub fn insert_entry(&self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, PlanError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn try_lease(
        &self,
        key: &CacheKey,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, PlanError> {
        let lease = Lease {
            holder: holder.to_string(),
            expires_at: expiry(ttl),
        };
        match self.leases.entry(key.clone()) {
            Entry::Occupied(mut current) => {
                let live = current.get().expires_at > Utc::now();
                if live && current.get().holder != holder {
                    return Ok(false);
                }
                current.insert(lease);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(lease);
                Ok(true)
            }
        }
    }

    async fn renew(&self, key: &CacheKey, holder: &str, ttl: Duration) -> Result<bool, PlanError> {
        match self.leases.get_mut(key) {
            Some(mut lease) if lease.holder == holder => {
                lease.expires_at = expiry(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn publish(
        &self,
        key: &CacheKey,
        holder: &str,
        entry: &CacheEntry,
    ) -> Result<(), PlanError> {
        // Hold the lease shard while the entry lands so no poller sees the
        // lease gone before the entry exists.
        match self.leases.entry(key.clone()) {
            Entry::Occupied(current) if current.get().holder == holder => {
                self.entries.insert(key.clone(), entry.clone());
                current.remove();
                Ok(())
            }
            _ => Err(PlanError::coordination(format!(
                "{} no longer holds the lease on {}",
                holder,
                key.short()
            ))),
        }
    }

    async fn release(&self, key: &CacheKey, holder: &str) -> Result<(), PlanError> {
        self.leases.remove_if(key, |_, lease| lease.holder == holder);
        Ok(())
    }

    async fn lease_active(&self, key: &CacheKey) -> Result<bool, PlanError> {
        let now = Utc::now();
        Ok(self
            .leases
            .get(key)
            .map(|lease| lease.expires_at > now)
            .unwrap_or(false))
    }

    async fn prune(&self, max_entries: usize, max_age: Duration) -> Result<u64, PlanError> {
        let now = Utc::now();
        self.leases.retain(|_, lease| lease.expires_at > now);
        Ok(prune_cache(&self.entries, max_entries, max_age) as u64)
    }
}
