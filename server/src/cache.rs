//! Cache-first lookups over storage accessors
//!
//! Entries are dropped when the event recorder reports a change to the
//! entity, so every node sees a fresh definition after the next lookup.

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::events::{EventListener, ServiceEvent};
use crate::job::{Job, JobRepository, JOB_ENTITY};
use crate::store::StoreError;

pub const DEFAULT_JOB_CACHE_SIZE: usize = 1024;

struct CacheEntry<V> {
    value: V,
    /// Distinguishes this insert from later ones for the same key
    stamp: u64,
    last_accessed: AtomicU64,
}

/// Lookup table in front of a slower loader; misses are not cached.
///
/// Holds at most `max_size` entries, evicting the least recently used. A
/// value loaded while an invalidation ran is handed to the caller but never
/// cached.
pub struct CachedLookup<K, V> {
    entries: DashMap<K, Arc<CacheEntry<V>>>,
    max_size: usize,
    /// Logical clock for stamps and access order
    ticks: AtomicU64,
    invalidations: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> CachedLookup<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_size,
            ticks: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let Some(entry) = self.entries.get(key).map(|e| Arc::clone(e.value())) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        entry.last_accessed.store(self.tick(), Ordering::Relaxed);
        Some(entry.value.clone())
    }

    pub async fn get_or_load<F, Fut, E>(&self, key: K, load: F) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(Some(value));
        }
        let epoch = self.invalidations.load(Ordering::SeqCst);
        let loaded = load().await?;
        if let Some(value) = &loaded {
            self.insert_unless_invalidated(key, value.clone(), epoch);
        }
        Ok(loaded)
    }

    fn insert_unless_invalidated(&self, key: K, value: V, epoch: u64) {
        if self.invalidations.load(Ordering::SeqCst) != epoch {
            return;
        }
        if self.max_size > 0 && self.entries.len() >= self.max_size && !self.entries.contains_key(&key) {
            self.evict_lru();
        }

        let stamp = self.tick();
        let entry = CacheEntry {
            value,
            stamp,
            last_accessed: AtomicU64::new(stamp),
        };
        self.entries.insert(key.clone(), Arc::new(entry));

        // An invalidation that slipped in after the check above must win
        if self.invalidations.load(Ordering::SeqCst) != epoch {
            self.entries.remove_if(&key, |_, entry| entry.stamp == stamp);
        }
    }

    fn evict_lru(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_accessed.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}

type JobKey = (String, String);

/// Job definitions served from memory once loaded
pub struct CachedJobRepository {
    inner: Arc<dyn JobRepository>,
    cache: Arc<CachedLookup<JobKey, Job>>,
}

impl CachedJobRepository {
    pub fn new(inner: Arc<dyn JobRepository>) -> Self {
        Self::with_max_size(inner, DEFAULT_JOB_CACHE_SIZE)
    }

    pub fn with_max_size(inner: Arc<dyn JobRepository>, max_size: usize) -> Self {
        Self {
            inner,
            cache: Arc::new(CachedLookup::new(max_size)),
        }
    }

    /// Listener to subscribe on the event recorder
    pub fn invalidator(&self) -> JobCacheInvalidator {
        JobCacheInvalidator {
            cache: self.cache.clone(),
        }
    }

    pub fn cache(&self) -> &CachedLookup<JobKey, Job> {
        &self.cache
    }
}

#[async_trait]
impl JobRepository for CachedJobRepository {
    async fn find(&self, tenant_id: &str, job_id: &str) -> Result<Option<Job>, StoreError> {
        let key = (tenant_id.to_string(), job_id.to_string());
        let inner = self.inner.clone();
        self.cache
            .get_or_load(key, || async move { inner.find(tenant_id, job_id).await })
            .await
    }

    async fn save(&self, job: Job) -> Result<(), StoreError> {
        let key = (job.tenant_id.clone(), job.job_id.clone());
        self.inner.save(job).await?;
        self.cache.invalidate(&key);
        Ok(())
    }
}

/// Drops cached job definitions when a job event is recorded
pub struct JobCacheInvalidator {
    cache: Arc<CachedLookup<JobKey, Job>>,
}

#[async_trait]
impl EventListener for JobCacheInvalidator {
    fn name(&self) -> &str {
        "job-cache-invalidator"
    }

    async fn on_event(&self, event: &ServiceEvent) -> anyhow::Result<()> {
        if event.entity_type != JOB_ENTITY {
            return Ok(());
        }
        let key = (event.tenant_id.clone(), event.entity_id.clone());
        if self.cache.invalidate(&key) {
            debug!(tenant_id = %event.tenant_id, job_id = %event.entity_id, "Job cache entry invalidated");
        }
        Ok(())
    }
}
