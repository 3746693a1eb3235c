//! Time-bucketed metric cache.
//!
//! Decrypted events are folded into per-key [`CacheEntry`] series. Each key
//! has its own lock, so ingestion into one key never waits on another; the
//! map's shard locks are only held long enough to find or insert a slot.
//! Entries whose last update is older than the TTL are never returned; they
//! are evicted when next touched or by the periodic sweep.

pub mod entry;
pub mod key;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::Event;

pub use entry::CacheEntry;
pub use key::{bucket, normalize_url, url_fingerprint, CacheKey, URL_HASH_LEN};

/// Tuning for the [`MetricCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix of every rendered key.
    pub namespace: String,
    /// Width of one time bucket. Rounded up to at least a minute.
    pub window: chrono::Duration,
    /// Entries not updated for this long are treated as absent.
    pub ttl: Duration,
    /// Samples kept per entry.
    pub max_points: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "telemetry".to_string(),
            window: chrono::Duration::minutes(1),
            ttl: Duration::from_secs(3600),
            max_points: 1000,
        }
    }
}

/// Counters for the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Live keys, including ones that have expired but not been evicted.
    pub entries: usize,
    /// Events appended.
    pub ingested: u64,
    /// Events rejected because a different URL owns the key.
    pub collisions: u64,
    /// Events rejected because the key holds another metric type.
    pub type_mismatches: u64,
    /// Entries evicted after their TTL.
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ingested: AtomicU64,
    collisions: AtomicU64,
    type_mismatches: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    /// Set when the slot is removed from the map; writers that raced the
    /// removal start over with a fresh slot.
    evicted: bool,
}

type SharedSlot = Arc<Mutex<Slot>>;

fn lock(slot: &SharedSlot) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Concurrent map from [`CacheKey`] to [`CacheEntry`].
#[derive(Debug)]
pub struct MetricCache {
    config: CacheConfig,
    entries: DashMap<CacheKey, SharedSlot>,
    counters: Counters,
}

impl MetricCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// The cache's configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key an event is aggregated under.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] if the event's timestamp is out of
    /// range.
    pub fn key_for(&self, event: &Event) -> Result<CacheKey> {
        CacheKey::for_event(&self.config.namespace, event, self.config.window)
            .ok_or_else(|| Error::invalid_event("timestamp out of range"))
    }

    /// Append an event to its series.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheKeyCollision`] if another URL already owns the
    /// key, or [`Error::InvalidEvent`] if the key holds a different metric
    /// type. The event is not recorded in either case.
    pub fn ingest(&self, event: &Event) -> Result<CacheKey> {
        self.ingest_at(event, Utc::now())
    }

    /// [`MetricCache::ingest`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`MetricCache::ingest`].
    pub fn ingest_at(&self, event: &Event, now: DateTime<Utc>) -> Result<CacheKey> {
        let key = self.key_for(event)?;
        let url = normalize_url(event.url());
        let metric_type = event.metric_type();

        loop {
            let slot = Arc::clone(
                self.entries
                    .entry(key.clone())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(Slot {
                            entry: CacheEntry::new(url, metric_type, now),
                            evicted: false,
                        }))
                    })
                    .value(),
            );

            let mut guard = lock(&slot);
            if guard.evicted {
                continue;
            }
            if self.is_expired(&guard.entry, now) {
                trace!(key = %key, "Restarting expired entry");
                guard.entry = CacheEntry::new(url, metric_type, now);
            }

            if guard.entry.url() != url {
                self.counters.collisions.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %key,
                    existing = guard.entry.url(),
                    incoming = url,
                    "Cache key collision, rejecting event"
                );
                return Err(Error::CacheKeyCollision {
                    key: key.to_string(),
                    existing: guard.entry.url().to_string(),
                    incoming: url.to_string(),
                });
            }
            if guard.entry.metric_type() != metric_type {
                self.counters.type_mismatches.fetch_add(1, Ordering::Relaxed);
                return Err(Error::invalid_event(format!(
                    "key {key} holds {} samples, got {metric_type}",
                    guard.entry.metric_type()
                )));
            }

            guard
                .entry
                .push(event.timestamp(), event.value(), now, self.config.max_points);
            self.counters.ingested.fetch_add(1, Ordering::Relaxed);
            return Ok(key);
        }
    }

    /// Look up an unexpired entry.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.get_at(key, Utc::now())
    }

    /// [`MetricCache::get`] with an explicit clock. Evicts the entry if it
    /// has expired.
    #[must_use]
    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry> {
        let slot = Arc::clone(self.entries.get(key)?.value());
        {
            let guard = lock(&slot);
            if guard.evicted {
                return None;
            }
            if !self.is_expired(&guard.entry, now) {
                return Some(guard.entry.clone());
            }
        }
        self.evict_if_expired(key, now);
        None
    }

    /// Merge every unexpired entry for `indicator_id` and `url` whose window
    /// overlaps `[start, end]`, keeping only samples inside the range.
    ///
    /// Returns `None` when nothing matches.
    #[must_use]
    pub fn query(
        &self,
        indicator_id: u32,
        url: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        self.query_at(indicator_id, url, start, end, Utc::now())
    }

    /// [`MetricCache::query`] with an explicit clock.
    #[must_use]
    pub fn query_at(
        &self,
        indicator_id: u32,
        url: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<CacheEntry> {
        if start > end {
            return None;
        }
        let url = normalize_url(url);
        let url_hash = url_fingerprint(url);

        let mut keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|item| {
                let k = item.key();
                k.namespace() == self.config.namespace
                    && k.indicator_id() == indicator_id
                    && k.url_hash() == url_hash
                    && k.overlaps(start, end)
            })
            .map(|item| item.key().clone())
            .collect();
        keys.sort_by_key(CacheKey::window_start);

        let mut merged: Option<CacheEntry> = None;
        for key in keys {
            let Some(entry) = self.get_at(&key, now) else {
                continue;
            };
            if entry.url() != url {
                continue;
            }
            match merged.as_mut() {
                Some(m) => m.merge(&entry, usize::MAX),
                None => merged = Some(entry),
            }
        }

        let mut merged = merged?;
        merged.retain_range(start.timestamp_millis(), end.timestamp_millis());
        Some(merged)
    }

    /// Evict every expired entry; returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// [`MetricCache::sweep`] with an explicit clock.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0usize;
        self.entries.retain(|_, slot| {
            let mut guard = lock(slot);
            if self.is_expired(&guard.entry, now) {
                guard.evicted = true;
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            self.counters.evicted.fetch_add(
                u64::try_from(removed).unwrap_or(u64::MAX),
                Ordering::Relaxed,
            );
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Run [`MetricCache::sweep`] every `interval` until the task is aborted.
    #[must_use]
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ingested: self.counters.ingested.load(Ordering::Relaxed),
            collisions: self.counters.collisions.load(Ordering::Relaxed),
            type_mismatches: self.counters.type_mismatches.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(entry.last_update_time());
        age.to_std().is_ok_and(|age| age > self.config.ttl)
    }

    fn evict_if_expired(&self, key: &CacheKey, now: DateTime<Utc>) {
        let removed = self.entries.remove_if(key, |_, slot| {
            let mut guard = lock(slot);
            if self.is_expired(&guard.entry, now) {
                guard.evicted = true;
                true
            } else {
                false
            }
        });
        if removed.is_some() {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Evicted expired cache entry");
        }
    }
}
