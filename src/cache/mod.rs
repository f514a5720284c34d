//! In-memory result cache.
//!
//! Sits in front of the store and the remote sources. Entries expire after a
//! TTL (evicted lazily on read and by a periodic sweeper), can be capped in
//! number (least recently accessed goes first), and are invalidated by APN.
//! The store stays authoritative; losing the cache only costs lookups.

mod fingerprint;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::models::Apn;

pub use fingerprint::Fingerprint;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    /// APNs this entry was derived from
    pub identifiers: HashSet<String>,
    pub payload: serde_json::Value,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub access_count: u64,
    pub last_accessed: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub evictions: u64,
}

pub struct ResultCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    default_ttl: Duration,
    max_entries: Option<usize>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResultCache {
    pub fn new(default_ttl: Duration, max_entries: Option<usize>) -> Self {
        ResultCache {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
            max_entries: max_entries.filter(|n| *n > 0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Returns the payload for `fingerprint`, or `None` on a miss.
    ///
    /// An expired entry is removed and counted as a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<serde_json::Value> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get_mut(fingerprint) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_accessed = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.payload.clone())
            }
            Some(_) => {
                entries.remove(fingerprint);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores `payload`, replacing any entry under the same key.
    ///
    /// `ttl` of `None` uses the cache default.
    pub fn put<I, S>(
        &self,
        fingerprint: Fingerprint,
        identifiers: I,
        payload: serde_json::Value,
        ttl: Option<Duration>,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Instant::now();
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            identifiers: identifiers.into_iter().map(Into::into).collect(),
            payload,
            created_at: now,
            expires_at: now + ttl.unwrap_or(self.default_ttl),
            access_count: 0,
            last_accessed: now,
        };

        let mut entries = self.entries.write();
        if let Some(limit) = self.max_entries {
            if !entries.contains_key(&fingerprint) && entries.len() >= limit {
                self.evict_one(&mut entries, now);
            }
        }
        entries.insert(fingerprint, entry);
    }

    /// Drops every entry derived from `apn`. Returns how many were removed.
    pub fn invalidate(&self, apn: &Apn) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.identifiers.contains(apn.as_str()));
        let removed = before - entries.len();
        if removed > 0 {
            log::debug!("Invalidated {removed} cache entries for {apn}");
        }
        removed
    }

    /// Removes expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::SeqCst);
        let misses = self.misses.load(Ordering::SeqCst);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            size: self.len(),
            evictions: self.evictions.load(Ordering::SeqCst),
        }
    }

    /// Spawns a task that sweeps expired entries every `interval`.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> CancellationToken {
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired();
                        if removed > 0 {
                            log::debug!("Cache sweeper removed {removed} expired entries");
                        }
                    }
                    _ = stop.cancelled() => {
                        log::debug!("Cache sweeper shutting down");
                        break;
                    }
                }
            }
        });
        shutdown
    }

    /// Makes room for one entry: an expired one if any, otherwise the least
    /// recently accessed.
    fn evict_one(&self, entries: &mut HashMap<Fingerprint, CacheEntry>, now: Instant) {
        let victim = entries
            .values()
            .find(|e| e.is_expired(now))
            .or_else(|| entries.values().min_by_key(|e| e.last_accessed))
            .map(|e| e.fingerprint.clone());
        if let Some(key) = victim {
            entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}
