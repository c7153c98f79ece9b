//! # Response Cache
//!
//! TTL-bounded memoization of finished pipeline outputs. Keys are the SHA-256
//! of the normalized prompt (trimmed, lowercased, whitespace runs collapsed),
//! so "Warm Tape  Echo" and "warm tape echo" share one entry.
//!
//! Expired entries are never returned; they are dropped when a lookup finds
//! them, or in bulk by [`ResponseCache::evict_expired`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use resilience::clock::elapsed_between;
use resilience::{SharedClock, SystemClock};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: DateTime<Utc>,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        elapsed_between(self.inserted_at, now) > self.ttl
    }
}

/// Hit/miss counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug)]
pub struct ResponseCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Canonical form of a prompt: trimmed, lowercased, single spaces.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex SHA-256 of the normalized prompt.
pub fn cache_key(prompt: &str) -> String {
    let digest = Sha256::digest(normalize_prompt(prompt).as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, SystemClock::shared())
    }

    pub fn with_clock(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, prompt: &str) -> Option<V> {
        let key = cache_key(prompt);
        let now = self.clock.now();
        let mut entries = self.lock();

        let expired = match entries.get(&key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("tonecraft_cache_hits_total", 1);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.remove(&key);
            debug!(key = %key, "Evicted expired cache entry on lookup");
            gauge!("tonecraft_cache_entries", entries.len() as f64);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!("tonecraft_cache_misses_total", 1);
        None
    }

    /// Stores `value` under `prompt`, replacing any previous entry and
    /// restarting its TTL.
    pub fn put(&self, prompt: &str, value: V) {
        let key = cache_key(prompt);
        let entry = CacheEntry {
            value,
            inserted_at: self.clock.now(),
            ttl: self.ttl,
        };
        let mut entries = self.lock();
        entries.insert(key, entry);
        gauge!("tonecraft_cache_entries", entries.len() as f64);
    }

    /// Drops every expired entry; returns how many went.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = entries.len(), "Evicted expired cache entries");
            gauge!("tonecraft_cache_entries", entries.len() as f64);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
