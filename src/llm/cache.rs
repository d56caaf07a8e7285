//! Bounded response cache keyed by request fingerprint
//!
//! Lookups take a shared read lock so concurrent callers never block each
//! other on a hit. Recency is recorded with atomics on entries that are
//! already fully inserted; insertion, eviction and invalidation take the
//! write lock.

use super::runtime::RuntimeConfig;
use super::types::GenerationParams;
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Default time-to-live for cached responses
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// SHA-256 of a normalized (model, prompt, params) tuple, hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Fingerprint(String);

#[derive(Debug, Serialize)]
struct FingerprintInput<'a> {
    model: &'a str,
    prompt: &'a str,
    params: &'a GenerationParams,
}

impl Fingerprint {
    pub fn compute(model: &str, prompt: &str, params: &GenerationParams) -> Self {
        let prompt = normalize_prompt(prompt);
        let input = FingerprintInput {
            model: model.trim(),
            prompt: &prompt,
            params,
        };

        let canonical = serde_json::to_vec(&input)
            .unwrap_or_else(|_| format!("{:?}", input).into_bytes());
        Self(hex::encode(Sha256::digest(&canonical)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Line endings unified, trailing whitespace per line removed, outer blank lines trimmed.
/// Indentation is kept: it is significant in YAML and HCL prompts.
fn normalize_prompt(prompt: &str) -> String {
    prompt
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_matches('\n')
        .to_string()
}

/// Read-only view of a cached entry
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub response: String,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub size_bytes: u64,
}

/// Counters describing cache behavior since creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub capacity_entries: usize,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Error)]
#[error("entry of {size_bytes} bytes exceeds cache capacity of {capacity_bytes} bytes")]
struct CacheCapacityExceeded {
    size_bytes: u64,
    capacity_bytes: u64,
}

#[derive(Debug)]
struct StoredEntry {
    response: String,
    created_at: Instant,
    created_seq: u64,
    size_bytes: u64,
    last_access_seq: AtomicU64,
    /// Nanoseconds since the cache epoch
    last_accessed_nanos: AtomicU64,
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<Fingerprint, StoredEntry>,
    total_bytes: u64,
    capacity_entries: usize,
    capacity_bytes: u64,
}

/// Bounded LRU cache with TTL expiry
#[derive(Debug)]
pub struct ResponseCache {
    state: RwLock<CacheState>,
    ttl: Duration,
    epoch: Instant,
    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResponseCache {
    pub fn new(capacity_entries: usize, capacity_bytes: u64, ttl: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                total_bytes: 0,
                capacity_entries,
                capacity_bytes,
            }),
            ttl,
            epoch: Instant::now(),
            sequence: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// A cache sized by the runtime configuration
    pub fn from_config(config: &RuntimeConfig, ttl: Duration) -> Self {
        Self::new(config.cache_capacity_entries, config.cache_capacity_bytes, ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn is_expired(&self, entry: &StoredEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.created_at) >= self.ttl
    }

    /// Return the cached response if present and fresh, refreshing its recency
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<String> {
        let now = Instant::now();
        let state = self.state.read();

        match state.entries.get(fingerprint) {
            Some(entry) if !self.is_expired(entry, now) => {
                entry
                    .last_access_seq
                    .store(self.next_seq(), Ordering::Relaxed);
                entry.last_accessed_nanos.store(
                    now.saturating_duration_since(self.epoch).as_nanos() as u64,
                    Ordering::Relaxed,
                );
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for {}", fingerprint);
                Some(entry.response.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a response, evicting least-recently-accessed entries to stay within bounds
    pub fn put(&self, fingerprint: Fingerprint, response: impl Into<String>) {
        let response = response.into();
        let size_bytes = (response.len() + fingerprint.as_str().len()) as u64;
        let now = Instant::now();

        let mut state = self.state.write();

        if let Some(previous) = state.entries.remove(&fingerprint) {
            state.total_bytes -= previous.size_bytes;
        }
        self.purge_expired_locked(&mut state, now);

        if let Err(e) = self.make_room(&mut state, size_bytes) {
            debug!("Not caching {}: {}", fingerprint, e);
            return;
        }

        let seq = self.next_seq();
        state.total_bytes += size_bytes;
        state.entries.insert(
            fingerprint,
            StoredEntry {
                response,
                created_at: now,
                created_seq: seq,
                size_bytes,
                last_access_seq: AtomicU64::new(seq),
                last_accessed_nanos: AtomicU64::new(
                    now.saturating_duration_since(self.epoch).as_nanos() as u64,
                ),
            },
        );
    }

    fn make_room(&self, state: &mut CacheState, size_bytes: u64) -> Result<(), CacheCapacityExceeded> {
        if size_bytes > state.capacity_bytes || state.capacity_entries == 0 {
            return Err(CacheCapacityExceeded {
                size_bytes,
                capacity_bytes: state.capacity_bytes,
            });
        }

        while state.entries.len() + 1 > state.capacity_entries
            || state.total_bytes + size_bytes > state.capacity_bytes
        {
            let victim = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| {
                    (
                        entry.last_access_seq.load(Ordering::Relaxed),
                        entry.created_seq,
                    )
                })
                .map(|(key, _)| key.clone());

            let Some(victim) = victim else { break };
            if let Some(entry) = state.entries.remove(&victim) {
                state.total_bytes -= entry.size_bytes;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("Evicted {} ({} bytes)", victim, entry.size_bytes);
            }
        }

        Ok(())
    }

    fn purge_expired_locked(&self, state: &mut CacheState, now: Instant) -> usize {
        let expired: Vec<Fingerprint> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = state.entries.remove(key) {
                state.total_bytes -= entry.size_bytes;
            }
        }

        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut state = self.state.write();
        self.purge_expired_locked(&mut state, Instant::now())
    }

    /// Remove all entries
    pub fn invalidate_all(&self) {
        let mut state = self.state.write();
        let dropped = state.entries.len();
        state.entries.clear();
        state.total_bytes = 0;
        debug!("Cache invalidated ({} entries dropped)", dropped);
    }

    /// Clear the cache and apply new bounds
    pub fn reset(&self, capacity_entries: usize, capacity_bytes: u64) {
        let mut state = self.state.write();
        state.entries.clear();
        state.total_bytes = 0;
        state.capacity_entries = capacity_entries;
        state.capacity_bytes = capacity_bytes;
    }

    /// Snapshot of one entry without touching its recency
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let state = self.state.read();
        state.entries.get(fingerprint).map(|entry| CacheEntry {
            fingerprint: fingerprint.clone(),
            response: entry.response.clone(),
            created_at: entry.created_at,
            last_accessed_at: self.epoch
                + Duration::from_nanos(entry.last_accessed_nanos.load(Ordering::Relaxed)),
            size_bytes: entry.size_bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.read().total_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        CacheStats {
            entries: state.entries.len(),
            bytes: state.total_bytes,
            capacity_entries: state.capacity_entries,
            capacity_bytes: state.capacity_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}
