//! # Bounded Widget Cache
//!
//! The single source of truth for "last known good" widget data. All write
//! paths (pipeline targets, subscription publish, offline sync) go through
//! this store, never around it, so late subscribers reading via `get` never
//! observe staler data than the most recent successful publish.
//!
//! ## Eviction Policy: TTL first, then LRU
//!
//! Two independent tiers keep memory bounded:
//!
//! 1. **TTL**: an entry is logically absent once its TTL elapses. Expired
//!    entries are removed lazily on access and in bulk by a periodic sweep.
//!    The sweep interval bounds how long a dead entry can linger physically,
//!    not correctness — lazy expiry on `get` guarantees correctness
//!    regardless of sweep timing.
//! 2. **LRU**: on capacity pressure, `set` evicts the least-recently-accessed
//!    10% of entries in one batch before inserting. Batching amortizes the
//!    scan cost and keeps heavy write load with long TTLs from growing the
//!    store without bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::cache::codec::PayloadCodec;
use crate::core::error::{EngineError, Result};
use crate::core::events::{emit, EngineEvent, EventSender};
use crate::core::payload::WidgetPayload;

/// Per-write options. `ttl = None` falls back to the store-wide default.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheWriteOptions {
    pub ttl: Option<Duration>,
    pub compress: bool,
    pub encrypt: bool,
}

/// One cached entry. The payload is held encoded (possibly compressed and/or
/// encrypted); `last_updated_at` is copied out of the payload at write time
/// so conflict checks never have to decode.
struct CacheEntry {
    payload: Vec<u8>,
    created_at: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed_at: Instant,
    size_bytes: usize,
    compressed: bool,
    encrypted: bool,
    last_updated_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Bounded key/value store with per-entry TTL and batch LRU eviction.
pub struct CacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
    default_ttl: Duration,
    compression: Arc<dyn PayloadCodec>,
    encryption: Arc<dyn PayloadCodec>,
    hits: AtomicU64,
    misses: AtomicU64,
    events: EventSender,
}

impl CacheStore {
    pub fn new(
        max_entries: usize,
        default_ttl: Duration,
        compression: Arc<dyn PayloadCodec>,
        encryption: Arc<dyn PayloadCodec>,
        events: EventSender,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            default_ttl,
            compression,
            encryption,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            events,
        }
    }

    /// Looks up a key. Expired entries are treated as absent and removed on
    /// the spot. A hit bumps the access bookkeeping used for LRU ranking; a
    /// decode failure drops the entry and surfaces as a miss plus a
    /// `CacheDecodeError` event, never as silently corrupted data.
    pub fn get(&self, key: &str) -> Option<WidgetPayload> {
        let (encoded, compressed, encrypted) = {
            let mut entries = self.entries.lock().expect("Cache store lock poisoned");
            match entries.get_mut(key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if entry.is_expired() => {
                    entries.remove(key);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) => {
                    entry.access_count += 1;
                    entry.last_accessed_at = Instant::now();
                    (entry.payload.clone(), entry.compressed, entry.encrypted)
                }
            }
        };

        match self.decode(&encoded, compressed, encrypted) {
            Ok(payload) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(payload)
            }
            Err(e) => {
                let mut entries = self.entries.lock().expect("Cache store lock poisoned");
                entries.remove(key);
                drop(entries);
                log::warn!("Cache entry '{}' failed to decode and was dropped: {}", key, e);
                emit(
                    &self.events,
                    EngineEvent::CacheDecodeError {
                        key: key.to_string(),
                        reason: e.to_string(),
                    },
                );
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Writes a payload. When the store is at capacity and the key is new,
    /// the least-recently-accessed 10% of entries are evicted first.
    pub fn set(&self, key: &str, payload: &WidgetPayload, opts: &CacheWriteOptions) -> Result<()> {
        let raw = serde_json::to_vec(payload)
            .map_err(|e| EngineError::CodecFailed(format!("payload serialize: {}", e)))?;
        let mut encoded = raw;
        if opts.compress {
            encoded = self.compression.encode(&encoded)?;
        }
        if opts.encrypt {
            encoded = self.encryption.encode(&encoded)?;
        }
        let ttl = opts.ttl.unwrap_or(self.default_ttl);

        let mut entries = self.entries.lock().expect("Cache store lock poisoned");
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            Self::evict_lru_batch(&mut entries, self.max_entries);
        }
        let now = Instant::now();
        entries.insert(
            key.to_string(),
            CacheEntry {
                size_bytes: encoded.len(),
                payload: encoded,
                created_at: now,
                ttl,
                access_count: 0,
                last_accessed_at: now,
                compressed: opts.compress,
                encrypted: opts.encrypt,
                last_updated_at: payload.last_updated_at,
            },
        );
        Ok(())
    }

    /// Removes everything (no pattern) or every key matching the regex.
    pub fn invalidate(&self, pattern: Option<&str>) -> Result<()> {
        let mut entries = self.entries.lock().expect("Cache store lock poisoned");
        match pattern {
            None => {
                let n = entries.len();
                entries.clear();
                log::info!("Cache invalidated: {} entries cleared", n);
            }
            Some(pattern) => {
                let re = Regex::new(pattern).map_err(|e| EngineError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })?;
                let before = entries.len();
                entries.retain(|key, _| !re.is_match(key));
                log::info!(
                    "Cache invalidated: {} entries matching '{}' removed",
                    before - entries.len(),
                    pattern
                );
            }
        }
        Ok(())
    }

    /// Bulk removal of expired entries, driven by the periodic sweep task.
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock().expect("Cache store lock poisoned");
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let removed = before - entries.len();
        if removed > 0 {
            log::debug!("Cache sweep removed {} expired entries", removed);
        }
        removed
    }

    /// Wall-clock update timestamp of a live entry, without decoding it.
    pub fn last_updated_at(&self, key: &str) -> Option<DateTime<Utc>> {
        let entries = self.entries.lock().expect("Cache store lock poisoned");
        entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.last_updated_at)
    }

    /// Whether a live (unexpired) entry exists for the key.
    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock().expect("Cache store lock poisoned");
        entries.get(key).is_some_and(|entry| !entry.is_expired())
    }

    /// Per-key freshness: how much of the TTL budget remains, 0..=100.
    pub fn freshness(&self) -> HashMap<String, f64> {
        let entries = self.entries.lock().expect("Cache store lock poisoned");
        entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired())
            .map(|(key, entry)| {
                let age = entry.created_at.elapsed().as_secs_f64();
                let ttl = entry.ttl.as_secs_f64().max(f64::EPSILON);
                (key.clone(), (100.0 * (1.0 - age / ttl)).max(0.0))
            })
            .collect()
    }

    /// Number of physically present entries (expired ones included until
    /// the next sweep or access removes them).
    pub fn len(&self) -> usize {
        self.entries.lock().expect("Cache store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("Cache store lock poisoned")
            .clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn decode(&self, encoded: &[u8], compressed: bool, encrypted: bool) -> Result<WidgetPayload> {
        let mut bytes = encoded.to_vec();
        if encrypted {
            bytes = self.encryption.decode(&bytes)?;
        }
        if compressed {
            bytes = self.compression.decode(&bytes)?;
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::CodecFailed(format!("payload deserialize: {}", e)))
    }

    /// Evicts the least-recently-accessed 10% (at least one entry) to make
    /// room. Purely capacity-driven; TTL state is irrelevant here.
    fn evict_lru_batch(entries: &mut HashMap<String, CacheEntry>, max_entries: usize) {
        let batch = (max_entries / 10).max(1);
        let mut ranked: Vec<(String, Instant)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_accessed_at))
            .collect();
        ranked.sort_by_key(|(_, accessed)| *accessed);
        for (key, _) in ranked.into_iter().take(batch) {
            entries.remove(&key);
        }
        log::debug!("Cache at capacity: evicted {} LRU entries", batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::{AesCbcCodec, DeflateCodec, NoopCodec};
    use crate::core::events::event_channel;
    use serde_json::json;

    fn store(max: usize, default_ttl: Duration) -> CacheStore {
        let (events, _rx) = event_channel(16);
        CacheStore::new(max, default_ttl, Arc::new(DeflateCodec), Arc::new(NoopCodec), events)
    }

    fn payload(v: i64) -> WidgetPayload {
        WidgetPayload::new(json!({ "value": v }))
    }

    #[test]
    fn get_returns_what_set_stored() {
        let cache = store(10, Duration::from_secs(60));
        let p = payload(7);
        cache.set("w1", &p, &CacheWriteOptions::default()).unwrap();
        assert_eq!(cache.get("w1"), Some(p));
        assert_eq!(cache.get("nope"), None);
    }

    #[test]
    fn expired_entries_are_absent_even_without_a_sweep() {
        let cache = store(10, Duration::from_secs(60));
        let opts = CacheWriteOptions {
            ttl: Some(Duration::from_millis(30)),
            ..Default::default()
        };
        cache.set("w1", &payload(1), &opts).unwrap();
        assert!(cache.get("w1").is_some());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get("w1"), None);
        assert!(!cache.contains("w1"));
    }

    #[test]
    fn sweep_removes_expired_entries_in_bulk() {
        let cache = store(10, Duration::from_millis(20));
        cache.set("a", &payload(1), &CacheWriteOptions::default()).unwrap();
        cache.set("b", &payload(2), &CacheWriteOptions::default()).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.sweep_expired(), 2);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn lru_batch_eviction_spares_recently_accessed_entries() {
        let cache = store(10, Duration::from_secs(60));
        for i in 0..10 {
            cache
                .set(&format!("k{}", i), &payload(i), &CacheWriteOptions::default())
                .unwrap();
            // Distinct last_accessed_at instants, oldest first.
            std::thread::sleep(Duration::from_millis(2));
        }
        // Touch the oldest entry so it outranks the untouched ones.
        assert!(cache.get("k0").is_some());

        cache.set("k10", &payload(10), &CacheWriteOptions::default()).unwrap();

        // Capacity 10 evicts a batch of one: k1 was least recently accessed.
        assert!(cache.contains("k0"), "recently accessed entry must survive");
        assert!(!cache.contains("k1"), "oldest untouched entry must be evicted");
        assert!(cache.contains("k10"));
        assert_eq!(cache.len(), 10);
    }

    #[test]
    fn overwriting_an_existing_key_never_evicts() {
        let cache = store(3, Duration::from_secs(60));
        for i in 0..3 {
            cache
                .set(&format!("k{}", i), &payload(i), &CacheWriteOptions::default())
                .unwrap();
        }
        cache.set("k1", &payload(99), &CacheWriteOptions::default()).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("k1").unwrap().data, json!({ "value": 99 }));
    }

    #[test]
    fn invalidate_with_pattern_and_without() {
        let cache = store(10, Duration::from_secs(60));
        cache.set("widget:a", &payload(1), &CacheWriteOptions::default()).unwrap();
        cache.set("widget:b", &payload(2), &CacheWriteOptions::default()).unwrap();
        cache.set("report:c", &payload(3), &CacheWriteOptions::default()).unwrap();

        cache.invalidate(Some("^widget:")).unwrap();
        assert!(!cache.contains("widget:a"));
        assert!(!cache.contains("widget:b"));
        assert!(cache.contains("report:c"));

        cache.invalidate(None).unwrap();
        assert!(cache.is_empty());

        assert!(matches!(
            cache.invalidate(Some("([unclosed")),
            Err(EngineError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn compressed_and_encrypted_roundtrip() {
        let (events, _rx) = event_channel(16);
        let key_hex = "aa".repeat(32);
        let cache = CacheStore::new(
            10,
            Duration::from_secs(60),
            Arc::new(DeflateCodec),
            Arc::new(AesCbcCodec::from_hex(&key_hex).unwrap()),
            events,
        );
        let p = payload(42);
        let opts = CacheWriteOptions {
            ttl: None,
            compress: true,
            encrypt: true,
        };
        cache.set("w1", &p, &opts).unwrap();
        assert_eq!(cache.get("w1"), Some(p));
    }

    #[test]
    fn decode_failure_is_a_miss_plus_an_error_event() {
        let (events, mut rx) = event_channel(16);
        let writer = CacheStore::new(
            10,
            Duration::from_secs(60),
            Arc::new(NoopCodec),
            Arc::new(AesCbcCodec::from_hex(&"bb".repeat(32)).unwrap()),
            events.clone(),
        );
        let reader = CacheStore::new(
            10,
            Duration::from_secs(60),
            Arc::new(NoopCodec),
            Arc::new(AesCbcCodec::from_hex(&"cc".repeat(32)).unwrap()),
            events,
        );
        let opts = CacheWriteOptions {
            ttl: None,
            compress: false,
            encrypt: true,
        };
        writer.set("w1", &payload(1), &opts).unwrap();

        // Hand the encrypted entry to a store holding the wrong key.
        let entry = writer.entries.lock().unwrap().remove("w1").unwrap();
        reader.entries.lock().unwrap().insert("w1".to_string(), entry);

        assert_eq!(reader.get("w1"), None);
        assert_eq!(reader.misses(), 1);
        assert!(!reader.contains("w1"), "undecodable entry must be dropped");
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::CacheDecodeError { .. })
        ));
    }

    #[test]
    fn hit_and_miss_counters_track_accesses() {
        let cache = store(10, Duration::from_secs(60));
        cache.set("w1", &payload(1), &CacheWriteOptions::default()).unwrap();
        cache.get("w1");
        cache.get("w1");
        cache.get("absent");
        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn freshness_decays_toward_zero() {
        let cache = store(10, Duration::from_secs(60));
        cache.set("w1", &payload(1), &CacheWriteOptions::default()).unwrap();
        let f = cache.freshness();
        let score = f.get("w1").copied().unwrap();
        assert!(score > 90.0 && score <= 100.0, "fresh entry, got {}", score);
    }
}
