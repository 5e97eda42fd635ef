//! # Offline Change Queue and Conflict Resolution
//!
//! Changes made against a disconnected dashboard are queued here with the
//! wall-clock timestamp of when the user made them, then replayed in
//! timestamp order on reconnect. Each change resolves independently against
//! the cache: one lost or failed change never blocks the rest of the batch.
//!
//! Last-writer-wins compares the queued change's timestamp against the
//! cached entry's `last_updated_at` (tracked per entry without decoding).
//! A tie goes to the cache, so replaying the same batch twice is a no-op.
//! The other strategies are accepted by `enable` as extension points; under
//! them every change fails individually at sync time.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::cache::store::{CacheStore, CacheWriteOptions};
use crate::core::error::{EngineError, Result};
use crate::core::events::{emit, EngineEvent, EventSender};
use crate::core::payload::WidgetPayload;

/// How queued changes resolve against newer server-side state. Only
/// last-writer-wins has implemented semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    LastWriterWins,
    Merge,
    VersionBased,
    UserPreference,
}

impl ConflictStrategy {
    fn name(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriterWins => "last_writer_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::VersionBased => "version_based",
            ConflictStrategy::UserPreference => "user_preference",
        }
    }
}

/// Two-state sync view per widget key: present in cache or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    Offline,
}

/// One change captured while offline.
#[derive(Debug, Clone)]
pub struct OfflineChange {
    pub id: Uuid,
    pub widget_key: String,
    pub data: Value,
    /// When the user made the change, not when it was queued or synced.
    pub timestamp: DateTime<Utc>,
}

/// Where a change ended up during a sync pass.
enum Resolution {
    Applied,
    Discarded,
}

/// Outcome of one `sync_all` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub applied: usize,
    pub discarded: usize,
    pub failed: usize,
}

pub struct OfflineResolver {
    queue: Mutex<Vec<OfflineChange>>,
    strategy: Mutex<ConflictStrategy>,
    /// Per-field strategy overrides: a change whose data carries one of
    /// these fields resolves under the named strategy instead.
    field_rules: Mutex<HashMap<String, ConflictStrategy>>,
    events: EventSender,
}

impl OfflineResolver {
    pub fn new(events: EventSender) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            strategy: Mutex::new(ConflictStrategy::LastWriterWins),
            field_rules: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Records the conflict strategy future sync passes resolve under.
    pub fn enable(&self, strategy: ConflictStrategy) {
        *self
            .strategy
            .lock()
            .expect("Offline strategy lock poisoned") = strategy;
        log::info!("Offline mode enabled with strategy '{}'", strategy.name());
    }

    /// Overrides the strategy for changes carrying the named data field.
    pub fn set_field_rule(&self, field: &str, strategy: ConflictStrategy) {
        self.field_rules
            .lock()
            .expect("Offline field rules lock poisoned")
            .insert(field.to_string(), strategy);
    }

    pub fn strategy(&self) -> ConflictStrategy {
        *self
            .strategy
            .lock()
            .expect("Offline strategy lock poisoned")
    }

    /// Queues a change for the next sync. Returns its id.
    pub fn queue_change(&self, widget_key: &str, data: Value, timestamp: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.queue
            .lock()
            .expect("Offline queue lock poisoned")
            .push(OfflineChange {
                id,
                widget_key: widget_key.to_string(),
                data,
                timestamp,
            });
        log::debug!("Offline change {} queued for '{}'", id, widget_key);
        id
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("Offline queue lock poisoned").len()
    }

    /// Drops queued changes without applying them.
    pub fn clear(&self) {
        self.queue
            .lock()
            .expect("Offline queue lock poisoned")
            .clear();
    }

    /// Per-key sync view: `Synced` when a live cache entry exists for the
    /// key, `Offline` otherwise.
    pub fn sync_status(&self, cache: &CacheStore, widget_keys: &[&str]) -> HashMap<String, SyncStatus> {
        widget_keys
            .iter()
            .map(|key| {
                let status = if cache.contains(key) {
                    SyncStatus::Synced
                } else {
                    SyncStatus::Offline
                };
                (key.to_string(), status)
            })
            .collect()
    }

    /// Replays the whole queue against the cache in change-timestamp order
    /// and empties it. Every change is resolved independently under the
    /// active strategy; the report tallies where each one ended up.
    pub fn sync_all(&self, cache: &CacheStore, write_opts: &CacheWriteOptions) -> SyncReport {
        let strategy = self.strategy();
        let mut batch = {
            let mut queue = self.queue.lock().expect("Offline queue lock poisoned");
            std::mem::take(&mut *queue)
        };
        batch.sort_by_key(|change| change.timestamp);

        let mut report = SyncReport::default();
        for change in batch {
            match self.apply(cache, write_opts, strategy, &change) {
                Ok(Resolution::Applied) => report.applied += 1,
                Ok(Resolution::Discarded) => {
                    report.discarded += 1;
                    emit(
                        &self.events,
                        EngineEvent::OfflineChangeDiscarded {
                            widget_key: change.widget_key.clone(),
                        },
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    log::warn!(
                        "Offline change {} for '{}' failed: {}",
                        change.id,
                        change.widget_key,
                        e
                    );
                    emit(
                        &self.events,
                        EngineEvent::OfflineChangeFailed {
                            widget_key: change.widget_key.clone(),
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }
        log::info!(
            "Offline sync: {} applied, {} discarded, {} failed",
            report.applied,
            report.discarded,
            report.failed
        );
        report
    }

    /// The strategy a change resolves under: the first matching field rule,
    /// or the engine-wide strategy.
    fn effective_strategy(&self, change: &OfflineChange, default: ConflictStrategy) -> ConflictStrategy {
        let rules = self
            .field_rules
            .lock()
            .expect("Offline field rules lock poisoned");
        if let Some(obj) = change.data.as_object() {
            for (field, strategy) in rules.iter() {
                if obj.contains_key(field) {
                    return *strategy;
                }
            }
        }
        default
    }

    fn apply(
        &self,
        cache: &CacheStore,
        write_opts: &CacheWriteOptions,
        strategy: ConflictStrategy,
        change: &OfflineChange,
    ) -> Result<Resolution> {
        let strategy = self.effective_strategy(change, strategy);
        if strategy != ConflictStrategy::LastWriterWins {
            return Err(EngineError::UnsupportedStrategy(strategy.name().to_string()));
        }

        // Ties go to the cache: an equal timestamp means the change lost.
        if let Some(cached_at) = cache.last_updated_at(&change.widget_key) {
            if cached_at >= change.timestamp {
                return Ok(Resolution::Discarded);
            }
        }

        let payload = WidgetPayload::timestamped(change.data.clone(), change.timestamp);
        cache.set(&change.widget_key, &payload, write_opts)?;
        Ok(Resolution::Applied)
    }
}
