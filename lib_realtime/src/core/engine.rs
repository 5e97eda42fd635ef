//! # Engine Facade
//!
//! Wires the cache, source registry, subscription registry, pipeline engine,
//! offline resolver, and metrics collector together behind one handle, and
//! owns the three background tasks:
//!
//! - the scheduler tick, which pops due heap entries and runs pipelines,
//! - the cache sweep, which bulk-removes expired entries,
//! - the metrics tick, which closes and logs a metrics window.
//!
//! All three run under a shared `CancellationToken`; `destroy` cancels it
//! and drops every subscription, pipeline, queued change, and cache entry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::codec::{AesCbcCodec, DeflateCodec, NoopCodec, PayloadCodec};
use crate::cache::store::{CacheStore, CacheWriteOptions};
use crate::config::EngineConfig;
use crate::core::error::{EngineError, Result};
use crate::core::events::{event_channel, EventReceiver, EventSender};
use crate::core::payload::WidgetPayload;
use crate::core::scheduler::{RunScheduler, ScheduledRun};
use crate::metrics::{MetricsCollector, RealtimeMetrics};
use crate::offline::{ConflictStrategy, OfflineResolver, SyncReport, SyncStatus};
use crate::pipelines::{PipelineEngine, Schedule, Target, Transformation};
use crate::sources::{SourceConnector, SourceKind, SourceRegistry};
use crate::subscriptions::{DeliveryCallback, SubscribeOptions, SubscriptionRegistry};

pub struct RealtimeEngine {
    config: EngineConfig,
    events: EventSender,
    cache: Arc<CacheStore>,
    sources: Arc<SourceRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    scheduler: Arc<RunScheduler>,
    pipelines: Arc<PipelineEngine>,
    offline: Arc<OfflineResolver>,
    metrics: Arc<MetricsCollector>,
    write_opts: CacheWriteOptions,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl RealtimeEngine {
    /// Builds a stopped engine from config. Fails if encryption is enabled
    /// without a usable key.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let (events, _rx) = event_channel(config.event_capacity);

        let encryption: Arc<dyn PayloadCodec> = match &config.encryption_key_hex {
            Some(key_hex) => Arc::new(AesCbcCodec::from_hex(key_hex)?),
            None if config.encrypt_by_default => {
                return Err(EngineError::CodecFailed(
                    "Encryption enabled but no encryption_key_hex configured".to_string(),
                ))
            }
            None => Arc::new(NoopCodec),
        };

        let cache = Arc::new(CacheStore::new(
            config.max_cache_entries,
            config.default_ttl(),
            Arc::new(DeflateCodec),
            encryption,
            events.clone(),
        ));
        let sources = Arc::new(SourceRegistry::new(config.fetch_timeout(), events.clone()));
        let subscriptions = Arc::new(SubscriptionRegistry::new(events.clone()));
        let scheduler = Arc::new(RunScheduler::new());
        let write_opts = CacheWriteOptions {
            ttl: None,
            compress: config.compress_by_default,
            encrypt: config.encrypt_by_default,
        };
        let pipelines = Arc::new(PipelineEngine::new(
            Arc::clone(&sources),
            Arc::clone(&cache),
            Arc::clone(&subscriptions),
            Arc::clone(&scheduler),
            write_opts,
            events.clone(),
        ));
        let offline = Arc::new(OfflineResolver::new(events.clone()));
        let metrics = Arc::new(MetricsCollector::new(
            Arc::clone(&cache),
            Arc::clone(&sources),
            Arc::clone(&subscriptions),
            Arc::clone(&pipelines),
        ));

        Ok(Self {
            config,
            events,
            cache,
            sources,
            subscriptions,
            scheduler,
            pipelines,
            offline,
            metrics,
            write_opts,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Spawns the background tasks. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!("Engine start requested twice, ignoring");
            return;
        }
        log::info!(
            "Engine starting: tick {:?}, sweep {:?}, metrics {:?}",
            self.config.scheduler_tick(),
            self.config.sweep_interval(),
            self.config.metrics_interval()
        );

        // Scheduler tick: run every due pipeline, earliest first.
        {
            let pipelines = Arc::clone(&self.pipelines);
            let token = self.shutdown.clone();
            let tick = self.config.scheduler_tick();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            for id in pipelines.take_due(Utc::now()) {
                                let _ = pipelines.run(id).await;
                            }
                        }
                    }
                }
                log::debug!("Scheduler tick task stopped");
            });
        }

        // Cache sweep.
        {
            let cache = Arc::clone(&self.cache);
            let token = self.shutdown.clone();
            let every = self.config.sweep_interval();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => { cache.sweep_expired(); }
                    }
                }
                log::debug!("Cache sweep task stopped");
            });
        }

        // Metrics window.
        {
            let metrics = Arc::clone(&self.metrics);
            let token = self.shutdown.clone();
            let every = self.config.metrics_interval();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                // The first tick fires immediately; skip it so the first
                // logged window covers a full interval.
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            let m = metrics.collect();
                            log::info!(
                                "Metrics: {:.2} upd/s, {:.2} runs/s, {:.2} err/s, hit rate {:.2}, {} entries, {} subscribers",
                                m.updates_per_second,
                                m.pipeline_runs_per_second,
                                m.errors_per_second,
                                m.cache_hit_rate,
                                m.cache_entries,
                                m.active_subscribers
                            );
                        }
                    }
                }
                log::debug!("Metrics task stopped");
            });
        }
    }

    // --- Sources ---

    pub fn register_source(
        &self,
        id: &str,
        name: &str,
        kind: SourceKind,
        connector: Arc<dyn SourceConnector>,
        refresh_interval: std::time::Duration,
    ) {
        self.sources
            .register(id, name, kind, connector, refresh_interval);
    }

    pub fn source_health(&self, id: &str) -> Option<bool> {
        self.sources.health(id)
    }

    // --- Subscriptions ---

    pub fn subscribe(
        &self,
        subscriber_id: &str,
        widget_key: &str,
        callback: DeliveryCallback,
        opts: SubscribeOptions,
    ) -> Uuid {
        self.subscriptions
            .subscribe(subscriber_id, widget_key, callback, opts)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscriptions.unsubscribe(id);
    }

    /// Pushes an update to a widget key outside any pipeline: subscribers
    /// first, then the cache write that makes it visible to late readers.
    /// Returns the number of successful deliveries.
    pub fn publish_update(&self, widget_key: &str, data: Value) -> Result<usize> {
        let payload = WidgetPayload::new(data);
        let delivered = self.subscriptions.publish(widget_key, &payload);
        self.cache.set(widget_key, &payload, &self.write_opts)?;
        Ok(delivered)
    }

    // --- Cache ---

    pub fn get_cached(&self, widget_key: &str) -> Option<WidgetPayload> {
        self.cache.get(widget_key)
    }

    /// Direct cache write without fan-out. `ttl = None` uses the store-wide
    /// default; compress/encrypt default from config when `opts` is `None`.
    pub fn set_cached(
        &self,
        key: &str,
        data: Value,
        ttl: Option<std::time::Duration>,
        opts: Option<CacheWriteOptions>,
    ) -> Result<()> {
        let mut write_opts = opts.unwrap_or(self.write_opts);
        write_opts.ttl = ttl.or(write_opts.ttl);
        self.cache.set(key, &WidgetPayload::new(data), &write_opts)
    }

    pub fn invalidate_cache(&self, pattern: Option<&str>) -> Result<()> {
        self.cache.invalidate(pattern)
    }

    // --- Pipelines ---

    pub fn create_pipeline(
        &self,
        name: &str,
        source_id: &str,
        transformations: Vec<Transformation>,
        targets: Vec<Target>,
        schedule: Schedule,
    ) -> Result<Uuid> {
        self.pipelines
            .create_pipeline(name, source_id, transformations, targets, schedule)
    }

    /// Runs one pipeline immediately, independent of its schedule, and
    /// returns the final transformed value.
    pub async fn run_pipeline(&self, id: Uuid) -> Result<Value> {
        self.pipelines.run(id).await
    }

    pub fn set_pipeline_active(&self, id: Uuid, active: bool) -> Result<()> {
        self.pipelines.set_active(id, active)
    }

    /// Fires every event-scheduled pipeline waiting on this name.
    pub async fn trigger_event(&self, event_name: &str) -> usize {
        self.pipelines.trigger_event(event_name).await
    }

    /// Upcoming planned runs, earliest first. Inspection only.
    pub fn next_scheduled_runs(&self, n: usize) -> Vec<ScheduledRun> {
        self.scheduler.next_runs(n)
    }

    // --- Offline ---

    /// Records the conflict strategy offline sync passes resolve under.
    pub fn enable_offline_mode(&self, strategy: ConflictStrategy) {
        self.offline.enable(strategy);
    }

    /// Overrides the strategy for offline changes carrying a data field.
    pub fn set_offline_field_rule(&self, field: &str, strategy: ConflictStrategy) {
        self.offline.set_field_rule(field, strategy);
    }

    pub fn queue_offline_change(
        &self,
        widget_key: &str,
        data: Value,
        timestamp: DateTime<Utc>,
    ) -> Uuid {
        self.offline.queue_change(widget_key, data, timestamp)
    }

    /// Replays all queued offline changes against the cache.
    pub fn sync_offline_changes(&self) -> SyncReport {
        self.offline.sync_all(&self.cache, &self.write_opts)
    }

    pub fn pending_offline_changes(&self) -> usize {
        self.offline.pending()
    }

    /// Per-key sync view: `Synced` when the key has a live cache entry.
    pub fn get_sync_status(
        &self,
        widget_keys: &[&str],
    ) -> std::collections::HashMap<String, SyncStatus> {
        self.offline.sync_status(&self.cache, widget_keys)
    }

    // --- Observability ---

    /// Closes the current metrics window and returns it.
    pub fn get_metrics(&self) -> RealtimeMetrics {
        self.metrics.collect()
    }

    /// A fresh receiver on the engine's error/diagnostic event stream.
    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Stops background tasks and drops all engine state: subscriptions,
    /// pipelines, scheduled runs, queued offline changes, cached entries.
    /// The engine cannot be restarted afterwards.
    pub fn destroy(&self) {
        log::info!("Engine shutting down");
        self.shutdown.cancel();
        self.subscriptions.clear();
        self.pipelines.clear();
        self.offline.clear();
        self.sources.clear();
        self.cache.clear();
    }
}

impl Drop for RealtimeEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
