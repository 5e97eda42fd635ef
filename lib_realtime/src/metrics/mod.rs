//! # Performance Metrics
//!
//! Per-window readings over the monotonic counters the other components
//! already maintain. Each `collect` call closes the current window: rates
//! are computed from the counter deltas since the previous call, then the
//! baseline resets. Gauges (subscriber count, cache size, freshness) are
//! sampled live at collection time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::store::CacheStore;
use crate::pipelines::PipelineEngine;
use crate::sources::SourceRegistry;
use crate::subscriptions::SubscriptionRegistry;

/// One collected metrics window, serializable for dashboards and logs.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeMetrics {
    pub collected_at: DateTime<Utc>,
    /// Wall-clock length of the window the rates below cover.
    pub window_secs: f64,
    /// Successful subscriber deliveries per second.
    pub updates_per_second: f64,
    /// Successful pipeline runs per second.
    pub pipeline_runs_per_second: f64,
    /// Failed pipeline runs plus source fetch failures, per second.
    pub errors_per_second: f64,
    /// Hit fraction of cache accesses in this window, 0.0 when idle.
    pub cache_hit_rate: f64,
    pub cache_entries: usize,
    pub active_subscribers: usize,
    pub active_pipelines: usize,
    /// Remaining TTL budget per cached key, 0..=100.
    pub data_freshness: HashMap<String, f64>,
}

/// Counter baseline at the start of the current window.
struct Window {
    hits: u64,
    misses: u64,
    delivered: u64,
    runs: u64,
    pipeline_errors: u64,
    source_errors: u64,
    at: Instant,
}

pub struct MetricsCollector {
    cache: Arc<CacheStore>,
    sources: Arc<SourceRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    pipelines: Arc<PipelineEngine>,
    window: Mutex<Window>,
}

impl MetricsCollector {
    pub fn new(
        cache: Arc<CacheStore>,
        sources: Arc<SourceRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
        pipelines: Arc<PipelineEngine>,
    ) -> Self {
        let window = Window {
            hits: cache.hits(),
            misses: cache.misses(),
            delivered: subscriptions.delivered(),
            runs: pipelines.runs(),
            pipeline_errors: pipelines.errors(),
            source_errors: sources.total_errors(),
            at: Instant::now(),
        };
        Self {
            cache,
            sources,
            subscriptions,
            pipelines,
            window: Mutex::new(window),
        }
    }

    /// Closes the current window and returns its reading. The next call
    /// measures from here.
    pub fn collect(&self) -> RealtimeMetrics {
        let hits = self.cache.hits();
        let misses = self.cache.misses();
        let delivered = self.subscriptions.delivered();
        let runs = self.pipelines.runs();
        let pipeline_errors = self.pipelines.errors();
        let source_errors = self.sources.total_errors();
        let now = Instant::now();

        let mut window = self.window.lock().expect("Metrics window lock poisoned");
        let elapsed = now.duration_since(window.at).as_secs_f64().max(f64::EPSILON);
        let hit_delta = hits - window.hits;
        let miss_delta = misses - window.misses;
        let accesses = hit_delta + miss_delta;
        let error_delta =
            (pipeline_errors - window.pipeline_errors) + (source_errors - window.source_errors);

        let metrics = RealtimeMetrics {
            collected_at: Utc::now(),
            window_secs: elapsed,
            updates_per_second: (delivered - window.delivered) as f64 / elapsed,
            pipeline_runs_per_second: (runs - window.runs) as f64 / elapsed,
            errors_per_second: error_delta as f64 / elapsed,
            cache_hit_rate: if accesses == 0 {
                0.0
            } else {
                hit_delta as f64 / accesses as f64
            },
            cache_entries: self.cache.len(),
            active_subscribers: self.subscriptions.subscriber_count(),
            active_pipelines: self.pipelines.pipeline_count(),
            data_freshness: self.cache.freshness(),
        };

        *window = Window {
            hits,
            misses,
            delivered,
            runs,
            pipeline_errors,
            source_errors,
            at: now,
        };
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::NoopCodec;
    use crate::cache::store::CacheWriteOptions;
    use crate::core::events::event_channel;
    use crate::core::payload::WidgetPayload;
    use crate::core::scheduler::RunScheduler;
    use serde_json::json;
    use std::time::Duration;

    fn collector() -> (MetricsCollector, Arc<CacheStore>, Arc<SubscriptionRegistry>) {
        let (events, _rx) = event_channel(16);
        let cache = Arc::new(CacheStore::new(
            100,
            Duration::from_secs(60),
            Arc::new(NoopCodec),
            Arc::new(NoopCodec),
            events.clone(),
        ));
        let sources = Arc::new(SourceRegistry::new(Duration::from_secs(5), events.clone()));
        let subscriptions = Arc::new(SubscriptionRegistry::new(events.clone()));
        let pipelines = Arc::new(PipelineEngine::new(
            Arc::clone(&sources),
            Arc::clone(&cache),
            Arc::clone(&subscriptions),
            Arc::new(RunScheduler::new()),
            CacheWriteOptions::default(),
            events,
        ));
        let collector = MetricsCollector::new(
            Arc::clone(&cache),
            sources,
            Arc::clone(&subscriptions),
            pipelines,
        );
        (collector, cache, subscriptions)
    }

    #[test]
    fn idle_windows_report_zero_rates() {
        let (collector, _cache, _subs) = collector();
        let m = collector.collect();
        assert_eq!(m.updates_per_second, 0.0);
        assert_eq!(m.errors_per_second, 0.0);
        assert_eq!(m.cache_hit_rate, 0.0);
        assert_eq!(m.cache_entries, 0);
    }

    #[test]
    fn hit_rate_covers_only_the_current_window() {
        let (collector, cache, _subs) = collector();
        let p = WidgetPayload::new(json!({ "v": 1 }));
        cache.set("w1", &p, &CacheWriteOptions::default()).unwrap();

        cache.get("w1");
        cache.get("w1");
        cache.get("w1");
        cache.get("miss");
        let m = collector.collect();
        assert_eq!(m.cache_hit_rate, 0.75);

        // Fresh window: earlier accesses no longer count.
        cache.get("miss");
        let m = collector.collect();
        assert_eq!(m.cache_hit_rate, 0.0);
    }

    #[test]
    fn gauges_sample_live_state() {
        let (collector, cache, subs) = collector();
        let p = WidgetPayload::new(json!({ "v": 1 }));
        cache.set("w1", &p, &CacheWriteOptions::default()).unwrap();
        subs.subscribe("u1", "w1", Arc::new(|_| Ok(())), Default::default());

        let m = collector.collect();
        assert_eq!(m.cache_entries, 1);
        assert_eq!(m.active_subscribers, 1);
        assert!(m.data_freshness.contains_key("w1"));
    }

    #[test]
    fn delivery_rate_reflects_publishes() {
        let (collector, _cache, subs) = collector();
        subs.subscribe("u1", "w1", Arc::new(|_| Ok(())), Default::default());
        let p = WidgetPayload::new(json!({ "v": 1 }));
        subs.publish("w1", &p);
        subs.publish("w1", &p);

        let m = collector.collect();
        assert!(m.updates_per_second > 0.0);
        assert!(m.window_secs > 0.0);
    }
}
