//! # Real-Time Dashboard Synchronization Engine
//!
//! Keeps live dashboards consistent with their backing data sources:
//! scheduled pipelines fetch and transform source data, a subscription
//! registry fans updates out to widgets under per-subscriber throttling and
//! filtering, a bounded TTL + LRU cache holds the last known good value for
//! every widget key, and an offline resolver replays queued changes with
//! last-writer-wins conflict resolution on reconnect.
//!
//! `core::RealtimeEngine` is the entry point; everything else is reachable
//! through it, and re-exported here for direct use.

// Declare the modules to re-export
pub mod cache;
pub mod config;
pub mod core;
pub mod metrics;
pub mod offline;
pub mod pipelines;
pub mod sources;
pub mod subscriptions;

// Re-export the primary types
pub use cache::{CacheStore, CacheWriteOptions, PayloadCodec};
pub use config::{ConfigError, EngineConfig};
pub use core::{
    EngineError, EngineEvent, EventReceiver, RealtimeEngine, Result, ScheduledRun, WidgetPayload,
};
pub use metrics::{MetricsCollector, RealtimeMetrics};
pub use offline::{ConflictStrategy, OfflineChange, OfflineResolver, SyncReport, SyncStatus};
pub use pipelines::{Pipeline, PipelineEngine, Schedule, Target, TransformKind, Transformation};
pub use sources::{DataSource, SourceConnector, SourceKind, SourceRegistry};
pub use subscriptions::{
    DeliveryCallback, PayloadFilter, SubscribeOptions, SubscriptionRegistry,
};
