//! # Data Source Registry
//!
//! Tracks the named external data sources pipelines fetch from. The actual
//! connector (database driver, HTTP client, file reader, stream consumer)
//! is supplied by the caller behind the `SourceConnector` trait; this
//! module owns identity, health state, and fetch timeout enforcement.
//!
//! Health is purely advisory bookkeeping: a failed fetch marks the source
//! unhealthy and bumps its error count, a later successful fetch resets it.
//! No circuit breaking happens here — consumers are expected to check
//! `healthy` before treating a fetch result as authoritative.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::core::error::{EngineError, Result};
use crate::core::events::{emit, EngineEvent, EventSender};

/// What kind of system a source connects to. Informational; the engine
/// treats all kinds identically through the connector trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Database,
    Api,
    File,
    Stream,
}

/// The connector contract implemented per source kind by the caller.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn fetch(&self, params: &Value) -> anyhow::Result<Value>;
}

/// A registered data source and its advisory health state.
#[derive(Clone)]
pub struct DataSource {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub connector: Arc<dyn SourceConnector>,
    pub refresh_interval: Duration,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub error_count: u64,
}

pub struct SourceRegistry {
    sources: Mutex<HashMap<String, DataSource>>,
    fetch_timeout: Duration,
    total_errors: AtomicU64,
    events: EventSender,
}

impl SourceRegistry {
    pub fn new(fetch_timeout: Duration, events: EventSender) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            fetch_timeout,
            total_errors: AtomicU64::new(0),
            events,
        }
    }

    /// Registers (or replaces) a named source. New sources start healthy.
    pub fn register(
        &self,
        id: &str,
        name: &str,
        kind: SourceKind,
        connector: Arc<dyn SourceConnector>,
        refresh_interval: Duration,
    ) {
        let mut sources = self.sources.lock().expect("Source registry lock poisoned");
        if sources.contains_key(id) {
            log::warn!("Data source '{}' re-registered, replacing existing entry", id);
        }
        sources.insert(
            id.to_string(),
            DataSource {
                id: id.to_string(),
                name: name.to_string(),
                kind,
                connector,
                refresh_interval,
                last_refreshed_at: None,
                healthy: true,
                error_count: 0,
            },
        );
        log::info!("Data source '{}' ({}) registered as {:?}", id, name, kind);
    }

    /// Fetches from a source, bounded by the configured timeout. Success
    /// resets the health flag; failure degrades it and emits an event.
    pub async fn fetch(&self, id: &str, params: &Value) -> Result<Value> {
        let connector = {
            let sources = self.sources.lock().expect("Source registry lock poisoned");
            sources
                .get(id)
                .map(|source| Arc::clone(&source.connector))
                .ok_or_else(|| EngineError::SourceNotFound(id.to_string()))?
        };

        match tokio::time::timeout(self.fetch_timeout, connector.fetch(params)).await {
            Ok(Ok(data)) => {
                let mut sources = self.sources.lock().expect("Source registry lock poisoned");
                if let Some(source) = sources.get_mut(id) {
                    source.healthy = true;
                    source.last_refreshed_at = Some(Utc::now());
                }
                Ok(data)
            }
            Ok(Err(e)) => Err(self.record_failure(id, e.to_string())),
            Err(_) => Err(self.record_failure(
                id,
                format!("fetch timed out after {:?}", self.fetch_timeout),
            )),
        }
    }

    fn record_failure(&self, id: &str, reason: String) -> EngineError {
        let error_count = {
            let mut sources = self.sources.lock().expect("Source registry lock poisoned");
            match sources.get_mut(id) {
                Some(source) => {
                    source.healthy = false;
                    source.error_count += 1;
                    source.error_count
                }
                None => 0,
            }
        };
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        log::warn!("Data source '{}' fetch failed ({} errors): {}", id, error_count, reason);
        emit(
            &self.events,
            EngineEvent::SourceUnhealthy {
                source_id: id.to_string(),
                error_count,
                reason: reason.clone(),
            },
        );
        EngineError::FetchFailed {
            source_id: id.to_string(),
            reason,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sources
            .lock()
            .expect("Source registry lock poisoned")
            .contains_key(id)
    }

    /// Advisory health flag, `None` for unknown sources.
    pub fn health(&self, id: &str) -> Option<bool> {
        self.sources
            .lock()
            .expect("Source registry lock poisoned")
            .get(id)
            .map(|source| source.healthy)
    }

    pub fn error_count(&self, id: &str) -> Option<u64> {
        self.sources
            .lock()
            .expect("Source registry lock poisoned")
            .get(id)
            .map(|source| source.error_count)
    }

    /// Total fetch failures across all sources since construction.
    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.sources
            .lock()
            .expect("Source registry lock poisoned")
            .clear();
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::StaticSource;
    use super::*;
    use crate::core::events::event_channel;
    use serde_json::json;

    fn registry() -> SourceRegistry {
        let (events, _rx) = event_channel(16);
        SourceRegistry::new(Duration::from_secs(5), events)
    }

    #[tokio::test]
    async fn fetch_returns_connector_data_and_marks_refresh() {
        let reg = registry();
        let source = StaticSource::new(json!([1, 2, 3]));
        reg.register("s1", "numbers", SourceKind::Api, source, Duration::from_secs(1));

        let data = reg.fetch("s1", &Value::Null).await.unwrap();
        assert_eq!(data, json!([1, 2, 3]));
        assert_eq!(reg.health("s1"), Some(true));
    }

    #[tokio::test]
    async fn unknown_source_is_a_caller_error() {
        let reg = registry();
        assert!(matches!(
            reg.fetch("missing", &Value::Null).await,
            Err(EngineError::SourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failure_degrades_health_and_success_restores_it() {
        let (events, mut rx) = event_channel(16);
        let reg = SourceRegistry::new(Duration::from_secs(5), events);
        let source = StaticSource::new(json!({}));
        reg.register(
            "s1",
            "flaky",
            SourceKind::Database,
            source.clone(),
            Duration::from_secs(1),
        );

        source.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            reg.fetch("s1", &Value::Null).await,
            Err(EngineError::FetchFailed { .. })
        ));
        assert_eq!(reg.health("s1"), Some(false));
        assert_eq!(reg.error_count("s1"), Some(1));
        assert_eq!(reg.total_errors(), 1);
        assert!(matches!(rx.try_recv(), Ok(EngineEvent::SourceUnhealthy { .. })));

        // No automatic recovery; only a successful fetch resets health.
        source.failing.store(false, Ordering::SeqCst);
        reg.fetch("s1", &Value::Null).await.unwrap();
        assert_eq!(reg.health("s1"), Some(true));
        assert_eq!(reg.error_count("s1"), Some(1), "error count is cumulative");
    }

    #[tokio::test]
    async fn slow_connectors_are_cut_off_by_the_timeout() {
        struct Stalled;
        #[async_trait]
        impl SourceConnector for Stalled {
            async fn fetch(&self, _params: &Value) -> anyhow::Result<Value> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }
        }

        let (events, _rx) = event_channel(16);
        let reg = SourceRegistry::new(Duration::from_millis(50), events);
        reg.register("s1", "stalled", SourceKind::Stream, Arc::new(Stalled), Duration::from_secs(1));

        let err = reg.fetch("s1", &Value::Null).await.unwrap_err();
        assert!(matches!(err, EngineError::FetchFailed { .. }));
        assert_eq!(reg.health("s1"), Some(false));
    }
}
