//! # Widget Payload
//!
//! The standardized unit of data that flows through the engine. The payload
//! body is an opaque `serde_json::Value` produced by upstream business-logic
//! services; the cache and the subscription registry treat it as a black box
//! annotated with source metadata and a wall-clock update timestamp. The
//! timestamp is what the offline conflict resolver compares under
//! last-writer-wins.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Annotations describing where a payload came from and how trustworthy it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Number of records the upstream computation was based on.
    pub record_count: u64,
    /// Inclusive date range the records cover, when known.
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Upstream quality score, 0.0 to 100.0.
    pub quality_score: f64,
    /// Upstream freshness score, 0.0 to 100.0.
    pub freshness: f64,
}

/// One widget update, as published into the fan-out and cached for late joiners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetPayload {
    /// The opaque widget data.
    pub data: Value,
    /// Optional source annotations, passed through unmodified.
    pub meta: Option<SourceMetadata>,
    /// Wall-clock time of the update this payload represents.
    pub last_updated_at: DateTime<Utc>,
}

impl WidgetPayload {
    /// Wraps raw widget data, stamped with the current time.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            meta: None,
            last_updated_at: Utc::now(),
        }
    }

    /// Wraps raw widget data with an explicit update timestamp.
    pub fn timestamped(data: Value, last_updated_at: DateTime<Utc>) -> Self {
        Self {
            data,
            meta: None,
            last_updated_at,
        }
    }

    /// Attaches source metadata.
    pub fn with_meta(mut self, meta: SourceMetadata) -> Self {
        self.meta = Some(meta);
        self
    }
}
