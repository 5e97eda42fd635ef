//! # Engine Error Taxonomy
//!
//! Errors are split along the propagation policy: caller errors
//! (`SourceNotFound`, `PipelineNotFound`, `PipelineInactive`) are returned
//! synchronously and never retried; transient run errors (`FetchFailed`,
//! `TransformationFailed`) abort a single pipeline run but leave the engine
//! scheduled and serving cached data.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Data source '{0}' not found")]
    SourceNotFound(String),

    #[error("Pipeline '{0}' not found")]
    PipelineNotFound(Uuid),

    #[error("Pipeline '{0}' is inactive")]
    PipelineInactive(Uuid),

    #[error("Fetch from source '{source_id}' failed: {reason}")]
    FetchFailed { source_id: String, reason: String },

    #[error("Transformation '{stage}' failed: {reason}")]
    TransformationFailed { stage: String, reason: String },

    #[error("Codec error: {0}")]
    CodecFailed(String),

    #[error("Invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("Invalid invalidation pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Conflict strategy '{0}' is not implemented")]
    UnsupportedStrategy(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
