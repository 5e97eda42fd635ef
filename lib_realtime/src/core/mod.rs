//! # Core Engine Module
//!
//! The fundamental building blocks the rest of the crate assembles:
//!
//! - **`engine`**: The facade. Wires every component together, owns the
//!   background tasks (scheduler tick, cache sweep, metrics window), and is
//!   the handle applications hold.
//!
//! - **`scheduler`**: The single min-heap of planned pipeline runs. One heap
//!   drives every interval and cron schedule in the engine.
//!
//! - **`events`**: The broadcast channel for structured error/diagnostic
//!   events. Failures attributable to one unit of work are contained there
//!   and reported here instead of propagating.
//!
//! - **`payload`**: The widget payload envelope all data paths share.
//!
//! - **`error`**: The crate-wide error enum.

pub mod engine;
pub mod error;
pub mod events;
pub mod payload;
pub mod scheduler;

// --- Public API Re-exports ---
pub use engine::RealtimeEngine;
pub use error::{EngineError, Result};
pub use events::{event_channel, EngineEvent, EventReceiver, EventSender};
pub use payload::{SourceMetadata, WidgetPayload};
pub use scheduler::{RunScheduler, ScheduledRun};
