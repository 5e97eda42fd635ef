//! # Widget Cache Module
//!
//! The bounded TTL + LRU store for last-known-good widget data, plus the
//! pluggable compression/encryption codecs applied around storage.

pub mod codec;
pub mod store;

// --- Public API Re-exports ---
pub use codec::{AesCbcCodec, DeflateCodec, NoopCodec, PayloadCodec};
pub use store::{CacheStore, CacheWriteOptions};
