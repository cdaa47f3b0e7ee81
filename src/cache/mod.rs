//! Response caching.
//!
//! [`ResponseCache`] stores completed execution results keyed on a digest
//! of `(function_id, input)`. It is shared by the synchronous and streaming
//! paths of the dispatcher; see [`response`] for eviction and expiry rules.

pub mod response;

pub use response::{CacheConfig, CacheStats, ResponseCache, cache_key};
