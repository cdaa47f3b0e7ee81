//! TTL + LRU bounded response cache.
//!
//! [`ResponseCache`] maps `(function_id, input)` to a previously computed
//! [`ExecutionResult`]. Keys are an MD5 digest of a canonical JSON
//! rendering of both parts, so field order in the caller's input never
//! matters. Expired entries are dropped lazily on read or by an explicit
//! [`ResponseCache::cleanup_expired`] sweep.
//!
//! All state sits behind one mutex; every operation is a short scan or a
//! single map access and no lock is held across an await point.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry;
use crate::types::{ExecutionResult, InputFields};

/// Configuration for the response cache.
///
/// ```rust
/// # use skald::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_entries(500)
///     .ttl(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// When false, lookups always miss and stores are dropped. Default: true.
    pub enabled: bool,
    /// Maximum number of cached entries. Default: 1,000.
    pub max_entries: usize,
    /// Default time-to-live for entries. Default: 1 hour.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// A config with caching switched off.
    pub fn disabled() -> Self {
        Self::default().enabled(false)
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the maximum number of cached entries.
    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the default time-to-live for cached entries.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Point-in-time view of the cache contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub total_entries: usize,
    pub active_entries: usize,
    /// Entries past their expiry that have not been swept yet.
    pub expired_entries: usize,
    pub max_entries: usize,
    /// `total_entries / max_entries`, or 0 for a zero-capacity cache.
    pub usage_ratio: f64,
    /// Entry count per function id, expired entries included.
    pub per_function: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    function_id: String,
    payload: ExecutionResult,
    created_at: Instant,
    last_accessed_at: Instant,
    /// Monotonic access order; orders entries touched within one clock tick.
    access_seq: u64,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    seq: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Remove the least recently accessed entry.
    fn evict_lru(&mut self) -> Option<CacheEntry> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.last_accessed_at, e.access_seq))
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&key)
    }
}

/// In-memory response cache bounded by entry count and TTL.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl ResponseCache {
    /// Create a new response cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a stored result.
    ///
    /// Misses when disabled, absent or expired. Expired entries are removed
    /// on the way out; a hit refreshes the entry's access time.
    pub fn get(&self, function_id: &str, input: &InputFields) -> Option<ExecutionResult> {
        if !self.config.enabled {
            return None;
        }
        let key = cache_key(function_id, input);
        let now = Instant::now();
        let mut state = self.state.lock();
        let seq = state.next_seq();

        let hit = match state.entries.get(&key).map(|e| e.is_expired(now)) {
            None => None,
            Some(true) => {
                state.entries.remove(&key);
                None
            }
            Some(false) => state.entries.get_mut(&key).map(|entry| {
                entry.last_accessed_at = now;
                entry.access_seq = seq;
                entry.payload.clone()
            }),
        };
        drop(state);

        let counter = if hit.is_some() {
            telemetry::CACHE_HITS_TOTAL
        } else {
            telemetry::CACHE_MISSES_TOTAL
        };
        metrics::counter!(counter, "function" => function_id.to_string()).increment(1);
        hit
    }

    /// Store a result with the configured default TTL.
    pub fn set(&self, function_id: &str, input: &InputFields, result: ExecutionResult) {
        self.set_with_ttl(function_id, input, result, self.config.ttl);
    }

    /// Store a result with an explicit TTL.
    ///
    /// Overwriting an existing key never evicts. Inserting a new key into a
    /// full cache first evicts the single least recently accessed entry.
    pub fn set_with_ttl(
        &self,
        function_id: &str,
        input: &InputFields,
        result: ExecutionResult,
        ttl: Duration,
    ) {
        if !self.config.enabled || self.config.max_entries == 0 {
            return;
        }
        let key = cache_key(function_id, input);
        let now = Instant::now();
        let mut state = self.state.lock();

        let mut evicted = 0u64;
        if !state.entries.contains_key(&key) {
            while state.entries.len() >= self.config.max_entries {
                match state.evict_lru() {
                    Some(entry) => {
                        debug!(
                            function_id = %entry.function_id,
                            age_secs = now.duration_since(entry.created_at).as_secs(),
                            "evicted least recently used cache entry"
                        );
                        evicted += 1;
                    }
                    None => break,
                }
            }
        }

        let seq = state.next_seq();
        state.entries.insert(
            key,
            CacheEntry {
                function_id: function_id.to_string(),
                payload: result,
                created_at: now,
                last_accessed_at: now,
                access_seq: seq,
                expires_at: now + ttl,
            },
        );
        drop(state);

        if evicted > 0 {
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL).increment(evicted);
        }
    }

    /// Remove one entry. Returns whether it was present.
    pub fn remove(&self, function_id: &str, input: &InputFields) -> bool {
        let key = cache_key(function_id, input);
        self.state.lock().entries.remove(&key).is_some()
    }

    /// Remove every entry belonging to `function_id`.
    pub fn invalidate(&self, function_id: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| e.function_id != function_id);
        before - state.entries.len()
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Sweep expired entries. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.is_expired(now));
        before - state.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let state = self.state.lock();
        let total = state.entries.len();
        let expired = state.entries.values().filter(|e| e.is_expired(now)).count();
        let mut per_function = BTreeMap::new();
        for entry in state.entries.values() {
            *per_function.entry(entry.function_id.clone()).or_insert(0) += 1;
        }
        drop(state);

        let max = self.config.max_entries;
        CacheStats {
            enabled: self.config.enabled,
            total_entries: total,
            active_entries: total - expired,
            expired_entries: expired,
            max_entries: max,
            usage_ratio: if max == 0 {
                0.0
            } else {
                total as f64 / max as f64
            },
            per_function,
        }
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

/// Cache key for a function call: hex MD5 of the canonical JSON of
/// `{"function_id": .., "input": ..}` with object keys sorted at every level.
pub fn cache_key(function_id: &str, input: &InputFields) -> String {
    let mut canonical = String::with_capacity(64);
    canonical.push_str("{\"function_id\":");
    write_canonical(&mut canonical, &Value::from(function_id));
    canonical.push_str(",\"input\":");
    write_object(&mut canonical, input);
    canonical.push('}');
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

fn write_object(out: &mut String, map: &serde_json::Map<String, Value>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(out, &Value::from(key.as_str()));
        out.push(':');
        write_canonical(out, &map[key]);
    }
    out.push('}');
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => write_object(out, map),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}
