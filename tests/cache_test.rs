use std::time::Duration;

use serde_json::{Value, json};
use skald::cache::cache_key;
use skald::{CacheConfig, ExecutionResult, InputFields, ResponseCache, TokenUsage};

fn input(value: Value) -> InputFields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn result(function_id: &str, content: &str) -> ExecutionResult {
    ExecutionResult {
        function_id: function_id.into(),
        content: content.into(),
        usage: TokenUsage::new(3, 2),
        model_used: "deepseek-chat".into(),
        execution_time: 0.4,
        cached: false,
    }
}

fn text(s: &str) -> InputFields {
    input(json!({ "text": s }))
}

// ============================================================================
// Keys
// ============================================================================

#[test]
fn key_ignores_input_key_order() {
    let a = input(json!({"text": "hi", "summary_length": "short"}));
    let b = input(json!({"summary_length": "short", "text": "hi"}));
    assert_eq!(cache_key("f", &a), cache_key("f", &b));
}

#[test]
fn key_depends_on_function_and_values() {
    let hi = text("hi");
    assert_ne!(cache_key("f", &hi), cache_key("g", &hi));
    assert_ne!(cache_key("f", &hi), cache_key("f", &text("ho")));
    assert_eq!(cache_key("f", &hi).len(), 32);
}

// ============================================================================
// Get / set
// ============================================================================

#[tokio::test(start_paused = true)]
async fn hit_returns_stored_result() {
    let cache = ResponseCache::new(CacheConfig::new());
    assert!(cache.get("f", &text("hi")).is_none());

    cache.set("f", &text("hi"), result("f", "Hello"));
    let hit = cache.get("f", &text("hi")).unwrap();
    assert_eq!(hit.content, "Hello");
    assert_eq!(hit.usage.total_tokens, 5);
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_ttl() {
    let cache = ResponseCache::new(CacheConfig::new().ttl(Duration::from_secs(60)));
    cache.set("f", &text("hi"), result("f", "Hello"));

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(cache.get("f", &text("hi")).is_some());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(cache.get("f", &text("hi")).is_none());
    // Expired entries are dropped on lookup.
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn explicit_ttl_overrides_default() {
    let cache = ResponseCache::new(CacheConfig::new().ttl(Duration::from_secs(3600)));
    cache.set_with_ttl("f", &text("hi"), result("f", "Hello"), Duration::from_secs(5));

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(cache.get("f", &text("hi")).is_none());
}

#[tokio::test(start_paused = true)]
async fn least_recently_accessed_entry_is_evicted() {
    let cache = ResponseCache::new(CacheConfig::new().max_entries(2));
    cache.set("f", &text("a"), result("f", "A"));
    tokio::time::advance(Duration::from_secs(1)).await;
    cache.set("f", &text("b"), result("f", "B"));
    tokio::time::advance(Duration::from_secs(1)).await;

    assert!(cache.get("f", &text("a")).is_some());
    tokio::time::advance(Duration::from_secs(1)).await;
    cache.set("f", &text("c"), result("f", "C"));

    assert_eq!(cache.len(), 2);
    assert!(cache.get("f", &text("a")).is_some());
    assert!(cache.get("f", &text("b")).is_none());
    assert!(cache.get("f", &text("c")).is_some());
}

#[tokio::test(start_paused = true)]
async fn eviction_order_holds_within_one_clock_tick() {
    let cache = ResponseCache::new(CacheConfig::new().max_entries(2));
    cache.set("f", &text("a"), result("f", "A"));
    cache.set("f", &text("b"), result("f", "B"));
    cache.get("f", &text("a"));
    cache.set("f", &text("c"), result("f", "C"));

    assert!(cache.get("f", &text("b")).is_none());
    assert!(cache.get("f", &text("a")).is_some());
}

#[tokio::test(start_paused = true)]
async fn overwriting_a_key_never_evicts() {
    let cache = ResponseCache::new(CacheConfig::new().max_entries(2));
    cache.set("f", &text("a"), result("f", "A"));
    cache.set("f", &text("b"), result("f", "B"));
    cache.set("f", &text("a"), result("f", "A2"));

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get("f", &text("a")).unwrap().content, "A2");
    assert!(cache.get("f", &text("b")).is_some());
}

#[tokio::test(start_paused = true)]
async fn disabled_cache_stores_nothing() {
    let cache = ResponseCache::new(CacheConfig::disabled());
    cache.set("f", &text("hi"), result("f", "Hello"));
    assert!(cache.get("f", &text("hi")).is_none());
    assert!(cache.is_empty());
    assert!(!cache.stats().enabled);
}

#[tokio::test(start_paused = true)]
async fn zero_capacity_cache_stores_nothing() {
    let cache = ResponseCache::new(CacheConfig::new().max_entries(0));
    cache.set("f", &text("hi"), result("f", "Hello"));
    assert!(cache.is_empty());
    assert_eq!(cache.stats().usage_ratio, 0.0);
}

// ============================================================================
// Invalidation and stats
// ============================================================================

#[tokio::test(start_paused = true)]
async fn invalidate_removes_only_one_function() {
    let cache = ResponseCache::new(CacheConfig::new());
    cache.set("f", &text("a"), result("f", "A"));
    cache.set("f", &text("b"), result("f", "B"));
    cache.set("g", &text("a"), result("g", "A"));

    assert_eq!(cache.invalidate("f"), 2);
    assert_eq!(cache.invalidate("f"), 0);
    assert_eq!(cache.len(), 1);
    assert!(cache.get("g", &text("a")).is_some());
}

#[tokio::test(start_paused = true)]
async fn remove_reports_presence() {
    let cache = ResponseCache::new(CacheConfig::new());
    cache.set("f", &text("a"), result("f", "A"));
    assert!(cache.remove("f", &text("a")));
    assert!(!cache.remove("f", &text("a")));
}

#[tokio::test(start_paused = true)]
async fn stats_count_expired_entries_until_swept() {
    let cache = ResponseCache::new(
        CacheConfig::new()
            .max_entries(4)
            .ttl(Duration::from_secs(10)),
    );
    cache.set("f", &text("a"), result("f", "A"));
    cache.set_with_ttl("g", &text("b"), result("g", "B"), Duration::from_secs(100));

    tokio::time::advance(Duration::from_secs(11)).await;
    let stats = cache.stats();
    assert!(stats.enabled);
    assert_eq!(stats.total_entries, 2);
    assert_eq!(stats.active_entries, 1);
    assert_eq!(stats.expired_entries, 1);
    assert_eq!(stats.max_entries, 4);
    assert!((stats.usage_ratio - 0.5).abs() < f64::EPSILON);
    assert_eq!(stats.per_function.get("f"), Some(&1));
    assert_eq!(stats.per_function.get("g"), Some(&1));

    assert_eq!(cache.cleanup_expired(), 1);
    let stats = cache.stats();
    assert_eq!(stats.total_entries, 1);
    assert_eq!(stats.expired_entries, 0);
}

#[tokio::test(start_paused = true)]
async fn clear_empties_the_cache() {
    let cache = ResponseCache::new(CacheConfig::new());
    cache.set("f", &text("a"), result("f", "A"));
    cache.set("g", &text("b"), result("g", "B"));
    cache.clear();
    assert!(cache.is_empty());
}
