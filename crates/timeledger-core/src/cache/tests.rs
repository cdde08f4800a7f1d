use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::NaiveDate;

use super::*;
use crate::memory::InMemoryCache;
use crate::repository::MockCacheStore;

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn cache_over(store: Arc<dyn CacheStore>) -> ExpansionCache {
    ExpansionCache::new(
        CategoryCache::new(store, DEFAULT_NAMESPACE),
        ExpansionCacheConfig::default(),
    )
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[test]
fn test_key_layout() {
    assert_eq!(
        center_key(1, date("2026-01-05"), date("2026-01-26")),
        "expand:center:1:start:2026-01-05:end:2026-01-26"
    );
    assert_eq!(
        teacher_key(7, 1, date("2026-01-05"), date("2026-01-26")),
        "expand:teacher:7:center:1:start:2026-01-05:end:2026-01-26"
    );
    let store: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new());
    let cache = CategoryCache::new(store, "timeledger");
    assert_eq!(
        cache.full_key(SCHEDULE_CATEGORY, "expand:center:1"),
        "timeledger:schedule:expand:center:1"
    );
}

#[tokio::test]
async fn test_miss_loads_then_hit_skips_loader() {
    let store = Arc::new(InMemoryCache::new());
    let cache = cache_over(store.clone());
    let loads = AtomicUsize::new(0);
    let counter = &loads;
    let key = center_key(1, date("2026-01-05"), date("2026-01-26"));

    let first = cache
        .get_or_load(key.clone(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        })
        .await
        .unwrap();
    assert!(first.is_empty());
    settle().await;
    assert_eq!(
        store.keys(),
        vec!["timeledger:schedule:expand:center:1:start:2026-01-05:end:2026-01-26".to_string()]
    );

    cache
        .get_or_load(key, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        })
        .await
        .unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_read_failure_counts_as_miss() {
    let mut store = MockCacheStore::new();
    store
        .expect_get()
        .returning(|_| Err(Error::system("connection refused")));
    store
        .expect_set_with_ttl()
        .returning(|_, _, _| Err(Error::system("connection refused")));
    let cache = cache_over(Arc::new(store));

    let sessions = cache
        .get_or_load("expand:center:1:start:a:end:b".to_string(), || async { Ok(Vec::new()) })
        .await;
    assert!(sessions.is_ok());
    settle().await;
}

#[tokio::test]
async fn test_loader_errors_propagate() {
    let cache = cache_over(Arc::new(InMemoryCache::new()));
    let err = cache
        .get_or_load("k".to_string(), || async { Err(Error::not_found("center", 9)) })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
}

#[tokio::test]
async fn test_undecodable_entry_is_dropped() {
    let store = Arc::new(InMemoryCache::new());
    store
        .set_with_ttl(
            "timeledger:schedule:k",
            "not json".to_string(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    let cache = CategoryCache::new(store.clone(), DEFAULT_NAMESPACE);
    let value: Option<Vec<ExpandedSchedule>> = cache.get_json(SCHEDULE_CATEGORY, "k").await.unwrap();
    assert!(value.is_none());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_center_invalidation_covers_teacher_views() {
    let store = Arc::new(InMemoryCache::new());
    let ttl = Duration::from_secs(60);
    for key in [
        "timeledger:schedule:expand:center:1:start:a:end:b",
        "timeledger:schedule:expand:teacher:7:center:1:start:a:end:b",
        "timeledger:schedule:expand:teacher:8:center:1:start:a:end:b",
        "timeledger:schedule:expand:center:2:start:a:end:b",
        "timeledger:schedule:expand:teacher:7:center:2:start:a:end:b",
    ] {
        store.set_with_ttl(key, "[]".to_string(), ttl).await.unwrap();
    }
    let cache = cache_over(store.clone());

    cache.invalidate_center(1).await;
    assert_eq!(
        store.keys(),
        vec![
            "timeledger:schedule:expand:center:2:start:a:end:b".to_string(),
            "timeledger:schedule:expand:teacher:7:center:2:start:a:end:b".to_string(),
        ]
    );

    cache.invalidate_teacher(7, 2).await;
    assert_eq!(
        store.keys(),
        vec!["timeledger:schedule:expand:center:2:start:a:end:b".to_string()]
    );
}

#[tokio::test]
async fn test_invalidation_failure_is_swallowed() {
    let mut store = MockCacheStore::new();
    store
        .expect_delete_by_pattern()
        .times(2)
        .returning(|_, _| Err(Error::system("down")));
    let cache = cache_over(Arc::new(store));
    // Must not panic or fail
    cache.invalidate_center(1).await;
}

#[tokio::test]
async fn test_invalidation_uses_namespaced_patterns() {
    let mut store = MockCacheStore::new();
    store
        .expect_delete_by_pattern()
        .withf(|pattern, cap| {
            *cap == 10_000
                && (pattern == "timeledger:schedule:expand:center:3:*"
                    || pattern == "timeledger:schedule:expand:teacher:*:center:3:*"
                    || pattern == "timeledger:schedule:expand:teacher:5:center:3:*")
        })
        .times(3)
        .returning(|_, _| Ok(PatternDeletion::default()));
    let cache = cache_over(Arc::new(store));
    cache.invalidate(3, &[5]).await;
}
