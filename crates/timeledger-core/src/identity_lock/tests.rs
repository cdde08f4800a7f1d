use super::*;
use crate::error::ErrorKind;
use crate::memory::{InMemoryLockStore, InMemoryRepository};
use crate::repository::MockLockStore;

fn fast() -> IdentityLockConfig {
    IdentityLockConfig {
        ttl: Duration::from_secs(10),
        max_retries: 3,
        backoff_step: Duration::from_millis(1),
    }
}

fn profile(name: &str) -> NewTeacher {
    NewTeacher {
        name: name.to_string(),
        email: Some("amy@example.com".to_string()),
        ..NewTeacher::default()
    }
}

#[tokio::test]
async fn test_acquire_and_release() {
    let store = Arc::new(InMemoryLockStore::new());
    let lock = IdentityLock::new(store.clone(), fast());

    let guard = lock.acquire("line:U123").await.unwrap();
    assert!(guard.is_held());
    assert!(store.is_held("identity:lock:line:U123"));

    // A second caller gives up after the retries
    let err = lock.acquire("line:U123").await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::ConcurrentModified);

    guard.release().await;
    assert!(!store.is_held("identity:lock:line:U123"));
    assert!(lock.acquire("line:U123").await.unwrap().is_held());
}

#[tokio::test]
async fn test_expired_guard_keeps_successor_lock() {
    let store = Arc::new(InMemoryLockStore::new());
    let short = IdentityLockConfig {
        ttl: Duration::from_millis(20),
        ..fast()
    };
    let stale = IdentityLock::new(store.clone(), short)
        .acquire("line:U9")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let current = IdentityLock::new(store.clone(), fast())
        .acquire("line:U9")
        .await
        .unwrap();
    stale.release().await;
    assert!(store.is_held("identity:lock:line:U9"));

    current.release().await;
    assert!(!store.is_held("identity:lock:line:U9"));
}

#[tokio::test]
async fn test_release_sends_acquired_token() {
    let seen = Arc::new(std::sync::Mutex::new(String::new()));
    let mut store = MockLockStore::new();
    let recorded = seen.clone();
    store.expect_set_nx().times(1).returning(move |_, value, _| {
        *recorded.lock().unwrap() = value.to_string();
        Ok(true)
    });
    let expected = seen.clone();
    store
        .expect_release()
        .withf(move |key, value| key == "identity:lock:k" && value == *expected.lock().unwrap())
        .times(1)
        .returning(|_, _| Ok(true));
    let lock = IdentityLock::new(Arc::new(store), fast());

    let guard = lock.acquire("k").await.unwrap();
    guard.release().await;
    assert!(!seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_contention_retries_then_fails() {
    let mut store = MockLockStore::new();
    store
        .expect_set_nx()
        .withf(|key, _, ttl| key == "identity:lock:k" && *ttl == Duration::from_secs(10))
        .times(4)
        .returning(|_, _, _| Ok(false));
    let lock = IdentityLock::new(Arc::new(store), fast());

    let err = lock.acquire("k").await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::ConcurrentModified);
}

#[tokio::test]
async fn test_store_outage_is_best_effort() {
    let mut store = MockLockStore::new();
    store
        .expect_set_nx()
        .times(1)
        .returning(|_, _, _| Err(Error::system("redis down")));
    store.expect_release().never();
    let lock = IdentityLock::new(Arc::new(store), fast());

    let guard = lock.acquire("k").await.unwrap();
    assert!(!guard.is_held());
    guard.release().await;
}

#[tokio::test]
async fn test_register_creates_once() {
    let repo = Arc::new(InMemoryRepository::new());
    let registrar = IdentityRegistrar::new(
        repo.clone(),
        IdentityLock::new(Arc::new(InMemoryLockStore::new()), fast()),
    );

    let first = registrar.register(" line:U1 ", profile("Amy")).await.unwrap();
    assert!(first.created);
    assert_eq!(first.teacher.identity_handle.as_deref(), Some("line:U1"));

    let again = registrar.register("line:U1", profile("Amy B")).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.teacher.id, first.teacher.id);
}

#[tokio::test]
async fn test_concurrent_registrations_create_one_teacher() {
    let repo = Arc::new(InMemoryRepository::new());
    let registrar = IdentityRegistrar::new(
        repo.clone(),
        IdentityLock::new(Arc::new(InMemoryLockStore::new()), fast()),
    );

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let registrar = registrar.clone();
            tokio::spawn(async move { registrar.register("line:U2", profile("Ben")).await })
        })
        .collect();

    let mut created = 0;
    let mut ids = Vec::new();
    for handle in handles {
        // Callers that lose every retry see ConcurrentModified
        if let Ok(outcome) = handle.await.unwrap() {
            if outcome.created {
                created += 1;
            }
            ids.push(outcome.teacher.id);
        }
    }
    assert_eq!(created, 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn test_register_requires_handle() {
    let registrar = IdentityRegistrar::new(
        Arc::new(InMemoryRepository::new()),
        IdentityLock::new(Arc::new(InMemoryLockStore::new()), fast()),
    );
    let err = registrar.register("  ", profile("Cy")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
