use super::fakes::FakeProbe;
use crate::nbd_pool::DevicePool;
use hostd_core::HostdError;
use std::collections::HashSet;
use std::sync::Arc;

async fn pool_with(devices: usize, max: usize) -> (Arc<DevicePool>, Arc<FakeProbe>) {
    let probe = Arc::new(FakeProbe::with_devices(devices));
    let pool = Arc::new(DevicePool::with_probe("/dev/nbd", max, probe.clone()));
    pool.init().await.unwrap();
    (pool, probe)
}

#[tokio::test]
async fn test_init_counts_present_device_nodes() {
    let (pool, _) = pool_with(4, 16).await;
    assert_eq!(pool.status().await.len(), 4);

    let (pool, _) = pool_with(8, 2).await;
    assert_eq!(pool.status().await.len(), 2);
}

#[tokio::test]
async fn test_allocate_returns_distinct_slots() {
    let (pool, _) = pool_with(3, 16).await;
    let a = pool.allocate().await.unwrap();
    let b = pool.allocate().await.unwrap();
    assert_ne!(a, b);

    pool.release(&a).await.unwrap();
    assert_eq!(pool.allocate().await.as_deref(), Some(a.as_str()));
}

#[tokio::test]
async fn test_externally_busy_slots_are_skipped() {
    let (pool, probe) = pool_with(2, 16).await;
    probe.mark_external("/dev/nbd0");
    assert_eq!(pool.allocate().await.as_deref(), Some("/dev/nbd1"));
}

#[tokio::test]
async fn test_exhausted_pool_returns_none_without_blocking() {
    let (pool, probe) = pool_with(2, 16).await;
    probe.mark_external("/dev/nbd0");
    pool.allocate().await.unwrap();

    let next = tokio::time::timeout(std::time::Duration::from_millis(200), pool.allocate())
        .await
        .expect("allocate must not block");
    assert!(next.is_none());

    let err = pool.acquire().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, HostdError::ResourceExhausted { .. }));
}

#[tokio::test]
async fn test_concurrent_allocations_are_exclusive() {
    let (pool, _) = pool_with(16, 16).await;
    let mut handles = Vec::new();
    for _ in 0..24 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move { pool.allocate().await }));
    }

    let mut granted = Vec::new();
    for handle in handles {
        if let Some(slot) = handle.await.unwrap() {
            granted.push(slot);
        }
    }
    assert_eq!(granted.len(), 16);
    let unique: HashSet<_> = granted.iter().collect();
    assert_eq!(unique.len(), granted.len());
}

#[tokio::test]
async fn test_release_unknown_slot_is_not_found() {
    let (pool, _) = pool_with(1, 16).await;
    assert!(pool.release("/dev/nbd9").await.unwrap_err().is_not_found());
}
