use super::fakes::{FakeDevices, FakeImage, Harness, RefusingBinder, cache_config, host_config};
use crate::disk::DiskDescription;
use crate::imagecache::{AcquireRequest, FileBookkeeping, ImageCacheManager};
use crate::manager::{HostServices, StorageManager};
use hostd_core::{Config, DevicePoolConfig, ImageFormat, StorageEntry, TaskContext};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

fn entry(id: &str, storage_type: &str, path: &str) -> StorageEntry {
    StorageEntry {
        id: id.to_string(),
        name: id.to_string(),
        storage_type: storage_type.to_string(),
        path: path.to_string(),
        conf: serde_json::Value::Null,
    }
}

fn config(dir: &Path) -> Config {
    let store = dir.join("store");
    std::fs::create_dir_all(&store).unwrap();
    Config {
        version: "1.0".to_string(),
        host: host_config(false),
        image_cache: cache_config(&dir.join("cache")),
        device_pool: DevicePoolConfig {
            device_prefix: "/dev/nbd".to_string(),
            max_devices: 4,
            bind_attempts: 1,
            bind_backoff_ms: 1,
        },
        storages: vec![
            entry("rbd-0", "rbd", "pool0"),
            entry("local-0", "local", store.to_str().unwrap()),
            entry("lvm-0", "lvm", "vg0"),
        ],
    }
}

async fn manager(harness: &Harness) -> (TempDir, StorageManager) {
    let dir = tempfile::tempdir().unwrap();
    let services = HostServices {
        image_tool: harness.tool.clone(),
        volumes: harness.volumes.clone(),
        block_store: Some(harness.block_store.clone()),
        fetcher: harness.fetcher.clone(),
        device_probe: Arc::new(FakeDevices { count: 2 }),
        binder: Arc::new(RefusingBinder),
        mount_base: dir.path().join("mnt"),
    };
    let manager = StorageManager::new(config(dir.path()), services);
    manager.init().await.unwrap();
    (dir, manager)
}

#[tokio::test]
async fn test_init_builds_storages_and_caches() {
    let harness = Harness::new(Vec::new());
    let (_dir, manager) = manager(&harness).await;

    let ids: Vec<String> = manager
        .storages()
        .await
        .iter()
        .map(|s| s.id().to_string())
        .collect();
    assert_eq!(ids, vec!["local-0", "lvm-0", "rbd-0"]);

    let caches: Vec<String> = manager.caches().await.into_iter().map(|(k, _)| k).collect();
    assert_eq!(caches, vec!["local", "lvm:vg0", "rbd:pool0"]);
    assert_eq!(manager.cache("lvm:vg0").await.unwrap().kind(), "lvm");
    assert!(manager.cache("rbd:other").await.err().unwrap().is_not_found());
    assert_eq!(manager.device_pool().status().await.len(), 2);
    assert!(manager.storage("missing").await.err().unwrap().is_not_found());

    manager.shutdown().await;
    assert!(manager.storages().await.is_empty());
}

#[tokio::test]
async fn test_find_disk_searches_every_storage() {
    let harness = Harness::new(Vec::new());
    let (_dir, manager) = manager(&harness).await;
    let local = manager.storage("local-0").await.unwrap();
    let desc = DiskDescription {
        disk_id: "d1".to_string(),
        size_mb: Some(64),
        ..Default::default()
    };
    local
        .create_disk_by_description(&TaskContext::new(), &desc)
        .await
        .unwrap();

    let (storage, disk) = manager.find_disk("d1").await.unwrap();
    assert_eq!(storage.id(), "local-0");
    assert_eq!(disk.id(), "d1");
    assert!(manager.find_disk("d9").await.err().unwrap().is_not_found());
}

#[tokio::test]
async fn test_reconcile_spares_images_under_live_disks() {
    let harness = Harness::new(FakeImage::bytes(ImageFormat::Qcow2, 100));
    let (dir, manager) = manager(&harness).await;
    let local = manager.storage("local-0").await.unwrap();
    let desc = DiskDescription {
        disk_id: "d1".to_string(),
        image_id: Some("img-1".to_string()),
        ..Default::default()
    };
    local
        .create_disk_by_description(&TaskContext::new(), &desc)
        .await
        .unwrap();
    let cache = manager.local_cache();
    cache.acquire(&AcquireRequest::new("img-2")).await.unwrap();
    cache.release("img-2").await.unwrap();

    assert!(manager.chain_references().await.unwrap().contains("img-1"));

    let book_path = dir.path().join("bookkeeping.json");
    std::fs::write(&book_path, br#"{"images": ["img-3"]}"#).unwrap();
    let bookkeeping = FileBookkeeping::new(book_path.clone());
    let reports = manager.reconcile_caches(&bookkeeping).await.unwrap();

    let (key, local_report) = &reports[0];
    assert_eq!(key, "local");
    assert_eq!(local_report.removed, vec!["img-2".to_string()]);
    assert_eq!(local_report.detached, vec!["img-3".to_string()]);
    let kept: Vec<String> = cache.list().into_iter().map(|i| i.id).collect();
    assert_eq!(kept, vec!["img-1"]);

    let saved: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&book_path).unwrap()).unwrap();
    assert_eq!(saved["last_report"]["detached"][0], "img-3");
}

#[tokio::test]
async fn test_reconcile_evicts_nothing_when_a_chain_cannot_be_read() {
    let harness = Harness::new(FakeImage::bytes(ImageFormat::Qcow2, 100));
    let (dir, manager) = manager(&harness).await;
    let local = manager.storage("local-0").await.unwrap();
    let desc = DiskDescription {
        disk_id: "d1".to_string(),
        image_id: Some("img-1".to_string()),
        ..Default::default()
    };
    local
        .create_disk_by_description(&TaskContext::new(), &desc)
        .await
        .unwrap();
    let template = manager.local_cache().list()[0].path.clone();
    harness.tool.fail_info.store(true, Ordering::SeqCst);

    assert!(manager.chain_references().await.is_err());

    let book_path = dir.path().join("bookkeeping.json");
    std::fs::write(&book_path, br#"{"images": ["img-3"]}"#).unwrap();
    let bookkeeping = FileBookkeeping::new(book_path);
    let reports = manager.reconcile_caches(&bookkeeping).await.unwrap();

    let (key, local_report) = &reports[0];
    assert_eq!(key, "local");
    assert!(local_report.removed.is_empty());
    assert_eq!(local_report.detached, vec!["img-3".to_string()]);
    assert!(template.exists());
    assert_eq!(manager.local_cache().list().len(), 1);
}

#[tokio::test]
async fn test_recycle_bins_are_cleaned_per_storage() {
    let harness = Harness::new(Vec::new());
    let (dir, manager) = manager(&harness).await;
    let old = dir.path().join("store").join("recycle_bin").join("19991231");
    std::fs::create_dir_all(&old).unwrap();

    assert_eq!(manager.clean_recycle_bins().await.unwrap(), 1);
    assert!(!old.exists());
}
