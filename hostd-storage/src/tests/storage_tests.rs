use super::fakes::{FakeFetcher, FakeImage, Harness, MB, cache_config, read_image, write_image};
use crate::disk::{DiskDescription, DiskOps, SnapshotSource};
use crate::imagecache::{ImageCache, ImageCacheManager, LocalFiles, RbdImages};
use crate::lvm::VolumeManager;
use crate::storage::{LocalStorage, LvmStorage, RbdStorage, StorageOps, StorageRegistry};
use hostd_core::{HostdError, ImageFormat, StorageEntry, TaskContext};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;

fn local_storage(harness: &Harness) -> (TempDir, PathBuf, LocalStorage) {
    let dir = tempfile::tempdir().unwrap();
    let config = cache_config(&dir.path().join("cache"));
    let cache: Arc<dyn ImageCacheManager> = Arc::new(ImageCache::new(
        LocalFiles::new(
            dir.path().join("cache"),
            harness.fetcher.clone(),
            harness.tool.clone(),
            &config,
        ),
        &config,
    ));
    let store = dir.path().join("store");
    std::fs::create_dir_all(&store).unwrap();
    let base = harness.base_storage("local", store.to_str().unwrap(), Some(cache));
    (dir, store, LocalStorage::new(base))
}

fn sized(disk_id: &str, size_mb: u64) -> DiskDescription {
    DiskDescription {
        disk_id: disk_id.to_string(),
        size_mb: Some(size_mb),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_description_without_source_is_rejected() {
    let harness = Harness::new(Vec::new());
    let (_dir, _store, storage) = local_storage(&harness);
    let ctx = TaskContext::new();

    let empty = DiskDescription {
        disk_id: "d1".to_string(),
        ..Default::default()
    };
    let err = storage.create_disk_by_description(&ctx, &empty).await.unwrap_err();
    assert!(matches!(err, HostdError::InvalidArgument(_)));

    let err = storage
        .create_disk_by_description(&ctx, &sized("", 10))
        .await
        .unwrap_err();
    assert!(matches!(err, HostdError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_existing_disk_needs_rebuild() {
    let harness = Harness::new(Vec::new());
    let (_dir, store, storage) = local_storage(&harness);
    let ctx = TaskContext::new();
    storage.create_disk_by_description(&ctx, &sized("d1", 10)).await.unwrap();

    let err = storage
        .create_disk_by_description(&ctx, &sized("d1", 20))
        .await
        .unwrap_err();
    assert!(matches!(err, HostdError::InvalidState(_)));

    let mut rebuild = sized("d1", 20);
    rebuild.rebuild = true;
    let created = storage.create_disk_by_description(&ctx, &rebuild).await.unwrap();
    assert_eq!(created.disk_size, 20);
    assert_eq!(read_image(&store.join("d1")).virtual_size, 20 * MB);
    assert_eq!(storage.disks().await.len(), 1);
}

#[tokio::test]
async fn test_concurrent_creates_of_one_id_admit_one() {
    let mut harness = Harness::new(Vec::new());
    harness.fetcher = Arc::new(FakeFetcher::slow(
        FakeImage::bytes(ImageFormat::Qcow2, 10),
        Duration::from_millis(200),
    ));
    let (_dir, store, storage) = local_storage(&harness);
    let storage = Arc::new(storage);
    let desc = DiskDescription {
        disk_id: "d1".to_string(),
        image_id: Some("img-1".to_string()),
        ..Default::default()
    };

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let storage = storage.clone();
            let desc = desc.clone();
            tokio::spawn(async move {
                storage
                    .create_disk_by_description(&TaskContext::new(), &desc)
                    .await
            })
        })
        .collect();
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(err, HostdError::InvalidState(_)));
    assert_eq!(harness.fetcher.calls(), 1);
    assert!(read_image(&store.join("d1")).backing.is_some());
    assert_eq!(storage.disks().await.len(), 1);
}

#[tokio::test]
async fn test_snapshot_source_wins_over_template() {
    let harness = Harness::new(FakeImage::bytes(ImageFormat::Qcow2, 10));
    let (_dir, store, storage) = local_storage(&harness);
    let ctx = TaskContext::new();
    storage.create_disk_by_description(&ctx, &sized("d1", 64)).await.unwrap();
    let d1 = storage.get_disk_by_id("d1").await.unwrap();
    d1.create_snapshot(&ctx, "s1").await.unwrap();

    let desc = DiskDescription {
        disk_id: "d2".to_string(),
        snapshot: Some(SnapshotSource {
            disk_id: "d1".to_string(),
            snapshot_id: "s1".to_string(),
        }),
        image_id: Some("img-1".to_string()),
        ..Default::default()
    };
    let created = storage.create_disk_by_description(&ctx, &desc).await.unwrap();

    assert_eq!(created.disk_size, 64);
    assert_eq!(harness.fetcher.calls(), 0);
    assert_eq!(read_image(&store.join("d2")).backing, None);
}

#[tokio::test]
async fn test_missing_snapshot_source_is_not_found() {
    let harness = Harness::new(Vec::new());
    let (_dir, _store, storage) = local_storage(&harness);
    let desc = DiskDescription {
        disk_id: "d2".to_string(),
        snapshot: Some(SnapshotSource {
            disk_id: "d1".to_string(),
            snapshot_id: "s1".to_string(),
        }),
        ..Default::default()
    };

    let err = storage
        .create_disk_by_description(&TaskContext::new(), &desc)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(storage.disks().await.is_empty());
}

#[tokio::test]
async fn test_backup_and_existing_sources() {
    let harness = Harness::new(Vec::new());
    let (dir, store, storage) = local_storage(&harness);
    let ctx = TaskContext::new();
    std::fs::create_dir_all(store.join("backups")).unwrap();
    write_image(&store.join("backups").join("b1"), ImageFormat::Qcow2, 30, None);
    std::fs::create_dir_all(store.join("import")).unwrap();
    write_image(&store.join("import").join("x"), ImageFormat::Raw, 40, None);

    let from_backup = DiskDescription {
        disk_id: "d1".to_string(),
        backup_id: Some("b1".to_string()),
        ..Default::default()
    };
    assert_eq!(
        storage
            .create_disk_by_description(&ctx, &from_backup)
            .await
            .unwrap()
            .disk_size,
        30
    );

    let linked = DiskDescription {
        disk_id: "d2".to_string(),
        existing_path: Some(store.join("import").join("x")),
        ..Default::default()
    };
    let created = storage.create_disk_by_description(&ctx, &linked).await.unwrap();
    assert_eq!(created.format, ImageFormat::Raw);
    assert_eq!(created.disk_path, store.join("d2"));

    let outside = DiskDescription {
        disk_id: "d3".to_string(),
        existing_path: Some(dir.path().join("cache").join("x")),
        ..Default::default()
    };
    let err = storage.create_disk_by_description(&ctx, &outside).await.unwrap_err();
    assert!(matches!(err, HostdError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_url_source_downloads_the_disk() {
    let harness = Harness::new(FakeImage::bytes(ImageFormat::Qcow2, 50));
    let (_dir, store, storage) = local_storage(&harness);
    let desc = DiskDescription {
        disk_id: "d1".to_string(),
        url: Some("http://images.test/d1.qcow2".to_string()),
        size_mb: Some(80),
        ..Default::default()
    };

    let created = storage
        .create_disk_by_description(&TaskContext::new(), &desc)
        .await
        .unwrap();

    assert_eq!(created.disk_size, 80);
    assert!(!store.join("d1.tmp").exists());
    assert_eq!(harness.fetcher.calls(), 1);
}

#[tokio::test]
async fn test_failed_creation_registers_nothing() {
    let harness = Harness::new(Vec::new());
    let (_dir, store, storage) = local_storage(&harness);
    harness.tool.fail_create.store(true, Ordering::SeqCst);

    assert!(storage
        .create_disk_by_description(&TaskContext::new(), &sized("d1", 10))
        .await
        .is_err());

    assert!(storage.disks().await.is_empty());
    assert!(!store.join("d1").exists());
}

#[tokio::test]
async fn test_local_media_listing_skips_bookkeeping() {
    let harness = Harness::new(Vec::new());
    let (_dir, store, storage) = local_storage(&harness);
    let ctx = TaskContext::new();
    storage.create_disk_by_description(&ctx, &sized("d1", 10)).await.unwrap();
    let d1 = storage.get_disk_by_id("d1").await.unwrap();
    d1.create_snapshot(&ctx, "s1").await.unwrap();
    write_image(&store.join("d2.alter"), ImageFormat::Raw, 10, None);
    std::fs::write(store.join("d3.tmp"), b"").unwrap();
    std::fs::write(store.join(".hidden"), b"").unwrap();

    assert_eq!(storage.disk_ids_on_media().await.unwrap(), vec!["d1", "d2"]);
}

#[tokio::test]
async fn test_recycle_bin_keeps_recent_days() {
    let harness = Harness::new(Vec::new());
    let (_dir, store, storage) = local_storage(&harness);
    let bin = store.join("recycle_bin");
    let today = chrono::Local::now().format("%Y%m%d").to_string();
    for day in ["20000101", today.as_str(), "not-a-day"] {
        std::fs::create_dir_all(bin.join(day)).unwrap();
        std::fs::write(bin.join(day).join("d1.1"), b"").unwrap();
    }

    assert_eq!(storage.base().clean_recycle_bin().await.unwrap(), 1);

    assert!(!bin.join("20000101").exists());
    assert!(bin.join(&today).exists());
    assert!(bin.join("not-a-day").exists());
}

#[tokio::test]
async fn test_local_capacity_and_access() {
    let harness = Harness::new(Vec::new());
    let (_dir, _store, storage) = local_storage(&harness);

    storage.accessible().await.unwrap();
    let capacity = storage.capacity().await.unwrap();
    assert!(capacity.total_mb > 0);
    assert!(capacity.free_mb <= capacity.total_mb);
    assert!(capacity.used_mb <= capacity.total_mb);
}

fn lvm_storage(harness: &Harness, storage_type: &str) -> LvmStorage {
    LvmStorage::new(harness.base_storage(storage_type, "vg0", None))
}

#[tokio::test]
async fn test_clustered_group_refuses_chain_operations() {
    let harness = Harness::new(Vec::new());
    let storage = lvm_storage(&harness, "clvm");
    harness.volumes.lv_create("vg0", "d1", 64 * MB).await.unwrap();
    let disk = storage.get_disk_by_id("d1").await.unwrap();
    let ctx = TaskContext::new();

    let err = disk.create_snapshot(&ctx, "s1").await.unwrap_err();
    assert!(matches!(err, HostdError::Unsupported(_)));
    let err = disk.reset_from_snapshot(&ctx, "s1", false).await.unwrap_err();
    assert!(matches!(err, HostdError::Unsupported(_)));
    assert!(harness.volumes.names("vg0").contains("d1"));
}

#[tokio::test]
async fn test_shared_group_allows_chain_operations() {
    let harness = Harness::new(Vec::new());
    let storage = lvm_storage(&harness, "slvm");
    harness.volumes.lv_create("vg0", "d1", 64 * MB).await.unwrap();
    let disk = storage.get_disk_by_id("d1").await.unwrap();
    harness.tool.fail_create.store(true, Ordering::SeqCst);

    // The snapshot is attempted and rolled back rather than refused.
    let err = disk.create_snapshot(&TaskContext::new(), "s1").await.unwrap_err();
    assert!(matches!(err, HostdError::RolledBack { .. }), "{err}");
    let names = harness.volumes.names("vg0");
    assert_eq!(names.len(), 1);
    assert!(names.contains("d1"));
}

#[tokio::test]
async fn test_lvm_storage_lists_volumes_and_capacity() {
    let harness = Harness::new(Vec::new());
    let storage = lvm_storage(&harness, "lvm");
    for name in ["d2", "d1", "snap_s1", "imagecache_img-1", "d1-reset.tmp"] {
        harness.volumes.lv_create("vg0", name, 1024 * MB).await.unwrap();
    }

    assert_eq!(storage.disk_ids_on_media().await.unwrap(), vec!["d1", "d2"]);
    assert!(storage.snapshot_exists("d1", "s1").await);
    assert!(!storage.snapshot_exists("d1", "s2").await);
    assert_eq!(storage.snapshot_path("d1", "s1"), PathBuf::from("/dev/vg0/snap_s1"));

    let capacity = storage.capacity().await.unwrap();
    assert_eq!(capacity.total_mb, 100 * 1024);
    assert_eq!(capacity.used_mb, 5 * 1024);
}

#[tokio::test]
async fn test_lvm_disk_probe_follows_the_volume_group() {
    let harness = Harness::new(Vec::new());
    let storage = lvm_storage(&harness, "lvm");

    assert!(storage.get_disk_by_id("d1").await.err().unwrap().is_not_found());
    harness.volumes.lv_create("vg0", "d1", 64 * MB).await.unwrap();
    let disk = storage.get_disk_by_id("d1").await.unwrap();
    assert_eq!(disk.path(), PathBuf::from("/dev/vg0/d1"));

    harness.volumes.lv_remove(&disk.path()).await.unwrap();
    assert!(storage.get_disk_by_id("d1").await.err().unwrap().is_not_found());
    assert!(storage.disks().await.is_empty());
}

fn rbd_storage(harness: &Harness, dir: &std::path::Path) -> RbdStorage {
    let config = cache_config(dir);
    let staging = LocalFiles::new(
        dir.join("staging"),
        harness.fetcher.clone(),
        harness.tool.clone(),
        &config,
    );
    let cache: Arc<dyn ImageCacheManager> = Arc::new(ImageCache::new(
        RbdImages::new(
            "pool0",
            harness.block_store.clone(),
            staging,
            harness.tool.clone(),
            dir.join("rbd"),
        ),
        &config,
    ));
    RbdStorage::new(harness.base_storage("rbd", "pool0", Some(cache)))
}

#[tokio::test]
async fn test_rbd_template_clone_copies_the_cached_image() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(FakeImage::bytes(ImageFormat::Raw, 300));
    let storage = rbd_storage(&harness, dir.path());
    let ctx = TaskContext::new();
    let desc = DiskDescription {
        disk_id: "d1".to_string(),
        image_id: Some("img-1".to_string()),
        size_mb: Some(1024),
        ..Default::default()
    };

    let created = storage.create_disk_by_description(&ctx, &desc).await.unwrap();

    assert_eq!(created.disk_size, 1024);
    assert_eq!(created.format, ImageFormat::Raw);
    assert!(harness.block_store.has("pool0", "image_cache_img-1"));
    assert!(harness.block_store.has("pool0", "d1"));

    let disk = storage.get_disk_by_id("d1").await.unwrap();
    disk.create_snapshot(&ctx, "s1").await.unwrap();
    let err = disk.reset_from_snapshot(&ctx, "s1", false).await.unwrap_err();
    assert!(matches!(err, HostdError::Unsupported(_)));

    storage.delete_disk(&ctx, "d1", false).await.unwrap();
    assert!(!harness.block_store.has("pool0", "d1"));
}

#[tokio::test]
async fn test_registry_dispatches_on_storage_type() {
    let harness = Harness::new(Vec::new());
    let registry = StorageRegistry::with_builtin();
    assert_eq!(
        registry.types(),
        vec!["clvm", "local", "lvm", "nfs", "raw", "rbd", "slvm"]
    );

    let entry = |storage_type: &str| StorageEntry {
        id: format!("{storage_type}-1"),
        name: storage_type.to_string(),
        storage_type: storage_type.to_string(),
        path: "/srv/disks".to_string(),
        conf: serde_json::Value::Null,
    };
    let storage = registry.build(&entry("nfs"), harness.services(None)).unwrap();
    assert_eq!(storage.storage_type(), "nfs");
    assert_eq!(storage.id(), "nfs-1");

    let err = registry
        .build(&entry("iscsi"), harness.services(None))
        .err()
        .unwrap();
    assert!(matches!(err, HostdError::Unsupported(_)));
}
