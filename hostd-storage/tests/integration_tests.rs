use hostd_storage::{
    DiskDescription, FileBookkeeping, ImageBookkeeping, ReconcileReport, SnapshotSource,
    StorageRegistry,
};

#[test]
fn test_builtin_registry_covers_every_backend() {
    let registry = StorageRegistry::with_builtin();
    let types = registry.types();
    for expected in ["local", "nfs", "lvm", "clvm", "slvm", "rbd", "raw"] {
        assert!(types.contains(&expected), "missing {expected}");
    }
    assert!(StorageRegistry::empty().types().is_empty());
}

#[test]
fn test_description_needs_a_source() {
    let mut desc = DiskDescription {
        disk_id: "d1".to_string(),
        size_mb: Some(0),
        ..Default::default()
    };
    assert!(desc.is_empty());

    desc.snapshot = Some(SnapshotSource {
        disk_id: "d0".to_string(),
        snapshot_id: "s1".to_string(),
    });
    assert!(!desc.is_empty());
}

#[tokio::test]
async fn test_file_bookkeeping_records_report() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("images.json");

    let bookkeeping = FileBookkeeping::new(path.clone());
    assert!(bookkeeping.referenced_images("local").await.unwrap().is_empty());

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, br#"{"images": ["img-1", "img-2"]}"#).unwrap();
    let report = ReconcileReport {
        removed: vec!["img-2".to_string()],
        detached: vec!["img-1".to_string()],
    };
    bookkeeping.report("local", &report).await.unwrap();

    let referenced = bookkeeping.referenced_images("local").await.unwrap();
    assert_eq!(referenced.len(), 1);
    assert!(referenced.contains("img-1"));
}
