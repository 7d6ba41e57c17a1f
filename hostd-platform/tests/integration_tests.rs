use async_trait::async_trait;
use hostd_core::{DevicePoolConfig, HostdError, Result};
use hostd_platform::{BlockBinder, DevicePool, DeviceProbe, GuestDiskMounter, GuestFsOps};
use std::path::Path;
use std::sync::Arc;

struct AllBusy;

#[async_trait]
impl DeviceProbe for AllBusy {
    async fn exists(&self, _device: &str) -> bool {
        true
    }

    async fn is_busy(&self, _device: &str) -> bool {
        true
    }
}

struct NeverBinds;

#[async_trait]
impl BlockBinder for NeverBinds {
    async fn connect(&self, _device: &str, _image: &Path, _read_only: bool) -> Result<()> {
        panic!("connect must not be reached without a slot");
    }

    async fn disconnect(&self, _device: &str) -> Result<()> {
        Ok(())
    }

    async fn partitions(&self, _device: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

fn mounter() -> GuestDiskMounter {
    let config = DevicePoolConfig {
        device_prefix: "/dev/nbd".to_string(),
        max_devices: 4,
        bind_attempts: 3,
        bind_backoff_ms: 1,
    };
    let pool = Arc::new(DevicePool::with_probe(
        &config.device_prefix,
        config.max_devices,
        Arc::new(AllBusy),
    ));
    GuestDiskMounter::new(pool, Arc::new(NeverBinds), &config, std::env::temp_dir())
}

#[tokio::test]
async fn test_mount_root_on_exhausted_pool_is_retryable() {
    let mounter = mounter();
    assert_eq!(mounter.pool().init().await.unwrap(), 4);

    let err = mounter
        .mount_root(Path::new("/data/disk-1"), false)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, HostdError::ResourceExhausted { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_format_rejects_unsupported_fs_before_binding() {
    let mounter = mounter();
    mounter.pool().init().await.unwrap();
    let err = mounter
        .format_fs(Path::new("/data/disk-1"), "ntfs", None)
        .await
        .unwrap_err();
    assert!(matches!(err, HostdError::InvalidArgument(_)));
}
