use super::{BaseStorage, StorageOps};
use crate::disk::{DiskOps, RawDeviceDisk, device_size_bytes};
use async_trait::async_trait;
use hostd_core::{HostdError, Result, StorageCapacity};
use std::sync::Arc;
use tracing::debug;

const MB: u64 = 1024 * 1024;

/// Block devices listed under one directory (for example
/// `/dev/disk/by-id`), each passed through to a guest whole.
pub struct RawDeviceStorage {
    base: Arc<BaseStorage>,
}

impl RawDeviceStorage {
    pub fn new(base: Arc<BaseStorage>) -> Self {
        Self { base }
    }
}

#[async_trait]
impl StorageOps for RawDeviceStorage {
    fn base(&self) -> &Arc<BaseStorage> {
        &self.base
    }

    fn make_disk(&self, disk_id: &str) -> Arc<dyn DiskOps> {
        Arc::new(RawDeviceDisk::new(disk_id, &self.base))
    }

    /// Devices claimed by a disk count as used.
    async fn capacity(&self) -> Result<StorageCapacity> {
        let claimed: Vec<String> = self.disks().await.iter().map(|d| d.id().to_string()).collect();
        let mut entries = tokio::fs::read_dir(&self.base.path).await?;
        let (mut total, mut used) = (0, 0);
        while let Some(entry) = entries.next_entry().await? {
            let size = match device_size_bytes(&entry.path()).await {
                Ok(size) => size / MB,
                Err(e) => {
                    debug!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            total += size;
            if claimed.iter().any(|id| entry.file_name().to_string_lossy() == id.as_str()) {
                used += size;
            }
        }
        Ok(StorageCapacity {
            total_mb: total,
            free_mb: total - used,
            used_mb: used,
        })
    }

    async fn accessible(&self) -> Result<()> {
        let meta = tokio::fs::metadata(&self.base.path).await?;
        if !meta.is_dir() {
            return Err(HostdError::StorageError(format!(
                "{} is not a directory",
                self.base.path.display()
            )));
        }
        Ok(())
    }
}
