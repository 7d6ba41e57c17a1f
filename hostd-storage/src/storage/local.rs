use super::{BaseStorage, StorageOps, capacity_from_bytes};
use crate::disk::{ALTERNATE_SUFFIX, DiskOps, LocalDisk};
use async_trait::async_trait;
use hostd_core::{HostdError, Result, STORAGE_TYPE_NFS, StorageCapacity};
use hostd_platform::{run_tool, run_tool_status};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const ACCESS_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_FILE: &str = ".hostd-access-probe";

/// Image files under a mounted directory: a local filesystem, or an NFS
/// export mounted on demand.
pub struct LocalStorage {
    base: Arc<BaseStorage>,
}

impl LocalStorage {
    pub fn new(base: Arc<BaseStorage>) -> Self {
        Self { base }
    }

    fn is_nfs(&self) -> bool {
        self.base.storage_type == STORAGE_TYPE_NFS
    }

    /// Mount the export named by `nfs_host` and `nfs_shared_dir` unless the
    /// path is already a mount point.
    async fn ensure_mounted(&self) -> Result<()> {
        let path = self.base.path.to_string_lossy().into_owned();
        if run_tool_status("mountpoint", ["-q", path.as_str()]).await?.success() {
            return Ok(());
        }
        let conf = &self.base.conf;
        let (Some(host), Some(dir)) = (
            conf.get("nfs_host").and_then(|v| v.as_str()),
            conf.get("nfs_shared_dir").and_then(|v| v.as_str()),
        ) else {
            return Err(HostdError::ConfigError(format!(
                "nfs storage {} is not mounted and has no export configured",
                self.base.id
            )));
        };
        tokio::fs::create_dir_all(&self.base.path).await?;
        let export = format!("{host}:{dir}");
        run_tool(
            "mount",
            ["-t", "nfs", export.as_str(), path.as_str()],
            &format!("mount {export}"),
        )
        .await?;
        info!("Mounted {} at {}", export, path);
        Ok(())
    }

    async fn check_writable(&self) -> Result<()> {
        if self.is_nfs() {
            self.ensure_mounted().await?;
        }
        tokio::fs::create_dir_all(&self.base.path).await?;
        let meta = tokio::fs::metadata(&self.base.path).await?;
        if !meta.is_dir() {
            return Err(HostdError::StorageError(format!(
                "{} is not a directory",
                self.base.path.display()
            )));
        }
        let probe = self.base.path.join(PROBE_FILE);
        tokio::fs::write(&probe, b"").await?;
        tokio::fs::remove_file(&probe).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageOps for LocalStorage {
    fn base(&self) -> &Arc<BaseStorage> {
        &self.base
    }

    fn make_disk(&self, disk_id: &str) -> Arc<dyn DiskOps> {
        Arc::new(LocalDisk::new(disk_id, &self.base))
    }

    fn probe_on_create(&self) -> bool {
        false
    }

    async fn capacity(&self) -> Result<StorageCapacity> {
        let stat = nix::sys::statvfs::statvfs(&self.base.path).map_err(|e| {
            HostdError::StorageError(format!("statvfs {}: {e}", self.base.path.display()))
        })?;
        let block = stat.fragment_size() as u64;
        Ok(capacity_from_bytes(
            stat.blocks() as u64 * block,
            stat.blocks_available() as u64 * block,
        ))
    }

    async fn accessible(&self) -> Result<()> {
        tokio::time::timeout(ACCESS_TIMEOUT, self.check_writable())
            .await
            .map_err(|_| {
                HostdError::StorageError(format!(
                    "storage {} did not answer within {}s",
                    self.base.id,
                    ACCESS_TIMEOUT.as_secs()
                ))
            })?
    }

    /// Regular files directly under the storage path. Bookkeeping
    /// directories, hidden files and temporaries are skipped.
    async fn disk_ids_on_media(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.base.path).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name.ends_with(".tmp") {
                continue;
            }
            let id = name.strip_suffix(ALTERNATE_SUFFIX).unwrap_or(&name).to_string();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
