use super::{BaseDisk, DeleteSnapshotOptions, DiskOps, exists};
use crate::imagecache::AcquireRequest;
use crate::storage::BaseStorage;
use async_trait::async_trait;
use hostd_core::{DiskDescriptor, DiskState, HostdError, ImageFormat, Result, TaskContext};
use hostd_platform::run_tool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const MB: u64 = 1024 * 1024;

pub(crate) async fn device_size_bytes(device: &Path) -> Result<u64> {
    let d = device.to_string_lossy().into_owned();
    let out = run_tool("blockdev", ["--getsize64", d.as_str()], &format!("size of {d}")).await?;
    out.trim()
        .parse()
        .map_err(|e| HostdError::tool("blockdev", format!("size of {d}"), format!("{out:?}: {e}")))
}

/// A host block device handed to the guest as is. Its size is fixed and
/// it has no chain.
pub struct RawDeviceDisk {
    base: BaseDisk,
    dir: PathBuf,
}

impl RawDeviceDisk {
    pub fn new(id: &str, storage: &Arc<BaseStorage>) -> Self {
        Self {
            base: BaseDisk::new(id, storage),
            dir: storage.path.clone(),
        }
    }

    fn unsupported(&self, what: &str) -> HostdError {
        HostdError::Unsupported(format!("{what} of raw device disk {}", self.base.id))
    }
}

#[async_trait]
impl DiskOps for RawDeviceDisk {
    fn base(&self) -> &BaseDisk {
        &self.base
    }

    fn disk_type(&self) -> &'static str {
        "raw"
    }

    fn path(&self) -> PathBuf {
        self.dir.join(&self.base.id)
    }

    async fn probe(&self) -> Result<()> {
        let path = self.path();
        if !exists(&path).await {
            return Err(HostdError::not_found("device", path.display().to_string()));
        }
        self.base.mark_ready();
        Ok(())
    }

    async fn descriptor(&self) -> Result<DiskDescriptor> {
        let path = self.path();
        Ok(DiskDescriptor {
            disk_id: self.base.id.clone(),
            disk_size: device_size_bytes(&path).await? / MB,
            format: ImageFormat::Raw,
            disk_path: path,
        })
    }

    /// Claims the device when it is at least `size_mb` large.
    async fn create_raw(
        &self,
        ctx: &TaskContext,
        size_mb: u64,
        _format: ImageFormat,
        _fs_format: Option<&str>,
        _fs_uuid: Option<&str>,
    ) -> Result<DiskDescriptor> {
        let transition = self.base.begin(DiskState::Materializing)?;
        self.probe().await?;
        let desc = self.descriptor().await?;
        if desc.disk_size < size_mb {
            return Err(HostdError::InvalidArgument(format!(
                "device {} has {} MB, {} MB requested",
                desc.disk_path.display(),
                desc.disk_size,
                size_mb
            )));
        }
        transition.finish(DiskState::Ready);
        info!(task_id = %ctx.task_id, "Claimed raw device disk {}", self.base.id);
        Ok(desc)
    }

    async fn create_from_template(
        &self,
        _ctx: &TaskContext,
        _template: &AcquireRequest,
        _size_mb: Option<u64>,
    ) -> Result<DiskDescriptor> {
        Err(self.unsupported("template clone"))
    }

    async fn create_from_snapshot(
        &self,
        _ctx: &TaskContext,
        _snapshot_path: &Path,
        _size_mb: Option<u64>,
    ) -> Result<DiskDescriptor> {
        Err(self.unsupported("restore"))
    }

    async fn resize(&self, _ctx: &TaskContext, _size_mb: u64) -> Result<DiskDescriptor> {
        Err(self.unsupported("resize"))
    }

    async fn create_snapshot(&self, _ctx: &TaskContext, _snapshot_id: &str) -> Result<()> {
        Err(self.unsupported("snapshot"))
    }

    async fn delete_snapshot(
        &self,
        _ctx: &TaskContext,
        _snapshot_id: &str,
        _opts: &DeleteSnapshotOptions,
    ) -> Result<()> {
        Err(self.unsupported("snapshot delete"))
    }

    async fn reset_from_snapshot(
        &self,
        _ctx: &TaskContext,
        _snapshot_id: &str,
        _out_of_chain: bool,
    ) -> Result<()> {
        Err(self.unsupported("snapshot reset"))
    }

    async fn cleanup_snapshots(
        &self,
        _ctx: &TaskContext,
        _convert: &[String],
        _delete: &[String],
    ) -> Result<()> {
        Ok(())
    }

    async fn delete_all_snapshots(&self, _ctx: &TaskContext, _skip_recycle: bool) -> Result<()> {
        Ok(())
    }

    /// Releases the device; its content is left alone.
    async fn delete(&self, ctx: &TaskContext, _skip_recycle: bool) -> Result<()> {
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Deleting)?;
        storage.unregister(&self.base.id).await;
        transition.finish(DiskState::Deleted);
        info!(task_id = %ctx.task_id, "Released raw device disk {}", self.base.id);
        Ok(())
    }
}
