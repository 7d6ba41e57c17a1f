use super::{BaseDisk, DeleteSnapshotOptions, DiskOps};
use crate::imagecache::AcquireRequest;
use crate::rbd::BlockStoreClient;
use crate::storage::BaseStorage;
use async_trait::async_trait;
use hostd_core::{DiskDescriptor, DiskState, HostdError, ImageFormat, Result, TaskContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A native image in a distributed block store pool. The store keeps its
/// own point-in-time copies, so chain operations are no-ops here.
pub struct RbdDisk {
    base: BaseDisk,
    pool: String,
    client: Arc<dyn BlockStoreClient>,
}

impl RbdDisk {
    pub fn new(id: &str, storage: &Arc<BaseStorage>, client: Arc<dyn BlockStoreClient>) -> Self {
        Self {
            base: BaseDisk::new(id, storage),
            pool: storage.path.to_string_lossy().into_owned(),
            client,
        }
    }

    async fn grow_to(&self, size_mb: u64) -> Result<DiskDescriptor> {
        let current = self.client.size_mb(&self.pool, &self.base.id).await?;
        if size_mb > current {
            self.client.resize(&self.pool, &self.base.id, size_mb).await?;
            info!(
                "Resized rbd disk {} from {} MB to {} MB",
                self.base.id, current, size_mb
            );
        }
        self.descriptor().await
    }

    async fn clear_target(&self) -> Result<()> {
        if self.client.exists(&self.pool, &self.base.id).await? {
            self.client.remove(&self.pool, &self.base.id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DiskOps for RbdDisk {
    fn base(&self) -> &BaseDisk {
        &self.base
    }

    fn disk_type(&self) -> &'static str {
        "rbd"
    }

    fn path(&self) -> PathBuf {
        PathBuf::new()
    }

    async fn probe(&self) -> Result<()> {
        if !self.client.exists(&self.pool, &self.base.id).await? {
            return Err(HostdError::not_found(
                "rbd image",
                format!("{}/{}", self.pool, self.base.id),
            ));
        }
        self.base.mark_ready();
        Ok(())
    }

    async fn descriptor(&self) -> Result<DiskDescriptor> {
        Ok(DiskDescriptor {
            disk_id: self.base.id.clone(),
            disk_size: self.client.size_mb(&self.pool, &self.base.id).await?,
            format: ImageFormat::Raw,
            disk_path: self.path(),
        })
    }

    async fn create_raw(
        &self,
        ctx: &TaskContext,
        size_mb: u64,
        _format: ImageFormat,
        fs_format: Option<&str>,
        _fs_uuid: Option<&str>,
    ) -> Result<DiskDescriptor> {
        if size_mb == 0 {
            return Err(HostdError::InvalidArgument(format!(
                "disk {} needs a size",
                self.base.id
            )));
        }
        let transition = self.base.begin(DiskState::Materializing)?;
        self.clear_target().await?;
        self.client.create(&self.pool, &self.base.id, size_mb).await?;
        if let Some(fs) = fs_format {
            debug!("Not formatting rbd disk {} as {}", self.base.id, fs);
        }
        let desc = self.descriptor().await?;
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Allocated rbd disk {}/{} of {} MB",
            self.pool,
            self.base.id,
            size_mb
        );
        Ok(desc)
    }

    async fn create_from_template(
        &self,
        ctx: &TaskContext,
        template: &AcquireRequest,
        size_mb: Option<u64>,
    ) -> Result<DiskDescriptor> {
        let storage = self.base.storage()?;
        let cache = storage.image_cache()?.clone();
        let transition = self.base.begin(DiskState::Materializing)?;
        let cached = cache.acquire(template).await?;
        let result = async {
            self.clear_target().await?;
            let src = cached.path.to_string_lossy();
            self.client.copy(&self.pool, &src, &self.base.id).await?;
            match size_mb {
                Some(size) => self.grow_to(size).await,
                None => self.descriptor().await,
            }
        }
        .await;
        if let Err(e) = cache.release(&cached.id).await {
            warn!("Failed to release image {}: {}", cached.id, e);
        }
        let desc = result?;
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Cloned rbd disk {} from image {}",
            self.base.id,
            cached.id
        );
        Ok(desc)
    }

    async fn create_from_snapshot(
        &self,
        ctx: &TaskContext,
        snapshot_path: &Path,
        size_mb: Option<u64>,
    ) -> Result<DiskDescriptor> {
        let transition = self.base.begin(DiskState::Materializing)?;
        self.clear_target().await?;
        self.client
            .import(snapshot_path, &self.pool, &self.base.id)
            .await?;
        let desc = match size_mb {
            Some(size) => self.grow_to(size).await?,
            None => self.descriptor().await?,
        };
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Imported rbd disk {} from {}",
            self.base.id,
            snapshot_path.display()
        );
        Ok(desc)
    }

    async fn resize(&self, ctx: &TaskContext, size_mb: u64) -> Result<DiskDescriptor> {
        let transition = self.base.begin(DiskState::Resizing)?;
        let desc = self.grow_to(size_mb).await?;
        transition.finish(DiskState::Ready);
        info!(task_id = %ctx.task_id, "Disk {} is {} MB", self.base.id, desc.disk_size);
        Ok(desc)
    }

    async fn create_snapshot(&self, _ctx: &TaskContext, snapshot_id: &str) -> Result<()> {
        debug!("Snapshot {} of rbd disk {} is store-managed", snapshot_id, self.base.id);
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        _ctx: &TaskContext,
        snapshot_id: &str,
        _opts: &DeleteSnapshotOptions,
    ) -> Result<()> {
        debug!("Snapshot {} of rbd disk {} is store-managed", snapshot_id, self.base.id);
        Ok(())
    }

    async fn reset_from_snapshot(
        &self,
        _ctx: &TaskContext,
        snapshot_id: &str,
        _out_of_chain: bool,
    ) -> Result<()> {
        Err(HostdError::Unsupported(format!(
            "reset of rbd disk {} to {snapshot_id}",
            self.base.id
        )))
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

    async fn delete(&self, ctx: &TaskContext, _skip_recycle: bool) -> Result<()> {
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Deleting)?;
        if self.client.exists(&self.pool, &self.base.id).await? {
            self.client.remove(&self.pool, &self.base.id).await?;
        }
        storage.unregister(&self.base.id).await;
        transition.finish(DiskState::Deleted);
        info!(task_id = %ctx.task_id, "Deleted rbd disk {}/{}", self.pool, self.base.id);
        Ok(())
    }
}
