use super::{
    BaseDisk, DeleteSnapshotOptions, DiskOps, exists, flatten_in_place, format_guest_fs,
    grow_guest_fs, remove_if_exists, with_suffix,
};
use crate::imagecache::AcquireRequest;
use crate::storage::BaseStorage;
use async_trait::async_trait;
use hostd_core::{DiskDescriptor, DiskState, HostdError, ImageFormat, Result, TaskContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// Suffix of the fallback file used when the primary path is unavailable.
pub const ALTERNATE_SUFFIX: &str = ".alter";

const RESET_TMP_SUFFIX: &str = "_reset.tmp";
const CONVERT_TMP_SUFFIX: &str = "_convert.tmp";
const FLATTEN_TMP_SUFFIX: &str = ".tmp";

/// A disk stored as an image file under a mounted directory. Used for both
/// local and network filesystems.
pub struct LocalDisk {
    base: BaseDisk,
    dir: PathBuf,
    alternate: AtomicBool,
}

impl LocalDisk {
    pub fn new(id: &str, storage: &Arc<BaseStorage>) -> Self {
        Self {
            base: BaseDisk::new(id, storage),
            dir: storage.path.clone(),
            alternate: AtomicBool::new(false),
        }
    }

    fn primary_path(&self) -> PathBuf {
        self.dir.join(&self.base.id)
    }

    fn alternate_path(&self) -> PathBuf {
        with_suffix(&self.primary_path(), ALTERNATE_SUFFIX)
    }

    /// Grow the image when `size_mb` exceeds it, then its filesystem.
    async fn grow_to(&self, storage: &BaseStorage, size_mb: u64) -> Result<DiskDescriptor> {
        let path = self.path();
        let info = storage.services.image_tool.info(&path).await?;
        if size_mb > info.size_mb() {
            storage.services.image_tool.resize(&path, size_mb).await?;
            info!(
                "Resized disk {} from {} MB to {} MB",
                self.base.id,
                info.size_mb(),
                size_mb
            );
            grow_guest_fs(storage, &path).await;
        }
        self.descriptor().await
    }

    async fn grow_if_requested(
        &self,
        storage: &BaseStorage,
        size_mb: Option<u64>,
    ) -> Result<DiskDescriptor> {
        let desc = self.descriptor().await?;
        match size_mb {
            Some(size) if size > desc.disk_size => self.grow_to(storage, size).await,
            _ => Ok(desc),
        }
    }

    /// Remove whatever sits at the primary path before new content lands.
    async fn clear_target(&self) -> Result<PathBuf> {
        self.alternate.store(false, Ordering::SeqCst);
        let path = self.primary_path();
        remove_if_exists(&path).await?;
        Ok(path)
    }

    async fn clone_template(
        &self,
        storage: &BaseStorage,
        backing: &Path,
        size_mb: Option<u64>,
    ) -> Result<DiskDescriptor> {
        let path = self.clear_target().await?;
        if let Err(e) = storage
            .services
            .image_tool
            .create(&path, ImageFormat::Qcow2, None, Some(backing))
            .await
        {
            discard(&path).await;
            return Err(e);
        }
        self.grow_if_requested(storage, size_mb).await
    }
}

async fn discard(path: &Path) {
    if let Err(e) = remove_if_exists(path).await {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[async_trait]
impl DiskOps for LocalDisk {
    fn base(&self) -> &BaseDisk {
        &self.base
    }

    fn disk_type(&self) -> &'static str {
        "local"
    }

    fn path(&self) -> PathBuf {
        if self.is_alternate() {
            self.alternate_path()
        } else {
            self.primary_path()
        }
    }

    fn is_alternate(&self) -> bool {
        self.alternate.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<()> {
        if exists(&self.primary_path()).await {
            self.alternate.store(false, Ordering::SeqCst);
        } else if exists(&self.alternate_path()).await {
            self.alternate.store(true, Ordering::SeqCst);
        } else {
            return Err(HostdError::not_found(
                "disk",
                self.primary_path().display().to_string(),
            ));
        }
        self.base.mark_ready();
        Ok(())
    }

    async fn descriptor(&self) -> Result<DiskDescriptor> {
        let storage = self.base.storage()?;
        let path = self.path();
        let info = storage.services.image_tool.info(&path).await?;
        Ok(DiskDescriptor {
            disk_id: self.base.id.clone(),
            disk_size: info.size_mb(),
            format: info.format,
            disk_path: path,
        })
    }

    async fn create_raw(
        &self,
        ctx: &TaskContext,
        size_mb: u64,
        format: ImageFormat,
        fs_format: Option<&str>,
        fs_uuid: Option<&str>,
    ) -> Result<DiskDescriptor> {
        if size_mb == 0 {
            return Err(HostdError::InvalidArgument(format!(
                "disk {} needs a size",
                self.base.id
            )));
        }
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Materializing)?;
        let path = self.clear_target().await?;
        if let Err(e) = storage
            .services
            .image_tool
            .create(&path, format, Some(size_mb), None)
            .await
        {
            discard(&path).await;
            return Err(e);
        }
        format_guest_fs(&storage, &path, fs_format, fs_uuid).await;
        let desc = self.descriptor().await?;
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Allocated {} disk {} of {} MB",
            format,
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
        let result = self.clone_template(&storage, &cached.path, size_mb).await;
        if let Err(e) = cache.release(&cached.id).await {
            warn!("Failed to release image {}: {}", cached.id, e);
        }
        let desc = result?;
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Cloned disk {} from image {}",
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
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Materializing)?;
        let path = self.clear_target().await?;
        if let Err(e) = storage
            .services
            .image_tool
            .convert(snapshot_path, &path, ImageFormat::Qcow2)
            .await
        {
            discard(&path).await;
            return Err(e);
        }
        let desc = self.grow_if_requested(&storage, size_mb).await?;
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Restored disk {} from {}",
            self.base.id,
            snapshot_path.display()
        );
        Ok(desc)
    }

    async fn create_from_url(
        &self,
        ctx: &TaskContext,
        url: &str,
        size_mb: Option<u64>,
    ) -> Result<DiskDescriptor> {
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Materializing)?;
        let path = self.clear_target().await?;
        let tmp = with_suffix(&path, FLATTEN_TMP_SUFFIX);
        if let Err(e) = storage.services.fetcher.fetch(url, &tmp).await {
            discard(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, &path).await?;
        let desc = self.grow_if_requested(&storage, size_mb).await?;
        transition.finish(DiskState::Ready);
        info!(task_id = %ctx.task_id, "Fetched disk {} from {}", self.base.id, url);
        Ok(desc)
    }

    async fn create_from_existing(
        &self,
        ctx: &TaskContext,
        existing: &Path,
    ) -> Result<DiskDescriptor> {
        let transition = self.base.begin(DiskState::Materializing)?;
        let path = self.clear_target().await?;
        tokio::fs::hard_link(existing, &path).await?;
        let desc = self.descriptor().await?;
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Linked disk {} to {}",
            self.base.id,
            existing.display()
        );
        Ok(desc)
    }

    async fn resize(&self, ctx: &TaskContext, size_mb: u64) -> Result<DiskDescriptor> {
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Resizing)?;
        let desc = self.grow_to(&storage, size_mb).await?;
        transition.finish(DiskState::Ready);
        info!(task_id = %ctx.task_id, "Disk {} is {} MB", self.base.id, desc.disk_size);
        Ok(desc)
    }

    async fn create_snapshot(&self, ctx: &TaskContext, snapshot_id: &str) -> Result<()> {
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Snapshotting)?;
        let active = self.path();
        let dir = storage.snapshot_dir(&self.base.id);
        tokio::fs::create_dir_all(&dir).await?;
        let snapshot = dir.join(snapshot_id);
        if exists(&snapshot).await {
            return Err(HostdError::InvalidState(format!(
                "snapshot {} of disk {} already exists",
                snapshot_id, self.base.id
            )));
        }

        tokio::fs::rename(&active, &snapshot).await?;
        if let Err(e) = storage
            .services
            .image_tool
            .create(&active, ImageFormat::Qcow2, None, Some(&snapshot))
            .await
        {
            discard(&active).await;
            if let Err(restore) = tokio::fs::rename(&snapshot, &active).await {
                error!(
                    "Disk {} lost its active image: {} could not move back: {}",
                    self.base.id,
                    snapshot.display(),
                    restore
                );
                return Err(HostdError::StorageError(format!(
                    "snapshot {snapshot_id} of disk {} failed ({e}) and rollback failed ({restore})",
                    self.base.id
                )));
            }
            return Err(HostdError::rolled_back(
                format!("snapshot {snapshot_id} of disk {}", self.base.id),
                e,
            ));
        }

        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Created snapshot {} of disk {}",
            snapshot_id,
            self.base.id
        );
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        ctx: &TaskContext,
        snapshot_id: &str,
        opts: &DeleteSnapshotOptions,
    ) -> Result<()> {
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Snapshotting)?;
        let tool = storage.services.image_tool.as_ref();
        let dir = storage.snapshot_dir(&self.base.id);

        if opts.block_stream {
            flatten_in_place(tool, &self.path(), FLATTEN_TMP_SUFFIX).await?;
        } else if let Some(convert) = &opts.convert_snapshot {
            flatten_in_place(tool, &dir.join(convert), FLATTEN_TMP_SUFFIX).await?;
        }

        if !opts.pending_delete {
            remove_if_exists(&dir.join(snapshot_id)).await?;
        }
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Deleted snapshot {} of disk {}",
            snapshot_id,
            self.base.id
        );
        Ok(())
    }

    async fn reset_from_snapshot(
        &self,
        ctx: &TaskContext,
        snapshot_id: &str,
        out_of_chain: bool,
    ) -> Result<()> {
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Snapshotting)?;
        let tool = storage.services.image_tool.as_ref();
        let snapshot = storage.snapshot_dir(&self.base.id).join(snapshot_id);
        if !exists(&snapshot).await {
            return Err(HostdError::not_found(
                "snapshot",
                snapshot.display().to_string(),
            ));
        }

        let active = self.path();
        let size_mb = tool.info(&active).await?.size_mb();
        let aside = with_suffix(&active, RESET_TMP_SUFFIX);
        tokio::fs::rename(&active, &aside).await?;

        let rebuilt = if out_of_chain {
            tool.convert(&snapshot, &active, ImageFormat::Qcow2).await
        } else {
            tool.create(&active, ImageFormat::Qcow2, Some(size_mb), Some(&snapshot))
                .await
        };
        if let Err(e) = rebuilt {
            discard(&active).await;
            if let Err(restore) = tokio::fs::rename(&aside, &active).await {
                error!(
                    "Disk {} lost its active image: {} could not move back: {}",
                    self.base.id,
                    aside.display(),
                    restore
                );
                return Err(HostdError::StorageError(format!(
                    "reset of disk {} failed ({e}) and rollback failed ({restore})",
                    self.base.id
                )));
            }
            return Err(HostdError::rolled_back(
                format!("reset of disk {} to {snapshot_id}", self.base.id),
                e,
            ));
        }

        discard(&aside).await;
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Reset disk {} to snapshot {}",
            self.base.id,
            snapshot_id
        );
        Ok(())
    }

    async fn cleanup_snapshots(
        &self,
        ctx: &TaskContext,
        convert: &[String],
        delete: &[String],
    ) -> Result<()> {
        let storage = self.base.storage()?;
        let tool = storage.services.image_tool.as_ref();
        let dir = storage.snapshot_dir(&self.base.id);
        for snapshot_id in convert {
            flatten_in_place(tool, &dir.join(snapshot_id), CONVERT_TMP_SUFFIX).await?;
        }
        for snapshot_id in delete {
            remove_if_exists(&dir.join(snapshot_id)).await?;
        }
        info!(
            task_id = %ctx.task_id,
            "Cleaned snapshots of disk {}: {} flattened, {} removed",
            self.base.id,
            convert.len(),
            delete.len()
        );
        Ok(())
    }

    async fn delete_all_snapshots(&self, _ctx: &TaskContext, skip_recycle: bool) -> Result<()> {
        let storage = self.base.storage()?;
        storage
            .delete_diskfile(&storage.snapshot_dir(&self.base.id), skip_recycle)
            .await
    }

    async fn delete(&self, ctx: &TaskContext, skip_recycle: bool) -> Result<()> {
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Deleting)?;
        storage.delete_diskfile(&self.path(), skip_recycle).await?;
        storage.unregister(&self.base.id).await;
        transition.finish(DiskState::Deleted);
        info!(task_id = %ctx.task_id, "Deleted disk {}", self.base.id);
        Ok(())
    }
}
