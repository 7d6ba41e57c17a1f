use super::{BaseDisk, DeleteSnapshotOptions, DiskOps, format_guest_fs, grow_guest_fs};
use crate::imagecache::AcquireRequest;
use crate::imgtool::backing_chain;
use crate::lvm::{SNAPSHOT_LV_PREFIX, lv_path, qcow2_lv_size_mb};
use crate::storage::BaseStorage;
use async_trait::async_trait;
use hostd_core::{DiskDescriptor, DiskState, HostdError, ImageFormat, Result, TaskContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const MB: u64 = 1024 * 1024;
const RESET_TMP_SUFFIX: &str = "-reset.tmp";
const CONVERT_TMP_SUFFIX: &str = "-convert.tmp";

/// A qcow2 image written straight onto a logical volume in the group
/// named by the storage path.
pub struct LvmDisk {
    base: BaseDisk,
    vg: String,
    /// Clustered groups cannot rename volumes under a running guest, so
    /// they keep no chain.
    chain_snapshots: bool,
}

pub fn snapshot_lv_name(snapshot_id: &str) -> String {
    format!("{SNAPSHOT_LV_PREFIX}{snapshot_id}")
}

impl LvmDisk {
    pub fn new(id: &str, storage: &Arc<BaseStorage>, chain_snapshots: bool) -> Self {
        Self {
            base: BaseDisk::new(id, storage),
            vg: storage.path.to_string_lossy().trim_start_matches("/dev/").to_string(),
            chain_snapshots,
        }
    }

    fn lv(&self, name: &str) -> PathBuf {
        lv_path(&self.vg, name)
    }

    fn require_chain(&self, what: &str) -> Result<()> {
        if self.chain_snapshots {
            return Ok(());
        }
        Err(HostdError::Unsupported(format!(
            "{what} on clustered volume group {}",
            self.vg
        )))
    }

    async fn volume_exists(&self, storage: &BaseStorage, name: &str) -> Result<bool> {
        let names = storage.services.volumes.lv_names(&self.vg).await?;
        Ok(names.iter().any(|n| n == name))
    }

    /// Replace whatever volume holds this id with a fresh one of `size_mb`.
    async fn fresh_volume(&self, storage: &BaseStorage, size_mb: u64) -> Result<PathBuf> {
        let volumes = &storage.services.volumes;
        let path = self.path();
        if self.volume_exists(storage, &self.base.id).await? {
            volumes.lv_remove(&path).await?;
        }
        volumes.lv_create(&self.vg, &self.base.id, size_mb * MB).await?;
        Ok(path)
    }

    async fn drop_volume(&self, storage: &BaseStorage, path: &Path) {
        if let Err(e) = storage.services.volumes.lv_remove(path).await {
            warn!("Failed to remove volume {}: {}", path.display(), e);
        }
    }

    async fn grow_to(&self, storage: &BaseStorage, size_mb: u64) -> Result<DiskDescriptor> {
        let path = self.path();
        let info = storage.services.image_tool.info(&path).await?;
        if size_mb > info.size_mb() {
            let lv_mb = if info.format == ImageFormat::Qcow2 {
                qcow2_lv_size_mb(size_mb)
            } else {
                size_mb
            };
            storage.services.volumes.lv_resize(&path, lv_mb * MB).await?;
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

    /// Write a flattened copy of `src` onto a fresh volume for this disk.
    async fn copy_onto_volume(
        &self,
        storage: &BaseStorage,
        src: &Path,
        size_mb: Option<u64>,
    ) -> Result<DiskDescriptor> {
        let src_mb = storage.services.image_tool.info(src).await?.size_mb();
        let path = self.fresh_volume(storage, qcow2_lv_size_mb(src_mb)).await?;
        if let Err(e) = storage
            .services
            .image_tool
            .convert(src, &path, ImageFormat::Qcow2)
            .await
        {
            self.drop_volume(storage, &path).await;
            return Err(e);
        }
        self.grow_if_requested(storage, size_mb).await
    }

    /// Flatten the volume `name` in place through a temporary volume.
    async fn flatten_volume(&self, storage: &BaseStorage, name: &str) -> Result<()> {
        let volumes = &storage.services.volumes;
        let src = self.lv(name);
        let tmp_name = format!("{name}{CONVERT_TMP_SUFFIX}");
        let tmp = self.lv(&tmp_name);
        let size = volumes.lv_size(&src).await?;
        if self.volume_exists(storage, &tmp_name).await? {
            volumes.lv_remove(&tmp).await?;
        }
        volumes.lv_create(&self.vg, &tmp_name, size).await?;
        if let Err(e) = storage
            .services
            .image_tool
            .convert(&src, &tmp, ImageFormat::Qcow2)
            .await
        {
            self.drop_volume(storage, &tmp).await;
            return Err(e);
        }
        volumes.lv_remove(&src).await?;
        volumes.lv_rename(&self.vg, &tmp_name, name).await?;
        Ok(())
    }

    /// Undo a half-built replacement: drop the new volume and move the
    /// original back under this disk's name.
    async fn restore_volume(
        &self,
        storage: &BaseStorage,
        aside: &str,
        what: &str,
        cause: HostdError,
    ) -> HostdError {
        let volumes = &storage.services.volumes;
        let path = self.path();
        if matches!(self.volume_exists(storage, &self.base.id).await, Ok(true)) {
            self.drop_volume(storage, &path).await;
        }
        if let Err(restore) = volumes.lv_rename(&self.vg, aside, &self.base.id).await {
            error!(
                "Disk {} lost its active volume: {} could not move back: {}",
                self.base.id, aside, restore
            );
            return HostdError::StorageError(format!(
                "{what} of disk {} failed ({cause}) and rollback failed ({restore})",
                self.base.id
            ));
        }
        HostdError::rolled_back(format!("{what} of disk {}", self.base.id), cause)
    }
}

#[async_trait]
impl DiskOps for LvmDisk {
    fn base(&self) -> &BaseDisk {
        &self.base
    }

    fn disk_type(&self) -> &'static str {
        "lvm"
    }

    fn path(&self) -> PathBuf {
        self.lv(&self.base.id)
    }

    async fn probe(&self) -> Result<()> {
        let storage = self.base.storage()?;
        if !self.volume_exists(&storage, &self.base.id).await? {
            return Err(HostdError::not_found(
                "volume",
                self.path().display().to_string(),
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
        _format: ImageFormat,
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
        let path = self.fresh_volume(&storage, qcow2_lv_size_mb(size_mb)).await?;
        if let Err(e) = storage
            .services
            .image_tool
            .create(&path, ImageFormat::Qcow2, Some(size_mb), None)
            .await
        {
            self.drop_volume(&storage, &path).await;
            return Err(e);
        }
        format_guest_fs(&storage, &path, fs_format, fs_uuid).await;
        let desc = self.descriptor().await?;
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Allocated volume disk {} of {} MB",
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
            let lv_mb = qcow2_lv_size_mb(cached.desc.size_mb.max(size_mb.unwrap_or(0)));
            let path = self.fresh_volume(&storage, lv_mb).await?;
            if let Err(e) = storage
                .services
                .image_tool
                .create(&path, ImageFormat::Qcow2, None, Some(&cached.path))
                .await
            {
                self.drop_volume(&storage, &path).await;
                return Err(e);
            }
            self.grow_if_requested(&storage, size_mb).await
        }
        .await;
        if let Err(e) = cache.release(&cached.id).await {
            warn!("Failed to release image {}: {}", cached.id, e);
        }
        let desc = result?;
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Cloned volume disk {} from image {}",
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
        let desc = self.copy_onto_volume(&storage, snapshot_path, size_mb).await?;
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Restored volume disk {} from {}",
            self.base.id,
            snapshot_path.display()
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
        self.require_chain("snapshot")?;
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Snapshotting)?;
        let volumes = &storage.services.volumes;
        let snap_name = snapshot_lv_name(snapshot_id);
        let snap_path = self.lv(&snap_name);
        if self.volume_exists(&storage, &snap_name).await? {
            return Err(HostdError::InvalidState(format!(
                "snapshot {} of disk {} already exists",
                snapshot_id, self.base.id
            )));
        }

        let size = volumes.lv_size(&self.path()).await?;
        volumes.lv_rename(&self.vg, &self.base.id, &snap_name).await?;
        let rebuilt = async {
            volumes.lv_create(&self.vg, &self.base.id, size).await?;
            storage
                .services
                .image_tool
                .create(&self.path(), ImageFormat::Qcow2, None, Some(&snap_path))
                .await
        }
        .await;
        if let Err(e) = rebuilt {
            return Err(self
                .restore_volume(&storage, &snap_name, &format!("snapshot {snapshot_id}"), e)
                .await);
        }

        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Created volume snapshot {} of disk {}",
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
        self.require_chain("snapshot delete")?;
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Snapshotting)?;
        if opts.block_stream {
            self.flatten_volume(&storage, &self.base.id).await?;
        } else if let Some(convert) = &opts.convert_snapshot {
            self.flatten_volume(&storage, &snapshot_lv_name(convert)).await?;
        }

        let snap_name = snapshot_lv_name(snapshot_id);
        if !opts.pending_delete && self.volume_exists(&storage, &snap_name).await? {
            let snap_path = self.lv(&snap_name);
            storage.services.volumes.lv_remove(&snap_path).await?;
        }
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Deleted volume snapshot {} of disk {}",
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
        self.require_chain("snapshot reset")?;
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Snapshotting)?;
        let volumes = &storage.services.volumes;
        let tool = &storage.services.image_tool;
        let snap_name = snapshot_lv_name(snapshot_id);
        let snap_path = self.lv(&snap_name);
        if !self.volume_exists(&storage, &snap_name).await? {
            return Err(HostdError::not_found(
                "snapshot",
                snap_path.display().to_string(),
            ));
        }

        let active = self.path();
        let size = volumes.lv_size(&active).await?;
        let size_mb = tool.info(&active).await?.size_mb();
        let aside = format!("{}{RESET_TMP_SUFFIX}", self.base.id);
        volumes.lv_rename(&self.vg, &self.base.id, &aside).await?;

        let rebuilt = async {
            volumes.lv_create(&self.vg, &self.base.id, size).await?;
            if out_of_chain {
                tool.convert(&snap_path, &active, ImageFormat::Qcow2).await
            } else {
                tool.create(&active, ImageFormat::Qcow2, Some(size_mb), Some(&snap_path))
                    .await
            }
        }
        .await;
        if let Err(e) = rebuilt {
            return Err(self
                .restore_volume(&storage, &aside, &format!("reset to {snapshot_id}"), e)
                .await);
        }

        self.drop_volume(&storage, &self.lv(&aside)).await;
        transition.finish(DiskState::Ready);
        info!(
            task_id = %ctx.task_id,
            "Reset volume disk {} to snapshot {}",
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
        self.require_chain("snapshot cleanup")?;
        let storage = self.base.storage()?;
        for snapshot_id in convert {
            self.flatten_volume(&storage, &snapshot_lv_name(snapshot_id)).await?;
        }
        for snapshot_id in delete {
            let name = snapshot_lv_name(snapshot_id);
            if self.volume_exists(&storage, &name).await? {
                storage.services.volumes.lv_remove(&self.lv(&name)).await?;
            }
        }
        info!(
            task_id = %ctx.task_id,
            "Cleaned volume snapshots of disk {}: {} flattened, {} removed",
            self.base.id,
            convert.len(),
            delete.len()
        );
        Ok(())
    }

    /// Remove every snapshot volume reachable from the active image's chain.
    async fn delete_all_snapshots(&self, ctx: &TaskContext, _skip_recycle: bool) -> Result<()> {
        if !self.chain_snapshots {
            return Ok(());
        }
        let storage = self.base.storage()?;
        let chain = backing_chain(storage.services.image_tool.as_ref(), &self.path()).await?;
        let snap_prefix = self.lv(SNAPSHOT_LV_PREFIX);
        let mut removed = 0;
        for link in chain.iter().skip(1) {
            if link.to_string_lossy().starts_with(&*snap_prefix.to_string_lossy()) {
                storage.services.volumes.lv_remove(link).await?;
                removed += 1;
            }
        }
        info!(
            task_id = %ctx.task_id,
            "Removed {} snapshot volumes of disk {}",
            removed,
            self.base.id
        );
        Ok(())
    }

    async fn delete(&self, ctx: &TaskContext, _skip_recycle: bool) -> Result<()> {
        let storage = self.base.storage()?;
        let transition = self.base.begin(DiskState::Deleting)?;
        if self.volume_exists(&storage, &self.base.id).await? {
            storage.services.volumes.lv_remove(&self.path()).await?;
        }
        storage.unregister(&self.base.id).await;
        transition.finish(DiskState::Deleted);
        info!(task_id = %ctx.task_id, "Deleted volume disk {}", self.base.id);
        Ok(())
    }
}
