//! Storages own the disks of one backend and decide how a new disk is built.

mod local;
mod lvm;
mod raw;
mod rbd;
mod registry;

pub use local::LocalStorage;
pub use lvm::LvmStorage;
pub use raw::RawDeviceStorage;
pub use rbd::RbdStorage;
pub use registry::{StorageFactory, StorageRegistry};

use crate::disk::{DiskDescription, DiskOps, exists};
use crate::imagecache::{ImageCacheManager, ImageFetcher};
use crate::imgtool::ImageTool;
use crate::lvm::VolumeManager;
use crate::rbd::BlockStoreClient;
use async_trait::async_trait;
use chrono::{Local, NaiveDate, Utc};
use hostd_core::{
    DiskDescriptor, HostConfig, HostdError, ImageFormat, KeyGuard, KeyedLocks, Result,
    StorageCapacity, StorageEntry, TaskContext,
};
use hostd_platform::GuestFsOps;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const RECYCLE_BIN_DIR: &str = "recycle_bin";
pub const BACKUPS_DIR: &str = "backups";
pub const SNAPSHOTS_DIR: &str = "snapshots";

const RECYCLE_DAY_FORMAT: &str = "%Y%m%d";

/// Collaborators a storage drives. Cloned into every storage built from
/// the same host configuration.
#[derive(Clone)]
pub struct StorageServices {
    pub image_tool: Arc<dyn ImageTool>,
    pub volumes: Arc<dyn VolumeManager>,
    /// Overrides the command-line client built from a storage's `conf`.
    pub block_store: Option<Arc<dyn BlockStoreClient>>,
    /// Filesystem steps are skipped when absent.
    pub guest_fs: Option<Arc<dyn GuestFsOps>>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub image_cache: Option<Arc<dyn ImageCacheManager>>,
    pub host: HostConfig,
}

/// State and helpers shared by all storage variants. Disks keep a weak
/// reference back to it.
pub struct BaseStorage {
    pub id: String,
    pub name: String,
    pub storage_type: String,
    pub path: PathBuf,
    pub conf: serde_json::Value,
    pub services: StorageServices,
    disks: Mutex<Vec<Arc<dyn DiskOps>>>,
    /// Held per disk id from the existence check until the new disk is
    /// registered.
    creating: KeyedLocks,
}

impl BaseStorage {
    pub fn new(entry: &StorageEntry, services: StorageServices) -> Arc<Self> {
        Arc::new(Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            storage_type: entry.storage_type.clone(),
            path: PathBuf::from(&entry.path),
            conf: entry.conf.clone(),
            services,
            disks: Mutex::new(Vec::new()),
            creating: KeyedLocks::new(),
        })
    }

    pub(crate) async fn lock_disks(&self) -> MutexGuard<'_, Vec<Arc<dyn DiskOps>>> {
        self.disks.lock().await
    }

    pub(crate) async fn reserve_create(&self, disk_id: &str) -> KeyGuard {
        self.creating.lock(disk_id).await
    }

    pub(crate) async fn unregister(&self, disk_id: &str) {
        self.disks.lock().await.retain(|d| d.id() != disk_id);
    }

    pub fn image_cache(&self) -> Result<&Arc<dyn ImageCacheManager>> {
        self.services.image_cache.as_ref().ok_or_else(|| {
            HostdError::InvalidState(format!("storage {} has no image cache", self.id))
        })
    }

    pub fn snapshot_dir(&self, disk_id: &str) -> PathBuf {
        self.path.join(SNAPSHOTS_DIR).join(format!(
            "{disk_id}{}",
            self.services.host.snapshot_dir_suffix
        ))
    }

    pub fn recycle_bin(&self) -> PathBuf {
        self.path.join(RECYCLE_BIN_DIR)
    }

    /// Remove a disk file or snapshot directory. Unless recycling is off,
    /// it is moved to `recycle_bin/<day>/<name>.<unix-seconds>` instead.
    pub async fn delete_diskfile(&self, path: &Path, skip_recycle: bool) -> Result<()> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if self.services.host.recycle_diskfile && !skip_recycle {
            let day_dir = self
                .recycle_bin()
                .join(Local::now().format(RECYCLE_DAY_FORMAT).to_string());
            tokio::fs::create_dir_all(&day_dir).await?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "diskfile".to_string());
            let target = day_dir.join(format!("{name}.{}", Utc::now().timestamp()));
            tokio::fs::rename(path, &target).await?;
            info!("Recycled {} to {}", path.display(), target.display());
            return Ok(());
        }

        if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        info!("Removed {}", path.display());
        Ok(())
    }

    /// Drop recycle-bin days older than the configured keep window.
    /// Returns how many day directories went away.
    pub async fn clean_recycle_bin(&self) -> Result<usize> {
        let bin = self.recycle_bin();
        let mut entries = match tokio::fs::read_dir(&bin).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let today = Local::now().date_naive();
        let keep_days = i64::from(self.services.host.recycle_keep_days);
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(day) = NaiveDate::parse_from_str(&name, RECYCLE_DAY_FORMAT) else {
                debug!("Skipping unexpected recycle bin entry {}", name);
                continue;
            };
            if (today - day).num_days() < keep_days {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!("Cleaned recycle bin day {} of storage {}", name, self.id);
                    removed += 1;
                }
                Err(e) => warn!("Failed to clean {}: {}", entry.path().display(), e),
            }
        }
        Ok(removed)
    }
}

fn bytes_to_mb(bytes: u64) -> u64 {
    bytes / (1024 * 1024)
}

pub(crate) fn capacity_from_bytes(total: u64, free: u64) -> StorageCapacity {
    StorageCapacity {
        total_mb: bytes_to_mb(total),
        free_mb: bytes_to_mb(free),
        used_mb: bytes_to_mb(total.saturating_sub(free)),
    }
}

/// Capability interface every storage variant provides.
#[async_trait]
pub trait StorageOps: Send + Sync {
    fn base(&self) -> &Arc<BaseStorage>;

    fn id(&self) -> &str {
        &self.base().id
    }

    fn storage_type(&self) -> &str {
        &self.base().storage_type
    }

    /// Construct an in-memory disk for `disk_id`. No I/O.
    fn make_disk(&self, disk_id: &str) -> Arc<dyn DiskOps>;

    /// Whether `create_disk` must find the disk on media first. File
    /// storages create the handle right before materializing it.
    fn probe_on_create(&self) -> bool {
        true
    }

    /// Live statistics; never cached.
    async fn capacity(&self) -> Result<StorageCapacity>;

    async fn accessible(&self) -> Result<()>;

    async fn free_size_mb(&self) -> Result<u64> {
        Ok(self.capacity().await?.free_mb)
    }

    async fn total_size_mb(&self) -> Result<u64> {
        Ok(self.capacity().await?.total_mb)
    }

    async fn used_size_mb(&self) -> Result<u64> {
        Ok(self.capacity().await?.used_mb)
    }

    fn snapshot_path(&self, disk_id: &str, snapshot_id: &str) -> PathBuf {
        self.base().snapshot_dir(disk_id).join(snapshot_id)
    }

    async fn snapshot_exists(&self, disk_id: &str, snapshot_id: &str) -> bool {
        exists(&self.snapshot_path(disk_id, snapshot_id)).await
    }

    fn backup_path(&self, backup_id: &str) -> PathBuf {
        self.base().path.join(BACKUPS_DIR).join(backup_id)
    }

    async fn disks(&self) -> Vec<Arc<dyn DiskOps>> {
        self.base().lock_disks().await.clone()
    }

    /// Ids of the disks present on the backend, known or not.
    async fn disk_ids_on_media(&self) -> Result<Vec<String>> {
        Ok(self
            .base()
            .lock_disks()
            .await
            .iter()
            .map(|d| d.id().to_string())
            .collect())
    }

    /// Known disk, or one found on media. A known disk that fails its
    /// probe is forgotten.
    async fn get_disk_by_id(&self, disk_id: &str) -> Result<Arc<dyn DiskOps>> {
        let mut disks = self.base().lock_disks().await;
        if let Some(pos) = disks.iter().position(|d| d.id() == disk_id) {
            let disk = disks[pos].clone();
            match disk.probe().await {
                Ok(()) => return Ok(disk),
                Err(e) if e.is_not_found() => {
                    disks.remove(pos);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        let disk = self.make_disk(disk_id);
        disk.probe().await?;
        disks.push(disk.clone());
        Ok(disk)
    }

    async fn create_disk(&self, disk_id: &str) -> Result<Arc<dyn DiskOps>> {
        let mut disks = self.base().lock_disks().await;
        if let Some(disk) = disks.iter().find(|d| d.id() == disk_id) {
            return Ok(disk.clone());
        }
        let disk = self.make_disk(disk_id);
        if self.probe_on_create() {
            disk.probe().await?;
        }
        disks.push(disk.clone());
        Ok(disk)
    }

    async fn delete_disk(&self, ctx: &TaskContext, disk_id: &str, skip_recycle: bool) -> Result<()> {
        let disk = self.get_disk_by_id(disk_id).await?;
        disk.delete(ctx, skip_recycle).await
    }

    /// Build a disk from `desc`. Priority: snapshot, template image,
    /// backup, existing path, URL, raw size. The disk joins the storage's
    /// set only once its content exists. Creates of the same id run one at
    /// a time, so a second one finds the first disk and fails.
    async fn create_disk_by_description(
        &self,
        ctx: &TaskContext,
        desc: &DiskDescription,
    ) -> Result<DiskDescriptor> {
        if desc.disk_id.is_empty() {
            return Err(HostdError::InvalidArgument("disk id is empty".to_string()));
        }
        if desc.is_empty() {
            return Err(HostdError::InvalidArgument(format!(
                "nothing to build disk {} from",
                desc.disk_id
            )));
        }

        let _reservation = self.base().reserve_create(&desc.disk_id).await;
        match self.get_disk_by_id(&desc.disk_id).await {
            Ok(existing) if desc.rebuild => {
                info!("Rebuilding disk {} on storage {}", desc.disk_id, self.id());
                existing.delete(ctx, false).await?;
            }
            Ok(_) => {
                return Err(HostdError::InvalidState(format!(
                    "disk {} already exists on storage {}",
                    desc.disk_id,
                    self.id()
                )));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let base = self.base();
        let disk = self.make_disk(&desc.disk_id);
        let descriptor = if let Some(snapshot) = &desc.snapshot {
            let path = self.snapshot_path(&snapshot.disk_id, &snapshot.snapshot_id);
            if !self.snapshot_exists(&snapshot.disk_id, &snapshot.snapshot_id).await {
                return Err(HostdError::not_found("snapshot", path.display().to_string()));
            }
            disk.create_from_snapshot(ctx, &path, desc.size_mb).await?
        } else if let Some(image_id) = &desc.image_id {
            let request = desc.template_request(image_id, &base.services.host.zone_id);
            disk.create_from_template(ctx, &request, desc.size_mb).await?
        } else if let Some(backup_id) = &desc.backup_id {
            let path = self.backup_path(backup_id);
            if !exists(&path).await {
                return Err(HostdError::not_found("backup", path.display().to_string()));
            }
            disk.create_from_snapshot(ctx, &path, desc.size_mb).await?
        } else if let Some(existing) = &desc.existing_path {
            if !existing.starts_with(&base.path) {
                return Err(HostdError::InvalidArgument(format!(
                    "{} is outside storage {}",
                    existing.display(),
                    base.path.display()
                )));
            }
            disk.create_from_existing(ctx, existing).await?
        } else if let Some(url) = &desc.url {
            disk.create_from_url(ctx, url, desc.size_mb).await?
        } else {
            let size = desc.size_mb.unwrap_or(0);
            disk.create_raw(
                ctx,
                size,
                desc.format.unwrap_or(ImageFormat::Qcow2),
                desc.fs_format.as_deref(),
                desc.fs_uuid.as_deref(),
            )
            .await?
        };

        let mut disks = base.lock_disks().await;
        disks.retain(|d| d.id() != desc.disk_id);
        disks.push(disk);
        Ok(descriptor)
    }
}
