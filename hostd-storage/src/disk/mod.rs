//! Disks and the operations every backend variant implements.

mod local;
mod lvm;
mod raw;
mod rbd;

pub use local::{ALTERNATE_SUFFIX, LocalDisk};
pub use lvm::{LvmDisk, snapshot_lv_name as lvm_snapshot_name};
pub use raw::RawDeviceDisk;
pub(crate) use raw::device_size_bytes;
pub use rbd::RbdDisk;

use crate::imagecache::AcquireRequest;
use crate::storage::BaseStorage;
use async_trait::async_trait;
use hostd_core::{DiskDescriptor, DiskState, HostdError, ImageFormat, Result, TaskContext};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Where a new disk's content comes from, plus what to do after it lands.
#[derive(Debug, Clone, Default)]
pub struct DiskDescription {
    pub disk_id: String,
    pub snapshot: Option<SnapshotSource>,
    pub image_id: Option<String>,
    pub backup_id: Option<String>,
    pub existing_path: Option<PathBuf>,
    pub url: Option<String>,
    /// Requested virtual size in MiB.
    pub size_mb: Option<u64>,
    pub format: Option<ImageFormat>,
    pub fs_format: Option<String>,
    pub fs_uuid: Option<String>,
    /// Expected checksum of the template image.
    pub checksum: Option<String>,
    /// Replace a disk that already exists under this id.
    pub rebuild: bool,
}

impl DiskDescription {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none()
            && self.image_id.is_none()
            && self.backup_id.is_none()
            && self.existing_path.is_none()
            && self.url.is_none()
            && self.size_mb.unwrap_or(0) == 0
    }

    pub(crate) fn template_request(&self, image_id: &str, zone: &str) -> AcquireRequest {
        AcquireRequest {
            image_id: image_id.to_string(),
            zone: zone.to_string(),
            source_url: self.url.clone(),
            format: self.format,
            checksum: self.checksum.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSource {
    pub disk_id: String,
    pub snapshot_id: String,
}

/// Options for removing one snapshot from a chain.
#[derive(Debug, Clone, Default)]
pub struct DeleteSnapshotOptions {
    /// Flatten this dependent snapshot before the removal.
    pub convert_snapshot: Option<String>,
    /// Flatten the active image itself before the removal.
    pub block_stream: bool,
    /// Leave the snapshot on disk for a later cleanup pass.
    pub pending_delete: bool,
}

/// Capability interface every disk variant provides. Mutating operations
/// go through the lifecycle guard on [`BaseDisk`].
#[async_trait]
pub trait DiskOps: Send + Sync {
    fn base(&self) -> &BaseDisk;

    fn id(&self) -> &str {
        &self.base().id
    }

    fn disk_type(&self) -> &'static str;

    /// Active image location. Empty for backends addressed natively.
    fn path(&self) -> PathBuf;

    fn is_alternate(&self) -> bool {
        false
    }

    /// Check the disk still exists on its media. Marks it ready when it does.
    async fn probe(&self) -> Result<()>;

    async fn descriptor(&self) -> Result<DiskDescriptor>;

    async fn create_raw(
        &self,
        ctx: &TaskContext,
        size_mb: u64,
        format: ImageFormat,
        fs_format: Option<&str>,
        fs_uuid: Option<&str>,
    ) -> Result<DiskDescriptor>;

    async fn create_from_template(
        &self,
        ctx: &TaskContext,
        template: &AcquireRequest,
        size_mb: Option<u64>,
    ) -> Result<DiskDescriptor>;

    /// Standalone copy of a snapshot (or backup) file.
    async fn create_from_snapshot(
        &self,
        ctx: &TaskContext,
        snapshot_path: &Path,
        size_mb: Option<u64>,
    ) -> Result<DiskDescriptor>;

    async fn create_from_url(
        &self,
        _ctx: &TaskContext,
        url: &str,
        _size_mb: Option<u64>,
    ) -> Result<DiskDescriptor> {
        Err(HostdError::Unsupported(format!(
            "{} disk {} cannot be fetched from {url}",
            self.disk_type(),
            self.id()
        )))
    }

    async fn create_from_existing(
        &self,
        _ctx: &TaskContext,
        existing: &Path,
    ) -> Result<DiskDescriptor> {
        Err(HostdError::Unsupported(format!(
            "{} disk {} cannot adopt {}",
            self.disk_type(),
            self.id(),
            existing.display()
        )))
    }

    /// Grow the disk to `size_mb`. Smaller sizes leave the disk untouched.
    async fn resize(&self, ctx: &TaskContext, size_mb: u64) -> Result<DiskDescriptor>;

    async fn create_snapshot(&self, ctx: &TaskContext, snapshot_id: &str) -> Result<()>;

    async fn delete_snapshot(
        &self,
        ctx: &TaskContext,
        snapshot_id: &str,
        opts: &DeleteSnapshotOptions,
    ) -> Result<()>;

    async fn reset_from_snapshot(
        &self,
        ctx: &TaskContext,
        snapshot_id: &str,
        out_of_chain: bool,
    ) -> Result<()>;

    /// Flatten each of `convert` in place, then remove each of `delete`.
    async fn cleanup_snapshots(
        &self,
        ctx: &TaskContext,
        convert: &[String],
        delete: &[String],
    ) -> Result<()>;

    async fn delete_all_snapshots(&self, ctx: &TaskContext, skip_recycle: bool) -> Result<()>;

    async fn delete(&self, ctx: &TaskContext, skip_recycle: bool) -> Result<()>;

    fn state(&self) -> DiskState {
        self.base().state()
    }
}

/// State shared by every disk variant.
pub struct BaseDisk {
    pub id: String,
    storage: Weak<BaseStorage>,
    state: Mutex<DiskState>,
}

impl BaseDisk {
    pub fn new(id: impl Into<String>, storage: &Arc<BaseStorage>) -> Self {
        Self {
            id: id.into(),
            storage: Arc::downgrade(storage),
            state: Mutex::new(DiskState::Unmaterialized),
        }
    }

    pub fn storage(&self) -> Result<Arc<BaseStorage>> {
        self.storage
            .upgrade()
            .ok_or_else(|| HostdError::InvalidState(format!("storage of disk {} is gone", self.id)))
    }

    pub fn state(&self) -> DiskState {
        match self.state.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: DiskState) {
        match self.state.lock() {
            Ok(mut s) => *s = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub(crate) fn mark_ready(&self) {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if matches!(*state, DiskState::Unmaterialized | DiskState::Deleted) {
            *state = DiskState::Ready;
        }
    }

    /// Enter a busy state. The returned guard restores the last known-good
    /// state unless [`Transition::finish`] is called.
    pub(crate) fn begin(&self, to: DiskState) -> Result<Transition<'_>> {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let from = *state;
        if from.is_busy() {
            return Err(HostdError::InvalidState(format!(
                "disk {} is {from}, cannot start {to}",
                self.id
            )));
        }
        let fallback = match to {
            DiskState::Materializing => DiskState::Unmaterialized,
            _ if from != DiskState::Ready => {
                return Err(HostdError::InvalidState(format!(
                    "disk {} is {from}, cannot start {to}",
                    self.id
                )));
            }
            _ => DiskState::Ready,
        };
        *state = to;
        debug!("Disk {} {} -> {}", self.id, from, to);
        Ok(Transition {
            disk: self,
            fallback,
            done: false,
        })
    }
}

pub(crate) struct Transition<'a> {
    disk: &'a BaseDisk,
    fallback: DiskState,
    done: bool,
}

impl Transition<'_> {
    pub(crate) fn finish(mut self, end: DiskState) {
        self.disk.set_state(end);
        self.done = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.disk.set_state(self.fallback);
        }
    }
}

/// Append `suffix` to the final path component.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

/// Rewrite `path` as a standalone image through a temporary sibling. The
/// original stays untouched until the flattened copy replaces it.
pub(crate) async fn flatten_in_place(
    tool: &dyn crate::imgtool::ImageTool,
    path: &Path,
    tmp_suffix: &str,
) -> Result<()> {
    let tmp = with_suffix(path, tmp_suffix);
    remove_if_exists(&tmp).await?;
    if let Err(e) = tool.convert(path, &tmp, ImageFormat::Qcow2).await {
        if let Err(cleanup) = remove_if_exists(&tmp).await {
            tracing::warn!("Failed to remove {}: {}", tmp.display(), cleanup);
        }
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        if let Err(cleanup) = remove_if_exists(&tmp).await {
            tracing::warn!("Failed to remove {}: {}", tmp.display(), cleanup);
        }
        return Err(e.into());
    }
    debug!("Flattened {}", path.display());
    Ok(())
}

/// Grow the filesystem inside `image`. The image itself has already grown,
/// so a failure here is only logged.
pub(crate) async fn grow_guest_fs(storage: &BaseStorage, image: &Path) {
    let Some(guest_fs) = &storage.services.guest_fs else {
        debug!("No guest filesystem support, not resizing fs of {}", image.display());
        return;
    };
    if let Err(e) = guest_fs.resize_fs(image).await {
        tracing::warn!("Filesystem resize of {} failed: {}", image.display(), e);
    }
}

pub(crate) async fn format_guest_fs(
    storage: &BaseStorage,
    image: &Path,
    fs_format: Option<&str>,
    fs_uuid: Option<&str>,
) {
    let Some(fs) = fs_format.filter(|fs| hostd_platform::fsutils::is_formattable(fs)) else {
        return;
    };
    let Some(guest_fs) = &storage.services.guest_fs else {
        debug!("No guest filesystem support, not formatting {}", image.display());
        return;
    };
    if let Err(e) = guest_fs.format_fs(image, fs, fs_uuid).await {
        tracing::warn!("Formatting {} as {} failed: {}", image.display(), fs, e);
    }
}
