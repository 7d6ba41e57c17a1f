use crate::fsutils::{self, FSCK_ATTEMPTS, FsTools, HostFsTools};
use crate::nbd::{BlockBinder, NbdAttachment};
use crate::nbd_pool::DevicePool;
use async_trait::async_trait;
use hostd_core::{DevicePoolConfig, HostdError, KeyGuard, KeyedLocks, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A guest root filesystem mounted on the host.
pub struct MountedRoot {
    pub image: PathBuf,
    pub device: String,
    pub partition: String,
    pub fs: String,
    pub mount_point: PathBuf,
    /// Set when the filesystem failed its check and was mounted read-only.
    pub read_only: bool,
    attachment: NbdAttachment,
    /// Per-UUID lock of an xfs root, held until unmount.
    _fs_lock: Option<KeyGuard>,
}

impl std::fmt::Debug for MountedRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedRoot")
            .field("image", &self.image)
            .field("partition", &self.partition)
            .field("mount_point", &self.mount_point)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub os: String,
    pub release: String,
}

/// Reads and writes guest files inside a mounted root.
#[async_trait]
pub trait GuestDeployer: Send + Sync {
    async fn deploy(&self, root: &MountedRoot) -> Result<DeployOutcome>;
}

/// Filesystem-level operations on a disk image that storage code needs.
#[async_trait]
pub trait GuestFsOps: Send + Sync {
    /// Grow the last partition and its filesystem to fill the image.
    async fn resize_fs(&self, image: &Path) -> Result<()>;

    /// Partition a blank image and create `fs` on it.
    async fn format_fs(&self, image: &Path, fs: &str, uuid: Option<&str>) -> Result<()>;
}

/// Exposes disk images as mounted filesystems through the device pool.
pub struct GuestDiskMounter {
    pool: Arc<DevicePool>,
    binder: Arc<dyn BlockBinder>,
    tools: Arc<dyn FsTools>,
    xfs_locks: Arc<KeyedLocks>,
    mount_base: PathBuf,
    bind_attempts: u32,
    bind_backoff: Duration,
}

impl GuestDiskMounter {
    pub fn new(
        pool: Arc<DevicePool>,
        binder: Arc<dyn BlockBinder>,
        config: &DevicePoolConfig,
        mount_base: PathBuf,
    ) -> Self {
        Self {
            pool,
            binder,
            tools: Arc::new(HostFsTools),
            xfs_locks: Arc::new(KeyedLocks::new()),
            mount_base,
            bind_attempts: config.bind_attempts,
            bind_backoff: Duration::from_millis(config.bind_backoff_ms),
        }
    }

    pub fn with_fs_tools(mut self, tools: Arc<dyn FsTools>) -> Self {
        self.tools = tools;
        self
    }

    pub fn pool(&self) -> &Arc<DevicePool> {
        &self.pool
    }

    async fn attach(&self, image: &Path, read_only: bool) -> Result<NbdAttachment> {
        NbdAttachment::attach(
            self.pool.clone(),
            self.binder.clone(),
            image,
            read_only,
            self.bind_attempts,
            self.bind_backoff,
        )
        .await
    }

    /// Template clones share their filesystem UUID, and xfs will not mount
    /// one UUID twice. Every xfs mount holds the UUID's lock.
    async fn fs_lock(&self, partition: &str, fs: &str) -> Option<KeyGuard> {
        if fs != "xfs" {
            return None;
        }
        match self.tools.fs_uuid(partition).await {
            Ok(Some(uuid)) => Some(self.xfs_locks.lock(&uuid).await),
            Ok(None) => None,
            Err(e) => {
                debug!("Cannot read filesystem uuid of {}: {}", partition, e);
                None
            }
        }
    }

    async fn looks_like_root(mount_point: &Path) -> bool {
        for marker in ["etc", "Windows", "windows"] {
            if tokio::fs::metadata(mount_point.join(marker)).await.is_ok() {
                return true;
            }
        }
        false
    }

    /// Mount the first partition holding a guest root. A partition that fails
    /// its filesystem check is still tried read-only.
    pub async fn mount_root(&self, image: &Path, read_only: bool) -> Result<MountedRoot> {
        let attachment = self.attach(image, read_only).await?;
        let device_name = Path::new(&attachment.device)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "nbd".to_string());
        let mount_point = self.mount_base.join(device_name);
        if let Err(e) = tokio::fs::create_dir_all(&mount_point).await {
            attachment.detach().await;
            return Err(e.into());
        }

        for partition in attachment.partitions.clone() {
            let fs = match self.tools.detect_fs(&partition).await {
                Ok(Some(fs)) if !fs.contains("swap") => fs,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Cannot detect filesystem on {}: {}", partition, e);
                    continue;
                }
            };

            let fs_lock = self.fs_lock(&partition, &fs).await;
            let mut mount_ro = read_only;
            if !read_only && !self.tools.fsck(&partition, &fs, FSCK_ATTEMPTS).await {
                warn!("{} failed fsck, falling back to read-only mount", partition);
                mount_ro = true;
            }

            if let Err(e) = self.tools.mount(&partition, &mount_point, mount_ro).await {
                debug!("Mounting {} failed: {}", partition, e);
                continue;
            }

            if Self::looks_like_root(&mount_point).await {
                info!(
                    "Mounted root {} of {} at {}",
                    partition,
                    image.display(),
                    mount_point.display()
                );
                return Ok(MountedRoot {
                    image: image.to_path_buf(),
                    device: attachment.device.clone(),
                    partition,
                    fs,
                    mount_point,
                    read_only: mount_ro,
                    attachment,
                    _fs_lock: fs_lock,
                });
            }

            if let Err(e) = self.tools.unmount(&mount_point).await {
                warn!("Failed to unmount {}: {}", partition, e);
            }
        }

        if let Err(e) = tokio::fs::remove_dir(&mount_point).await {
            debug!("Failed to remove {}: {}", mount_point.display(), e);
        }
        attachment.detach().await;
        Err(HostdError::not_found("root partition in", image.display().to_string()))
    }

    /// Tear down a mount. Unmount failures are retried, then logged; the
    /// device slot is always returned to the pool.
    pub async fn unmount_root(&self, root: MountedRoot) {
        if let Err(e) = self.tools.unmount(&root.mount_point).await {
            warn!("Failed to unmount {}: {}", root.mount_point.display(), e);
        }
        if let Err(e) = tokio::fs::remove_dir(&root.mount_point).await {
            debug!("Failed to remove {}: {}", root.mount_point.display(), e);
        }
        root.attachment.detach().await;
    }

    /// Mount, hand the root to `deployer`, then always unmount.
    pub async fn deploy(&self, image: &Path, deployer: &dyn GuestDeployer) -> Result<DeployOutcome> {
        let root = self.mount_root(image, false).await?;
        if root.read_only {
            warn!("Deploying into read-only root of {}", image.display());
        }
        let outcome = deployer.deploy(&root).await;
        self.unmount_root(root).await;
        outcome
    }
}

#[async_trait]
impl GuestFsOps for GuestDiskMounter {
    async fn resize_fs(&self, image: &Path) -> Result<()> {
        let mut attachment = self.attach(image, false).await?;
        let result = async {
            let Some(last) = attachment.partitions.last().cloned() else {
                return Ok(());
            };
            fsutils::grow_partition(&last).await?;
            attachment.rescan(self.bind_attempts, self.bind_backoff).await?;
            match fsutils::detect_fs(&last).await? {
                Some(fs) => fsutils::resize_partition_fs(&last, &fs, &self.xfs_locks).await,
                None => Ok(()),
            }
        }
        .await;
        attachment.detach().await;
        result
    }

    async fn format_fs(&self, image: &Path, fs: &str, uuid: Option<&str>) -> Result<()> {
        if !fsutils::is_formattable(fs) {
            return Err(HostdError::InvalidArgument(format!("unknown filesystem {fs}")));
        }
        let mut attachment = self.attach(image, false).await?;
        let result = async {
            fsutils::make_partition(&attachment.device, fs).await?;
            attachment.rescan(self.bind_attempts, self.bind_backoff).await?;
            let partition = attachment
                .partitions
                .first()
                .cloned()
                .ok_or_else(|| HostdError::not_found("partition on", attachment.device.clone()))?;
            fsutils::format_partition(&partition, fs, uuid).await
        }
        .await;
        attachment.detach().await;
        result
    }
}
