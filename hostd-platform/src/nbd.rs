use crate::command::run_tool;
use crate::nbd_pool::DevicePool;
use async_trait::async_trait;
use hostd_core::{HostdError, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Binds disk images to block devices and lists the partitions that appear.
#[async_trait]
pub trait BlockBinder: Send + Sync {
    async fn connect(&self, device: &str, image: &Path, read_only: bool) -> Result<()>;
    async fn disconnect(&self, device: &str) -> Result<()>;
    /// Partition device paths currently visible for `device`, in order.
    async fn partitions(&self, device: &str) -> Result<Vec<String>>;
}

pub struct QemuNbdBinder {
    sys_block: PathBuf,
}

impl QemuNbdBinder {
    pub fn new() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
        }
    }

    /// Read partitions from `sys_block` instead of `/sys/block`.
    pub fn with_sys_block(sys_block: impl Into<PathBuf>) -> Self {
        Self {
            sys_block: sys_block.into(),
        }
    }
}

impl Default for QemuNbdBinder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockBinder for QemuNbdBinder {
    async fn connect(&self, device: &str, image: &Path, read_only: bool) -> Result<()> {
        let image = image.to_string_lossy().into_owned();
        let mut args = vec!["-c", device];
        if read_only {
            args.push("-r");
        }
        args.push(image.as_str());
        run_tool("qemu-nbd", &args, &format!("connect {image} to {device}")).await?;
        // Ask the kernel to re-read the table; partitions may still show up late.
        if let Err(e) = run_tool("partprobe", [device], "partprobe").await {
            debug!("partprobe {} failed: {}", device, e);
        }
        Ok(())
    }

    async fn disconnect(&self, device: &str) -> Result<()> {
        run_tool("qemu-nbd", ["-d", device], &format!("disconnect {device}")).await?;
        Ok(())
    }

    async fn partitions(&self, device: &str) -> Result<Vec<String>> {
        let name = Path::new(device)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut entries = match tokio::fs::read_dir(self.sys_block.join(&name)).await {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };
        let mut parts: Vec<(u32, String)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let entry_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(index) = entry_name.strip_prefix(&format!("{name}p")) {
                if let Ok(index) = index.parse::<u32>() {
                    parts.push((index, format!("/dev/{entry_name}")));
                }
            }
        }
        parts.sort();
        Ok(parts.into_iter().map(|(_, p)| p).collect())
    }
}

/// Retry `op` up to `attempts` times, doubling the delay after every failure.
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = base_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!("{} attempt {}/{} failed: {}", what, attempt, attempts, e);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}

/// An image bound to a pool slot. Call [`NbdAttachment::detach`] when done;
/// the slot stays allocated until then.
pub struct NbdAttachment {
    pub device: String,
    pub image: PathBuf,
    pub partitions: Vec<String>,
    pool: Arc<DevicePool>,
    binder: Arc<dyn BlockBinder>,
}

impl NbdAttachment {
    pub async fn attach(
        pool: Arc<DevicePool>,
        binder: Arc<dyn BlockBinder>,
        image: &Path,
        read_only: bool,
        attempts: u32,
        backoff: Duration,
    ) -> Result<Self> {
        let device = pool.acquire().await?;

        if let Err(e) = binder.connect(&device, image, read_only).await {
            if let Err(release_err) = pool.release(&device).await {
                warn!("Failed to release {}: {}", device, release_err);
            }
            return Err(e);
        }

        let discovered = retry_with_backoff(attempts, backoff, "partition discovery", || {
            let binder = binder.clone();
            let device = device.clone();
            async move {
                let parts = binder.partitions(&device).await?;
                if parts.is_empty() {
                    return Err(HostdError::not_found("partitions on", device));
                }
                Ok(parts)
            }
        })
        .await;

        // An unpartitioned image exposes its filesystem on the whole device.
        let partitions = match discovered {
            Ok(parts) => parts,
            Err(e) if e.is_not_found() => vec![device.clone()],
            Err(e) => {
                let attachment = Self {
                    device,
                    image: image.to_path_buf(),
                    partitions: Vec::new(),
                    pool,
                    binder,
                };
                attachment.detach().await;
                return Err(e);
            }
        };

        info!(
            "Attached {} to {} with {} partition(s)",
            image.display(),
            device,
            partitions.len()
        );
        Ok(Self {
            device,
            image: image.to_path_buf(),
            partitions,
            pool,
            binder,
        })
    }

    /// Re-read partitions after the table was rewritten.
    pub async fn rescan(&mut self, attempts: u32, backoff: Duration) -> Result<()> {
        let binder = self.binder.clone();
        let device = self.device.clone();
        self.partitions = retry_with_backoff(attempts, backoff, "partition rescan", || {
            let binder = binder.clone();
            let device = device.clone();
            async move {
                let parts = binder.partitions(&device).await?;
                if parts.is_empty() {
                    return Err(HostdError::not_found("partitions on", device));
                }
                Ok(parts)
            }
        })
        .await?;
        Ok(())
    }

    /// Best-effort: failures are logged and the slot is always returned.
    pub async fn detach(self) {
        if let Err(e) = self.binder.disconnect(&self.device).await {
            warn!("Failed to disconnect {}: {}", self.device, e);
        }
        if let Err(e) = self.pool.release(&self.device).await {
            warn!("Failed to release {}: {}", self.device, e);
        }
        debug!("Detached {}", self.image.display());
    }
}
