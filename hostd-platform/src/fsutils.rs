use crate::command::{run_tool, run_tool_status};
use async_trait::async_trait;
use hostd_core::{HostdError, KeyedLocks, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const FSCK_ATTEMPTS: u32 = 3;
const UNMOUNT_ATTEMPTS: u32 = 3;

/// Filesystems a fresh raw disk can be formatted with.
pub const FORMATTABLE_FS: &[&str] = &["swap", "ext2", "ext3", "ext4", "xfs"];

pub fn is_formattable(fs: &str) -> bool {
    FORMATTABLE_FS.contains(&fs)
}

async fn blkid_value(device: &str, tag: &str) -> Result<Option<String>> {
    let out = run_tool_status("blkid", ["-o", "value", "-s", tag, device]).await?;
    let value = out.stdout.trim();
    if !out.success() || value.is_empty() {
        return Ok(None);
    }
    Ok(Some(value.to_string()))
}

pub async fn detect_fs(device: &str) -> Result<Option<String>> {
    blkid_value(device, "TYPE").await
}

pub async fn fs_uuid(device: &str) -> Result<Option<String>> {
    blkid_value(device, "UUID").await
}

/// `e2fsck -f -p`; exit codes below 4 mean the filesystem is usable.
pub async fn fsck_ext(device: &str) -> Result<bool> {
    let out = run_tool_status("e2fsck", ["-f", "-p", device]).await?;
    match out.code {
        Some(code) if code < 4 => Ok(true),
        code => {
            error!("e2fsck {} exit status {:?}: {}", device, code, out.stderr.trim());
            Ok(false)
        }
    }
}

/// Read-only check first, then `xfs_repair -n`, then a real repair. Returns
/// whether the filesystem was clean before any repair.
pub async fn fsck_xfs(device: &str) -> Result<bool> {
    if run_tool_status("xfs_check", [device]).await?.success() {
        return Ok(true);
    }
    debug!("xfs_check {} failed, falling back to xfs_repair -n", device);
    if run_tool_status("xfs_repair", ["-n", device]).await?.success() {
        return Ok(true);
    }
    let repair = run_tool_status("xfs_repair", [device]).await?;
    if !repair.success() {
        warn!("xfs_repair {} failed: {}", device, repair.stderr.trim());
    }
    Ok(false)
}

/// Check `device`, repairing up to `attempts` times. Unknown filesystems pass.
pub async fn fsck_with_repair(device: &str, fs: &str, attempts: u32) -> bool {
    for attempt in 1..=attempts.max(1) {
        let result = if fs.starts_with("ext") {
            fsck_ext(device).await
        } else if fs == "xfs" {
            fsck_xfs(device).await
        } else {
            return true;
        };
        match result {
            Ok(true) => return true,
            Ok(false) => warn!("fsck {} ({}) attempt {} failed", device, fs, attempt),
            Err(e) => warn!("fsck {} ({}) attempt {} error: {}", device, fs, attempt, e),
        }
    }
    false
}

/// `/dev/nbd0p2` -> (`/dev/nbd0`, 2).
pub fn split_partition(partition: &str) -> Option<(&str, u32)> {
    let (device, index) = partition.rsplit_once('p')?;
    let index = index.parse().ok()?;
    if device.is_empty() || !device.starts_with("/dev/") {
        return None;
    }
    Some((device, index))
}

/// Grow `partition` to the end of its device. NOCHANGE from growpart is fine.
pub async fn grow_partition(partition: &str) -> Result<()> {
    let Some((device, index)) = split_partition(partition) else {
        debug!("{} is not a partition, nothing to grow", partition);
        return Ok(());
    };
    let index = index.to_string();
    let out = run_tool_status("growpart", [device, index.as_str()]).await?;
    if out.success() || out.stdout.contains("NOCHANGE") {
        return Ok(());
    }
    Err(HostdError::tool(
        "growpart",
        format!("grow {partition}"),
        out.stderr.trim().to_string(),
    ))
}

/// Resize the filesystem on `partition` to fill it.
pub async fn resize_partition_fs(partition: &str, fs: &str, xfs_locks: &KeyedLocks) -> Result<()> {
    if fs.starts_with("linux-swap") || fs == "swap" {
        let uuid = fs_uuid(partition).await?;
        match uuid {
            Some(uuid) => run_tool("mkswap", ["-U", uuid.as_str(), partition], "mkswap").await?,
            None => run_tool("mkswap", [partition], "mkswap").await?,
        };
        return Ok(());
    }

    if fs.starts_with("ext") {
        if !fsck_ext(partition).await? {
            return Err(HostdError::tool(
                "e2fsck",
                format!("check {partition}"),
                "filesystem not clean",
            ));
        }
        run_tool("resize2fs", [partition], &format!("resize {partition}")).await?;
        return Ok(());
    }

    if fs == "xfs" {
        fsck_xfs(partition).await?;
        let _guard = match fs_uuid(partition).await? {
            Some(uuid) => Some(xfs_locks.lock(&uuid).await),
            None => None,
        };
        let tmp_point = std::env::temp_dir().join(partition.replace('/', "_"));
        tokio::fs::create_dir_all(&tmp_point).await?;
        let tmp = tmp_point.to_string_lossy().into_owned();

        run_tool("mount", [partition, tmp.as_str()], &format!("mount {partition}")).await?;
        let grown = run_tool("xfs_growfs", [tmp.as_str()], &format!("grow {partition}")).await;
        if let Err(e) = unmount_with_retry(&tmp_point, 3, Duration::from_secs(1)).await {
            warn!("Failed to unmount {}: {}", tmp, e);
        }
        if let Err(e) = tokio::fs::remove_dir(&tmp_point).await {
            debug!("Failed to remove {}: {}", tmp, e);
        }
        grown?;
        return Ok(());
    }

    debug!("Filesystem {} on {} has no resize support", fs, partition);
    Ok(())
}

/// Write a single-partition label spanning the whole device.
pub async fn make_partition(device: &str, fs: &str) -> Result<()> {
    let part_type = if fs == "swap" { "linux-swap" } else { "ext2" };
    run_tool("parted", ["-s", device, "mklabel", "msdos"], "mklabel").await?;
    run_tool(
        "parted",
        ["-s", "-a", "cylinder", device, "mkpart", "primary", part_type, "0", "-1s"],
        "mkpart",
    )
    .await?;
    Ok(())
}

/// Create `fs` on `partition`, optionally stamping a fixed UUID.
pub async fn format_partition(partition: &str, fs: &str, uuid: Option<&str>) -> Result<()> {
    let (mut cmd, uuid_cmd): (Vec<&str>, Option<(&str, Vec<&str>)>) = match fs {
        "swap" => (
            match uuid {
                Some(u) => vec!["mkswap", "-U", u],
                None => vec!["mkswap"],
            },
            None,
        ),
        "ext2" => (vec!["mkfs.ext2"], Some(("tune2fs", vec!["-U"]))),
        "ext3" => (vec!["mkfs.ext3"], Some(("tune2fs", vec!["-U"]))),
        "ext4" => (
            vec!["mkfs.ext4", "-O", "^64bit", "-E", "lazy_itable_init=1"],
            Some(("tune2fs", vec!["-U"])),
        ),
        "xfs" => (
            vec!["mkfs.xfs", "-f", "-m", "crc=0", "-i", "projid32bit=0", "-n", "ftype=0"],
            Some(("xfs_admin", vec!["-U"])),
        ),
        other => {
            return Err(HostdError::InvalidArgument(format!(
                "unknown filesystem {other}"
            )));
        }
    };

    cmd.push(partition);
    let tool = cmd.remove(0);
    run_tool(tool, &cmd, &format!("format {partition} as {fs}")).await?;

    if let (Some(uuid), Some((tool, mut args))) = (uuid, uuid_cmd) {
        args.push(uuid);
        args.push(partition);
        run_tool(tool, &args, &format!("set uuid on {partition}")).await?;
    }
    info!("Formatted {} as {}", partition, fs);
    Ok(())
}

/// Unmount `mount_point`, retrying a fixed number of times for busy mounts.
pub async fn unmount_with_retry(mount_point: &Path, attempts: u32, delay: Duration) -> Result<()> {
    let target = mount_point.to_string_lossy().into_owned();
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match run_tool("umount", [target.as_str()], &format!("unmount {target}")).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                debug!("umount {} attempt {} failed: {}", target, attempt, e);
                last_err = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The filesystem steps of mounting a guest partition.
#[async_trait]
pub trait FsTools: Send + Sync {
    async fn detect_fs(&self, partition: &str) -> Result<Option<String>>;

    async fn fs_uuid(&self, partition: &str) -> Result<Option<String>>;

    /// Whether `partition` is usable after up to `attempts` check and
    /// repair rounds.
    async fn fsck(&self, partition: &str, fs: &str, attempts: u32) -> bool;

    async fn mount(&self, partition: &str, target: &Path, read_only: bool) -> Result<()>;

    async fn unmount(&self, target: &Path) -> Result<()>;
}

/// `blkid`, `e2fsck`/`xfs_repair`, `mount` and `umount` on the host.
pub struct HostFsTools;

#[async_trait]
impl FsTools for HostFsTools {
    async fn detect_fs(&self, partition: &str) -> Result<Option<String>> {
        detect_fs(partition).await
    }

    async fn fs_uuid(&self, partition: &str) -> Result<Option<String>> {
        fs_uuid(partition).await
    }

    async fn fsck(&self, partition: &str, fs: &str, attempts: u32) -> bool {
        fsck_with_repair(partition, fs, attempts).await
    }

    async fn mount(&self, partition: &str, target: &Path, read_only: bool) -> Result<()> {
        let target = target.to_string_lossy().into_owned();
        let mut args = Vec::new();
        if read_only {
            args.extend(["-o", "ro"]);
        }
        args.extend([partition, target.as_str()]);
        run_tool("mount", &args, &format!("mount {partition}")).await?;
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<()> {
        unmount_with_retry(target, UNMOUNT_ATTEMPTS, Duration::from_secs(1)).await
    }
}
