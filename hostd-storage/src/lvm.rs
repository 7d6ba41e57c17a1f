use async_trait::async_trait;
use hostd_core::{HostdError, Result};
use hostd_platform::{run_tool, run_tool_status};
use std::path::{Path, PathBuf};
use tracing::info;

/// LVM rounds volumes up to whole extents.
pub const EXTENT_MB: u64 = 4;

pub const SNAPSHOT_LV_PREFIX: &str = "snap_";
pub const IMAGECACHE_LV_PREFIX: &str = "imagecache_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VgProps {
    pub size_bytes: u64,
    pub free_bytes: u64,
}

/// Logical-volume operations against one host's LVM.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    async fn lv_create(&self, vg: &str, name: &str, size_bytes: u64) -> Result<()>;
    async fn lv_remove(&self, lv_path: &Path) -> Result<()>;
    async fn lv_resize(&self, lv_path: &Path, size_bytes: u64) -> Result<()>;
    async fn lv_rename(&self, vg: &str, from: &str, to: &str) -> Result<()>;
    async fn lv_size(&self, lv_path: &Path) -> Result<u64>;
    async fn lv_names(&self, vg: &str) -> Result<Vec<String>>;
    async fn vg_props(&self, vg: &str) -> Result<VgProps>;
}

pub fn lv_path(vg: &str, name: &str) -> PathBuf {
    PathBuf::from("/dev").join(vg).join(name)
}

/// Volume size for a qcow2 image of `size_mb` virtual MiB: room for L1/L2
/// and refcount tables, rounded up to whole extents.
pub fn qcow2_lv_size_mb(size_mb: u64) -> u64 {
    let with_metadata = size_mb + (size_mb / 512).max(1) + 2;
    with_metadata.div_ceil(EXTENT_MB) * EXTENT_MB
}

pub struct LvmCli;

impl LvmCli {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LvmCli {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bytes(tool: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| HostdError::tool(tool, "parse size", format!("{raw:?}: {e}")))
}

#[async_trait]
impl VolumeManager for LvmCli {
    async fn lv_create(&self, vg: &str, name: &str, size_bytes: u64) -> Result<()> {
        let size = format!("{size_bytes}B");
        run_tool(
            "lvcreate",
            ["--yes", "-L", size.as_str(), "-n", name, vg],
            &format!("create {vg}/{name}"),
        )
        .await?;
        info!("Created logical volume {}/{} ({} bytes)", vg, name, size_bytes);
        Ok(())
    }

    async fn lv_remove(&self, lv_path: &Path) -> Result<()> {
        let p = lv_path.to_string_lossy().into_owned();
        run_tool("lvremove", ["-f", p.as_str()], &format!("remove {p}")).await?;
        info!("Removed logical volume {}", p);
        Ok(())
    }

    async fn lv_resize(&self, lv_path: &Path, size_bytes: u64) -> Result<()> {
        let p = lv_path.to_string_lossy().into_owned();
        let size = format!("{size_bytes}B");
        let out = run_tool_status("lvresize", ["-L", size.as_str(), p.as_str()]).await?;
        // Shrinking is never requested; an unchanged size is not an error.
        if !out.success() && !out.stderr.contains("matches existing size") {
            return Err(HostdError::tool(
                "lvresize",
                format!("resize {p}"),
                out.stderr.trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn lv_rename(&self, vg: &str, from: &str, to: &str) -> Result<()> {
        run_tool(
            "lvrename",
            [vg, from, to],
            &format!("rename {vg}/{from} to {to}"),
        )
        .await?;
        Ok(())
    }

    async fn lv_size(&self, lv_path: &Path) -> Result<u64> {
        let p = lv_path.to_string_lossy().into_owned();
        let out = run_tool(
            "lvs",
            [
                "--noheadings",
                "--nosuffix",
                "--units",
                "b",
                "-o",
                "lv_size",
                p.as_str(),
            ],
            &format!("size of {p}"),
        )
        .await?;
        parse_bytes("lvs", &out)
    }

    async fn lv_names(&self, vg: &str) -> Result<Vec<String>> {
        let out = run_tool(
            "lvs",
            ["--noheadings", "-o", "lv_name", vg],
            &format!("list {vg}"),
        )
        .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn vg_props(&self, vg: &str) -> Result<VgProps> {
        let out = run_tool(
            "vgs",
            [
                "--noheadings",
                "--nosuffix",
                "--units",
                "b",
                "-o",
                "vg_size,vg_free",
                vg,
            ],
            &format!("props of {vg}"),
        )
        .await?;
        let mut fields = out.split_whitespace();
        let (Some(size), Some(free)) = (fields.next(), fields.next()) else {
            return Err(HostdError::tool("vgs", format!("props of {vg}"), out.trim().to_string()));
        };
        Ok(VgProps {
            size_bytes: parse_bytes("vgs", size)?,
            free_bytes: parse_bytes("vgs", free)?,
        })
    }
}
