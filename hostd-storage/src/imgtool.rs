use async_trait::async_trait;
use hostd_core::{HostdError, ImageFormat, Result};
use hostd_platform::run_tool;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub path: PathBuf,
    pub format: ImageFormat,
    pub virtual_size: u64,
    pub backing_file: Option<PathBuf>,
    /// False when the declared backing file does not resolve.
    pub chain_valid: bool,
}

impl ImageInfo {
    pub fn size_mb(&self) -> u64 {
        self.virtual_size / MB
    }
}

/// The disk-image utility the storage layer drives. Every call is treated as
/// an atomic black box.
#[async_trait]
pub trait ImageTool: Send + Sync {
    async fn info(&self, path: &Path) -> Result<ImageInfo>;

    /// Create an image. `size_mb` of `None` inherits the backing file's size.
    async fn create(
        &self,
        path: &Path,
        format: ImageFormat,
        size_mb: Option<u64>,
        backing: Option<&Path>,
    ) -> Result<()>;

    /// Write a standalone copy of `src` (its whole chain flattened) to `dst`.
    async fn convert(&self, src: &Path, dst: &Path, format: ImageFormat) -> Result<()>;

    async fn resize(&self, path: &Path, size_mb: u64) -> Result<()>;
}

#[derive(Deserialize)]
struct QemuImgInfo {
    format: String,
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
    #[serde(rename = "full-backing-filename")]
    full_backing_filename: Option<String>,
    #[serde(rename = "backing-filename")]
    backing_filename: Option<String>,
}

pub struct QemuImgTool;

impl QemuImgTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for QemuImgTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageTool for QemuImgTool {
    async fn info(&self, path: &Path) -> Result<ImageInfo> {
        let p = path.to_string_lossy().into_owned();
        let out = run_tool(
            "qemu-img",
            ["info", "-U", "--output=json", p.as_str()],
            &format!("info {p}"),
        )
        .await?;
        let raw: QemuImgInfo = serde_json::from_str(&out)?;

        let backing_file = raw
            .full_backing_filename
            .or(raw.backing_filename)
            .map(PathBuf::from);
        let chain_valid = match &backing_file {
            Some(b) => tokio::fs::metadata(b).await.is_ok(),
            None => true,
        };

        Ok(ImageInfo {
            path: path.to_path_buf(),
            format: raw.format.parse()?,
            virtual_size: raw.virtual_size,
            backing_file,
            chain_valid,
        })
    }

    async fn create(
        &self,
        path: &Path,
        format: ImageFormat,
        size_mb: Option<u64>,
        backing: Option<&Path>,
    ) -> Result<()> {
        let p = path.to_string_lossy().into_owned();
        let mut args = vec!["create".to_string(), "-f".to_string(), format.as_str().to_string()];
        if let Some(backing) = backing {
            let backing_info = self.info(backing).await?;
            args.extend([
                "-b".to_string(),
                backing.to_string_lossy().into_owned(),
                "-F".to_string(),
                backing_info.format.as_str().to_string(),
            ]);
        }
        args.push(p.clone());
        if let Some(size) = size_mb {
            args.push(format!("{size}M"));
        }
        run_tool("qemu-img", &args, &format!("create {p}")).await?;
        debug!("Created {} image {}", format, p);
        Ok(())
    }

    async fn convert(&self, src: &Path, dst: &Path, format: ImageFormat) -> Result<()> {
        let s = src.to_string_lossy().into_owned();
        let d = dst.to_string_lossy().into_owned();
        run_tool(
            "qemu-img",
            ["convert", "-O", format.as_str(), s.as_str(), d.as_str()],
            &format!("convert {s} to {d}"),
        )
        .await?;
        Ok(())
    }

    async fn resize(&self, path: &Path, size_mb: u64) -> Result<()> {
        let p = path.to_string_lossy().into_owned();
        let size = format!("{size_mb}M");
        run_tool(
            "qemu-img",
            ["resize", p.as_str(), size.as_str()],
            &format!("resize {p}"),
        )
        .await?;
        Ok(())
    }
}

/// Follow backing links from `path`. The result starts with `path` itself.
/// A revisited or dangling link is an integrity failure.
pub async fn backing_chain(tool: &dyn ImageTool, path: &Path) -> Result<Vec<PathBuf>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = path.to_path_buf();
    loop {
        if !seen.insert(current.clone()) {
            return Err(HostdError::Integrity {
                subject: path.display().to_string(),
                message: format!("backing chain loops at {}", current.display()),
            });
        }
        let info = tool.info(&current).await?;
        chain.push(current.clone());
        match info.backing_file {
            Some(next) if !info.chain_valid => {
                return Err(HostdError::Integrity {
                    subject: path.display().to_string(),
                    message: format!("missing backing file {}", next.display()),
                });
            }
            Some(next) => current = next,
            None => return Ok(chain),
        }
    }
}
