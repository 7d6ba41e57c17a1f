use super::local::{read_sidecar, scan_sidecars, sidecar_path, write_sidecar};
use super::{AcquireRequest, CacheBackend, CachedImageDesc, ImageCacheManager};
use crate::disk::remove_if_exists;
use crate::imgtool::ImageTool;
use crate::lvm::{IMAGECACHE_LV_PREFIX, VolumeManager, lv_path, qcow2_lv_size_mb};
use async_trait::async_trait;
use chrono::Utc;
use hostd_core::{ImageFormat, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const MB: u64 = 1024 * 1024;

/// One logical volume per image, filled from the host's local file cache
/// the first time the image is used on this group.
pub struct LvmVolumes {
    vg: String,
    local: Arc<dyn ImageCacheManager>,
    volumes: Arc<dyn VolumeManager>,
    tool: Arc<dyn ImageTool>,
    sidecars: PathBuf,
}

impl LvmVolumes {
    pub fn new(
        vg: impl Into<String>,
        local: Arc<dyn ImageCacheManager>,
        volumes: Arc<dyn VolumeManager>,
        tool: Arc<dyn ImageTool>,
        sidecars: PathBuf,
    ) -> Self {
        Self {
            vg: vg.into(),
            local,
            volumes,
            tool,
            sidecars,
        }
    }

    fn lv_name(image_id: &str) -> String {
        format!("{IMAGECACHE_LV_PREFIX}{image_id}")
    }

    async fn volume_exists(&self, image_id: &str) -> Result<bool> {
        let name = Self::lv_name(image_id);
        Ok(self.volumes.lv_names(&self.vg).await?.contains(&name))
    }

    async fn fill_volume(&self, image_id: &str, src: &Path, size_mb: u64) -> Result<()> {
        let name = Self::lv_name(image_id);
        let path = self.location(image_id);
        if self.volume_exists(image_id).await? {
            self.volumes.lv_remove(&path).await?;
        }
        self.volumes
            .lv_create(&self.vg, &name, qcow2_lv_size_mb(size_mb) * MB)
            .await?;
        if let Err(e) = self.tool.convert(src, &path, ImageFormat::Qcow2).await {
            if let Err(cleanup) = self.volumes.lv_remove(&path).await {
                warn!("Failed to remove volume {}: {}", path.display(), cleanup);
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for LvmVolumes {
    fn kind(&self) -> &'static str {
        "lvm"
    }

    fn location(&self, image_id: &str) -> PathBuf {
        lv_path(&self.vg, &Self::lv_name(image_id))
    }

    async fn scan(&self) -> Result<Vec<(String, CachedImageDesc)>> {
        let names = self.volumes.lv_names(&self.vg).await?;
        let mut found = Vec::new();
        for (image_id, desc) in scan_sidecars(&self.sidecars).await? {
            if names.contains(&Self::lv_name(&image_id)) {
                found.push((image_id, desc));
            } else {
                warn!("Volume for image {} is gone, dropping its descriptor", image_id);
                remove_if_exists(&sidecar_path(&self.sidecars, &image_id)).await?;
            }
        }
        Ok(found)
    }

    async fn materialize(
        &self,
        req: &AcquireRequest,
        previous: Option<&CachedImageDesc>,
    ) -> Result<CachedImageDesc> {
        let image_id = req.image_id.as_str();
        if previous.is_some() && self.volume_exists(image_id).await? {
            let mut desc = read_sidecar(&self.sidecars, image_id).await?;
            desc.last_access = Utc::now();
            write_sidecar(&self.sidecars, image_id, &desc).await?;
            return Ok(desc);
        }

        let cached = self.local.acquire(req).await?;
        let filled = self.fill_volume(image_id, &cached.path, cached.desc.size_mb).await;
        if let Err(e) = self.local.release(image_id).await {
            warn!("Failed to release local image {}: {}", image_id, e);
        }
        filled?;

        let mut desc = cached.desc;
        desc.format = ImageFormat::Qcow2;
        desc.last_access = Utc::now();
        tokio::fs::create_dir_all(&self.sidecars).await?;
        write_sidecar(&self.sidecars, image_id, &desc).await?;
        info!("Converted image {} onto volume group {}", image_id, self.vg);
        Ok(desc)
    }

    async fn remove(&self, image_id: &str) -> Result<()> {
        if self.volume_exists(image_id).await? {
            self.volumes.lv_remove(&self.location(image_id)).await?;
        }
        remove_if_exists(&sidecar_path(&self.sidecars, image_id)).await
    }
}
