use super::local::{LocalFiles, read_sidecar, scan_sidecars, sidecar_path, write_sidecar};
use super::{AcquireRequest, CacheBackend, CachedImageDesc};
use crate::disk::{remove_if_exists, with_suffix};
use crate::imgtool::ImageTool;
use crate::rbd::BlockStoreClient;
use async_trait::async_trait;
use chrono::Utc;
use hostd_core::{ImageFormat, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const RBD_IMAGECACHE_PREFIX: &str = "image_cache_";

const RAW_TMP_SUFFIX: &str = ".raw.tmp";

/// Native images in a block store pool. Downloads are staged locally and
/// dropped once imported.
pub struct RbdImages {
    pool: String,
    client: Arc<dyn BlockStoreClient>,
    staging: LocalFiles,
    tool: Arc<dyn ImageTool>,
    sidecars: PathBuf,
}

impl RbdImages {
    pub fn new(
        pool: impl Into<String>,
        client: Arc<dyn BlockStoreClient>,
        staging: LocalFiles,
        tool: Arc<dyn ImageTool>,
        sidecars: PathBuf,
    ) -> Self {
        Self {
            pool: pool.into(),
            client,
            staging,
            tool,
            sidecars,
        }
    }

    fn native_name(image_id: &str) -> String {
        format!("{RBD_IMAGECACHE_PREFIX}{image_id}")
    }

    async fn import(&self, staged: &Path, format: ImageFormat, name: &str) -> Result<()> {
        if self.client.exists(&self.pool, name).await? {
            self.client.remove(&self.pool, name).await?;
        }
        if format == ImageFormat::Raw {
            return self.client.import(staged, &self.pool, name).await;
        }
        let raw = with_suffix(staged, RAW_TMP_SUFFIX);
        let imported = async {
            self.tool.convert(staged, &raw, ImageFormat::Raw).await?;
            self.client.import(&raw, &self.pool, name).await
        }
        .await;
        if let Err(e) = remove_if_exists(&raw).await {
            warn!("Failed to remove {}: {}", raw.display(), e);
        }
        imported
    }
}

#[async_trait]
impl CacheBackend for RbdImages {
    fn kind(&self) -> &'static str {
        "rbd"
    }

    /// The native image name; there is no host path.
    fn location(&self, image_id: &str) -> PathBuf {
        PathBuf::from(Self::native_name(image_id))
    }

    async fn scan(&self) -> Result<Vec<(String, CachedImageDesc)>> {
        let mut found = Vec::new();
        for (image_id, desc) in scan_sidecars(&self.sidecars).await? {
            if self.client.exists(&self.pool, &Self::native_name(&image_id)).await? {
                found.push((image_id, desc));
            } else {
                warn!("Pool image for {} is gone, dropping its descriptor", image_id);
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
        let name = Self::native_name(image_id);
        if previous.is_some() && self.client.exists(&self.pool, &name).await? {
            let mut desc = read_sidecar(&self.sidecars, image_id).await?;
            desc.last_access = Utc::now();
            write_sidecar(&self.sidecars, image_id, &desc).await?;
            return Ok(desc);
        }

        let staged = self.staging.materialize(req, None).await?;
        let imported = self
            .import(&self.staging.location(image_id), staged.format, &name)
            .await;
        if let Err(e) = self.staging.remove(image_id).await {
            warn!("Failed to drop staged copy of image {}: {}", image_id, e);
        }
        imported?;

        let mut desc = staged;
        desc.format = ImageFormat::Raw;
        desc.last_access = Utc::now();
        tokio::fs::create_dir_all(&self.sidecars).await?;
        write_sidecar(&self.sidecars, image_id, &desc).await?;
        info!("Imported image {} into pool {}", image_id, self.pool);
        Ok(desc)
    }

    async fn remove(&self, image_id: &str) -> Result<()> {
        let name = Self::native_name(image_id);
        if self.client.exists(&self.pool, &name).await? {
            self.client.remove(&self.pool, &name).await?;
        }
        remove_if_exists(&sidecar_path(&self.sidecars, image_id)).await
    }
}
