use super::{AcquireRequest, CacheBackend, CachedImageDesc, ImageFetcher, sha256_file};
use crate::disk::{remove_if_exists, with_suffix};
use crate::imgtool::ImageTool;
use async_trait::async_trait;
use chrono::Utc;
use hostd_core::{HostdError, ImageCacheConfig, ImageFormat, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) const TMP_SUFFIX: &str = ".tmp";
pub(crate) const SIDECAR_SUFFIX: &str = ".inf";

const MB: u64 = 1024 * 1024;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

pub(crate) fn sidecar_path(dir: &Path, image_id: &str) -> PathBuf {
    dir.join(format!("{image_id}{SIDECAR_SUFFIX}"))
}

/// Write the descriptor next to its image, through a temporary file.
pub(crate) async fn write_sidecar(
    dir: &Path,
    image_id: &str,
    desc: &CachedImageDesc,
) -> Result<()> {
    let path = sidecar_path(dir, image_id);
    let tmp = with_suffix(&path, TMP_SUFFIX);
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(desc)?).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

pub(crate) async fn read_sidecar(dir: &Path, image_id: &str) -> Result<CachedImageDesc> {
    let raw = tokio::fs::read(sidecar_path(dir, image_id)).await?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Ids with a descriptor in `dir`; leftover temporary files are removed.
pub(crate) async fn scan_sidecars(dir: &Path) -> Result<Vec<(String, CachedImageDesc)>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(TMP_SUFFIX) {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => info!("Removed interrupted download {}", entry.path().display()),
                Err(e) => warn!("Failed to remove {}: {}", entry.path().display(), e),
            }
            continue;
        }
        let Some(image_id) = name.strip_suffix(SIDECAR_SUFFIX) else {
            continue;
        };
        match read_sidecar(dir, image_id).await {
            Ok(desc) => found.push((image_id.to_string(), desc)),
            Err(e) => warn!("Ignoring unreadable descriptor {}: {}", name, e),
        }
    }
    Ok(found)
}

/// One file plus one sidecar descriptor per image in a local directory.
pub struct LocalFiles {
    root: PathBuf,
    fetcher: Arc<dyn ImageFetcher>,
    tool: Arc<dyn ImageTool>,
    catalog_url: String,
    attempts: u32,
    backoff: Duration,
}

impl LocalFiles {
    pub fn new(
        root: PathBuf,
        fetcher: Arc<dyn ImageFetcher>,
        tool: Arc<dyn ImageTool>,
        config: &ImageCacheConfig,
    ) -> Self {
        Self {
            root,
            fetcher,
            tool,
            catalog_url: config.catalog_url.clone(),
            attempts: config.fetch_attempts.max(1),
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Base delay between integrity re-fetches; doubles each attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tmp_path(&self, image_id: &str) -> PathBuf {
        with_suffix(&self.location(image_id), TMP_SUFFIX)
    }

    fn source_url(&self, req: &AcquireRequest) -> Result<String> {
        if let Some(url) = &req.source_url {
            return Ok(url.clone());
        }
        if self.catalog_url.is_empty() {
            return Err(HostdError::ConfigError(format!(
                "no source for image {} and no catalog configured",
                req.image_id
            )));
        }
        let mut url = format!(
            "{}/images/{}",
            self.catalog_url.trim_end_matches('/'),
            req.image_id
        );
        if !req.zone.is_empty() {
            url.push_str(&format!("?zone={}", req.zone));
        }
        Ok(url)
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = remove_if_exists(path).await {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }

    /// Download into the temporary path until the checksum matches.
    async fn fetch_verified(
        &self,
        req: &AcquireRequest,
        url: &str,
    ) -> Result<(PathBuf, String, u64)> {
        let tmp = self.tmp_path(&req.image_id);
        let mut delay = self.backoff;
        for attempt in 1..=self.attempts {
            self.discard(&tmp).await;
            let outcome = match self.fetcher.fetch(url, &tmp).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.discard(&tmp).await;
                    return Err(e);
                }
            };
            match &req.checksum {
                Some(expected) if !expected.eq_ignore_ascii_case(&outcome.sha256) => {
                    warn!(
                        "Image {} checksum mismatch on attempt {}/{}: expected {}, got {}",
                        req.image_id, attempt, self.attempts, expected, outcome.sha256
                    );
                    self.discard(&tmp).await;
                    if attempt < self.attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
                _ => return Ok((tmp, outcome.sha256, outcome.bytes)),
            }
        }
        Err(HostdError::Integrity {
            subject: req.image_id.clone(),
            message: format!("checksum mismatch after {} attempts", self.attempts),
        })
    }
}

#[async_trait]
impl CacheBackend for LocalFiles {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn location(&self, image_id: &str) -> PathBuf {
        self.root.join(image_id)
    }

    async fn scan(&self) -> Result<Vec<(String, CachedImageDesc)>> {
        let mut found = Vec::new();
        for (image_id, desc) in scan_sidecars(&self.root).await? {
            if tokio::fs::metadata(self.location(&image_id)).await.is_ok() {
                found.push((image_id, desc));
            } else {
                warn!("Descriptor of image {} has no image file, dropping it", image_id);
                self.discard(&sidecar_path(&self.root, &image_id)).await;
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
        let path = self.location(image_id);

        if let Some(previous) = previous {
            let wanted = |sum: &str| {
                req.checksum
                    .as_deref()
                    .is_none_or(|expected| expected.eq_ignore_ascii_case(sum))
            };
            match sha256_file(&path).await {
                Ok(sum) if sum == previous.checksum && wanted(&sum) => {
                    debug!("Image {} re-verified locally", image_id);
                    let mut desc = previous.clone();
                    desc.last_access = Utc::now();
                    write_sidecar(&self.root, image_id, &desc).await?;
                    return Ok(desc);
                }
                Ok(sum) if sum != previous.checksum => {
                    warn!("Cached image {} changed on disk, fetching again", image_id)
                }
                Ok(_) => info!("Image {} has a new expected checksum, fetching again", image_id),
                Err(e) => warn!("Cannot re-verify image {}: {}", image_id, e),
            }
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let url = self.source_url(req)?;
        let (tmp, checksum, bytes) = self.fetch_verified(req, &url).await?;
        let (format, size_mb) = match self.tool.info(&tmp).await {
            Ok(info) => (info.format, info.size_mb()),
            Err(e) => {
                debug!("Cannot inspect image {}: {}", image_id, e);
                (req.format.unwrap_or(ImageFormat::Raw), bytes.div_ceil(MB))
            }
        };
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            self.discard(&tmp).await;
            return Err(e.into());
        }

        let desc = CachedImageDesc {
            name: image_id.to_string(),
            format,
            checksum,
            size_bytes: bytes,
            size_mb,
            last_access: Utc::now(),
        };
        write_sidecar(&self.root, image_id, &desc).await?;
        info!("Fetched image {} ({} bytes) from {}", image_id, bytes, url);
        Ok(desc)
    }

    async fn remove(&self, image_id: &str) -> Result<()> {
        remove_if_exists(&self.location(image_id)).await?;
        remove_if_exists(&sidecar_path(&self.root, image_id)).await?;
        remove_if_exists(&self.tmp_path(image_id)).await?;
        Ok(())
    }
}
