use crate::imagecache::{FetchOutcome, ImageFetcher};
use crate::imgtool::{ImageInfo, ImageTool};
use crate::lvm::{VgProps, VolumeManager};
use crate::rbd::{BlockStoreClient, PoolStats};
use crate::storage::{BaseStorage, StorageServices};
use async_trait::async_trait;
use hostd_core::{HostConfig, HostdError, ImageCacheConfig, ImageFormat, Result, StorageEntry};
use hostd_platform::GuestFsOps;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MB: u64 = 1024 * 1024;

/// What the fake image tool writes into an image file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FakeImage {
    pub format: ImageFormat,
    pub virtual_size: u64,
    pub backing: Option<PathBuf>,
}

impl FakeImage {
    pub fn bytes(format: ImageFormat, size_mb: u64) -> Vec<u8> {
        serde_json::to_vec(&FakeImage {
            format,
            virtual_size: size_mb * MB,
            backing: None,
        })
        .unwrap()
    }
}

pub fn read_image(path: &Path) -> FakeImage {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

pub fn write_image(path: &Path, format: ImageFormat, size_mb: u64, backing: Option<&Path>) {
    let image = FakeImage {
        format,
        virtual_size: size_mb * MB,
        backing: backing.map(Path::to_path_buf),
    };
    std::fs::write(path, serde_json::to_vec(&image).unwrap()).unwrap();
}

/// Image tool over JSON descriptor files. Failures can be injected per call
/// kind.
#[derive(Default)]
pub struct FakeImageTool {
    pub fail_info: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_convert: AtomicBool,
    pub converts: AtomicUsize,
    pub resizes: Mutex<Vec<(PathBuf, u64)>>,
}

impl FakeImageTool {
    async fn load(path: &Path) -> Result<FakeImage> {
        let raw = tokio::fs::read(path).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| HostdError::tool("qemu-img", "info", e.to_string()))
    }

    async fn store(path: &Path, image: &FakeImage) -> Result<()> {
        tokio::fs::write(path, serde_json::to_vec(image)?).await?;
        Ok(())
    }
}

#[async_trait]
impl ImageTool for FakeImageTool {
    async fn info(&self, path: &Path) -> Result<ImageInfo> {
        if self.fail_info.load(Ordering::SeqCst) {
            return Err(HostdError::tool("qemu-img", "info", "injected failure"));
        }
        let image = Self::load(path).await?;
        let chain_valid = match &image.backing {
            Some(backing) => tokio::fs::metadata(backing).await.is_ok(),
            None => true,
        };
        Ok(ImageInfo {
            path: path.to_path_buf(),
            format: image.format,
            virtual_size: image.virtual_size,
            backing_file: image.backing,
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
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(HostdError::tool("qemu-img", "create", "injected failure"));
        }
        let virtual_size = match (size_mb, backing) {
            (Some(size), _) => size * MB,
            (None, Some(backing)) => Self::load(backing).await?.virtual_size,
            (None, None) => {
                return Err(HostdError::InvalidArgument("size or backing needed".into()));
            }
        };
        let image = FakeImage {
            format,
            virtual_size,
            backing: backing.map(Path::to_path_buf),
        };
        Self::store(path, &image).await
    }

    async fn convert(&self, src: &Path, dst: &Path, format: ImageFormat) -> Result<()> {
        self.converts.fetch_add(1, Ordering::SeqCst);
        if self.fail_convert.load(Ordering::SeqCst) {
            return Err(HostdError::tool("qemu-img", "convert", "injected failure"));
        }
        let source = Self::load(src).await?;
        let image = FakeImage {
            format,
            virtual_size: source.virtual_size,
            backing: None,
        };
        Self::store(dst, &image).await
    }

    async fn resize(&self, path: &Path, size_mb: u64) -> Result<()> {
        let mut image = Self::load(path).await?;
        image.virtual_size = size_mb * MB;
        Self::store(path, &image).await?;
        self.resizes
            .lock()
            .unwrap()
            .push((path.to_path_buf(), size_mb));
        Ok(())
    }
}

/// Serves one payload for every URL, optionally slowly or not at all.
pub struct FakeFetcher {
    pub payload: Mutex<Vec<u8>>,
    pub delay: Duration,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload: Mutex::new(payload),
            delay: Duration::ZERO,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn slow(payload: Vec<u8>, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(payload)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(HostdError::NetworkError {
                operation: format!("GET {url}"),
                cause: "connection refused".to_string(),
            });
        }
        let payload = self.payload.lock().unwrap().clone();
        tokio::fs::write(dest, &payload).await?;
        Ok(FetchOutcome {
            bytes: payload.len() as u64,
            sha256: sha256_hex(&payload),
        })
    }
}

/// Volume groups held in memory.
#[derive(Default)]
pub struct FakeVolumes {
    pub lvs: Mutex<HashMap<String, HashMap<String, u64>>>,
    pub vg_size: u64,
}

impl FakeVolumes {
    pub fn with_group(vg: &str, size_bytes: u64) -> Self {
        let volumes = Self {
            vg_size: size_bytes,
            ..Self::default()
        };
        volumes
            .lvs
            .lock()
            .unwrap()
            .insert(vg.to_string(), HashMap::new());
        volumes
    }

    fn split(path: &Path) -> Result<(String, String)> {
        let mut parts = path.iter().rev();
        match (parts.next(), parts.next()) {
            (Some(name), Some(vg)) => Ok((
                vg.to_string_lossy().into_owned(),
                name.to_string_lossy().into_owned(),
            )),
            _ => Err(HostdError::InvalidArgument(path.display().to_string())),
        }
    }

    pub fn names(&self, vg: &str) -> HashSet<String> {
        self.lvs
            .lock()
            .unwrap()
            .get(vg)
            .map(|lvs| lvs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VolumeManager for FakeVolumes {
    async fn lv_create(&self, vg: &str, name: &str, size_bytes: u64) -> Result<()> {
        let mut lvs = self.lvs.lock().unwrap();
        let group = lvs
            .get_mut(vg)
            .ok_or_else(|| HostdError::not_found("volume group", vg))?;
        if group.contains_key(name) {
            return Err(HostdError::tool("lvcreate", name, "already exists"));
        }
        group.insert(name.to_string(), size_bytes);
        Ok(())
    }

    async fn lv_remove(&self, lv_path: &Path) -> Result<()> {
        let (vg, name) = Self::split(lv_path)?;
        let mut lvs = self.lvs.lock().unwrap();
        match lvs.get_mut(&vg).and_then(|g| g.remove(&name)) {
            Some(_) => Ok(()),
            None => Err(HostdError::not_found("logical volume", name)),
        }
    }

    async fn lv_resize(&self, lv_path: &Path, size_bytes: u64) -> Result<()> {
        let (vg, name) = Self::split(lv_path)?;
        let mut lvs = self.lvs.lock().unwrap();
        let size = lvs
            .get_mut(&vg)
            .and_then(|g| g.get_mut(&name))
            .ok_or_else(|| HostdError::not_found("logical volume", name.clone()))?;
        *size = size_bytes;
        Ok(())
    }

    async fn lv_rename(&self, vg: &str, from: &str, to: &str) -> Result<()> {
        let mut lvs = self.lvs.lock().unwrap();
        let group = lvs
            .get_mut(vg)
            .ok_or_else(|| HostdError::not_found("volume group", vg))?;
        let size = group
            .remove(from)
            .ok_or_else(|| HostdError::not_found("logical volume", from))?;
        group.insert(to.to_string(), size);
        Ok(())
    }

    async fn lv_size(&self, lv_path: &Path) -> Result<u64> {
        let (vg, name) = Self::split(lv_path)?;
        self.lvs
            .lock()
            .unwrap()
            .get(&vg)
            .and_then(|g| g.get(&name).copied())
            .ok_or_else(|| HostdError::not_found("logical volume", name))
    }

    async fn lv_names(&self, vg: &str) -> Result<Vec<String>> {
        Ok(self.names(vg).into_iter().collect())
    }

    async fn vg_props(&self, vg: &str) -> Result<VgProps> {
        let lvs = self.lvs.lock().unwrap();
        let group = lvs
            .get(vg)
            .ok_or_else(|| HostdError::not_found("volume group", vg))?;
        let used: u64 = group.values().sum();
        Ok(VgProps {
            size_bytes: self.vg_size,
            free_bytes: self.vg_size.saturating_sub(used),
        })
    }
}

/// Pools of native images held in memory, sizes in MiB.
#[derive(Default)]
pub struct FakeBlockStore {
    pub images: Mutex<HashMap<(String, String), u64>>,
    pub imports: AtomicUsize,
}

impl FakeBlockStore {
    pub fn has(&self, pool: &str, name: &str) -> bool {
        self.images
            .lock()
            .unwrap()
            .contains_key(&(pool.to_string(), name.to_string()))
    }
}

fn key(pool: &str, name: &str) -> (String, String) {
    (pool.to_string(), name.to_string())
}

#[async_trait]
impl BlockStoreClient for FakeBlockStore {
    async fn create(&self, pool: &str, name: &str, size_mb: u64) -> Result<()> {
        self.images.lock().unwrap().insert(key(pool, name), size_mb);
        Ok(())
    }

    async fn resize(&self, pool: &str, name: &str, size_mb: u64) -> Result<()> {
        let mut images = self.images.lock().unwrap();
        let size = images
            .get_mut(&key(pool, name))
            .ok_or_else(|| HostdError::not_found("rbd image", name))?;
        *size = size_mb;
        Ok(())
    }

    async fn remove(&self, pool: &str, name: &str) -> Result<()> {
        self.images.lock().unwrap().remove(&key(pool, name));
        Ok(())
    }

    async fn exists(&self, pool: &str, name: &str) -> Result<bool> {
        Ok(self.has(pool, name))
    }

    async fn size_mb(&self, pool: &str, name: &str) -> Result<u64> {
        self.images
            .lock()
            .unwrap()
            .get(&key(pool, name))
            .copied()
            .ok_or_else(|| HostdError::not_found("rbd image", name))
    }

    async fn import(&self, src: &Path, pool: &str, name: &str) -> Result<()> {
        let image: FakeImage = serde_json::from_slice(&tokio::fs::read(src).await?)?;
        self.imports.fetch_add(1, Ordering::SeqCst);
        self.images
            .lock()
            .unwrap()
            .insert(key(pool, name), image.virtual_size / MB);
        Ok(())
    }

    async fn copy(&self, pool: &str, src: &str, dst: &str) -> Result<()> {
        let mut images = self.images.lock().unwrap();
        let size = *images
            .get(&key(pool, src))
            .ok_or_else(|| HostdError::not_found("rbd image", src))?;
        images.insert(key(pool, dst), size);
        Ok(())
    }

    async fn pool_stats(&self, _pool: &str) -> Result<PoolStats> {
        let used: u64 = self.images.lock().unwrap().values().sum::<u64>() * MB;
        let total = 100 * 1024 * MB;
        Ok(PoolStats {
            total_bytes: total,
            free_bytes: total - used,
            used_bytes: used,
        })
    }
}

#[derive(Default)]
pub struct FakeGuestFs {
    pub resized: Mutex<Vec<PathBuf>>,
    pub formatted: Mutex<Vec<(PathBuf, String)>>,
}

#[async_trait]
impl GuestFsOps for FakeGuestFs {
    async fn resize_fs(&self, image: &Path) -> Result<()> {
        self.resized.lock().unwrap().push(image.to_path_buf());
        Ok(())
    }

    async fn format_fs(&self, image: &Path, fs: &str, _uuid: Option<&str>) -> Result<()> {
        self.formatted
            .lock()
            .unwrap()
            .push((image.to_path_buf(), fs.to_string()));
        Ok(())
    }
}

pub fn cache_config(path: &Path) -> ImageCacheConfig {
    ImageCacheConfig {
        path: path.to_path_buf(),
        staleness_secs: 3600,
        retention_secs: 0,
        catalog_url: "http://catalog.test/v1".to_string(),
        fetch_attempts: 3,
    }
}

pub fn host_config(recycle: bool) -> HostConfig {
    HostConfig {
        zone_id: "zone-a".to_string(),
        snapshot_dir_suffix: "_snap".to_string(),
        recycle_diskfile: recycle,
        recycle_keep_days: 3,
        log_dir: PathBuf::from("/tmp"),
    }
}

/// Fakes shared by one test, plus the services built over them.
pub struct Harness {
    pub tool: Arc<FakeImageTool>,
    pub fetcher: Arc<FakeFetcher>,
    pub volumes: Arc<FakeVolumes>,
    pub block_store: Arc<FakeBlockStore>,
    pub guest_fs: Arc<FakeGuestFs>,
    pub recycle: bool,
}

impl Harness {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            tool: Arc::new(FakeImageTool::default()),
            fetcher: Arc::new(FakeFetcher::new(payload)),
            volumes: Arc::new(FakeVolumes::with_group("vg0", 100 * 1024 * MB)),
            block_store: Arc::new(FakeBlockStore::default()),
            guest_fs: Arc::new(FakeGuestFs::default()),
            recycle: false,
        }
    }

    pub fn services(
        &self,
        image_cache: Option<Arc<dyn crate::imagecache::ImageCacheManager>>,
    ) -> StorageServices {
        StorageServices {
            image_tool: self.tool.clone(),
            volumes: self.volumes.clone(),
            block_store: Some(self.block_store.clone()),
            guest_fs: Some(self.guest_fs.clone()),
            fetcher: self.fetcher.clone(),
            image_cache,
            host: host_config(self.recycle),
        }
    }

    pub fn base_storage(
        &self,
        storage_type: &str,
        path: &str,
        image_cache: Option<Arc<dyn crate::imagecache::ImageCacheManager>>,
    ) -> Arc<BaseStorage> {
        let entry = StorageEntry {
            id: format!("{storage_type}-0"),
            name: storage_type.to_string(),
            storage_type: storage_type.to_string(),
            path: path.to_string(),
            conf: serde_json::Value::Null,
        };
        BaseStorage::new(&entry, self.services(image_cache))
    }
}

/// Device nodes `0..count` exist and none is bound elsewhere.
pub struct FakeDevices {
    pub count: usize,
}

#[async_trait]
impl hostd_platform::DeviceProbe for FakeDevices {
    async fn exists(&self, device: &str) -> bool {
        device
            .strip_prefix("/dev/nbd")
            .and_then(|n| n.parse::<usize>().ok())
            .is_some_and(|n| n < self.count)
    }

    async fn is_busy(&self, _device: &str) -> bool {
        false
    }
}

/// Refuses every bind, so guest filesystem steps fail and get logged.
pub struct RefusingBinder;

#[async_trait]
impl hostd_platform::BlockBinder for RefusingBinder {
    async fn connect(&self, device: &str, _image: &Path, _read_only: bool) -> Result<()> {
        Err(HostdError::tool("qemu-nbd", device, "refused"))
    }

    async fn disconnect(&self, _device: &str) -> Result<()> {
        Ok(())
    }

    async fn partitions(&self, _device: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
