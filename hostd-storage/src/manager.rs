use crate::disk::DiskOps;
use crate::imagecache::{
    HttpImageFetcher, ImageBookkeeping, ImageCache, ImageCacheManager, ImageFetcher, LocalFiles,
    LocalImageCache, LvmVolumes, RbdImages, ReconcileReport,
};
use crate::imgtool::{ImageTool, QemuImgTool, backing_chain};
use crate::lvm::{LvmCli, VolumeManager};
use crate::rbd::{BlockStoreClient, RbdCli};
use crate::storage::{StorageOps, StorageRegistry, StorageServices};
use hostd_core::{
    Config, HostdError, Result, STORAGE_TYPE_CLVM, STORAGE_TYPE_LVM, STORAGE_TYPE_RAW,
    STORAGE_TYPE_RBD, STORAGE_TYPE_SHARED_LVM, StorageEntry,
};
use hostd_platform::{
    BlockBinder, DevicePool, DeviceProbe, GuestDiskMounter, GuestFsOps, QemuNbdBinder,
    SysfsDeviceProbe,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// The host-side collaborators the manager wires together. Tests swap in
/// fakes; [`HostServices::system`] uses the real tools.
#[derive(Clone)]
pub struct HostServices {
    pub image_tool: Arc<dyn ImageTool>,
    pub volumes: Arc<dyn VolumeManager>,
    pub block_store: Option<Arc<dyn BlockStoreClient>>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub device_probe: Arc<dyn DeviceProbe>,
    pub binder: Arc<dyn BlockBinder>,
    pub mount_base: PathBuf,
}

impl HostServices {
    pub fn system() -> Self {
        Self {
            image_tool: Arc::new(QemuImgTool::new()),
            volumes: Arc::new(LvmCli::new()),
            block_store: None,
            fetcher: Arc::new(HttpImageFetcher::new()),
            device_probe: Arc::new(SysfsDeviceProbe::new()),
            binder: Arc::new(QemuNbdBinder::new()),
            mount_base: std::env::temp_dir().join("hostd").join("mnt"),
        }
    }
}

/// Application context: every configured storage, the image caches that
/// serve them, and the device pool behind the mount bridge.
pub struct StorageManager {
    config: Config,
    services: HostServices,
    registry: StorageRegistry,
    device_pool: Arc<DevicePool>,
    mounter: Arc<GuestDiskMounter>,
    local_cache: Arc<LocalImageCache>,
    caches: RwLock<HashMap<String, Arc<dyn ImageCacheManager>>>,
    storages: RwLock<HashMap<String, Arc<dyn StorageOps>>>,
}

impl StorageManager {
    pub fn new(config: Config, services: HostServices) -> Self {
        let device_pool = Arc::new(DevicePool::with_probe(
            &config.device_pool.device_prefix,
            config.device_pool.max_devices,
            services.device_probe.clone(),
        ));
        let mounter = Arc::new(GuestDiskMounter::new(
            device_pool.clone(),
            services.binder.clone(),
            &config.device_pool,
            services.mount_base.clone(),
        ));
        let local_cache = Arc::new(ImageCache::new(
            LocalFiles::new(
                config.image_cache.path.clone(),
                services.fetcher.clone(),
                services.image_tool.clone(),
                &config.image_cache,
            ),
            &config.image_cache,
        ));

        Self {
            config,
            services,
            registry: StorageRegistry::with_builtin(),
            device_pool,
            mounter,
            local_cache,
            caches: RwLock::new(HashMap::new()),
            storages: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_registry(mut self, registry: StorageRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device_pool(&self) -> &Arc<DevicePool> {
        &self.device_pool
    }

    pub fn mounter(&self) -> &Arc<GuestDiskMounter> {
        &self.mounter
    }

    pub fn local_cache(&self) -> &Arc<LocalImageCache> {
        &self.local_cache
    }

    /// Scan the device pool, restore cached images and build every
    /// configured storage. Unreachable storages are kept and logged.
    pub async fn init(&self) -> Result<()> {
        self.config.validate()?;
        let slots = self.device_pool.init().await?;
        self.local_cache.load().await?;
        self.caches.write().await.insert(
            "local".to_string(),
            self.local_cache.clone() as Arc<dyn ImageCacheManager>,
        );

        for entry in &self.config.storages {
            let cache = self.cache_for(entry).await?;
            let storage = self.registry.build(entry, self.storage_services(cache))?;
            if let Err(e) = storage.accessible().await {
                warn!("Storage {} ({}) is not accessible: {}", entry.id, entry.path, e);
            }
            self.storages.write().await.insert(entry.id.clone(), storage);
        }
        info!(
            "Storage manager ready: {} storages, {} device slots",
            self.config.storages.len(),
            slots
        );
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.device_pool.shutdown().await;
        self.storages.write().await.clear();
        self.caches.write().await.clear();
        info!("Storage manager stopped");
    }

    fn storage_services(&self, image_cache: Option<Arc<dyn ImageCacheManager>>) -> StorageServices {
        StorageServices {
            image_tool: self.services.image_tool.clone(),
            volumes: self.services.volumes.clone(),
            block_store: self.services.block_store.clone(),
            guest_fs: Some(self.mounter.clone() as Arc<dyn GuestFsOps>),
            fetcher: self.services.fetcher.clone(),
            image_cache,
            host: self.config.host.clone(),
        }
    }

    fn block_store(&self, entry: &StorageEntry) -> Arc<dyn BlockStoreClient> {
        match &self.services.block_store {
            Some(client) => client.clone(),
            None => Arc::new(RbdCli::new(&entry.conf)),
        }
    }

    /// The cache serving `entry`'s backend, created and loaded on first use.
    async fn cache_for(&self, entry: &StorageEntry) -> Result<Option<Arc<dyn ImageCacheManager>>> {
        let cache_config = &self.config.image_cache;
        let location = entry.path.trim_start_matches("/dev/").to_string();
        let key = match entry.storage_type.as_str() {
            STORAGE_TYPE_LVM | STORAGE_TYPE_SHARED_LVM | STORAGE_TYPE_CLVM => {
                format!("lvm:{location}")
            }
            STORAGE_TYPE_RBD => format!("rbd:{location}"),
            STORAGE_TYPE_RAW => return Ok(None),
            _ => return Ok(Some(self.local_cache.clone() as Arc<dyn ImageCacheManager>)),
        };
        if let Some(cache) = self.caches.read().await.get(&key) {
            return Ok(Some(cache.clone()));
        }

        let cache: Arc<dyn ImageCacheManager> = if entry.storage_type == STORAGE_TYPE_RBD {
            let staging = LocalFiles::new(
                cache_config.path.join("rbd-staging").join(&location),
                self.services.fetcher.clone(),
                self.services.image_tool.clone(),
                cache_config,
            );
            Arc::new(ImageCache::new(
                RbdImages::new(
                    location.clone(),
                    self.block_store(entry),
                    staging,
                    self.services.image_tool.clone(),
                    cache_config.path.join("rbd").join(&location),
                ),
                cache_config,
            ))
        } else {
            Arc::new(ImageCache::new(
                LvmVolumes::new(
                    location.clone(),
                    self.local_cache.clone(),
                    self.services.volumes.clone(),
                    self.services.image_tool.clone(),
                    cache_config.path.join("lvm").join(&location),
                ),
                cache_config,
            ))
        };
        if let Err(e) = cache.load().await {
            warn!("Failed to load {} cache: {}", key, e);
        }
        self.caches.write().await.insert(key, cache.clone());
        Ok(Some(cache))
    }

    pub async fn storage(&self, storage_id: &str) -> Result<Arc<dyn StorageOps>> {
        self.storages
            .read()
            .await
            .get(storage_id)
            .cloned()
            .ok_or_else(|| HostdError::not_found("storage", storage_id))
    }

    pub async fn storages(&self) -> Vec<Arc<dyn StorageOps>> {
        let mut storages: Vec<_> = self.storages.read().await.values().cloned().collect();
        storages.sort_by(|a, b| a.id().cmp(b.id()));
        storages
    }

    pub async fn caches(&self) -> Vec<(String, Arc<dyn ImageCacheManager>)> {
        let mut caches: Vec<_> = self
            .caches
            .read()
            .await
            .iter()
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();
        caches.sort_by(|a, b| a.0.cmp(&b.0));
        caches
    }

    /// Cache registered under `key`: `local`, `lvm:<vg>` or `rbd:<pool>`.
    pub async fn cache(&self, key: &str) -> Result<Arc<dyn ImageCacheManager>> {
        self.caches
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| HostdError::not_found("image cache", key))
    }

    /// Locate a disk on any storage.
    pub async fn find_disk(
        &self,
        disk_id: &str,
    ) -> Result<(Arc<dyn StorageOps>, Arc<dyn DiskOps>)> {
        for storage in self.storages().await {
            match storage.get_disk_by_id(disk_id).await {
                Ok(disk) => return Ok((storage, disk)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => debug!("Looking up {} on {} failed: {}", disk_id, storage.id(), e),
            }
        }
        Err(HostdError::not_found("disk", disk_id))
    }

    /// Cached image ids that some disk's backing chain still points at.
    /// Fails if any storage listing, disk lookup or chain walk fails, since
    /// a partial set would leave live templates unprotected.
    pub async fn chain_references(&self) -> Result<HashSet<String>> {
        let caches: Vec<_> = self.caches().await.into_iter().map(|(_, c)| c).collect();
        let mut refs = HashSet::new();
        for storage in self.storages().await {
            for disk_id in storage.disk_ids_on_media().await? {
                let disk = match storage.get_disk_by_id(&disk_id).await {
                    Ok(disk) => disk,
                    // Deleted since the listing.
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
                let path = disk.path();
                if path.as_os_str().is_empty() {
                    continue;
                }
                for link in backing_chain(self.services.image_tool.as_ref(), &path).await? {
                    refs.extend(caches.iter().filter_map(|c| c.image_id_for_path(&link)));
                }
            }
        }
        Ok(refs)
    }

    /// Compare every cache against the control plane's bookkeeping and
    /// report what was evicted or is missing. When the chain references
    /// cannot be collected the pass only reports.
    pub async fn reconcile_caches(
        &self,
        bookkeeping: &dyn ImageBookkeeping,
    ) -> Result<Vec<(String, ReconcileReport)>> {
        let chain_refs = match self.chain_references().await {
            Ok(refs) => Some(refs),
            Err(e) => {
                warn!("Cannot collect backing-chain references, skipping eviction: {}", e);
                None
            }
        };
        let mut reports = Vec::new();
        for (key, cache) in self.caches().await {
            let referenced = bookkeeping.referenced_images(cache.kind()).await?;
            let report = cache.reconcile(&referenced, chain_refs.as_ref()).await?;
            bookkeeping.report(cache.kind(), &report).await?;
            reports.push((key, report));
        }
        Ok(reports)
    }

    pub async fn clean_recycle_bins(&self) -> Result<usize> {
        let mut removed = 0;
        for storage in self.storages().await {
            removed += storage.base().clean_recycle_bin().await?;
        }
        Ok(removed)
    }
}
