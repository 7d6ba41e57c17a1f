//! Per-backend caches of base images with single-flight fetches,
//! reference counts and reconciliation against the control plane.

mod fetcher;
mod local;
mod lvm;
mod rbd;
mod reconcile;

pub use fetcher::{FetchOutcome, HttpImageFetcher, ImageFetcher, sha256_file};
pub use local::LocalFiles;
pub use lvm::LvmVolumes;
pub use rbd::RbdImages;
pub use reconcile::{FileBookkeeping, ImageBookkeeping};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostd_core::{HostdError, ImageCacheConfig, ImageFormat, KeyedLocks, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub image_id: String,
    pub zone: String,
    /// Fetched from the catalog when absent.
    pub source_url: Option<String>,
    pub format: Option<ImageFormat>,
    /// Lowercase hex SHA-256.
    pub checksum: Option<String>,
}

impl AcquireRequest {
    pub fn new(image_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            zone: String::new(),
            source_url: None,
            format: None,
            checksum: None,
        }
    }
}

/// What the sidecar descriptor records about a cached image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedImageDesc {
    pub name: String,
    pub format: ImageFormat,
    pub checksum: String,
    pub size_bytes: u64,
    /// Virtual size in MiB.
    pub size_mb: u64,
    pub last_access: DateTime<Utc>,
}

/// A cache entry as handed to a consumer.
#[derive(Debug, Clone, Serialize)]
pub struct CachedImage {
    pub id: String,
    /// File path, volume path, or native image name of the cached copy.
    pub path: PathBuf,
    pub desc: CachedImageDesc,
    pub consumers: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Deleted from local media.
    pub removed: Vec<String>,
    /// Referenced by the control plane but not cached here.
    pub detached: Vec<String>,
}

#[async_trait]
pub trait ImageCacheManager: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Restore entries persisted by a previous run.
    async fn load(&self) -> Result<usize>;

    async fn acquire(&self, req: &AcquireRequest) -> Result<CachedImage>;

    /// Drop one consumer. Releasing more than was acquired is an error.
    async fn release(&self, image_id: &str) -> Result<()>;

    fn list(&self) -> Vec<CachedImage>;

    /// Delete an unused entry.
    async fn remove(&self, image_id: &str) -> Result<()>;

    /// Evict idle entries nobody references and report referenced ids
    /// that are not cached. `chain_refs` is `None` when the disks' backing
    /// chains could not all be walked; nothing is evicted then.
    async fn reconcile(
        &self,
        control_plane: &HashSet<String>,
        chain_refs: Option<&HashSet<String>>,
    ) -> Result<ReconcileReport>;

    /// The image whose cached copy lives at `path`, if any.
    fn image_id_for_path(&self, path: &Path) -> Option<String>;
}

/// Where and how one cache variant stores its copies.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    fn location(&self, image_id: &str) -> PathBuf;

    /// Persisted entries, cleaning up anything half-written.
    async fn scan(&self) -> Result<Vec<(String, CachedImageDesc)>>;

    /// Produce a verified copy. `previous` is the stale descriptor of a
    /// copy that may still be usable.
    async fn materialize(
        &self,
        req: &AcquireRequest,
        previous: Option<&CachedImageDesc>,
    ) -> Result<CachedImageDesc>;

    async fn remove(&self, image_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Failure {
    integrity: bool,
    retryable: bool,
    message: String,
}

impl Failure {
    fn from_error(e: &HostdError) -> Self {
        Self {
            integrity: matches!(e, HostdError::Integrity { .. }),
            retryable: e.is_retryable(),
            message: e.to_string(),
        }
    }

    fn to_error(&self, image_id: &str) -> HostdError {
        if self.integrity {
            HostdError::Integrity {
                subject: image_id.to_string(),
                message: self.message.clone(),
            }
        } else if self.retryable {
            HostdError::NetworkError {
                operation: format!("fetch image {image_id}"),
                cause: self.message.clone(),
            }
        } else {
            HostdError::StorageError(format!("fetch of image {image_id} failed: {}", self.message))
        }
    }
}

#[derive(Default)]
struct EntryState {
    desc: Option<CachedImageDesc>,
    consumers: u32,
    fetching: bool,
    generation: u64,
    failure: Option<(u64, Failure)>,
    verified_at: Option<Instant>,
    idle_since: Option<DateTime<Utc>>,
}

impl EntryState {
    fn is_fresh(&self, staleness: Duration) -> bool {
        self.verified_at.is_some_and(|at| at.elapsed() < staleness)
    }
}

struct CacheEntry {
    state: Mutex<EntryState>,
    settled: Notify,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState::default()),
            settled: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Resolves an in-flight fetch exactly once. Dropping it unresolved (the
/// fetching task was cancelled) counts as a failure so waiters wake up.
struct Settle<'a> {
    entry: &'a CacheEntry,
    generation: u64,
    done: bool,
}

impl Settle<'_> {
    fn succeed(mut self, desc: CachedImageDesc) -> u32 {
        let consumers = {
            let mut st = self.entry.lock();
            st.desc = Some(desc);
            st.consumers += 1;
            st.fetching = false;
            st.failure = None;
            st.verified_at = Some(Instant::now());
            st.idle_since = None;
            st.consumers
        };
        self.done = true;
        self.entry.settled.notify_waiters();
        consumers
    }

    fn fail(mut self, failure: Failure) {
        self.record(failure);
        self.done = true;
    }

    fn record(&self, failure: Failure) {
        {
            let mut st = self.entry.lock();
            st.desc = None;
            st.fetching = false;
            st.verified_at = None;
            st.failure = Some((self.generation, failure));
            if st.consumers == 0 {
                st.idle_since = Some(Utc::now());
            }
        }
        self.entry.settled.notify_waiters();
    }
}

impl Drop for Settle<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.record(Failure {
                integrity: false,
                retryable: true,
                message: "fetch abandoned".to_string(),
            });
        }
    }
}

enum Step<'a> {
    Hit(CachedImage),
    Failed(HostdError),
    Wait(Notified<'a>, u64),
    Fetch(u64, Option<CachedImageDesc>),
}

/// The cache engine, generic over where copies are stored.
pub struct ImageCache<B> {
    backend: B,
    entries: Mutex<HashMap<String, Arc<CacheEntry>>>,
    locks: KeyedLocks,
    staleness: Duration,
    retention: Duration,
}

pub type LocalImageCache = ImageCache<LocalFiles>;
pub type LvmImageCache = ImageCache<LvmVolumes>;
pub type RbdImageCache = ImageCache<RbdImages>;

impl<B: CacheBackend> ImageCache<B> {
    pub fn new(backend: B, config: &ImageCacheConfig) -> Self {
        Self {
            backend,
            entries: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
            staleness: Duration::from_secs(config.staleness_secs),
            retention: Duration::from_secs(config.retention_secs),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<CacheEntry>>> {
        match self.entries.lock() {
            Ok(e) => e,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn entry(&self, image_id: &str) -> Arc<CacheEntry> {
        self.entries()
            .entry(image_id.to_string())
            .or_insert_with(|| Arc::new(CacheEntry::new()))
            .clone()
    }

    fn existing(&self, image_id: &str) -> Option<Arc<CacheEntry>> {
        self.entries().get(image_id).cloned()
    }

    fn handle(&self, image_id: &str, desc: CachedImageDesc, consumers: u32) -> CachedImage {
        CachedImage {
            id: image_id.to_string(),
            path: self.backend.location(image_id),
            desc,
            consumers,
        }
    }

    /// Current consumer count; zero for unknown images.
    pub fn consumers(&self, image_id: &str) -> u32 {
        self.existing(image_id).map_or(0, |e| e.lock().consumers)
    }

    fn step<'a>(
        &self,
        req: &AcquireRequest,
        entry: &'a CacheEntry,
        waited_for: Option<u64>,
    ) -> Step<'a> {
        let image_id = req.image_id.as_str();
        let mut st = entry.lock();
        if let (Some(generation), Some((failed, failure))) = (waited_for, &st.failure) {
            if *failed == generation {
                return Step::Failed(failure.to_error(image_id));
            }
        }
        // A cached copy that differs from the digest the caller expects is
        // stale, unless someone still uses it.
        let mismatched = match (&st.desc, req.checksum.as_deref()) {
            (Some(desc), Some(expected)) => !expected.eq_ignore_ascii_case(&desc.checksum),
            _ => false,
        };
        if mismatched && st.consumers > 0 {
            return Step::Failed(HostdError::Integrity {
                subject: image_id.to_string(),
                message: format!(
                    "cached copy does not match the expected checksum and has {} consumers",
                    st.consumers
                ),
            });
        }
        if !mismatched
            && !st.fetching
            && st.desc.is_some()
            && (st.consumers > 0 || st.is_fresh(self.staleness))
        {
            st.consumers += 1;
            st.idle_since = None;
            let consumers = st.consumers;
            if let Some(desc) = st.desc.clone() {
                return Step::Hit(self.handle(image_id, desc, consumers));
            }
        }
        if st.fetching {
            return Step::Wait(entry.settled.notified(), st.generation);
        }
        st.fetching = true;
        st.generation += 1;
        let previous = if mismatched { None } else { st.desc.clone() };
        Step::Fetch(st.generation, previous)
    }
}

#[async_trait]
impl<B: CacheBackend> ImageCacheManager for ImageCache<B> {
    fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    async fn load(&self) -> Result<usize> {
        let found = self.backend.scan().await?;
        let count = found.len();
        for (image_id, desc) in found {
            let entry = self.entry(&image_id);
            let mut st = entry.lock();
            st.idle_since = Some(desc.last_access);
            st.desc = Some(desc);
        }
        info!("Loaded {} cached images into {} cache", count, self.backend.kind());
        Ok(count)
    }

    async fn acquire(&self, req: &AcquireRequest) -> Result<CachedImage> {
        let image_id = req.image_id.as_str();
        if image_id.is_empty() {
            return Err(HostdError::InvalidArgument("image id is empty".to_string()));
        }

        let mut waited_for = None;
        loop {
            let key_guard = self.locks.lock(image_id).await;
            let entry = self.entry(image_id);
            match self.step(req, &entry, waited_for.take()) {
                Step::Hit(image) => {
                    debug!("Image {} cache hit, {} consumers", image_id, image.consumers);
                    return Ok(image);
                }
                Step::Failed(e) => return Err(e),
                Step::Wait(notified, generation) => {
                    drop(key_guard);
                    debug!("Waiting for in-flight fetch of image {}", image_id);
                    notified.await;
                    waited_for = Some(generation);
                }
                Step::Fetch(generation, previous) => {
                    drop(key_guard);
                    let settle = Settle {
                        entry: &entry,
                        generation,
                        done: false,
                    };
                    return match self.backend.materialize(req, previous.as_ref()).await {
                        Ok(desc) => {
                            let consumers = settle.succeed(desc.clone());
                            info!("Cached image {} in {} cache", image_id, self.backend.kind());
                            Ok(self.handle(image_id, desc, consumers))
                        }
                        Err(e) => {
                            warn!("Fetching image {} failed: {}", image_id, e);
                            settle.fail(Failure::from_error(&e));
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    async fn release(&self, image_id: &str) -> Result<()> {
        let entry = self.existing(image_id).ok_or_else(|| {
            HostdError::InvalidState(format!("release of image {image_id} that was never acquired"))
        })?;
        let mut st = entry.lock();
        if st.consumers == 0 {
            return Err(HostdError::InvalidState(format!(
                "release of image {image_id} without a matching acquire"
            )));
        }
        st.consumers -= 1;
        if st.consumers == 0 {
            st.idle_since = Some(Utc::now());
        }
        Ok(())
    }

    fn list(&self) -> Vec<CachedImage> {
        let entries: Vec<(String, Arc<CacheEntry>)> = self
            .entries()
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        let mut images: Vec<CachedImage> = entries
            .into_iter()
            .filter_map(|(id, entry)| {
                let st = entry.lock();
                st.desc
                    .clone()
                    .map(|desc| self.handle(&id, desc, st.consumers))
            })
            .collect();
        images.sort_by(|a, b| a.id.cmp(&b.id));
        images
    }

    async fn remove(&self, image_id: &str) -> Result<()> {
        let _key_guard = self.locks.lock(image_id).await;
        let entry = self
            .existing(image_id)
            .ok_or_else(|| HostdError::not_found("cached image", image_id))?;
        {
            let st = entry.lock();
            if st.consumers > 0 || st.fetching {
                return Err(HostdError::InvalidState(format!(
                    "image {image_id} is in use by {} consumers",
                    st.consumers
                )));
            }
        }
        self.backend.remove(image_id).await?;
        self.entries().remove(image_id);
        info!("Removed image {} from {} cache", image_id, self.backend.kind());
        Ok(())
    }

    async fn reconcile(
        &self,
        control_plane: &HashSet<String>,
        chain_refs: Option<&HashSet<String>>,
    ) -> Result<ReconcileReport> {
        let now = Utc::now();
        let candidates: Vec<String> = match chain_refs {
            Some(_) => self.entries().keys().cloned().collect(),
            None => {
                warn!(
                    "Backing chains unknown, not evicting from {} cache",
                    self.backend.kind()
                );
                Vec::new()
            }
        };
        let mut report = ReconcileReport::default();

        for image_id in candidates {
            if control_plane.contains(&image_id)
                || chain_refs.is_some_and(|refs| refs.contains(&image_id))
            {
                continue;
            }
            let _key_guard = self.locks.lock(&image_id).await;
            let Some(entry) = self.existing(&image_id) else {
                continue;
            };
            let expired = {
                let st = entry.lock();
                st.consumers == 0
                    && !st.fetching
                    && st
                        .idle_since
                        .and_then(|since| (now - since).to_std().ok())
                        .is_some_and(|idle| idle >= self.retention)
            };
            if !expired {
                continue;
            }
            match self.backend.remove(&image_id).await {
                Ok(()) => {
                    self.entries().remove(&image_id);
                    report.removed.push(image_id);
                }
                Err(e) => warn!("Failed to evict image {}: {}", image_id, e),
            }
        }

        for image_id in control_plane {
            let cached = self
                .existing(image_id)
                .is_some_and(|e| e.lock().desc.is_some());
            if !cached {
                report.detached.push(image_id.clone());
            }
        }
        report.removed.sort();
        report.detached.sort();
        if !report.removed.is_empty() || !report.detached.is_empty() {
            info!(
                "Reconciled {} cache: {} removed, {} detached",
                self.backend.kind(),
                report.removed.len(),
                report.detached.len()
            );
        }
        Ok(report)
    }

    fn image_id_for_path(&self, path: &Path) -> Option<String> {
        self.entries()
            .keys()
            .find(|id| self.backend.location(id) == path)
            .cloned()
    }
}
