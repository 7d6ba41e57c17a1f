//! Disks, storage backends and the image cache of a hypervisor host.
//!
//! A [`StorageManager`] builds one [`StorageOps`] per configured storage.
//! Storages hand out [`DiskOps`] handles, and disks built from templates
//! pull their base image through an [`ImageCacheManager`].

pub mod disk;
pub mod imagecache;
pub mod imgtool;
pub mod lvm;
pub mod manager;
pub mod rbd;
pub mod storage;

#[cfg(test)]
mod tests;

pub use disk::{DeleteSnapshotOptions, DiskDescription, DiskOps, SnapshotSource};
pub use imagecache::{
    AcquireRequest, CachedImage, CachedImageDesc, FileBookkeeping, HttpImageFetcher,
    ImageBookkeeping, ImageCache, ImageCacheManager, ImageFetcher, ReconcileReport,
};
pub use imgtool::{ImageInfo, ImageTool, QemuImgTool, backing_chain};
pub use lvm::{LvmCli, VgProps, VolumeManager};
pub use manager::{HostServices, StorageManager};
pub use rbd::{BlockStoreClient, PoolStats, RbdCli};
pub use storage::{BaseStorage, StorageOps, StorageRegistry, StorageServices};
