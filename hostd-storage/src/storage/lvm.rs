use super::{BaseStorage, StorageOps, capacity_from_bytes};
use crate::disk::{DiskOps, LvmDisk, lvm_snapshot_name};
use async_trait::async_trait;
use crate::lvm::{IMAGECACHE_LV_PREFIX, SNAPSHOT_LV_PREFIX};
use hostd_core::{Result, STORAGE_TYPE_CLVM, StorageCapacity};
use hostd_platform::run_tool;
use std::path::PathBuf;
use std::sync::Arc;

/// Disks as logical volumes of one volume group. Serves local, shared and
/// clustered groups; only the clustered flavour refuses chain operations.
pub struct LvmStorage {
    base: Arc<BaseStorage>,
}

impl LvmStorage {
    pub fn new(base: Arc<BaseStorage>) -> Self {
        Self { base }
    }

    fn vg(&self) -> String {
        self.base
            .path
            .to_string_lossy()
            .trim_start_matches("/dev/")
            .to_string()
    }
}

#[async_trait]
impl StorageOps for LvmStorage {
    fn base(&self) -> &Arc<BaseStorage> {
        &self.base
    }

    fn make_disk(&self, disk_id: &str) -> Arc<dyn DiskOps> {
        let chain_snapshots = self.base.storage_type != STORAGE_TYPE_CLVM;
        Arc::new(LvmDisk::new(disk_id, &self.base, chain_snapshots))
    }

    fn snapshot_path(&self, _disk_id: &str, snapshot_id: &str) -> PathBuf {
        crate::lvm::lv_path(&self.vg(), &lvm_snapshot_name(snapshot_id))
    }

    async fn snapshot_exists(&self, _disk_id: &str, snapshot_id: &str) -> bool {
        match self.base.services.volumes.lv_names(&self.vg()).await {
            Ok(names) => names.contains(&lvm_snapshot_name(snapshot_id)),
            Err(_) => false,
        }
    }

    async fn capacity(&self) -> Result<StorageCapacity> {
        let props = self.base.services.volumes.vg_props(&self.vg()).await?;
        Ok(capacity_from_bytes(props.size_bytes, props.free_bytes))
    }

    async fn accessible(&self) -> Result<()> {
        run_tool("pvscan", ["--cache"], "rescan physical volumes").await?;
        self.base.services.volumes.vg_props(&self.vg()).await?;
        Ok(())
    }

    async fn disk_ids_on_media(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .base
            .services
            .volumes
            .lv_names(&self.vg())
            .await?
            .into_iter()
            .filter(|n| {
                !n.starts_with(SNAPSHOT_LV_PREFIX)
                    && !n.starts_with(IMAGECACHE_LV_PREFIX)
                    && !n.ends_with(".tmp")
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}
