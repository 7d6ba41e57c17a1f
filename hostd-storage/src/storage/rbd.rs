use super::{BaseStorage, StorageOps, capacity_from_bytes};
use crate::disk::{DiskOps, RbdDisk};
use crate::rbd::{BlockStoreClient, RbdCli};
use async_trait::async_trait;
use hostd_core::{Result, StorageCapacity};
use std::sync::Arc;

/// Disks as native images in one pool of a distributed block store.
pub struct RbdStorage {
    base: Arc<BaseStorage>,
    client: Arc<dyn BlockStoreClient>,
}

impl RbdStorage {
    pub fn new(base: Arc<BaseStorage>) -> Self {
        let client = match &base.services.block_store {
            Some(client) => client.clone(),
            None => Arc::new(RbdCli::new(&base.conf)) as Arc<dyn BlockStoreClient>,
        };
        Self { base, client }
    }

    fn pool(&self) -> String {
        self.base.path.to_string_lossy().into_owned()
    }
}

#[async_trait]
impl StorageOps for RbdStorage {
    fn base(&self) -> &Arc<BaseStorage> {
        &self.base
    }

    fn make_disk(&self, disk_id: &str) -> Arc<dyn DiskOps> {
        Arc::new(RbdDisk::new(disk_id, &self.base, self.client.clone()))
    }

    async fn capacity(&self) -> Result<StorageCapacity> {
        let stats = self.client.pool_stats(&self.pool()).await?;
        Ok(capacity_from_bytes(stats.total_bytes, stats.free_bytes))
    }

    async fn accessible(&self) -> Result<()> {
        self.client.pool_stats(&self.pool()).await?;
        Ok(())
    }
}
