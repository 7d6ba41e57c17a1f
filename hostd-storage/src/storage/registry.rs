use super::{
    BaseStorage, LocalStorage, LvmStorage, RawDeviceStorage, RbdStorage, StorageOps,
    StorageServices,
};
use hostd_core::{
    HostdError, Result, STORAGE_TYPE_CLVM, STORAGE_TYPE_LOCAL, STORAGE_TYPE_LVM, STORAGE_TYPE_NFS,
    STORAGE_TYPE_RAW, STORAGE_TYPE_RBD, STORAGE_TYPE_SHARED_LVM, StorageEntry,
};
use std::collections::HashMap;
use std::sync::Arc;

pub type StorageFactory = fn(Arc<BaseStorage>) -> Arc<dyn StorageOps>;

/// Maps backend type names to the variant that serves them.
pub struct StorageRegistry {
    factories: HashMap<String, StorageFactory>,
}

fn local(base: Arc<BaseStorage>) -> Arc<dyn StorageOps> {
    Arc::new(LocalStorage::new(base))
}

fn lvm(base: Arc<BaseStorage>) -> Arc<dyn StorageOps> {
    Arc::new(LvmStorage::new(base))
}

fn rbd(base: Arc<BaseStorage>) -> Arc<dyn StorageOps> {
    Arc::new(RbdStorage::new(base))
}

fn raw(base: Arc<BaseStorage>) -> Arc<dyn StorageOps> {
    Arc::new(RawDeviceStorage::new(base))
}

impl StorageRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(STORAGE_TYPE_LOCAL, local);
        registry.register(STORAGE_TYPE_NFS, local);
        registry.register(STORAGE_TYPE_LVM, lvm);
        registry.register(STORAGE_TYPE_SHARED_LVM, lvm);
        registry.register(STORAGE_TYPE_CLVM, lvm);
        registry.register(STORAGE_TYPE_RBD, rbd);
        registry.register(STORAGE_TYPE_RAW, raw);
        registry
    }

    pub fn register(&mut self, storage_type: &str, factory: StorageFactory) {
        self.factories.insert(storage_type.to_string(), factory);
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn build(
        &self,
        entry: &StorageEntry,
        services: StorageServices,
    ) -> Result<Arc<dyn StorageOps>> {
        let factory = self.factories.get(&entry.storage_type).ok_or_else(|| {
            HostdError::Unsupported(format!(
                "storage {} has unknown type {}",
                entry.id, entry.storage_type
            ))
        })?;
        Ok(factory(BaseStorage::new(entry, services)))
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
