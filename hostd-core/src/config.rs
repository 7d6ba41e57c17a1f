use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const STORAGE_TYPE_LOCAL: &str = "local";
pub const STORAGE_TYPE_NFS: &str = "nfs";
pub const STORAGE_TYPE_LVM: &str = "lvm";
pub const STORAGE_TYPE_CLVM: &str = "clvm";
pub const STORAGE_TYPE_SHARED_LVM: &str = "slvm";
pub const STORAGE_TYPE_RBD: &str = "rbd";
pub const STORAGE_TYPE_RAW: &str = "raw";

pub const KNOWN_STORAGE_TYPES: &[&str] = &[
    STORAGE_TYPE_LOCAL,
    STORAGE_TYPE_NFS,
    STORAGE_TYPE_LVM,
    STORAGE_TYPE_CLVM,
    STORAGE_TYPE_SHARED_LVM,
    STORAGE_TYPE_RBD,
    STORAGE_TYPE_RAW,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub host: HostConfig,
    pub image_cache: ImageCacheConfig,
    pub device_pool: DevicePoolConfig,
    #[serde(default)]
    pub storages: Vec<StorageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub zone_id: String,
    pub snapshot_dir_suffix: String,
    pub recycle_diskfile: bool,
    pub recycle_keep_days: u32,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCacheConfig {
    pub path: PathBuf,
    /// Entries verified more recently than this are trusted without a re-check.
    pub staleness_secs: u64,
    /// Unreferenced entries are kept at least this long before eviction.
    pub retention_secs: u64,
    pub catalog_url: String,
    pub fetch_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePoolConfig {
    pub device_prefix: String,
    pub max_devices: usize,
    pub bind_attempts: u32,
    pub bind_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEntry {
    pub id: String,
    pub name: String,
    pub storage_type: String,
    /// Mount path, volume group name or pool name depending on the backend.
    pub path: String,
    #[serde(default)]
    pub conf: serde_json::Value,
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> crate::Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = serde_yaml::from_str(&content)
                .map_err(|e| crate::HostdError::ConfigError(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> crate::Result<()> {
        let config_path = Self::config_path()?;
        if let Some(config_dir) = config_path.parent() {
            std::fs::create_dir_all(config_dir)?;
        }

        let content = serde_yaml::to_string(self)
            .map_err(|e| crate::HostdError::ConfigError(e.to_string()))?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    fn config_path() -> crate::Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            crate::HostdError::ConfigError("Cannot determine home directory".to_string())
        })?;
        Ok(home.join(".hostd").join("config.yaml"))
    }

    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.storages {
            if !seen.insert(entry.id.as_str()) {
                return Err(crate::HostdError::ConfigError(format!(
                    "Duplicate storage id {}",
                    entry.id
                )));
            }
            if entry.path.trim().is_empty() {
                return Err(crate::HostdError::ConfigError(format!(
                    "Storage {} has an empty path",
                    entry.id
                )));
            }
            if !KNOWN_STORAGE_TYPES.contains(&entry.storage_type.as_str()) {
                return Err(crate::HostdError::ConfigError(format!(
                    "Storage {} has unknown type {}",
                    entry.id, entry.storage_type
                )));
            }
        }
        if self.device_pool.max_devices == 0 {
            return Err(crate::HostdError::ConfigError(
                "device_pool.max_devices must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hostd");

        Self {
            version: "1.0".to_string(),
            host: HostConfig {
                zone_id: "default".to_string(),
                snapshot_dir_suffix: "_snap".to_string(),
                recycle_diskfile: true,
                recycle_keep_days: 3,
                log_dir: base.join("logs"),
            },
            image_cache: ImageCacheConfig {
                path: PathBuf::from("/opt/cloud/workspace/disks/image_cache"),
                staleness_secs: 3600,
                retention_secs: 7 * 24 * 3600,
                catalog_url: "http://127.0.0.1:9292/v1".to_string(),
                fetch_attempts: 3,
            },
            device_pool: DevicePoolConfig {
                device_prefix: "/dev/nbd".to_string(),
                max_devices: 16,
                bind_attempts: 3,
                bind_backoff_ms: 500,
            },
            storages: vec![StorageEntry {
                id: "local-0".to_string(),
                name: "local".to_string(),
                storage_type: STORAGE_TYPE_LOCAL.to_string(),
                path: "/opt/cloud/workspace/disks".to_string(),
                conf: serde_json::Value::Null,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.host.snapshot_dir_suffix, "_snap");
        assert_eq!(config.device_pool.max_devices, 16);
    }

    #[test]
    fn test_load_rejects_duplicate_storage_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        let dup = config.storages[0].clone();
        config.storages.push(dup);
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Duplicate storage id"));
    }

    #[test]
    fn test_unknown_storage_type_rejected() {
        let mut config = Config::default();
        config.storages[0].storage_type = "tape".to_string();
        assert!(config.validate().is_err());
    }
}
