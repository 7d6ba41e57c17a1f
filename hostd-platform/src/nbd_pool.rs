use async_trait::async_trait;
use hostd_core::{DevicePoolConfig, HostdError, ResourceType, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// OS view of a device slot, independent of what this process believes.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn exists(&self, device: &str) -> bool;

    /// A slot can be busy without this process having marked it, e.g. left
    /// bound by a crashed agent.
    async fn is_busy(&self, device: &str) -> bool;
}

/// Probes nbd devices through `/dev` and `/sys/block`.
pub struct SysfsDeviceProbe {
    sys_block: PathBuf,
}

impl SysfsDeviceProbe {
    pub fn new() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
        }
    }

    fn sys_dir(&self, device: &str) -> PathBuf {
        let name = Path::new(device)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.sys_block.join(name)
    }
}

impl Default for SysfsDeviceProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceProbe for SysfsDeviceProbe {
    async fn exists(&self, device: &str) -> bool {
        tokio::fs::metadata(device).await.is_ok()
    }

    async fn is_busy(&self, device: &str) -> bool {
        let dir = self.sys_dir(device);
        if tokio::fs::metadata(dir.join("pid")).await.is_ok() {
            return true;
        }
        match tokio::fs::read_to_string(dir.join("size")).await {
            Ok(size) => size.trim().parse::<u64>().map(|s| s > 0).unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SlotStatus {
    pub device: String,
    pub busy: bool,
}

/// Fixed inventory of block-device slots shared by every disk operation on
/// the host. Allocation is a bounded scan under one lock and never waits for
/// a slot to free up.
pub struct DevicePool {
    device_prefix: String,
    max_devices: usize,
    probe: Arc<dyn DeviceProbe>,
    slots: Mutex<Vec<SlotStatus>>,
}

impl DevicePool {
    pub fn new(config: &DevicePoolConfig) -> Self {
        Self::with_probe(
            &config.device_prefix,
            config.max_devices,
            Arc::new(SysfsDeviceProbe::new()),
        )
    }

    pub fn with_probe(device_prefix: &str, max_devices: usize, probe: Arc<dyn DeviceProbe>) -> Self {
        Self {
            device_prefix: device_prefix.to_string(),
            max_devices,
            probe,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild the inventory from the device nodes present right now.
    pub async fn init(&self) -> Result<usize> {
        let mut slots = self.slots.lock().await;
        slots.clear();
        for i in 0..self.max_devices {
            let device = format!("{}{}", self.device_prefix, i);
            if self.probe.exists(&device).await {
                slots.push(SlotStatus {
                    device,
                    busy: false,
                });
            }
        }
        info!("Device pool initialised with {} slots", slots.len());
        Ok(slots.len())
    }

    /// Mark the first free slot busy and return its name, or `None` when every
    /// slot is taken.
    pub async fn allocate(&self) -> Option<String> {
        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut() {
            if slot.busy {
                continue;
            }
            if self.probe.is_busy(&slot.device).await {
                debug!("Slot {} is busy outside the pool", slot.device);
                continue;
            }
            slot.busy = true;
            debug!("Allocated slot {}", slot.device);
            return Some(slot.device.clone());
        }
        None
    }

    /// Like [`DevicePool::allocate`] but maps exhaustion to a retryable error.
    pub async fn acquire(&self) -> Result<String> {
        self.allocate()
            .await
            .ok_or_else(|| HostdError::ResourceExhausted {
                resource_type: ResourceType::DeviceSlot,
                message: "no free block device".to_string(),
            })
    }

    pub async fn release(&self, device: &str) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .iter_mut()
            .find(|s| s.device == device)
            .ok_or_else(|| HostdError::not_found("device slot", device))?;
        if !slot.busy {
            warn!("Releasing slot {} that was not allocated", device);
        }
        slot.busy = false;
        debug!("Released slot {}", device);
        Ok(())
    }

    pub async fn status(&self) -> Vec<SlotStatus> {
        self.slots.lock().await.clone()
    }

    pub async fn shutdown(&self) {
        let slots = self.slots.lock().await;
        let held: Vec<_> = slots.iter().filter(|s| s.busy).map(|s| &s.device).collect();
        if !held.is_empty() {
            warn!("Device pool shutting down with slots still held: {:?}", held);
        }
    }
}
