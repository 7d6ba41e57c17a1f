use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Opaque handle carried by every core operation so results can be routed
/// back through the task-completion channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: String,
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_id(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
        }
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Vmdk,
    Vhd,
}

impl ImageFormat {
    /// Name understood by qemu-img's `-f`/`-O` options.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vhd => "vpc",
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ImageFormat {
    type Err = crate::HostdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(ImageFormat::Raw),
            "qcow2" => Ok(ImageFormat::Qcow2),
            "vmdk" => Ok(ImageFormat::Vmdk),
            "vpc" | "vhd" | "vhdx" => Ok(ImageFormat::Vhd),
            other => Err(crate::HostdError::InvalidArgument(format!(
                "unknown image format {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub disk_id: String,
    /// Virtual size in MiB.
    pub disk_size: u64,
    pub format: ImageFormat,
    pub disk_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskState {
    Unmaterialized,
    Materializing,
    Ready,
    Resizing,
    Snapshotting,
    Deleting,
    Deleted,
}

impl DiskState {
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            DiskState::Materializing
                | DiskState::Resizing
                | DiskState::Snapshotting
                | DiskState::Deleting
        )
    }
}

impl std::fmt::Display for DiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DiskState::Unmaterialized => "unmaterialized",
            DiskState::Materializing => "materializing",
            DiskState::Ready => "ready",
            DiskState::Resizing => "resizing",
            DiskState::Snapshotting => "snapshotting",
            DiskState::Deleting => "deleting",
            DiskState::Deleted => "deleted",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCapacity {
    pub total_mb: u64,
    pub free_mb: u64,
    pub used_mb: u64,
}
