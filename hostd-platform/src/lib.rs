pub mod command;
pub mod fsutils;
pub mod mount;
pub mod nbd;
pub mod nbd_pool;

#[cfg(test)]
mod tests;

pub use command::{ToolOutput, run_tool, run_tool_status, tool_path};
pub use fsutils::{FsTools, HostFsTools};
pub use mount::{DeployOutcome, GuestDeployer, GuestDiskMounter, GuestFsOps, MountedRoot};
pub use nbd::{BlockBinder, NbdAttachment, QemuNbdBinder, retry_with_backoff};
pub use nbd_pool::{DevicePool, DeviceProbe, SlotStatus, SysfsDeviceProbe};

/// Host tools the agent shells out to, with whether each is on `PATH`.
pub fn probe_host_tools() -> Vec<(&'static str, bool)> {
    [
        "qemu-img", "qemu-nbd", "lvm", "rbd", "blkid", "e2fsck", "xfs_repair", "growpart",
    ]
    .into_iter()
    .map(|tool| (tool, tool_path(tool).is_some()))
    .collect()
}
