mod cache;
mod disk;
mod pool;
mod recycle;
mod snapshot;
mod storage;

use clap::Subcommand;
use hostd_core::{Config, DiskEventLog, HostdError, Result, TaskContext, WorkManager};
use hostd_storage::{HostServices, StorageManager};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::output::OutputFormat;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect configured storages
    Storage {
        #[command(subcommand)]
        action: StorageAction,
    },

    /// Create, resize and delete guest disks
    Disk {
        #[command(subcommand)]
        action: DiskAction,
    },

    /// Manage a disk's snapshot chain
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Manage the template image caches
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show the block-device pool
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },

    /// Maintain storage recycle bins
    Recycle {
        #[command(subcommand)]
        action: RecycleAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum StorageAction {
    /// List storages with their capacity
    List,

    /// List disks found on a storage's media
    Disks {
        /// Storage id
        storage: String,
    },

    /// Check which host tools are available
    Tools,
}

#[derive(Subcommand, Debug)]
pub enum DiskAction {
    /// Create a disk on a storage
    Create {
        /// Storage id
        storage: String,

        /// Disk id
        disk_id: String,

        /// Template image id
        #[arg(long)]
        image: Option<String>,

        /// Source snapshot as DISK:SNAPSHOT
        #[arg(long)]
        snapshot: Option<String>,

        /// Backup id
        #[arg(long)]
        backup: Option<String>,

        /// Adopt an existing file on the storage
        #[arg(long)]
        existing: Option<PathBuf>,

        /// Download the content from a URL
        #[arg(long)]
        url: Option<String>,

        /// Disk size (e.g., 20GB)
        #[arg(long)]
        size: Option<String>,

        /// Image format (raw, qcow2)
        #[arg(long)]
        image_format: Option<String>,

        /// Filesystem to create on a blank disk
        #[arg(long)]
        fs_format: Option<String>,

        /// Filesystem UUID for a blank disk
        #[arg(long)]
        fs_uuid: Option<String>,

        /// Expected SHA-256 of the template image
        #[arg(long)]
        checksum: Option<String>,

        /// Replace a disk that already exists
        #[arg(long)]
        rebuild: bool,
    },

    /// Show a disk's descriptor
    Show {
        /// Disk id
        disk_id: String,
    },

    /// Grow a disk
    Resize {
        /// Disk id
        disk_id: String,

        /// New size (e.g., 40GB)
        size: String,
    },

    /// Show the operation history of a disk
    Events {
        /// Disk id
        disk_id: String,

        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "20")]
        tail: usize,
    },

    /// Delete a disk and all of its snapshots
    Delete {
        /// Disk id
        disk_id: String,

        /// Remove files immediately instead of moving them to the recycle bin
        #[arg(long)]
        skip_recycle: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum SnapshotAction {
    /// Take a snapshot of a disk
    Create {
        disk_id: String,
        snapshot_id: String,
    },

    /// Remove one snapshot from a disk's chain
    Delete {
        disk_id: String,
        snapshot_id: String,

        /// Flatten this dependent snapshot first
        #[arg(long)]
        convert: Option<String>,

        /// Flatten the active image first
        #[arg(long)]
        block_stream: bool,

        /// Leave the file for a later cleanup
        #[arg(long)]
        pending: bool,
    },

    /// Roll a disk back to a snapshot
    Reset {
        disk_id: String,
        snapshot_id: String,

        /// The snapshot is not part of the disk's current chain
        #[arg(long)]
        out_of_chain: bool,
    },

    /// Flatten and remove snapshots left by pending deletes
    Cleanup {
        disk_id: String,

        /// Snapshots to flatten in place
        #[arg(long)]
        convert: Vec<String>,

        /// Snapshots to remove
        #[arg(long)]
        delete: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached images
    List,

    /// Fetch an image into a cache and take a reference
    Acquire {
        image_id: String,

        /// Cache key: local, lvm:<vg> or rbd:<pool>
        #[arg(long, default_value = "local")]
        cache: String,

        /// Source URL (looked up in the catalog when omitted)
        #[arg(long)]
        url: Option<String>,

        /// Image format (raw, qcow2)
        #[arg(long)]
        image_format: Option<String>,

        /// Expected SHA-256
        #[arg(long)]
        checksum: Option<String>,
    },

    /// Drop a reference taken by acquire
    Release {
        image_id: String,

        #[arg(long, default_value = "local")]
        cache: String,
    },

    /// Evict an unused image
    Remove {
        image_id: String,

        #[arg(long, default_value = "local")]
        cache: String,
    },

    /// Compare the caches against control-plane bookkeeping
    Reconcile {
        /// JSON file listing referenced image ids
        #[arg(long)]
        bookkeeping: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum PoolAction {
    /// Show every device slot
    Status,
}

#[derive(Subcommand, Debug)]
pub enum RecycleAction {
    /// Remove recycle-bin days past retention
    Clean,
}

pub async fn execute(command: Command, config: Config, format: OutputFormat) -> Result<()> {
    if let Command::Storage {
        action: StorageAction::Tools,
    } = &command
    {
        return storage::tools(format).await;
    }

    let manager = open_manager(config).await?;
    let result = match command {
        Command::Storage { action } => storage::execute(action, &manager, format).await,
        Command::Disk { action } => disk::execute(action, &manager, format).await,
        Command::Snapshot { action } => snapshot::execute(action, &manager, format).await,
        Command::Cache { action } => cache::execute(action, &manager, format).await,
        Command::Pool { action } => pool::execute(action, &manager, format).await,
        Command::Recycle { action } => recycle::execute(action, &manager, format).await,
    };
    manager.shutdown().await;
    result
}

async fn open_manager(config: Config) -> Result<Arc<StorageManager>> {
    let manager = StorageManager::new(config, HostServices::system());
    manager.init().await?;
    Ok(Arc::new(manager))
}

/// Run one disk operation as a tracked task: it goes through the work
/// manager and its start and outcome land in the disk's event log.
pub(crate) async fn run_disk_task<W, F>(
    manager: &StorageManager,
    disk_id: &str,
    operation: &str,
    work: W,
) -> Result<serde_json::Value>
where
    W: FnOnce(TaskContext) -> F,
    F: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    let events = DiskEventLog::new(&manager.config().host.log_dir, disk_id);
    events.init().await?;

    let ctx = TaskContext::new();
    events
        .info(&ctx.task_id, &format!("{operation} started"))
        .await?;

    let (workers, mut completions) = WorkManager::new(1);
    workers.dispatch(ctx.clone(), work(ctx.clone())).await?;
    let completion = completions
        .recv()
        .await
        .ok_or_else(|| HostdError::InvalidState(format!("{operation} vanished")))?;
    workers.shutdown().await;
    debug!("Task {} completed", completion.task_id);

    match completion.result {
        Ok(value) => {
            events
                .info(&ctx.task_id, &format!("{operation} finished"))
                .await?;
            Ok(value)
        }
        Err(message) => {
            events
                .error(&ctx.task_id, &format!("{operation} failed: {message}"))
                .await?;
            Err(HostdError::StorageError(message))
        }
    }
}
