use super::{SnapshotAction, run_disk_task};
use crate::output::{OutputFormat, print_success};
use hostd_core::Result;
use hostd_storage::{DeleteSnapshotOptions, StorageManager};

pub async fn execute(
    action: SnapshotAction,
    manager: &StorageManager,
    _format: OutputFormat,
) -> Result<()> {
    match action {
        SnapshotAction::Create {
            disk_id,
            snapshot_id,
        } => {
            let (_, disk) = manager.find_disk(&disk_id).await?;
            let id = snapshot_id.clone();
            run_disk_task(manager, &disk_id, "snapshot", |ctx| async move {
                disk.create_snapshot(&ctx, &id).await?;
                Ok(serde_json::Value::Null)
            })
            .await?;
            print_success(&format!("Snapshot {snapshot_id} of {disk_id} created"));
        }
        SnapshotAction::Delete {
            disk_id,
            snapshot_id,
            convert,
            block_stream,
            pending,
        } => {
            let (_, disk) = manager.find_disk(&disk_id).await?;
            let opts = DeleteSnapshotOptions {
                convert_snapshot: convert,
                block_stream,
                pending_delete: pending,
            };
            let id = snapshot_id.clone();
            run_disk_task(manager, &disk_id, "delete snapshot", |ctx| async move {
                disk.delete_snapshot(&ctx, &id, &opts).await?;
                Ok(serde_json::Value::Null)
            })
            .await?;
            print_success(&format!("Snapshot {snapshot_id} of {disk_id} deleted"));
        }
        SnapshotAction::Reset {
            disk_id,
            snapshot_id,
            out_of_chain,
        } => {
            let (_, disk) = manager.find_disk(&disk_id).await?;
            let id = snapshot_id.clone();
            run_disk_task(manager, &disk_id, "reset", |ctx| async move {
                disk.reset_from_snapshot(&ctx, &id, out_of_chain).await?;
                Ok(serde_json::Value::Null)
            })
            .await?;
            print_success(&format!("Disk {disk_id} reset to {snapshot_id}"));
        }
        SnapshotAction::Cleanup {
            disk_id,
            convert,
            delete,
        } => {
            let (_, disk) = manager.find_disk(&disk_id).await?;
            let removed = delete.len();
            run_disk_task(manager, &disk_id, "snapshot cleanup", |ctx| async move {
                disk.cleanup_snapshots(&ctx, &convert, &delete).await?;
                Ok(serde_json::Value::Null)
            })
            .await?;
            print_success(&format!("Cleaned up {removed} snapshot(s) of {disk_id}"));
        }
    }
    Ok(())
}
