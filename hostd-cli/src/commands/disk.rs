use super::{DiskAction, run_disk_task};
use crate::output::{OutputFormat, OutputFormatter, print_info, print_progress, print_success};
use crate::utils::{format_size_mb, parse_size_mb};
use hostd_core::{DiskDescriptor, DiskEventLog, HostdError, ImageFormat, Result};
use hostd_storage::{DiskDescription, SnapshotSource, StorageManager};
use serde::Serialize;
use tabled::Tabled;

#[derive(Serialize, Tabled)]
struct DiskRow {
    disk_id: String,
    size: String,
    format: String,
    state: String,
    path: String,
}

impl DiskRow {
    fn new(desc: DiskDescriptor, state: String) -> Self {
        Self {
            disk_id: desc.disk_id,
            size: format_size_mb(desc.disk_size),
            format: desc.format.to_string(),
            state,
            path: desc.disk_path.display().to_string(),
        }
    }
}

pub async fn execute(action: DiskAction, manager: &StorageManager, format: OutputFormat) -> Result<()> {
    match action {
        DiskAction::Create {
            storage,
            disk_id,
            image,
            snapshot,
            backup,
            existing,
            url,
            size,
            image_format,
            fs_format,
            fs_uuid,
            checksum,
            rebuild,
        } => {
            let desc = DiskDescription {
                disk_id: disk_id.clone(),
                snapshot: snapshot.as_deref().map(parse_snapshot_source).transpose()?,
                image_id: image,
                backup_id: backup,
                existing_path: existing,
                url,
                size_mb: size.as_deref().map(parse_size_mb).transpose()?,
                format: image_format
                    .as_deref()
                    .map(str::parse::<ImageFormat>)
                    .transpose()?,
                fs_format,
                fs_uuid,
                checksum,
                rebuild,
            };
            let storage = manager.storage(&storage).await?;
            if format.is_human() {
                print_progress(&format!("Creating disk {disk_id} on {}", storage.id()));
            }
            let value = run_disk_task(manager, &disk_id, "create", |ctx| async move {
                let created = storage.create_disk_by_description(&ctx, &desc).await?;
                Ok(serde_json::to_value(created)?)
            })
            .await?;
            report(value, "ready", format, &format!("Disk {disk_id} created"))
        }
        DiskAction::Show { disk_id } => {
            let (_, disk) = manager.find_disk(&disk_id).await?;
            let desc = disk.descriptor().await?;
            println!("{}", format.format_table(vec![DiskRow::new(desc, disk.state().to_string())]));
            Ok(())
        }
        DiskAction::Events { disk_id, tail } => {
            let events = DiskEventLog::new(&manager.config().host.log_dir, &disk_id);
            let entries = events.tail(tail).await?;
            if format.is_human() {
                if entries.is_empty() {
                    print_info(&format!("No recorded operations for {disk_id}"));
                }
                for entry in entries {
                    println!("{entry}");
                }
            } else {
                println!("{}", format.format(entries));
            }
            Ok(())
        }
        DiskAction::Resize { disk_id, size } => {
            let size_mb = parse_size_mb(&size)?;
            let (_, disk) = manager.find_disk(&disk_id).await?;
            let value = run_disk_task(manager, &disk_id, "resize", |ctx| async move {
                Ok(serde_json::to_value(disk.resize(&ctx, size_mb).await?)?)
            })
            .await?;
            report(value, "ready", format, &format!("Disk {disk_id} resized"))
        }
        DiskAction::Delete {
            disk_id,
            skip_recycle,
        } => {
            let (storage, disk) = manager.find_disk(&disk_id).await?;
            let id = disk_id.clone();
            run_disk_task(manager, &disk_id, "delete", |ctx| async move {
                disk.delete_all_snapshots(&ctx, skip_recycle).await?;
                storage.delete_disk(&ctx, &id, skip_recycle).await?;
                Ok(serde_json::Value::Null)
            })
            .await?;
            print_success(&format!("Disk {disk_id} deleted"));
            Ok(())
        }
    }
}

fn report(value: serde_json::Value, state: &str, format: OutputFormat, message: &str) -> Result<()> {
    let desc: DiskDescriptor = serde_json::from_value(value)?;
    if format.is_human() {
        print_success(message);
    }
    println!("{}", format.format_table(vec![DiskRow::new(desc, state.to_string())]));
    Ok(())
}

fn parse_snapshot_source(raw: &str) -> Result<SnapshotSource> {
    match raw.split_once(':') {
        Some((disk_id, snapshot_id)) if !disk_id.is_empty() && !snapshot_id.is_empty() => {
            Ok(SnapshotSource {
                disk_id: disk_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
            })
        }
        _ => Err(HostdError::InvalidArgument(format!(
            "snapshot source must be DISK:SNAPSHOT, got {raw}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_source() {
        let source = parse_snapshot_source("d1:s2").unwrap();
        assert_eq!(source.disk_id, "d1");
        assert_eq!(source.snapshot_id, "s2");
        assert!(parse_snapshot_source("d1").is_err());
        assert!(parse_snapshot_source(":s2").is_err());
    }
}
