use super::StorageAction;
use crate::output::{OutputFormat, OutputFormatter, print_warning};
use crate::utils::format_size_mb;
use colored::*;
use hostd_core::Result;
use hostd_storage::StorageManager;
use serde::Serialize;
use tabled::Tabled;

#[derive(Serialize, Tabled)]
struct StorageRow {
    id: String,
    #[tabled(rename = "type")]
    storage_type: String,
    total: String,
    free: String,
    used: String,
    disks: usize,
}

#[derive(Serialize, Tabled)]
struct ToolRow {
    tool: String,
    available: String,
}

pub async fn execute(
    action: StorageAction,
    manager: &StorageManager,
    format: OutputFormat,
) -> Result<()> {
    match action {
        StorageAction::List => list(manager, format).await,
        StorageAction::Disks { storage } => {
            let storage = manager.storage(&storage).await?;
            let ids = storage.disk_ids_on_media().await?;
            println!("{}", format.format(ids));
            Ok(())
        }
        StorageAction::Tools => tools(format).await,
    }
}

async fn list(manager: &StorageManager, format: OutputFormat) -> Result<()> {
    let mut rows = Vec::new();
    for storage in manager.storages().await {
        let (total, free, used) = match storage.capacity().await {
            Ok(cap) => (
                format_size_mb(cap.total_mb),
                format_size_mb(cap.free_mb),
                format_size_mb(cap.used_mb),
            ),
            Err(e) => {
                if format.is_human() {
                    print_warning(&format!("Capacity of {} unavailable: {e}", storage.id()));
                }
                ("-".to_string(), "-".to_string(), "-".to_string())
            }
        };
        rows.push(StorageRow {
            id: storage.id().to_string(),
            storage_type: storage.storage_type().to_string(),
            total,
            free,
            used,
            disks: storage.disk_ids_on_media().await.map(|ids| ids.len()).unwrap_or(0),
        });
    }
    println!("{}", format.format_table(rows));
    Ok(())
}

pub async fn tools(format: OutputFormat) -> Result<()> {
    let rows: Vec<ToolRow> = hostd_platform::probe_host_tools()
        .into_iter()
        .map(|(tool, found)| ToolRow {
            tool: tool.to_string(),
            available: if found {
                "yes".green().to_string()
            } else {
                "no".red().to_string()
            },
        })
        .collect();
    println!("{}", format.format_table(rows));
    Ok(())
}
