use super::PoolAction;
use crate::output::{OutputFormat, OutputFormatter, print_info};
use colored::*;
use hostd_core::Result;
use hostd_storage::StorageManager;
use serde::Serialize;
use tabled::Tabled;

#[derive(Serialize, Tabled)]
struct SlotRow {
    device: String,
    state: String,
}

pub async fn execute(action: PoolAction, manager: &StorageManager, format: OutputFormat) -> Result<()> {
    match action {
        PoolAction::Status => {
            let slots = manager.device_pool().status().await;
            let busy = slots.iter().filter(|s| s.busy).count();
            if format.is_human() {
                print_info(&format!("{busy} of {} devices in use", slots.len()));
                let rows: Vec<SlotRow> = slots
                    .into_iter()
                    .map(|s| SlotRow {
                        device: s.device,
                        state: if s.busy {
                            "busy".yellow().to_string()
                        } else {
                            "free".green().to_string()
                        },
                    })
                    .collect();
                println!("{}", format.format_table(rows));
            } else {
                println!("{}", format.format(slots));
            }
        }
    }
    Ok(())
}
