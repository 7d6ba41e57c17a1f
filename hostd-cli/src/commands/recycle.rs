use super::RecycleAction;
use crate::output::{OutputFormat, OutputFormatter, print_success};
use hostd_core::Result;
use hostd_storage::StorageManager;

pub async fn execute(
    action: RecycleAction,
    manager: &StorageManager,
    format: OutputFormat,
) -> Result<()> {
    match action {
        RecycleAction::Clean => {
            let removed = manager.clean_recycle_bins().await?;
            if format.is_human() {
                print_success(&format!("Removed {removed} expired recycle-bin day(s)"));
            } else {
                println!("{}", format.format(serde_json::json!({ "removed": removed })));
            }
        }
    }
    Ok(())
}
