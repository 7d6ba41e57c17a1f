use super::CacheAction;
use crate::output::{OutputFormat, OutputFormatter, print_success};
use crate::utils::format_size_mb;
use hostd_core::{ImageFormat, Result};
use hostd_storage::{AcquireRequest, CachedImage, FileBookkeeping, StorageManager};
use serde::Serialize;
use tabled::Tabled;

#[derive(Serialize, Tabled)]
struct CachedImageRow {
    cache: String,
    image_id: String,
    format: String,
    size: String,
    consumers: u32,
    last_access: String,
}

impl CachedImageRow {
    fn new(cache: &str, image: CachedImage) -> Self {
        Self {
            cache: cache.to_string(),
            image_id: image.id,
            format: image.desc.format.to_string(),
            size: format_size_mb(image.desc.size_mb),
            consumers: image.consumers,
            last_access: image.desc.last_access.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

#[derive(Serialize, Tabled)]
struct ReconcileRow {
    cache: String,
    removed: String,
    detached: String,
}

pub async fn execute(action: CacheAction, manager: &StorageManager, format: OutputFormat) -> Result<()> {
    match action {
        CacheAction::List => {
            let mut rows = Vec::new();
            for (key, cache) in manager.caches().await {
                rows.extend(cache.list().into_iter().map(|i| CachedImageRow::new(&key, i)));
            }
            println!("{}", format.format_table(rows));
        }
        CacheAction::Acquire {
            image_id,
            cache,
            url,
            image_format,
            checksum,
        } => {
            let request = AcquireRequest {
                image_id,
                zone: manager.config().host.zone_id.clone(),
                source_url: url,
                format: image_format
                    .as_deref()
                    .map(str::parse::<ImageFormat>)
                    .transpose()?,
                checksum,
            };
            let image = manager.cache(&cache).await?.acquire(&request).await?;
            println!("{}", format.format_table(vec![CachedImageRow::new(&cache, image)]));
        }
        CacheAction::Release { image_id, cache } => {
            manager.cache(&cache).await?.release(&image_id).await?;
            print_success(&format!("Released {image_id} in {cache}"));
        }
        CacheAction::Remove { image_id, cache } => {
            manager.cache(&cache).await?.remove(&image_id).await?;
            print_success(&format!("Removed {image_id} from {cache}"));
        }
        CacheAction::Reconcile { bookkeeping } => {
            let bookkeeping = FileBookkeeping::new(bookkeeping);
            let rows: Vec<ReconcileRow> = manager
                .reconcile_caches(&bookkeeping)
                .await?
                .into_iter()
                .map(|(cache, report)| ReconcileRow {
                    cache,
                    removed: report.removed.join(","),
                    detached: report.detached.join(","),
                })
                .collect();
            println!("{}", format.format_table(rows));
        }
    }
    Ok(())
}
