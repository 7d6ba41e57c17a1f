use super::ReconcileReport;
use async_trait::async_trait;
use hostd_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::info;

/// The control plane's record of which images this host should hold.
#[async_trait]
pub trait ImageBookkeeping: Send + Sync {
    async fn referenced_images(&self, cache_kind: &str) -> Result<HashSet<String>>;

    async fn report(&self, cache_kind: &str, report: &ReconcileReport) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BookkeepingFile {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    last_report: Option<ReconcileReport>,
}

/// Bookkeeping kept in a JSON file: `{"images": [...]}`. The latest
/// report is written back into the same file.
pub struct FileBookkeeping {
    path: PathBuf,
}

impl FileBookkeeping {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read(&self) -> Result<BookkeepingFile> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BookkeepingFile::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ImageBookkeeping for FileBookkeeping {
    async fn referenced_images(&self, _cache_kind: &str) -> Result<HashSet<String>> {
        Ok(self.read().await?.images.into_iter().collect())
    }

    async fn report(&self, cache_kind: &str, report: &ReconcileReport) -> Result<()> {
        let mut file = self.read().await?;
        file.images.retain(|id| !report.removed.contains(id));
        file.last_report = Some(report.clone());
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(&file)?).await?;
        info!(
            "Reported {} cache reconciliation: removed {:?}, detached {:?}",
            cache_kind, report.removed, report.detached
        );
        Ok(())
    }
}
