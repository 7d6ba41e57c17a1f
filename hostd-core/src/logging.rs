use crate::Result;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Append-only per-disk operation log, one file per disk id.
pub struct DiskEventLog {
    disk_id: String,
    log_file: PathBuf,
}

impl DiskEventLog {
    pub fn new(log_dir: &Path, disk_id: impl Into<String>) -> Self {
        let disk_id = disk_id.into();
        let log_file = log_dir.join(format!("{disk_id}.log"));
        Self { disk_id, log_file }
    }

    pub async fn init(&self) -> Result<()> {
        if let Some(parent) = self.log_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.log_file
    }

    pub async fn log(&self, level: LogLevel, task_id: &str, message: &str) -> Result<()> {
        let timestamp = Utc::now();
        let log_entry = format!(
            "{} [{}] [{}] [task {}] {}\n",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            level.as_str(),
            self.disk_id,
            task_id,
            message
        );

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .await?;

        file.write_all(log_entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn info(&self, task_id: &str, message: &str) -> Result<()> {
        self.log(LogLevel::Info, task_id, message).await
    }

    pub async fn warn(&self, task_id: &str, message: &str) -> Result<()> {
        self.log(LogLevel::Warn, task_id, message).await
    }

    pub async fn error(&self, task_id: &str, message: &str) -> Result<()> {
        self.log(LogLevel::Error, task_id, message).await
    }

    /// Last `count` entries, oldest first. A disk with no history yields none.
    pub async fn tail(&self, count: usize) -> Result<Vec<String>> {
        let content = match fs::read_to_string(&self.log_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(count);
        Ok(lines[start..].iter().map(|l| l.to_string()).collect())
    }
}

#[derive(Clone, Copy)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = DiskEventLog::new(&dir.path().join("logs"), "disk-1");
        log.init().await.unwrap();
        log.info("task-1", "created").await.unwrap();
        log.error("task-2", "resize failed").await.unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[INFO] [disk-1] [task task-1] created"));
        assert!(lines[1].contains("[ERROR]"));
    }

    #[tokio::test]
    async fn test_tail_returns_latest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = DiskEventLog::new(dir.path(), "disk-2");
        assert!(log.tail(5).await.unwrap().is_empty());

        for step in ["create started", "create finished", "resize started"] {
            log.info("t", step).await.unwrap();
        }
        let tail = log.tail(2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("create finished"));
        assert!(tail[1].ends_with("resize started"));
    }
}
