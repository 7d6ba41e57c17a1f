use async_trait::async_trait;
use hostd_core::{HostdError, Result};
use hostd_platform::{run_tool, run_tool_status};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
}

/// Native operations of the distributed block store. Images are addressed
/// as `pool/name`; there is no host path.
#[async_trait]
pub trait BlockStoreClient: Send + Sync {
    async fn create(&self, pool: &str, name: &str, size_mb: u64) -> Result<()>;
    async fn resize(&self, pool: &str, name: &str, size_mb: u64) -> Result<()>;
    async fn remove(&self, pool: &str, name: &str) -> Result<()>;
    async fn exists(&self, pool: &str, name: &str) -> Result<bool>;
    async fn size_mb(&self, pool: &str, name: &str) -> Result<u64>;
    /// Convert a local image file into a native image.
    async fn import(&self, src: &Path, pool: &str, name: &str) -> Result<()>;
    /// Full copy of one native image into another.
    async fn copy(&self, pool: &str, src: &str, dst: &str) -> Result<()>;
    async fn pool_stats(&self, pool: &str) -> Result<PoolStats>;
}

#[derive(Deserialize)]
struct RbdInfo {
    size: u64,
}

#[derive(Deserialize)]
struct CephDf {
    pools: Vec<CephPool>,
}

#[derive(Deserialize)]
struct CephPool {
    name: String,
    stats: CephPoolStats,
}

#[derive(Deserialize)]
struct CephPoolStats {
    stored: u64,
    max_avail: u64,
}

/// Talks to the cluster through the `rbd` and `ceph` command line tools.
pub struct RbdCli {
    conf_args: Vec<String>,
}

impl RbdCli {
    /// `conf` is the storage's configuration blob; `mon_host` and `key` are
    /// passed through when present.
    pub fn new(conf: &serde_json::Value) -> Self {
        let mut conf_args = Vec::new();
        if let Some(mon) = conf.get("mon_host").and_then(|v| v.as_str()) {
            conf_args.extend(["-m".to_string(), mon.to_string()]);
        }
        if let Some(key) = conf.get("key").and_then(|v| v.as_str()) {
            conf_args.push(format!("--key={key}"));
        }
        Self { conf_args }
    }

    fn args<'a>(&'a self, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args: Vec<&str> = self.conf_args.iter().map(String::as_str).collect();
        args.extend_from_slice(rest);
        args
    }
}

#[async_trait]
impl BlockStoreClient for RbdCli {
    async fn create(&self, pool: &str, name: &str, size_mb: u64) -> Result<()> {
        let spec = format!("{pool}/{name}");
        let size = size_mb.to_string();
        run_tool(
            "rbd",
            self.args(&["create", "--size", &size, &spec]),
            &format!("create {spec}"),
        )
        .await?;
        info!("Created rbd image {} ({} MB)", spec, size_mb);
        Ok(())
    }

    async fn resize(&self, pool: &str, name: &str, size_mb: u64) -> Result<()> {
        let spec = format!("{pool}/{name}");
        let size = size_mb.to_string();
        run_tool(
            "rbd",
            self.args(&["resize", "--size", &size, &spec]),
            &format!("resize {spec}"),
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, pool: &str, name: &str) -> Result<()> {
        let spec = format!("{pool}/{name}");
        run_tool("rbd", self.args(&["rm", &spec]), &format!("remove {spec}")).await?;
        info!("Removed rbd image {}", spec);
        Ok(())
    }

    async fn exists(&self, pool: &str, name: &str) -> Result<bool> {
        let spec = format!("{pool}/{name}");
        let out = run_tool_status("rbd", self.args(&["info", &spec])).await?;
        if out.success() {
            return Ok(true);
        }
        if out.stderr.contains("No such file") || out.stderr.contains("not found") {
            return Ok(false);
        }
        Err(HostdError::tool("rbd", format!("info {spec}"), out.stderr.trim().to_string()))
    }

    async fn size_mb(&self, pool: &str, name: &str) -> Result<u64> {
        let spec = format!("{pool}/{name}");
        let out = run_tool(
            "rbd",
            self.args(&["info", "--format", "json", &spec]),
            &format!("info {spec}"),
        )
        .await?;
        let info: RbdInfo = serde_json::from_str(&out)?;
        Ok(info.size / MB)
    }

    async fn import(&self, src: &Path, pool: &str, name: &str) -> Result<()> {
        let spec = format!("{pool}/{name}");
        let src = src.to_string_lossy().into_owned();
        run_tool(
            "rbd",
            self.args(&["import", &src, &spec]),
            &format!("import {src} to {spec}"),
        )
        .await?;
        Ok(())
    }

    async fn copy(&self, pool: &str, src: &str, dst: &str) -> Result<()> {
        let from = format!("{pool}/{src}");
        let to = format!("{pool}/{dst}");
        run_tool("rbd", self.args(&["cp", &from, &to]), &format!("copy {from} to {to}")).await?;
        Ok(())
    }

    async fn pool_stats(&self, pool: &str) -> Result<PoolStats> {
        let out = run_tool("ceph", self.args(&["df", "--format", "json"]), "df").await?;
        let df: CephDf = serde_json::from_str(&out)?;
        let stats = df
            .pools
            .into_iter()
            .find(|p| p.name == pool)
            .map(|p| p.stats)
            .ok_or_else(|| HostdError::not_found("rbd pool", pool))?;
        Ok(PoolStats {
            total_bytes: stats.stored + stats.max_avail,
            free_bytes: stats.max_avail,
            used_bytes: stats.stored,
        })
    }
}
