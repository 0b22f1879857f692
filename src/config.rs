use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::LockPolicy;
use crate::core::TableDescriptor;

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pagetree")
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_lock_retry_ms() -> u64 {
    5
}

fn default_checkpoint_interval_secs() -> u64 {
    300
}

fn default_table() -> TableDescriptor {
    TableDescriptor::standard("pagetree")
}

/// 存储配置（toml）。缺省字段取默认值，缺失文件等同全默认。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    #[serde(default = "default_table")]
    pub table: TableDescriptor,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_retry_ms: default_lock_retry_ms(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            table: default_table(),
        }
    }
}

impl StoreConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("Config {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;
        cfg.table.validate()?;
        Ok(cfg)
    }

    /// 默认配置文件位置：`<data_dir>/config.toml`
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            ttl: Duration::from_millis(self.lock_ttl_ms),
            timeout: Duration::from_millis(self.lock_timeout_ms),
            retry: Duration::from_millis(self.lock_retry_ms.max(1)),
        }
    }
}
