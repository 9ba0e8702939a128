//! Configuration carried by the registry. Loading these from files or
//! the environment is the embedder's concern; this module only defines
//! the shapes and their defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::time::Duration;

use crate::cache::pool::DEFAULT_BLOCK_SIZE;
use libtask::TaskRunnerConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub cache: CacheConfig,
    pub meta: MetaConfig,
    pub staging: StagingConfig,
    pub tasks: TaskConfig,
    pub admin_group: String,
    pub event_capacity: usize,
    /// Id of the composite root drive.
    pub root_drive: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            meta: MetaConfig::default(),
            staging: StagingConfig::default(),
            tasks: TaskConfig::default(),
            admin_group: "admin".into(),
            event_capacity: 256,
            root_drive: "root".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub entries: usize,
    pub block_size: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache-files"),
            entries: 1024,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub clean_interval_secs: u64,
    /// Default entry TTL; `None` caches until invalidated.
    pub ttl_secs: Option<u64>,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            clean_interval_secs: 30,
            ttl_secs: Some(60),
        }
    }
}

impl MetaConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub dir: PathBuf,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("uploads"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub workers: usize,
    pub queue: usize,
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue: 0,
            retention_secs: 60,
            sweep_interval_secs: 10,
        }
    }
}

impl TaskConfig {
    pub fn runner_config(&self) -> TaskRunnerConfig {
        TaskRunnerConfig {
            workers: self.workers,
            queue: self.queue,
            retention: Duration::from_secs(self.retention_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.admin_group, "admin");
        assert_eq!(cfg.cache.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(cfg.meta.ttl(), Some(Duration::from_secs(60)));

        let cfg: GatewayConfig =
            serde_json::from_str(r#"{"tasks":{"workers":8},"meta":{"ttl_secs":null}}"#).unwrap();
        assert_eq!(cfg.tasks.workers, 8);
        assert_eq!(cfg.tasks.queue, 0);
        assert_eq!(cfg.meta.ttl(), None);
    }
}
