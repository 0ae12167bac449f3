use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::upload::executor::Backoff;
use crate::upload::UploadPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Concurrency handed to the uploader for a single archive
    pub max_upload_parallel: usize,

    /// Maximum number of units the executor runs at once
    pub max_upload_load: usize,

    /// Conflict policy at the remote destination
    pub upload_policy: UploadPolicy,

    /// Root directory of the local remote store
    pub store_root: PathBuf,

    /// Retries per unit after the first attempt
    pub max_retry: u32,

    /// Deflate level passed to the archive writer
    pub compression_level: i64,

    /// Linear backoff step between retries, in seconds
    pub retry_step_secs: u64,

    /// Backoff ceiling, in seconds
    pub retry_max_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let store_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dirzip-upload")
            .join("store");

        Self {
            max_upload_parallel: num_cpus::get(),
            max_upload_load: 4,
            upload_policy: UploadPolicy::Overwrite,
            store_root,
            max_retry: 3,
            compression_level: 6,
            retry_step_secs: 2,
            retry_max_secs: 6,
        }
    }
}

impl Config {
    /// Load config from `.env` and environment variables
    pub fn load() -> Result<Self> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();

        let mut config = Config::default();

        if let Ok(parallel) = std::env::var("DIRZIP_MAX_PARALLEL") {
            config.max_upload_parallel = parallel.parse().context("DIRZIP_MAX_PARALLEL")?;
        }

        if let Ok(load) = std::env::var("DIRZIP_MAX_LOAD") {
            config.max_upload_load = load.parse().context("DIRZIP_MAX_LOAD")?;
        }

        if let Ok(policy) = std::env::var("DIRZIP_POLICY") {
            config.upload_policy = policy.parse().context("DIRZIP_POLICY")?;
        }

        if let Ok(root) = std::env::var("DIRZIP_STORE_ROOT") {
            config.store_root = PathBuf::from(root);
        }

        if let Ok(retry) = std::env::var("DIRZIP_MAX_RETRY") {
            config.max_retry = retry.parse().context("DIRZIP_MAX_RETRY")?;
        }

        if let Ok(level) = std::env::var("DIRZIP_COMPRESSION_LEVEL") {
            config.compression_level = level.parse().context("DIRZIP_COMPRESSION_LEVEL")?;
        }

        // Zero means auto, same as the defaults
        if config.max_upload_parallel == 0 {
            config.max_upload_parallel = num_cpus::get();
        }
        if config.max_upload_load == 0 {
            config.max_upload_load = 1;
        }

        Ok(config)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.retry_step_secs),
            Duration::from_secs(self.retry_max_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.max_upload_parallel >= 1);
        assert_eq!(config.max_retry, 3);
        assert_eq!(config.compression_level, 6);
        assert_eq!(config.upload_policy, UploadPolicy::Overwrite);
        assert!(config.store_root.ends_with("dirzip-upload/store"));
    }

    #[test]
    fn test_backoff_from_config() {
        let config = Config::default();
        let backoff = config.backoff();
        assert_eq!(backoff.wait(1), Duration::from_secs(2));
        assert_eq!(backoff.wait(10), Duration::from_secs(6));
    }
}
