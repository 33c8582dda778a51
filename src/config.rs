// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::retry::RetryPolicy;

const MIB: u64 = 1024 * 1024;

/// Tuning knobs for the transfer manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Worker-pool size: chunks executing at the same time across all transfers.
    pub max_concurrent_chunks: usize,

    /// Size of each range chunk of a split download.
    pub download_chunk_size: u64,

    /// Downloads larger than this are split into `download_chunk_size` ranges.
    pub download_split_threshold: u64,

    /// Size of each upload block.
    pub upload_block_size: u64,

    pub retry: RetryPolicy,

    /// Shared bandwidth cap. `None` means unlimited.
    pub max_bytes_per_sec: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 4,
            download_chunk_size: 4 * MIB,
            download_split_threshold: 4 * MIB,
            upload_block_size: 4 * MIB,
            retry: RetryPolicy::default(),
            max_bytes_per_sec: None,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub async fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(Self::from_json(&text)?)
    }

    pub fn with_max_concurrent_chunks(mut self, slots: usize) -> Self {
        self.max_concurrent_chunks = slots.max(1);
        self
    }

    pub fn with_download_chunk_size(mut self, bytes: u64) -> Self {
        self.download_chunk_size = bytes;
        self
    }

    pub fn with_download_split_threshold(mut self, bytes: u64) -> Self {
        self.download_split_threshold = bytes;
        self
    }

    pub fn with_upload_block_size(mut self, bytes: u64) -> Self {
        self.upload_block_size = bytes;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_bytes_per_sec(mut self, rate: u64) -> Self {
        self.max_bytes_per_sec = (rate > 0).then_some(rate);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            ManagerConfig::from_json(r#"{ "max_concurrent_chunks": 8, "retry": { "max_attempts": 5 } }"#)
                .unwrap();
        assert_eq!(config.max_concurrent_chunks, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, RetryPolicy::default().initial_delay);
        assert_eq!(config.download_chunk_size, 4 * MIB);
        assert_eq!(config.max_bytes_per_sec, None);
    }

    #[test]
    fn test_builder() {
        let config = ManagerConfig::new()
            .with_max_concurrent_chunks(0)
            .with_download_chunk_size(2 * MIB)
            .with_max_bytes_per_sec(0);
        assert_eq!(config.max_concurrent_chunks, 1);
        assert_eq!(config.download_chunk_size, 2 * MIB);
        assert_eq!(config.max_bytes_per_sec, None);
    }
}
