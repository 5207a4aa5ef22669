//! Configuration for the page store adaptor

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_FLUSH_EVERY_N_REQUESTS, DEFAULT_MAX_CLUSTER_SIZE_MB, DEFAULT_READAHEAD_BUFFER_SIZE,
};
use crate::error::{PageStoreError, Result};

/// Runtime tunables of the adaptor
///
/// `readahead_buffer_size` can also be changed on a live
/// [`crate::store::PageStore`] through
/// [`crate::store::PageStore::resize_readahead_buffer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageStoreConfig {
    /// Capacity of the per-backend prefetch ring
    pub readahead_buffer_size: usize,
    /// Flush the transport after this many unflushed requests; 0 disables
    /// threshold flushing
    pub flush_every_n_requests: usize,
    /// Refuse relation extension once the cluster exceeds this many
    /// megabytes; 0 disables the limit
    pub max_cluster_size_mb: u64,
}

impl Default for PageStoreConfig {
    fn default() -> Self {
        Self {
            readahead_buffer_size: DEFAULT_READAHEAD_BUFFER_SIZE,
            flush_every_n_requests: DEFAULT_FLUSH_EVERY_N_REQUESTS,
            max_cluster_size_mb: DEFAULT_MAX_CLUSTER_SIZE_MB,
        }
    }
}

impl PageStoreConfig {
    /// Create a configuration with the default tunables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the prefetch ring capacity.
    pub fn with_readahead_buffer_size(mut self, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PageStoreError::config(
                "readahead buffer size must be greater than 0",
            ));
        }
        self.readahead_buffer_size = size;
        Ok(self)
    }

    /// Set the threshold-flush interval. Zero disables threshold flushing.
    pub fn with_flush_every_n_requests(mut self, n: usize) -> Self {
        self.flush_every_n_requests = n;
        self
    }

    /// Set the cluster size limit in megabytes. Zero disables the limit.
    pub fn with_max_cluster_size_mb(mut self, mb: u64) -> Self {
        self.max_cluster_size_mb = mb;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.readahead_buffer_size == 0 {
            return Err(PageStoreError::config(
                "readahead buffer size must be greater than 0",
            ));
        }
        Ok(())
    }
}
