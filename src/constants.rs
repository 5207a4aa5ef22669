//! Block and WAL geometry constants and tunable defaults
//!
//! This module contains the fixed geometry the wire protocol and the
//! request-LSN logic depend on, plus the default values for the runtime
//! tunables exposed through [`crate::config::PageStoreConfig`].

use static_assertions::const_assert;

/// Size of a relation page in bytes. Page payloads on the wire are exactly
/// this long.
pub const BLCKSZ: usize = 8192;

/// Size of the fixed page header at the start of every relation page.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Size of a WAL page in bytes.
pub const XLOG_BLCKSZ: u64 = 8192;

/// Size of a WAL segment in bytes.
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Length of the short WAL page header that starts every WAL page.
pub const XLOG_SHORT_PHD_SIZE: u64 = 24;

/// Length of the long WAL page header that starts every WAL segment.
pub const XLOG_LONG_PHD_SIZE: u64 = 40;

/// Pseudo block number used when a request concerns relation metadata
/// (existence, size) rather than a specific block.
pub const REL_METADATA_PSEUDO_BLOCK: u32 = u32::MAX;

/// Default capacity of the per-backend prefetch ring.
pub const DEFAULT_READAHEAD_BUFFER_SIZE: usize = 128;

/// Default number of unflushed requests that triggers a transport flush.
/// Zero disables threshold flushing.
pub const DEFAULT_FLUSH_EVERY_N_REQUESTS: usize = 8;

/// Default cluster size limit in megabytes. Zero disables the limit.
pub const DEFAULT_MAX_CLUSTER_SIZE_MB: u64 = 0;

/// Number of relation forks (main, FSM, visibility map, init).
pub const NUM_FORKS: usize = 4;

const_assert!(BLCKSZ.is_power_of_two());
const_assert!((XLOG_BLCKSZ as usize).is_power_of_two());
const_assert!((WAL_SEGMENT_SIZE as usize).is_power_of_two());
const_assert!(XLOG_SHORT_PHD_SIZE < XLOG_BLCKSZ);
const_assert!(XLOG_LONG_PHD_SIZE < WAL_SEGMENT_SIZE);

/// Validate that all constants are properly configured
pub fn validate_constants() -> Result<(), &'static str> {
    if DEFAULT_READAHEAD_BUFFER_SIZE == 0 {
        return Err("DEFAULT_READAHEAD_BUFFER_SIZE must be greater than 0");
    }
    if PAGE_HEADER_SIZE >= BLCKSZ {
        return Err("PAGE_HEADER_SIZE must be smaller than BLCKSZ");
    }
    if XLOG_SHORT_PHD_SIZE >= XLOG_LONG_PHD_SIZE {
        return Err("short WAL page header must be smaller than the long one");
    }
    Ok(())
}
