//! Interfaces consumed from the host engine and environment
//!
//! The adaptor itself carries no transport, no caches, and no WAL machinery;
//! those are provided by the environment through the traits in this module.
//! The transport ([`PageServerApi`]) is owned exclusively by the prefetch
//! pipeline and accessed with `&mut self`; every other collaborator is an
//! internally synchronized shared service (`Send + Sync`, `&self` methods).

use std::sync::Arc;

use crate::codec::{PageServerRequest, PageServerResponse};
use crate::error::Result;
use crate::lsn::Lsn;
use crate::page::PageBuf;
use crate::prefetch::pool::PagePool;
use crate::tag::{BufferTag, ForkNumber, RelTag};

/// The page server connection: send, flush, receive.
///
/// `send` returns `false` when the outbound buffer did not accept the
/// request; callers retry. `flush` and `receive` return `false`/`None` on
/// transport failure; the owner then resets the prefetch pipeline by calling
/// [`crate::store::PageStore::on_pageserver_disconnect`] before retrying.
///
/// Responses must arrive in the order their requests were sent: the pipeline
/// relies on FIFO delivery over a single connection.
pub trait PageServerApi {
    /// Put a request into the outbound buffer. Does not flush.
    fn send(&mut self, request: &PageServerRequest) -> bool;

    /// Flush the outbound buffer to the server.
    fn flush(&mut self) -> bool;

    /// Receive the next response. Page payloads are allocated from `pool`.
    fn receive(&mut self, pool: &mut PagePool) -> Option<PageServerResponse>;
}

/// Shared cache of relation fork sizes, in blocks.
pub trait RelSizeCache: Send + Sync {
    /// Look up the cached size of a relation fork.
    fn get(&self, rel: &RelTag, fork: ForkNumber) -> Option<u32>;
    /// Unconditionally set the cached size.
    fn set(&self, rel: &RelTag, fork: ForkNumber, n_blocks: u32);
    /// Grow the cached size; never shrinks an existing entry.
    fn update(&self, rel: &RelTag, fork: ForkNumber, n_blocks: u32);
    /// Drop the cached size.
    fn forget(&self, rel: &RelTag, fork: ForkNumber);
}

/// The last-written-LSN service: the WAL position a reader must demand from
/// the page server for a given block.
pub trait LastWrittenLsn: Send + Sync {
    /// The LSN any future read of this block must request.
    fn get(&self, rel: &RelTag, fork: ForkNumber, block: u32) -> Lsn;
    /// Record that this block may have been touched up to `lsn`.
    fn set_for_block(&self, lsn: Lsn, rel: &RelTag, fork: ForkNumber, block: u32);
    /// Record a relation-wide watermark, covering metadata like the size.
    fn set_for_relation(&self, lsn: Lsn, rel: &RelTag, fork: ForkNumber);
}

/// The local file cache of remote pages.
pub trait FileCache: Send + Sync {
    /// Read a cached page into `buf`; `false` on miss.
    fn read(&self, rel: &RelTag, fork: ForkNumber, block: u32, buf: &mut PageBuf) -> bool;
    /// Write a page through to the cache.
    fn write(&self, rel: &RelTag, fork: ForkNumber, block: u32, page: &PageBuf);
    /// Whether the cache holds this block.
    fn contains(&self, rel: &RelTag, fork: ForkNumber, block: u32) -> bool;
    /// Drop this block from the cache.
    fn evict(&self, rel: &RelTag, fork: ForkNumber, block: u32);
}

/// The WAL subsystem of the host engine.
pub trait WalFacade: Send + Sync {
    /// Position up to which WAL is known flushed to durable storage.
    fn flush_lsn(&self) -> Lsn;
    /// Position of the most recently inserted (reserved) WAL record.
    fn insert_lsn(&self) -> Lsn;
    /// Flush WAL up to `lsn`.
    fn flush(&self, lsn: Lsn);
    /// Emit a full-page-image record for `page`; returns the record's LSN.
    fn log_page_image(&self, rel: &RelTag, fork: ForkNumber, block: u32, page: &PageBuf) -> Lsn;
    /// Whether WAL insertion is currently permitted in this process.
    fn insert_allowed(&self) -> bool;
}

/// Facts about the current process the adaptor dispatches on.
pub trait ProcessState: Send + Sync {
    /// Whether WAL replay is in progress.
    fn in_recovery(&self) -> bool;
    /// Whether this process is a WAL sender.
    fn is_wal_sender(&self) -> bool;
    /// Whether this process is an autovacuum worker.
    fn is_autovacuum_worker(&self) -> bool;
    /// Whether a shutdown request is pending.
    fn shutdown_requested(&self) -> bool;
    /// Current logical cluster size in bytes, for the extension limit.
    fn current_cluster_size(&self) -> u64;
}

/// Local-disk block storage, used in full for temporary and unlogged
/// relations and probed by a few unknown-persistence paths.
pub trait LocalStorage: Send + Sync {
    /// Does the relation fork exist on local disk?
    fn exists(&self, rel: &RelTag, fork: ForkNumber) -> bool;
    /// Create the relation fork.
    fn create(&self, rel: &RelTag, fork: ForkNumber, is_redo: bool) -> Result<()>;
    /// Write a block at or beyond the current EOF.
    fn extend(
        &self,
        rel: &RelTag,
        fork: ForkNumber,
        block: u32,
        page: &PageBuf,
        skip_fsync: bool,
    ) -> Result<()>;
    /// Read a block.
    fn read(&self, rel: &RelTag, fork: ForkNumber, block: u32, buf: &mut PageBuf) -> Result<()>;
    /// Overwrite an existing block.
    fn write(
        &self,
        rel: &RelTag,
        fork: ForkNumber,
        block: u32,
        page: &PageBuf,
        skip_fsync: bool,
    ) -> Result<()>;
    /// Number of blocks in the fork.
    fn nblocks(&self, rel: &RelTag, fork: ForkNumber) -> Result<u32>;
    /// Truncate the fork to `n_blocks`.
    fn truncate(&self, rel: &RelTag, fork: ForkNumber, n_blocks: u32) -> Result<()>;
    /// Sync the fork to stable storage.
    fn immedsync(&self, rel: &RelTag, fork: ForkNumber) -> Result<()>;
    /// Remove the fork's file; `None` removes every fork.
    fn unlink(&self, rel: &RelTag, fork: Option<ForkNumber>, is_redo: bool) -> Result<()>;
    /// Hint the OS to read a block ahead.
    fn prefetch(&self, rel: &RelTag, fork: ForkNumber, block: u32) -> bool;
    /// Hint the OS to write a block range back.
    fn writeback(&self, rel: &RelTag, fork: ForkNumber, block: u32, n_blocks: u32);
    /// Initialize per-relation local state.
    fn open(&self, rel: &RelTag);
    /// Close the fork if it is open.
    fn close(&self, rel: &RelTag, fork: ForkNumber);
}

/// Residency checks against the engine's shared buffer pool.
pub trait SharedBuffers: Send + Sync {
    /// Run `f` with the buffer-mapping partition for `tag` held in shared
    /// mode. `f` receives whether the block is resident in shared buffers.
    ///
    /// Everything that must happen before concurrent backends can observe
    /// the mapping again runs inside `f`.
    fn with_partition_shared(&self, tag: &BufferTag, f: &mut dyn FnMut(bool));
}

/// Transaction lifecycle events forwarded to the adaptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    /// Transaction commit
    Commit,
    /// Just before commit
    PreCommit,
    /// Two-phase prepare
    Prepare,
    /// Just before prepare
    PrePrepare,
    /// Transaction abort
    Abort,
}

/// The bundle of collaborator services a [`crate::store::PageStore`] is
/// built from.
#[derive(Clone)]
pub struct EngineHooks {
    /// Relation size cache
    pub relsize: Arc<dyn RelSizeCache>,
    /// Last-written-LSN service
    pub lwlsn: Arc<dyn LastWrittenLsn>,
    /// Local file cache of remote pages
    pub file_cache: Arc<dyn FileCache>,
    /// WAL subsystem
    pub wal: Arc<dyn WalFacade>,
    /// Process facts
    pub process: Arc<dyn ProcessState>,
    /// Local-disk fallback storage
    pub local: Arc<dyn LocalStorage>,
    /// Shared buffer pool residency
    pub shared_buffers: Arc<dyn SharedBuffers>,
}
