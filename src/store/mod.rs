//! The block adaptor surface
//!
//! [`PageStore`] is the backend-scoped object the engine's storage manager
//! calls into. Every operation first dispatches on the relation's
//! persistence: temporary and unlogged relations are delegated wholesale to
//! the local-disk fallback, permanent relations take the remote path, and a
//! handle with unresolved persistence is only allowed the handful of
//! operations buffer eviction and transaction-end cleanup need.
//!
//! The remote path never reads pages synchronously from scratch: every read
//! goes through the prefetch pipeline, so a read that was prefetched earlier
//! is served from the ring, and a cold read simply registers and immediately
//! waits.

pub mod redo;
pub mod request_lsn;
pub mod unlogged;
pub mod wallog;

use std::sync::Arc;

use tracing::{trace, warn};

use crate::api::{
    EngineHooks, FileCache, LastWrittenLsn, LocalStorage, PageServerApi, ProcessState,
    RelSizeCache, SharedBuffers, WalFacade,
};
use crate::codec::{PageServerRequest, PageServerResponse};
use crate::config::PageStoreConfig;
use crate::constants::REL_METADATA_PSEUDO_BLOCK;
use crate::error::{PageStoreError, Result};
use crate::lsn::Lsn;
use crate::metrics::PrefetchStats;
use crate::page::{self, PageBuf};
use crate::prefetch::{PrefetchPipeline, PrefetchStatus};
use crate::tag::{BufferTag, ForkNumber, Persistence, RelTag, Relation};

use self::request_lsn::RequestLsnOracle;
use self::unlogged::UnloggedBuildState;

/// Builds a request-LSN oracle over this store's collaborators without
/// borrowing the pipeline, so the two can be used in the same expression.
macro_rules! lsn_oracle {
    ($store:expr) => {
        RequestLsnOracle {
            lwlsn: &*$store.lwlsn,
            wal: &*$store.wal,
            process: &*$store.process,
        }
    };
}

/// The client-side storage adaptor for one backend.
///
/// All state is private to the backend that owns the value; nothing here is
/// shared between backends. The collaborator services are internally
/// synchronized and may be shared freely.
pub struct PageStore {
    pipeline: PrefetchPipeline,
    config: PageStoreConfig,
    relsize: Arc<dyn RelSizeCache>,
    lwlsn: Arc<dyn LastWrittenLsn>,
    file_cache: Arc<dyn FileCache>,
    wal: Arc<dyn WalFacade>,
    process: Arc<dyn ProcessState>,
    local: Arc<dyn LocalStorage>,
    shared_buffers: Arc<dyn SharedBuffers>,
    unlogged_build: UnloggedBuildState,
}

impl PageStore {
    /// Create the adaptor over a page server connection and the engine's
    /// collaborator services.
    pub fn new(
        config: PageStoreConfig,
        client: Box<dyn PageServerApi>,
        hooks: EngineHooks,
    ) -> Result<Self> {
        config.validate()?;
        let pipeline = PrefetchPipeline::new(
            client,
            config.readahead_buffer_size,
            config.flush_every_n_requests,
        );
        Ok(Self {
            pipeline,
            config,
            relsize: hooks.relsize,
            lwlsn: hooks.lwlsn,
            file_cache: hooks.file_cache,
            wal: hooks.wal,
            process: hooks.process,
            local: hooks.local,
            shared_buffers: hooks.shared_buffers,
            unlogged_build: UnloggedBuildState::default(),
        })
    }

    /// Does the relation fork exist?
    pub fn exists(&mut self, rel: &Relation, fork: ForkNumber) -> Result<bool> {
        match rel.persistence {
            Persistence::Unknown => {
                // Could be an unlogged rel stored locally or a permanent rel
                // on the page server; check local disk first.
                if self.local.exists(&rel.tag, fork) {
                    return Ok(true);
                }
            }
            Persistence::Permanent => {}
            Persistence::Temp | Persistence::Unlogged => {
                return Ok(self.local.exists(&rel.tag, fork));
            }
        }

        if self.relsize.get(&rel.tag, fork).is_some() {
            return Ok(true);
        }

        // Catalog views are sometimes probed with an all-zeros relation
        // identity the page server would reject; answer locally.
        if rel.tag.is_zero() {
            return Ok(false);
        }

        let (lsn, latest) =
            lsn_oracle!(self).request_lsn(&rel.tag, fork, REL_METADATA_PSEUDO_BLOCK);
        let request = PageServerRequest::Exists {
            latest,
            lsn,
            rel: rel.tag,
            fork,
        };
        match self.pipeline.sync_request(&request) {
            PageServerResponse::Exists { exists } => Ok(exists),
            PageServerResponse::Error { message } => Err(PageStoreError::page_server(
                format!("relation existence of rel {}.{}", rel.tag, fork),
                lsn,
                message,
            )),
            other => Err(PageStoreError::protocol(format!(
                "unexpected response to existence request: {other}"
            ))),
        }
    }

    /// Create a new relation fork.
    ///
    /// During redo the fork may exist already; the cached size is then only
    /// seeded, never truncated.
    pub fn create(&mut self, rel: &Relation, fork: ForkNumber, is_redo: bool) -> Result<()> {
        match rel.persistence {
            Persistence::Unknown => return Err(PageStoreError::unsupported("create")),
            Persistence::Permanent => {}
            Persistence::Temp | Persistence::Unlogged => {
                return self.local.create(&rel.tag, fork, is_redo);
            }
        }

        trace!(rel = %rel.tag, %fork, "create relation");

        // A newly created relation is empty; the relsize cache is the
        // primary source of truth until the creation record reaches the
        // page server, so it must be seeded here.
        if is_redo {
            self.relsize.update(&rel.tag, fork, 0);
        } else {
            self.relsize.set(&rel.tag, fork, 0);
        }
        Ok(())
    }

    /// Unlink a relation; `fork = None` removes every fork.
    ///
    /// This usually runs outside a transaction, so failures are only
    /// warnings.
    pub fn unlink(&mut self, rel: &Relation, fork: Option<ForkNumber>, is_redo: bool) {
        // The file may or may not exist locally depending on persistence;
        // trying never hurts.
        if let Err(error) = self.local.unlink(&rel.tag, fork, is_redo) {
            warn!(rel = %rel.tag, %error, "could not unlink local relation file");
        }
        if rel.persistence != Persistence::Temp {
            match fork {
                Some(fork) => self.relsize.forget(&rel.tag, fork),
                None => {
                    for fork in ForkNumber::ALL {
                        self.relsize.forget(&rel.tag, fork);
                    }
                }
            }
        }
    }

    /// Add a block at or beyond the current end of the relation.
    pub fn extend(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        block: u32,
        buf: &PageBuf,
        skip_fsync: bool,
    ) -> Result<()> {
        match rel.persistence {
            Persistence::Unknown => return Err(PageStoreError::unsupported("extend")),
            Persistence::Permanent => {}
            Persistence::Temp | Persistence::Unlogged => {
                return self.local.extend(&rel.tag, fork, block, buf, skip_fsync);
            }
        }

        // Temporary and unlogged relations are not counted by the page
        // server, and autovacuum must always be able to make progress.
        if self.config.max_cluster_size_mb > 0 && !self.process.is_autovacuum_worker() {
            let current_size = self.process.current_cluster_size();
            if current_size >= self.config.max_cluster_size_mb * 1024 * 1024 {
                return Err(PageStoreError::ClusterSizeExceeded {
                    limit_mb: self.config.max_cluster_size_mb,
                });
            }
        }

        // Extension normally advances one block at a time, but copy paths
        // may jump; every skipped block needs a logged image too.
        let mut n_blocks = self.nblocks(rel, fork)?;
        while n_blocks < block {
            self.wallog_page(&rel.tag, fork, n_blocks, buf, true);
            n_blocks += 1;
        }

        self.wallog_page(&rel.tag, fork, block, buf, false);
        self.relsize.set(&rel.tag, fork, block + 1);

        let mut lsn = page::page_lsn(buf);
        trace!(rel = %rel.tag, %fork, block, lsn = %lsn, "extend");

        self.file_cache.write(&rel.tag, fork, block, buf);

        // Extension usually passes an all-zeros page whose contents arrive
        // with a later write, but the relation metadata update needs a valid
        // position now.
        if !lsn.is_valid() {
            lsn = self.wal.insert_lsn();
            self.lwlsn.set_for_block(lsn, &rel.tag, fork, block);
        }
        self.lwlsn.set_for_relation(lsn, &rel.tag, fork);
        Ok(())
    }

    /// Read a block into `buf`.
    pub fn read(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        block: u32,
        buf: &mut PageBuf,
    ) -> Result<()> {
        match rel.persistence {
            Persistence::Unknown => return Err(PageStoreError::unsupported("read")),
            Persistence::Permanent => {}
            Persistence::Temp | Persistence::Unlogged => {
                return self.local.read(&rel.tag, fork, block, buf);
            }
        }

        if self.file_cache.read(&rel.tag, fork, block, buf) {
            return Ok(());
        }

        let (request_lsn, request_latest) = lsn_oracle!(self).request_lsn(&rel.tag, fork, block);
        self.read_at_lsn(rel.tag, fork, block, request_lsn, request_latest, buf)
    }

    /// Read a block as of an explicit LSN.
    ///
    /// A buffered prefetch for the same block is used when its effective
    /// request LSN is at least `request_lsn`, and discarded otherwise. The
    /// whole register-and-wait cycle restarts after a connection drop.
    pub fn read_at_lsn(
        &mut self,
        rel: RelTag,
        fork: ForkNumber,
        block: u32,
        request_lsn: Lsn,
        request_latest: bool,
        buf: &mut PageBuf,
    ) -> Result<()> {
        let tag = BufferTag::new(rel, fork, block);

        let mut hit = None;
        if let Some(ring_index) = self.pipeline.lookup(&tag) {
            if self.pipeline.slot_effective_lsn(ring_index) >= request_lsn {
                self.pipeline.stats_mut().hits += 1;
                hit = Some(ring_index);
            } else {
                // The buffered request is not fresh enough. It cannot be
                // dropped while still in flight, so wait it out first.
                if self.pipeline.slot_status(ring_index) == PrefetchStatus::Requested {
                    if !self.pipeline.wait_for(ring_index) {
                        self.pipeline.on_disconnect();
                    }
                }
                self.pipeline.set_unused(ring_index);
                self.pipeline.stats_mut().expired += 1;
            }
        }

        let ring_index = loop {
            let ring_index = match hit.take() {
                Some(ring_index) => ring_index,
                None => {
                    self.pipeline.stats_mut().misses += 1;
                    let oracle = lsn_oracle!(self);
                    self.pipeline
                        .register_buffer(tag, Some((request_latest, request_lsn)), &oracle)
                }
            };
            if self.pipeline.wait_for(ring_index)
                && self.pipeline.slot_status(ring_index) == PrefetchStatus::Received
            {
                break ring_index;
            }
            // The connection dropped underneath us; reset and re-register.
            self.pipeline.on_disconnect();
        };

        let outcome = match self.pipeline.response(ring_index) {
            Some(PageServerResponse::GetPage { page }) => {
                buf.copy_from_slice(&page[..]);
                Ok(())
            }
            Some(PageServerResponse::Error { message }) => Err(PageStoreError::page_server(
                format!("block {block} in rel {rel}.{fork}"),
                request_lsn,
                message.clone(),
            )),
            Some(other) => Err(PageStoreError::protocol(format!(
                "unexpected response to page request: {other}"
            ))),
            None => unreachable!("slot has just been received"),
        };

        // The buffered response has served its purpose either way.
        self.pipeline.set_unused(ring_index);
        self.pipeline.cleanup_trailing_unused();

        outcome?;
        self.file_cache.write(&rel, fork, block, buf);
        Ok(())
    }

    /// Write a block that already exists.
    ///
    /// For permanent relations nothing is sent anywhere: the page's changes
    /// are already in the WAL, and this is only the point where the page's
    /// LSN is recorded (or, for never-logged forks, where a full-page image
    /// is forced out).
    pub fn write(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        block: u32,
        buf: &PageBuf,
        skip_fsync: bool,
    ) -> Result<()> {
        match rel.persistence {
            Persistence::Unknown => {
                // Resolve by probing local disk: if the file exists this is
                // an unlogged rel; otherwise it must be permanent and
                // already WAL-logged.
                if self.local.exists(&rel.tag, fork) {
                    return self.local.write(&rel.tag, fork, block, buf, skip_fsync);
                }
            }
            Persistence::Permanent => {}
            Persistence::Temp | Persistence::Unlogged => {
                return self.local.write(&rel.tag, fork, block, buf, skip_fsync);
            }
        }

        self.wallog_page(&rel.tag, fork, block, buf, false);

        trace!(
            rel = %rel.tag, %fork, block, lsn = %page::page_lsn(buf),
            "write"
        );

        self.file_cache.write(&rel.tag, fork, block, buf);
        Ok(())
    }

    /// Number of blocks in the relation fork.
    pub fn nblocks(&mut self, rel: &Relation, fork: ForkNumber) -> Result<u32> {
        match rel.persistence {
            Persistence::Unknown => return Err(PageStoreError::unsupported("nblocks")),
            Persistence::Permanent => {}
            Persistence::Temp | Persistence::Unlogged => {
                return self.local.nblocks(&rel.tag, fork);
            }
        }

        if let Some(n_blocks) = self.relsize.get(&rel.tag, fork) {
            trace!(rel = %rel.tag, %fork, n_blocks, "cached nblocks");
            return Ok(n_blocks);
        }

        let (lsn, latest) =
            lsn_oracle!(self).request_lsn(&rel.tag, fork, REL_METADATA_PSEUDO_BLOCK);
        let request = PageServerRequest::Nblocks {
            latest,
            lsn,
            rel: rel.tag,
            fork,
        };
        let n_blocks = match self.pipeline.sync_request(&request) {
            PageServerResponse::Nblocks { n_blocks } => n_blocks,
            PageServerResponse::Error { message } => {
                return Err(PageStoreError::page_server(
                    format!("relation size of rel {}.{}", rel.tag, fork),
                    lsn,
                    message,
                ));
            }
            other => {
                return Err(PageStoreError::protocol(format!(
                    "unexpected response to size request: {other}"
                )));
            }
        };
        self.relsize.update(&rel.tag, fork, n_blocks);

        trace!(rel = %rel.tag, %fork, %lsn, n_blocks, "nblocks");
        Ok(n_blocks)
    }

    /// Total size of a database in bytes.
    pub fn db_size(&mut self, db_node: u32) -> Result<i64> {
        let dummy_rel = RelTag::default();
        let (lsn, latest) =
            lsn_oracle!(self).request_lsn(&dummy_rel, ForkNumber::Main, REL_METADATA_PSEUDO_BLOCK);
        let request = PageServerRequest::DbSize {
            latest,
            lsn,
            db_node,
        };
        let db_size = match self.pipeline.sync_request(&request) {
            PageServerResponse::DbSize { db_size } => db_size,
            PageServerResponse::Error { message } => {
                return Err(PageStoreError::page_server(
                    format!("db size of db {db_node}"),
                    lsn,
                    message,
                ));
            }
            other => {
                return Err(PageStoreError::protocol(format!(
                    "unexpected response to db size request: {other}"
                )));
            }
        };

        trace!(db_node, %lsn, db_size, "db_size");
        Ok(db_size)
    }

    /// Truncate a relation fork to `n_blocks`.
    pub fn truncate(&mut self, rel: &Relation, fork: ForkNumber, n_blocks: u32) -> Result<()> {
        match rel.persistence {
            Persistence::Unknown => return Err(PageStoreError::unsupported("truncate")),
            Persistence::Permanent => {}
            Persistence::Temp | Persistence::Unlogged => {
                return self.local.truncate(&rel.tag, fork, n_blocks);
            }
        }

        self.relsize.set(&rel.tag, fork, n_blocks);

        // Truncation drops buffers without evicting them through write(),
        // but future size queries must still see the new size. The record
        // itself is already in the WAL; use the most recent insert position
        // as a conservative watermark.
        let lsn = self.wal.insert_lsn().adjust_to_wal_boundary();

        // Uphold last-written <= flushed.
        self.wal.flush(lsn);

        // One relation-level entry covers all truncated blocks; a later
        // extension overwrites the per-block entries anyway.
        self.lwlsn.set_for_relation(lsn, &rel.tag, fork);
        Ok(())
    }

    /// Sync a relation to stable storage. Remote relations have nothing to
    /// sync; durability is the page server's responsibility.
    pub fn immedsync(&mut self, rel: &Relation, fork: ForkNumber) -> Result<()> {
        match rel.persistence {
            Persistence::Unknown => return Err(PageStoreError::unsupported("immedsync")),
            Persistence::Permanent => {}
            Persistence::Temp | Persistence::Unlogged => {
                return self.local.immedsync(&rel.tag, fork);
            }
        }

        trace!(rel = %rel.tag, %fork, "immedsync noop");
        Ok(())
    }

    /// Start an asynchronous read of a block.
    ///
    /// Returns `false`: the engine never needs to treat the block as
    /// initiated-elsewhere, because responses are matched by block identity
    /// at read time.
    pub fn prefetch(&mut self, rel: &Relation, fork: ForkNumber, block: u32) -> Result<bool> {
        match rel.persistence {
            // An unresolved handle should not be prefetched, but the hint is
            // harmless; treat it like a permanent relation.
            Persistence::Unknown | Persistence::Permanent => {}
            Persistence::Temp | Persistence::Unlogged => {
                return Ok(self.local.prefetch(&rel.tag, fork, block));
            }
        }

        if self.file_cache.contains(&rel.tag, fork, block) {
            return Ok(false);
        }

        let tag = BufferTag::new(rel.tag, fork, block);
        let oracle = lsn_oracle!(self);
        let ring_index = self.pipeline.register_buffer(tag, None, &oracle);
        debug_assert!(
            self.pipeline.ring_last() <= ring_index && ring_index < self.pipeline.ring_unused()
        );
        Ok(false)
    }

    /// Hint the OS to write a block range back. Remote relations have no
    /// local blocks to write back.
    pub fn writeback(
        &mut self,
        rel: &Relation,
        fork: ForkNumber,
        block: u32,
        n_blocks: u32,
    ) -> Result<()> {
        match rel.persistence {
            Persistence::Unknown => {
                // Writing back nothing is fine if the file doesn't exist.
                self.local.writeback(&rel.tag, fork, block, n_blocks);
                return Ok(());
            }
            Persistence::Permanent => {}
            Persistence::Temp | Persistence::Unlogged => {
                self.local.writeback(&rel.tag, fork, block, n_blocks);
                return Ok(());
            }
        }

        trace!(rel = %rel.tag, %fork, "writeback noop");
        Ok(())
    }

    /// Initialize a newly opened relation handle.
    pub fn open(&mut self, rel: &Relation) {
        // Only temporary and unlogged relations have local state to set up,
        // but it is cheap to always let the fallback initialize itself.
        self.local.open(&rel.tag);
        trace!(rel = %rel.tag, "open noop");
    }

    /// Close a relation fork if it is open locally.
    pub fn close(&mut self, rel: &Relation, fork: ForkNumber) {
        self.local.close(&rel.tag, fork);
    }

    /// Notification that the page server connection dropped. Orphans every
    /// in-flight prefetch so no response is ever mismatched.
    pub fn on_pageserver_disconnect(&mut self) {
        self.pipeline.on_disconnect();
    }

    /// Change the prefetch ring capacity at runtime.
    pub fn resize_readahead_buffer(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(PageStoreError::config(
                "readahead buffer size must be greater than 0",
            ));
        }
        self.pipeline.resize(capacity);
        self.config.readahead_buffer_size = capacity;
        Ok(())
    }

    /// Prefetch effectiveness counters.
    pub fn stats(&self) -> PrefetchStats {
        self.pipeline.stats()
    }

    /// The current configuration.
    pub fn config(&self) -> &PageStoreConfig {
        &self.config
    }

    /// Read access to the prefetch pipeline, mainly for invariant checks in
    /// tests.
    pub fn pipeline(&self) -> &PrefetchPipeline {
        &self.pipeline
    }
}
