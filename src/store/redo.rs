//! Redo read-buffer filtering
//!
//! The WAL redo driver asks, per block referenced by a record, whether the
//! read-and-apply step can be skipped. It can whenever the block is not in
//! shared buffers: any later reader has to fetch the block from the page
//! server anyway, and publishing the record's end position as the block's
//! last-written LSN forces that fetch to see the post-redo contents.
//!
//! Skipping also means the block is never locked by the redo process, so the
//! last-written LSN must be published *before* the buffer-mapping partition
//! lock is released; otherwise a concurrent reader could slip in between and
//! be served a pre-redo page.

use tracing::trace;

use crate::codec::{PageServerRequest, PageServerResponse};
use crate::error::{PageStoreError, Result};
use crate::lsn::Lsn;
use crate::store::PageStore;
use crate::tag::{BufferTag, ForkNumber, RelTag};

impl PageStore {
    /// Decide whether redo for `(rel, fork, block)` can skip its read+apply
    /// step. `end_record_lsn` is the end position of the record being
    /// replayed.
    ///
    /// Returns `true` when the block is absent from shared buffers. In both
    /// cases the block's last-written LSN is at least `end_record_lsn` on
    /// return, and the relation-size cache reflects the block's existence.
    pub fn redo_read_buffer_filter(
        &mut self,
        rel: RelTag,
        fork: ForkNumber,
        block: u32,
        end_record_lsn: Lsn,
    ) -> Result<bool> {
        // Shared catalogs always get redo applied: catalog updates usually
        // make backends rebuild their snapshots, so the page is about to be
        // used.
        if rel.db_node == 0 {
            return Ok(false);
        }

        let tag = BufferTag::new(rel, fork, block);
        let mut no_redo_needed = false;
        {
            let lwlsn = &*self.lwlsn;
            let file_cache = &*self.file_cache;
            self.shared_buffers.with_partition_shared(&tag, &mut |resident| {
                no_redo_needed = !resident;

                // Publish before the partition lock is released, or a
                // concurrent reader could still be served the old page.
                lwlsn.set_for_block(end_record_lsn, &rel, fork, block);

                // A skipped block must not linger in the file cache either;
                // evicting is cheaper than re-reading it through the
                // filesystem.
                if no_redo_needed {
                    file_cache.evict(&rel, fork, block);
                }
            });
        }

        // The record may extend the relation. Keep the size cache current so
        // later size queries don't consult the server at a pre-redo state.
        match self.relsize.get(&rel, fork) {
            Some(size) => {
                if size < block + 1 {
                    self.relsize.update(&rel, fork, block + 1);
                    self.lwlsn.set_for_relation(end_record_lsn, &rel, fork);
                }
            }
            None => {
                // Size unknown; seed the cache with the size as of this
                // record. The value is reused when the block is later read,
                // which is expected.
                let request = PageServerRequest::Nblocks {
                    latest: false,
                    lsn: end_record_lsn,
                    rel,
                    fork,
                };
                let n_blocks = match self.pipeline.sync_request(&request) {
                    PageServerResponse::Nblocks { n_blocks } => n_blocks,
                    PageServerResponse::Error { message } => {
                        return Err(PageStoreError::page_server(
                            format!("relation size of rel {rel}.{fork}"),
                            end_record_lsn,
                            message,
                        ));
                    }
                    other => {
                        return Err(PageStoreError::protocol(format!(
                            "unexpected response to size request: {other}"
                        )));
                    }
                };
                debug_assert!(n_blocks > block);
                self.relsize.set(&rel, fork, n_blocks);
                self.lwlsn.set_for_relation(end_record_lsn, &rel, fork);
                trace!(%rel, %fork, n_blocks, "seeded relation size during redo");
            }
        }

        Ok(no_redo_needed)
    }
}
