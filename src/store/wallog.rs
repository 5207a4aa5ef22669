//! Eviction-time WAL logging
//!
//! Pages reach the page server only through the WAL. Most pages are logged
//! when they are modified, but FSM and some visibility-map changes never
//! are; for those, eviction from the buffer cache is the last chance to get
//! an image into the stream. This module decides, for every page leaving the
//! cache, whether to force a full-page image and what LSN to publish as the
//! page's last-written position.

use tracing::trace;

use crate::page::{self, PageBuf};
use crate::store::PageStore;
use crate::tag::{ForkNumber, RelTag};

impl PageStore {
    /// Record the eviction of `buf` in the WAL bookkeeping.
    ///
    /// With `force`, or for the FSM and visibility-map forks, a copy of the
    /// page is logged as a full-page image and flushed, and the record's
    /// position becomes the page's last-written LSN. Otherwise the page must
    /// already carry an LSN, with two benign exceptions: a brand-new page
    /// (relation extension) and a page byte-identical to an empty heap page.
    ///
    /// # Panics
    ///
    /// Panics when a page with a zero LSN is neither of those: an unlogged
    /// modification is about to be lost.
    pub(crate) fn wallog_page(
        &self,
        rel: &RelTag,
        fork: ForkNumber,
        block: u32,
        buf: &PageBuf,
        force: bool,
    ) {
        let mut lsn = page::page_lsn(buf);

        if self.process.shutdown_requested() {
            return;
        }
        if !self.wal.insert_allowed() {
            return;
        }

        if (force || fork == ForkNumber::Fsm || fork == ForkNumber::VisibilityMap)
            && !self.process.in_recovery()
        {
            // The caller may hold only a shared lock on the page, so log a
            // copy rather than the live buffer.
            let copy = *buf;
            let record_lsn = self.wal.log_page_image(rel, fork, block, &copy);
            self.wal.flush(record_lsn);
            lsn = record_lsn;
            trace!(%rel, %fork, block, %lsn, "page was force logged at eviction");
        } else if !lsn.is_valid() {
            if page::page_is_new(buf) {
                trace!(%rel, %fork, block, "evicted page is all-zeros");
            } else if page::page_is_empty_heap(buf) {
                trace!(%rel, %fork, block, "evicted page is an empty heap page with no LSN");
            } else {
                panic!("page {block} of relation {rel}.{fork} is evicted with zero LSN");
            }
        } else {
            trace!(%rel, %fork, block, %lsn, "evicted page is already WAL-logged");
        }

        // Any future read of this page must see this version or newer.
        self.lwlsn.set_for_block(lsn, rel, fork, block);
    }
}
