//! The prefetch state machine
//!
//! `PrefetchPipeline` owns the page server connection and a bounded ring of
//! request slots. Four monotonic counters partition the ring:
//!
//! ```text
//! ring_last <= ring_receive <= ring_flush <= ring_unused
//! ```
//!
//! - `ring_unused` — first slot that has never been handed out
//! - `ring_flush` — first request not yet flushed to the server
//! - `ring_receive` — next request whose response is pending
//! - `ring_last` — oldest slot still holding anything
//!
//! Slots in `[ring_receive, ring_unused)` are in flight; slots in
//! `[ring_last, ring_receive)` hold buffered responses, orphaned tags, or
//! holes left by retired entries. Every live slot is also registered in the
//! tag index, and no two live slots share a tag.
//!
//! The tag index may only be consulted between suspension points: any call
//! into [`PrefetchPipeline::wait_for`], [`PrefetchPipeline::set_unused`] or
//! compaction can invalidate previously looked-up ring positions, and
//! consumers must re-look-up afterwards.

use std::collections::HashMap;

use tracing::trace;

use crate::api::PageServerApi;
use crate::codec::{PageServerRequest, PageServerResponse};
use crate::lsn::Lsn;
use crate::metrics::PrefetchStats;
use crate::tag::BufferTag;

use super::pool::PagePool;
use super::slot::{PrefetchSlot, PrefetchStatus};

/// Supplies the `(lsn, latest)` pair stamped onto a request when the caller
/// did not force one.
pub trait RequestLsnSource {
    /// Pick the request LSN for `tag`.
    fn lsn_for(&self, tag: &BufferTag) -> (Lsn, bool);
}

/// A per-backend pipeline of page requests.
pub struct PrefetchPipeline {
    client: Box<dyn PageServerApi>,
    ring: Vec<PrefetchSlot>,
    capacity: usize,

    ring_last: u64,
    ring_receive: u64,
    ring_flush: u64,
    ring_unused: u64,

    n_requests_inflight: usize,
    n_responses_buffered: usize,
    n_unused: usize,

    index: HashMap<BufferTag, u64>,
    /// Monotone watermark used as the effective LSN of non-forced requests.
    prefetch_lsn: Lsn,
    pool: PagePool,
    flush_every_n_requests: usize,
    stats: PrefetchStats,
}

impl PrefetchPipeline {
    /// Create a pipeline over `client` with the given ring capacity.
    pub fn new(
        client: Box<dyn PageServerApi>,
        capacity: usize,
        flush_every_n_requests: usize,
    ) -> Self {
        assert!(capacity > 0, "prefetch ring capacity must be non-zero");
        Self {
            client,
            ring: std::iter::repeat_with(PrefetchSlot::default)
                .take(capacity)
                .collect(),
            capacity,
            ring_last: 0,
            ring_receive: 0,
            ring_flush: 0,
            ring_unused: 0,
            n_requests_inflight: 0,
            n_responses_buffered: 0,
            n_unused: capacity,
            index: HashMap::with_capacity(capacity),
            prefetch_lsn: Lsn::INVALID,
            pool: PagePool::new(capacity),
            flush_every_n_requests,
            stats: PrefetchStats::default(),
        }
    }

    fn slot_pos(&self, ring_index: u64) -> usize {
        (ring_index % self.capacity as u64) as usize
    }

    fn slot(&self, ring_index: u64) -> &PrefetchSlot {
        debug_assert!(
            self.ring_last <= ring_index && ring_index < self.ring_unused,
            "slot {ring_index} outside addressable range [{}, {})",
            self.ring_last,
            self.ring_unused
        );
        &self.ring[self.slot_pos(ring_index)]
    }

    /// Ring position of the live slot for `tag`, if any.
    pub fn lookup(&self, tag: &BufferTag) -> Option<u64> {
        self.index.get(tag).copied()
    }

    /// Lifecycle state of the slot at `ring_index`.
    pub fn slot_status(&self, ring_index: u64) -> PrefetchStatus {
        self.slot(ring_index).status
    }

    /// The LSN the request at `ring_index` was stamped with.
    pub fn slot_effective_lsn(&self, ring_index: u64) -> Lsn {
        self.slot(ring_index).effective_request_lsn
    }

    /// The buffered response at `ring_index`, if one has been received.
    pub fn response(&self, ring_index: u64) -> Option<&PageServerResponse> {
        self.slot(ring_index).response.as_ref()
    }

    /// Register that the contents of `tag` will be wanted soon, and send a
    /// request for it unless an equivalent one is already in the ring.
    ///
    /// With `force = Some((latest, lsn))` the request is stamped with
    /// exactly that pair, and an existing slot is reused only when its
    /// effective LSN still satisfies the caller: any LSN `>= lsn` when
    /// `latest`, exactly `lsn` otherwise. A mismatched slot is waited for
    /// and retired first, because an unflushed request cannot be cancelled
    /// on the wire.
    ///
    /// Returns the slot's ring position. The position is invalidated by any
    /// subsequent wait, retire, or registration.
    pub fn register_buffer(
        &mut self,
        tag: BufferTag,
        force: Option<(bool, Lsn)>,
        lsn_source: &dyn RequestLsnSource,
    ) -> u64 {
        if let Some(ring_index) = self.lookup(&tag) {
            debug_assert!(self.ring_last <= ring_index && ring_index < self.ring_unused);
            debug_assert_eq!(self.slot(ring_index).tag, Some(tag));
            debug_assert_ne!(self.slot(ring_index).status, PrefetchStatus::Unused);

            let mut reusable = true;
            if let Some((latest, lsn)) = force {
                let effective = self.slot(ring_index).effective_request_lsn;
                let satisfied = if latest {
                    effective >= lsn
                } else {
                    effective == lsn
                };
                if !satisfied {
                    // The in-flight request may not even be flushed yet, but
                    // it cannot be recalled; wait it out, then discard.
                    if !self.wait_for(ring_index) {
                        self.on_disconnect();
                    }
                    self.set_unused(ring_index);
                    reusable = false;
                }
            }

            if reusable {
                if self.slot(ring_index).status == PrefetchStatus::TagRemains {
                    // Orphaned by a disconnect; retire it and request afresh.
                    self.set_unused(ring_index);
                } else {
                    self.stats.duplicates += 1;
                    return ring_index;
                }
            }
        }

        // If the ring is full, make room by clearing the oldest slot. A
        // received response is simply thrown away; an in-flight request must
        // be flushed and waited for first. The threshold leaves one slot of
        // headroom below the structural bound; `>=` rather than `==` because
        // a resize can leave the window one slot denser than registration
        // ever does.
        if self.ring_unused > self.ring_last
            && self.ring_unused - self.ring_last >= self.capacity as u64 - 1
        {
            let cleanup_index = self.ring_last;
            debug_assert_ne!(self.slot(cleanup_index).status, PrefetchStatus::Unused);

            if self.needs_compaction() && self.compact() {
                debug_assert_eq!(
                    self.ring[self.slot_pos(cleanup_index)].status,
                    PrefetchStatus::Unused
                );
            } else {
                match self.slot(cleanup_index).status {
                    PrefetchStatus::Requested => {
                        debug_assert_eq!(self.ring_receive, cleanup_index);
                        if !self.wait_for(cleanup_index) {
                            self.on_disconnect();
                        }
                        self.set_unused(cleanup_index);
                    }
                    PrefetchStatus::Received | PrefetchStatus::TagRemains => {
                        self.set_unused(cleanup_index);
                    }
                    PrefetchStatus::Unused => {
                        unreachable!("ring-full cleanup found an unused oldest slot")
                    }
                }
            }
        }

        // The slot at ring_unused is now definitely empty.
        let ring_index = self.ring_unused;
        let pos = self.slot_pos(ring_index);
        debug_assert!(self.ring_last <= ring_index);
        debug_assert_eq!(self.ring[pos].status, PrefetchStatus::Unused);

        // Tag the slot before issuing the request; the index keys off it.
        self.ring[pos].tag = Some(tag);
        self.ring[pos].ring_index = ring_index;

        self.issue_request(ring_index, force, lsn_source);
        debug_assert_eq!(self.slot(ring_index).status, PrefetchStatus::Requested);

        if self.flush_every_n_requests > 0
            && self.ring_unused - self.ring_flush >= self.flush_every_n_requests as u64
        {
            if self.client.flush() {
                self.ring_flush = self.ring_unused;
            } else {
                self.on_disconnect();
            }
        }

        ring_index
    }

    /// Compose and send the request for the freshly tagged slot at
    /// `ring_index`.
    fn issue_request(
        &mut self,
        ring_index: u64,
        force: Option<(bool, Lsn)>,
        lsn_source: &dyn RequestLsnSource,
    ) {
        let pos = self.slot_pos(ring_index);
        let tag = self.ring[pos].tag.expect("issuing a request for an untagged slot");

        let (request_lsn, request_latest, effective_lsn) = match force {
            Some((latest, lsn)) => (lsn, latest, lsn),
            None => {
                let (lsn, latest) = lsn_source.lsn_for(&tag);
                // The effective LSN may exceed the requested one and still
                // be correct: a page modified between the two would have
                // advanced its last-written LSN past prefetch_lsn, which
                // defeats reuse of this slot anyway.
                self.prefetch_lsn = self.prefetch_lsn.max(lsn);
                (lsn, latest, self.prefetch_lsn)
            }
        };

        let request = PageServerRequest::GetPage {
            latest: request_latest,
            lsn: request_lsn,
            rel: tag.rel,
            fork: tag.fork,
            block: tag.block,
        };

        debug_assert!(self.ring[pos].response.is_none());
        debug_assert_eq!(self.ring[pos].ring_index, self.ring_unused);

        while !self.client.send(&request) {}

        self.n_requests_inflight += 1;
        self.n_unused -= 1;
        self.ring_unused += 1;

        let slot = &mut self.ring[pos];
        slot.status = PrefetchStatus::Requested;
        slot.effective_request_lsn = effective_lsn;

        let previous = self.index.insert(tag, ring_index);
        assert!(
            previous.is_none(),
            "duplicate prefetch tag {tag} in index at {ring_index}"
        );
    }

    /// Wait until the slot at `ring_index` has received its response.
    ///
    /// Flushes first if the request might still sit in the send buffer.
    /// Returns `false` on transport failure without touching in-flight
    /// accounting; the caller must retry or trigger disconnect handling.
    pub fn wait_for(&mut self, ring_index: u64) -> bool {
        if self.ring_flush <= ring_index && self.ring_unused > self.ring_flush {
            if !self.client.flush() {
                return false;
            }
            self.ring_flush = self.ring_unused;
        }

        debug_assert!(self.ring_unused > ring_index);

        while self.ring_receive <= ring_index {
            debug_assert_eq!(
                self.slot(self.ring_receive).status,
                PrefetchStatus::Requested
            );
            if !self.receive_one() {
                return false;
            }
        }
        true
    }

    /// Receive the response for the oldest in-flight request into its slot.
    fn receive_one(&mut self) -> bool {
        let pos = self.slot_pos(self.ring_receive);
        debug_assert_eq!(self.ring[pos].status, PrefetchStatus::Requested);
        debug_assert!(self.ring[pos].response.is_none());

        match self.client.receive(&mut self.pool) {
            Some(response) => {
                self.n_responses_buffered += 1;
                self.n_requests_inflight -= 1;
                self.ring_receive += 1;

                let slot = &mut self.ring[pos];
                slot.status = PrefetchStatus::Received;
                slot.response = Some(response);
                true
            }
            None => false,
        }
    }

    /// Drain every response still owed to the ring. Used before synchronous
    /// round trips, which share the connection's FIFO with the pipeline.
    pub fn consume_responses(&mut self) -> bool {
        if self.ring_receive < self.ring_unused {
            return self.wait_for(self.ring_unused - 1);
        }
        true
    }

    /// Retire the slot at `ring_index`, clearing all its fields.
    ///
    /// Must not be called on an in-flight slot. Retiring the oldest slot
    /// advances `ring_last` past any trailing holes; retiring elsewhere may
    /// trigger compaction when more than an eighth of the received window is
    /// holes.
    pub fn set_unused(&mut self, ring_index: u64) {
        if ring_index < self.ring_last {
            return; // already retired and cleaned past
        }
        debug_assert!(self.ring_unused > ring_index);

        let pos = self.slot_pos(ring_index);
        if self.ring[pos].status == PrefetchStatus::Unused {
            return;
        }
        debug_assert!(
            matches!(
                self.ring[pos].status,
                PrefetchStatus::Received | PrefetchStatus::TagRemains
            ),
            "cannot retire an in-flight slot"
        );

        let response = self.ring[pos].response.take();
        if self.ring[pos].status == PrefetchStatus::Received {
            if let Some(PageServerResponse::GetPage { page }) = response {
                self.pool.release(page);
            }
            self.n_responses_buffered -= 1;
            self.n_unused += 1;
        } else {
            debug_assert!(response.is_none());
        }

        let tag = self.ring[pos].tag.expect("live slot without a tag");
        let removed = self.index.remove(&tag);
        debug_assert_eq!(removed, Some(ring_index));

        self.ring[pos] = PrefetchSlot::default();

        if self.ring_last == ring_index {
            self.cleanup_trailing_unused();
        } else if self.needs_compaction() {
            self.compact();
        }
    }

    /// Advance `ring_last` past leading holes.
    pub fn cleanup_trailing_unused(&mut self) {
        while self.ring_last < self.ring_receive {
            let pos = self.slot_pos(self.ring_last);
            if self.ring[pos].status == PrefetchStatus::Unused {
                self.ring_last += 1;
            } else {
                break;
            }
        }
    }

    /// More than an eighth of the received window is holes.
    fn needs_compaction(&self) -> bool {
        ((self.n_responses_buffered / 8) as u64)
            < self.ring_receive - self.ring_last - self.n_responses_buffered as u64
    }

    /// Move buffered slots into lower-numbered holes so `ring_last` can
    /// advance. Slot contents are preserved exactly; only ring positions
    /// change, with the tag index updated in step.
    fn compact(&mut self) -> bool {
        let mut empty_ring_index = self.ring_last;
        let mut search_ring_index = self.ring_receive;
        let mut n_moved = 0;

        if self.ring_receive == self.ring_last {
            return false;
        }

        // Find the highest hole below the received window's end.
        while search_ring_index > self.ring_last {
            search_ring_index -= 1;
            if self.ring[self.slot_pos(search_ring_index)].status == PrefetchStatus::Unused {
                empty_ring_index = search_ring_index;
                break;
            }
        }

        // Everything below search_ring_index is unscanned; slots between
        // search_ring_index and empty_ring_index are holes; everything above
        // empty_ring_index is in use or out of range. The hole gap grows as
        // more unused slots are passed while scanning downwards.
        while search_ring_index > self.ring_last {
            search_ring_index -= 1;
            let src_pos = self.slot_pos(search_ring_index);
            if self.ring[src_pos].status == PrefetchStatus::Unused {
                continue;
            }

            let dst_pos = self.slot_pos(empty_ring_index);
            debug_assert_ne!(self.ring[src_pos].status, PrefetchStatus::Requested);
            debug_assert_eq!(self.ring[dst_pos].status, PrefetchStatus::Unused);

            let mut moved = std::mem::take(&mut self.ring[src_pos]);
            moved.ring_index = empty_ring_index;
            let tag = moved.tag.expect("live slot without a tag");
            self.ring[dst_pos] = moved;

            let previous = self.index.insert(tag, empty_ring_index);
            debug_assert_eq!(previous, Some(search_ring_index));

            empty_ring_index -= 1;
            n_moved += 1;
        }

        // Trailing holes can only appear when something moved.
        if n_moved > 0 {
            self.cleanup_trailing_unused();
            true
        } else {
            false
        }
    }

    /// Handle a dropped page server connection.
    ///
    /// Every in-flight request is orphaned: its response will never arrive.
    /// The slots keep their tags (`TagRemains`) so later requests for the
    /// same blocks notice the orphan and retire it; the actual retirement
    /// happens lazily as duplicates are detected or room is made.
    pub fn on_disconnect(&mut self) {
        self.ring_flush = self.ring_unused;
        while self.ring_receive < self.ring_unused {
            let ring_index = self.ring_receive;
            let pos = self.slot_pos(ring_index);
            debug_assert_eq!(self.ring[pos].status, PrefetchStatus::Requested);
            debug_assert_eq!(self.ring[pos].ring_index, ring_index);

            self.ring[pos].status = PrefetchStatus::TagRemains;
            self.n_requests_inflight -= 1;
            self.ring_receive += 1;
        }
    }

    /// Change the ring capacity, retaining the most recent live slots.
    ///
    /// Waits until no more than `new_capacity` requests are in flight, then
    /// rebuilds the ring and index. The page-buffer pool carries across with
    /// its retention bound adjusted.
    pub fn resize(&mut self, new_capacity: usize) {
        assert!(new_capacity > 0, "prefetch ring capacity must be non-zero");

        // Don't lose track of in-flight requests: receive all but the last
        // new_capacity of them first.
        if self.n_requests_inflight > new_capacity {
            if !self.wait_for(self.ring_unused - new_capacity as u64) {
                self.on_disconnect();
            }
        }

        let new_cap = new_capacity as u64;
        let mut new_ring: Vec<PrefetchSlot> = std::iter::repeat_with(PrefetchSlot::default)
            .take(new_capacity)
            .collect();
        let mut new_index = HashMap::with_capacity(new_capacity);
        let mut n_requests_inflight = 0usize;
        let mut n_responses_buffered = 0usize;
        let mut n_unused = new_capacity;
        let mut ring_last = new_cap;
        let mut ring_receive = new_cap;
        let mut nfree = new_cap;

        // Populate the new ring from the end, newest slot first, so the most
        // recent prefetches survive and come out trivially compacted.
        let mut k = self.ring_unused;
        while k > self.ring_last && nfree != 0 {
            k -= 1;
            let pos = self.slot_pos(k);
            if self.ring[pos].status == PrefetchStatus::Unused {
                continue;
            }

            nfree -= 1;
            let mut moved = std::mem::take(&mut self.ring[pos]);
            moved.ring_index = nfree;

            match moved.status {
                PrefetchStatus::Unused => unreachable!(),
                PrefetchStatus::Requested => {
                    n_requests_inflight += 1;
                    ring_receive -= 1;
                    ring_last -= 1;
                }
                PrefetchStatus::Received => {
                    n_responses_buffered += 1;
                    ring_last -= 1;
                }
                PrefetchStatus::TagRemains => {
                    ring_last -= 1;
                }
            }

            let tag = moved.tag.expect("live slot without a tag");
            let previous = new_index.insert(tag, nfree);
            debug_assert!(previous.is_none());
            new_ring[nfree as usize] = moved;
            n_unused -= 1;
        }

        // Discard the remaining old slots, recycling their page buffers.
        while k > self.ring_last {
            k -= 1;
            let pos = self.slot_pos(k);
            if let Some(PageServerResponse::GetPage { page }) = self.ring[pos].response.take() {
                self.pool.release(page);
            }
            self.ring[pos] = PrefetchSlot::default();
        }

        trace!(
            old_capacity = self.capacity,
            new_capacity,
            kept = new_capacity - n_unused,
            "resized prefetch ring"
        );

        self.ring = new_ring;
        self.index = new_index;
        self.capacity = new_capacity;
        self.ring_last = ring_last;
        self.ring_receive = ring_receive;
        self.ring_flush = new_cap;
        self.ring_unused = new_cap;
        self.n_requests_inflight = n_requests_inflight;
        self.n_responses_buffered = n_responses_buffered;
        self.n_unused = n_unused;
        self.pool.set_capacity(new_capacity);
    }

    /// Perform a synchronous round trip outside the ring.
    ///
    /// The connection's FIFO is shared with the pipeline, so every response
    /// still owed to the ring is drained before the answer to `request` is
    /// read. Retries through disconnects until a response arrives.
    pub fn sync_request(&mut self, request: &PageServerRequest) -> PageServerResponse {
        loop {
            loop {
                while !self.client.send(request) {}
                if self.client.flush() {
                    break;
                }
                self.on_disconnect();
            }
            self.ring_flush = self.ring_unused;

            if !self.consume_responses() {
                self.on_disconnect();
                continue;
            }

            match self.client.receive(&mut self.pool) {
                Some(response) => return response,
                None => self.on_disconnect(),
            }
        }
    }

    /// Prefetch effectiveness counters.
    pub fn stats(&self) -> PrefetchStats {
        self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut PrefetchStats {
        &mut self.stats
    }

    /// Ring capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest slot still holding anything.
    pub fn ring_last(&self) -> u64 {
        self.ring_last
    }

    /// Next request whose response is pending.
    pub fn ring_receive(&self) -> u64 {
        self.ring_receive
    }

    /// First request not yet flushed.
    pub fn ring_flush(&self) -> u64 {
        self.ring_flush
    }

    /// First never-used slot.
    pub fn ring_unused(&self) -> u64 {
        self.ring_unused
    }

    /// Number of requests awaiting a response.
    pub fn n_requests_inflight(&self) -> usize {
        self.n_requests_inflight
    }

    /// Number of responses buffered in the ring.
    pub fn n_responses_buffered(&self) -> usize {
        self.n_responses_buffered
    }

    /// The monotone watermark stamped on non-forced requests.
    pub fn prefetch_lsn(&self) -> Lsn {
        self.prefetch_lsn
    }

    /// Assert every structural invariant of the pipeline. Intended for
    /// tests running randomized operation sequences.
    ///
    /// # Panics
    ///
    /// Panics on any violation.
    pub fn check_invariants(&self) {
        assert!(self.ring_last <= self.ring_receive, "ring_last > ring_receive");
        assert!(self.ring_receive <= self.ring_flush, "ring_receive > ring_flush");
        assert!(self.ring_flush <= self.ring_unused, "ring_flush > ring_unused");
        assert!(
            self.ring_unused - self.ring_last <= self.capacity as u64,
            "ring window exceeds capacity"
        );

        let mut requested = 0usize;
        let mut received = 0usize;
        let mut live = 0usize;
        for k in self.ring_last..self.ring_unused {
            let slot = &self.ring[self.slot_pos(k)];
            match slot.status {
                PrefetchStatus::Requested => {
                    requested += 1;
                    assert!(
                        k >= self.ring_receive,
                        "in-flight slot {k} below ring_receive"
                    );
                    assert!(slot.response.is_none());
                }
                PrefetchStatus::Received => {
                    received += 1;
                    assert!(k < self.ring_receive, "received slot {k} above ring_receive");
                    assert!(slot.response.is_some());
                }
                PrefetchStatus::TagRemains => {
                    assert!(k < self.ring_receive, "orphaned slot {k} above ring_receive");
                    assert!(slot.response.is_none());
                }
                PrefetchStatus::Unused => {
                    assert!(k < self.ring_receive, "hole {k} inside the in-flight window");
                    assert!(slot.tag.is_none());
                    assert!(slot.response.is_none());
                }
            }
            if slot.status != PrefetchStatus::Unused {
                live += 1;
                assert_eq!(slot.ring_index, k, "slot at {k} carries wrong ring index");
                let tag = slot.tag.expect("live slot without a tag");
                assert_eq!(
                    self.index.get(&tag),
                    Some(&k),
                    "index does not map {tag} back to its slot"
                );
            }
        }

        assert_eq!(requested, self.n_requests_inflight, "inflight counter drift");
        assert_eq!(received, self.n_responses_buffered, "buffered counter drift");
        assert_eq!(live, self.index.len(), "index has stale entries");
    }
}
