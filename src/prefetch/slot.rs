//! Prefetch request slots

use crate::codec::PageServerResponse;
use crate::lsn::Lsn;
use crate::tag::BufferTag;

/// Lifecycle state of a ring slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchStatus {
    /// Slot holds nothing
    #[default]
    Unused,
    /// Request written to the connection's send buffer, response pending.
    /// The request is not necessarily flushed yet.
    Requested,
    /// Response received and buffered in the slot
    Received,
    /// The connection dropped while the request was in flight; the tag is
    /// kept registered for duplicate suppression until the slot is retired
    TagRemains,
}

/// One entry of the prefetch ring.
///
/// A slot is created by registering a block, observed through the tag index,
/// and retired by `set_unused`, which clears every field. The slot's ring
/// index is stable for the whole of its lifetime.
#[derive(Debug, Default)]
pub struct PrefetchSlot {
    /// Identity of the requested block; `None` exactly when the slot is
    /// unused
    pub(crate) tag: Option<BufferTag>,
    /// Lifecycle state
    pub(crate) status: PrefetchStatus,
    /// The LSN actually stamped onto the outgoing request. May exceed the
    /// LSN the caller asked for; see the request-issue path.
    pub(crate) effective_request_lsn: Lsn,
    /// The response, owned by the slot while `status` is `Received`
    pub(crate) response: Option<PageServerResponse>,
    /// This slot's monotonic ring position
    pub(crate) ring_index: u64,
}

impl PrefetchSlot {
    /// Lifecycle state of the slot.
    pub fn status(&self) -> PrefetchStatus {
        self.status
    }

    /// The block this slot concerns, if any.
    pub fn tag(&self) -> Option<BufferTag> {
        self.tag
    }

    /// The LSN the outgoing request was stamped with.
    pub fn effective_request_lsn(&self) -> Lsn {
        self.effective_request_lsn
    }
}
