//! Per-backend prefetch pipeline
//!
//! Reads against the page server are pipelined: each backend keeps a bounded
//! ring of in-flight page requests, indexed by block identity, and matches
//! responses (which arrive in request order over the single connection) to
//! later reads. A buffered response is only ever reused when its request LSN
//! still satisfies the caller's freshness requirement; stale entries are
//! discarded and re-requested.
//!
//! ## Architecture
//!
//! The pipeline consists of:
//! - A fixed-capacity ring of request slots addressed by monotonic counters
//! - A hash index from block identity to ring position
//! - A fixed-capacity pool recycling page-sized response buffers
//! - The owned page server connection
//!
//! Slot state machine:
//!
//! ```text
//!          not in index : in index
//!                       :
//!  Unused ----------------> Requested ----> Received
//!    ^                  :       |               |
//!    |                  :       v               |
//!    |                  :  TagRemains           |
//!    |                  :       |               |
//!    +------------------+-------+---------------+
//! ```
//!
//! Only a backend's own thread touches its pipeline; there is no
//! cross-backend sharing of the ring, the index, or the connection.

pub mod pipeline;
pub mod pool;
pub mod slot;

pub use pipeline::{PrefetchPipeline, RequestLsnSource};
pub use pool::PagePool;
pub use slot::{PrefetchSlot, PrefetchStatus};
