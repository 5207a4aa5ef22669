//! pagestore - client-side storage adaptor for an LSN-versioned page server
//!
//! This crate lets a relational database engine treat a remote page server
//! as if it were local block storage. Block-level reads, writes, extends and
//! truncates are translated into requests keyed by
//! `(relation, fork, block, LSN)` against a page server that can materialize
//! any page at any WAL position, while the engine's expectations about
//! durability, read-your-writes and crash recovery are preserved.
//!
//! ## Key pieces
//!
//! - **Prefetch pipeline**: a per-backend ring of in-flight page requests
//!   matched to later reads by block identity, with strict LSN-freshness
//!   rules deciding when a buffered response may be reused
//! - **Request-LSN selection**: picks the WAL position stamped onto every
//!   outgoing request
//! - **Eviction WAL-logger**: forces full-page images for never-logged forks
//!   when their pages leave the buffer cache
//! - **Redo filter**: lets WAL replay skip blocks that are not resident,
//!   while keeping last-written-LSN bookkeeping coherent
//! - **Unlogged-build controller**: the state machine behind two-phase index
//!   builds
//!
//! The transport, caches and WAL machinery are consumed through the traits
//! in [`api`]; in-memory implementations for all of them live in the
//! `testing` module, behind the `testing` cargo feature.

pub mod api;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod lsn;
pub mod metrics;
pub mod page;
pub mod prefetch;
pub mod store;
pub mod tag;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export main components
pub use api::{EngineHooks, PageServerApi, TransactionEvent};
pub use codec::{PageServerRequest, PageServerResponse};
pub use config::PageStoreConfig;
pub use error::{PageStoreError, Result};
pub use lsn::Lsn;
pub use metrics::PrefetchStats;
pub use page::PageBuf;
pub use prefetch::{PagePool, PrefetchPipeline, PrefetchStatus};
pub use store::unlogged::UnloggedBuildPhase;
pub use store::PageStore;
pub use tag::{BufferTag, ForkNumber, Persistence, RelTag, Relation};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;

    #[test]
    fn test_store_creation() {
        let env = TestEnv::new();
        let store = env.store(PageStoreConfig::default());
        assert_eq!(store.config().readahead_buffer_size, 128);
        store.pipeline().check_invariants();
    }

    #[test]
    fn test_prefetch_then_read() {
        let env = TestEnv::new();
        let mut store = env.store(PageStoreConfig::default());
        let rel = Relation::permanent(RelTag::new(1663, 12345, 16384));

        let mut page = page::ZERO_PAGE;
        page::set_page_lsn(&mut page, Lsn(0x2000));
        env.server.put_page(rel.tag, ForkNumber::Main, 0, &page);

        store.prefetch(&rel, ForkNumber::Main, 0).unwrap();
        let mut buf = page::ZERO_PAGE;
        store.read(&rel, ForkNumber::Main, 0, &mut buf).unwrap();
        assert_eq!(page::page_lsn(&buf), Lsn(0x2000));
        assert_eq!(store.stats().hits, 1);
    }

    #[test]
    fn test_config_rejects_zero_ring() {
        assert!(PageStoreConfig::new().with_readahead_buffer_size(0).is_err());
    }
}
