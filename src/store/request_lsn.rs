//! Request-LSN selection
//!
//! Every request carries the WAL position the answer must reflect. Too old
//! and the server hands back a stale page; too new and the server stalls
//! waiting for WAL it has not received. The safe position is the block's
//! last-written LSN: anything the WAL touched after that is still pinned in
//! the buffer cache, so no request can concern it.

use tracing::debug;

use crate::api::{LastWrittenLsn, ProcessState, WalFacade};
use crate::lsn::Lsn;
use crate::prefetch::RequestLsnSource;
use crate::tag::{BufferTag, ForkNumber, RelTag};

/// Picks the `(lsn, latest)` pair for outgoing requests.
pub(crate) struct RequestLsnOracle<'a> {
    pub lwlsn: &'a dyn LastWrittenLsn,
    pub wal: &'a dyn WalFacade,
    pub process: &'a dyn ProcessState,
}

impl RequestLsnOracle<'_> {
    /// Pick the LSN to stamp on a request for `(rel, fork, block)`.
    pub fn request_lsn(&self, rel: &RelTag, fork: ForkNumber, block: u32) -> (Lsn, bool) {
        if self.process.in_recovery() {
            // WAL may exist that is not replayed yet, so don't claim this is
            // the latest version.
            let lsn = self
                .lwlsn
                .get(rel, fork, block)
                .adjust_to_wal_boundary();
            debug!(%rel, %fork, block, %lsn, "request lsn during recovery");
            (lsn, false)
        } else if self.process.is_wal_sender() {
            // Zero is the wire sentinel for the freshest version the server
            // has.
            debug!("wal sender requests server-side latest");
            (Lsn::INVALID, true)
        } else {
            let lsn = self.lwlsn.get(rel, fork, block);
            debug_assert!(lsn.is_valid());
            let lsn = lsn.adjust_to_wal_boundary();

            // Last-written is normally behind the flush pointer ("WAL before
            // data"), except when an index build logs full pages and only
            // fsyncs at the end. Force the flush so the server can ever
            // reach the requested position.
            let flush_lsn = self.wal.flush_lsn();
            if lsn > flush_lsn {
                debug!(%lsn, %flush_lsn, "last-written LSN is ahead of last flushed LSN");
                self.wal.flush(lsn);
            }
            (lsn, true)
        }
    }
}

impl RequestLsnSource for RequestLsnOracle<'_> {
    fn lsn_for(&self, tag: &BufferTag) -> (Lsn, bool) {
        self.request_lsn(&tag.rel, tag.fork, tag.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryLastWrittenLsn, MockProcessState, MockWal};

    fn rel() -> RelTag {
        RelTag::new(1663, 5, 16384)
    }

    #[test]
    fn test_normal_backend_uses_last_written_lsn() {
        let lwlsn = InMemoryLastWrittenLsn::new(Lsn(0x5000));
        let wal = MockWal::new(Lsn(0x8000));
        let process = MockProcessState::default();
        lwlsn.set_for_block(Lsn(0x6000), &rel(), ForkNumber::Main, 3);

        let oracle = RequestLsnOracle {
            lwlsn: &lwlsn,
            wal: &wal,
            process: &process,
        };
        let (lsn, latest) = oracle.request_lsn(&rel(), ForkNumber::Main, 3);
        assert_eq!(lsn, Lsn(0x6000));
        assert!(latest);
    }

    #[test]
    fn test_recovery_is_never_latest() {
        let lwlsn = InMemoryLastWrittenLsn::new(Lsn(0x5000));
        let wal = MockWal::new(Lsn(0x8000));
        let process = MockProcessState::default();
        process.set_in_recovery(true);

        let oracle = RequestLsnOracle {
            lwlsn: &lwlsn,
            wal: &wal,
            process: &process,
        };
        let (lsn, latest) = oracle.request_lsn(&rel(), ForkNumber::Main, 0);
        assert_eq!(lsn, Lsn(0x5000));
        assert!(!latest);
    }

    #[test]
    fn test_wal_sender_requests_server_side_latest() {
        let lwlsn = InMemoryLastWrittenLsn::new(Lsn(0x5000));
        let wal = MockWal::new(Lsn(0x8000));
        let process = MockProcessState::default();
        process.set_wal_sender(true);

        let oracle = RequestLsnOracle {
            lwlsn: &lwlsn,
            wal: &wal,
            process: &process,
        };
        let (lsn, latest) = oracle.request_lsn(&rel(), ForkNumber::Main, 0);
        assert_eq!(lsn, Lsn::INVALID);
        assert!(latest);
    }

    #[test]
    fn test_unflushed_position_forces_wal_flush() {
        let lwlsn = InMemoryLastWrittenLsn::new(Lsn(0x5000));
        let wal = MockWal::new(Lsn(0x1000));
        let process = MockProcessState::default();
        lwlsn.set_for_block(Lsn(0x9000), &rel(), ForkNumber::Main, 1);

        let oracle = RequestLsnOracle {
            lwlsn: &lwlsn,
            wal: &wal,
            process: &process,
        };
        let (lsn, _) = oracle.request_lsn(&rel(), ForkNumber::Main, 1);
        assert_eq!(lsn, Lsn(0x9000));
        assert!(wal.flush_lsn() >= Lsn(0x9000));
    }

    #[test]
    fn test_boundary_positions_are_adjusted() {
        use crate::constants::{XLOG_BLCKSZ, XLOG_SHORT_PHD_SIZE};

        let lwlsn = InMemoryLastWrittenLsn::new(Lsn(0x5000));
        let wal = MockWal::new(Lsn(0x10_0000));
        let process = MockProcessState::default();
        lwlsn.set_for_block(
            Lsn(4 * XLOG_BLCKSZ + XLOG_SHORT_PHD_SIZE),
            &rel(),
            ForkNumber::Main,
            8,
        );

        let oracle = RequestLsnOracle {
            lwlsn: &lwlsn,
            wal: &wal,
            process: &process,
        };
        let (lsn, _) = oracle.request_lsn(&rel(), ForkNumber::Main, 8);
        assert_eq!(lsn, Lsn(4 * XLOG_BLCKSZ));
    }
}
