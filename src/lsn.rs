//! Log sequence numbers
//!
//! An [`Lsn`] is a monotonic byte position in the WAL stream. The page server
//! serves every page *as of* an LSN, so LSNs travel on every request and are
//! the currency of the freshness rules in the prefetch pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{
    WAL_SEGMENT_SIZE, XLOG_BLCKSZ, XLOG_LONG_PHD_SIZE, XLOG_SHORT_PHD_SIZE,
};

/// A WAL position, displayed in the conventional `hi/lo` hex form.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The invalid (zero) LSN. On the wire this is the sentinel meaning
    /// "serve the freshest version the server has".
    pub const INVALID: Lsn = Lsn(0);

    /// Whether this LSN is a real WAL position rather than the sentinel.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Back a position off WAL page and segment header boundaries.
    ///
    /// A position that points at the first record of a WAL page or segment
    /// sits right after the page/segment header; the page server would stall
    /// waiting for a record at such a boundary position, so it is returned to
    /// the page/segment origin instead.
    pub fn adjust_to_wal_boundary(self) -> Lsn {
        if self.0 & (XLOG_BLCKSZ - 1) == XLOG_SHORT_PHD_SIZE {
            Lsn(self.0 - XLOG_SHORT_PHD_SIZE)
        } else if self.0 & (WAL_SEGMENT_SIZE - 1) == XLOG_LONG_PHD_SIZE {
            Lsn(self.0 - XLOG_LONG_PHD_SIZE)
        } else {
            self
        }
    }

    /// The larger of two positions.
    pub fn max(self, other: Lsn) -> Lsn {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        assert_eq!(Lsn(0).to_string(), "0/0");
        assert_eq!(Lsn(0x1_2345_6789).to_string(), "1/23456789");
    }

    #[test]
    fn test_adjust_page_boundary() {
        // First record on a WAL page sits right after the short header.
        let lsn = Lsn(3 * XLOG_BLCKSZ + XLOG_SHORT_PHD_SIZE);
        assert_eq!(lsn.adjust_to_wal_boundary(), Lsn(3 * XLOG_BLCKSZ));
    }

    #[test]
    fn test_adjust_segment_boundary() {
        let lsn = Lsn(2 * WAL_SEGMENT_SIZE + XLOG_LONG_PHD_SIZE);
        assert_eq!(lsn.adjust_to_wal_boundary(), Lsn(2 * WAL_SEGMENT_SIZE));
    }

    #[test]
    fn test_adjust_mid_page_is_untouched() {
        let lsn = Lsn(XLOG_BLCKSZ + 100);
        assert_eq!(lsn.adjust_to_wal_boundary(), lsn);
    }

    #[test]
    fn test_validity_and_max() {
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn(1).is_valid());
        assert_eq!(Lsn(5).max(Lsn(9)), Lsn(9));
        assert_eq!(Lsn(9).max(Lsn(5)), Lsn(9));
    }
}
