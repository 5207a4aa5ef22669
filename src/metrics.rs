//! Prefetch effectiveness counters

use serde::Serialize;

/// Counters describing how the prefetch pipeline has been serving reads.
///
/// A read that finds a usable buffered response is a *hit*; a read that has
/// to register a fresh request is a *miss*; a buffered response discarded
/// because its LSN was too old is *expired*; a prefetch that found an
/// equivalent request already in flight is a *duplicate*.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrefetchStats {
    /// Reads served from a buffered or in-flight prefetch
    pub hits: u64,
    /// Reads that had to issue a fresh request
    pub misses: u64,
    /// Buffered responses discarded for LSN staleness
    pub expired: u64,
    /// Prefetch registrations absorbed by an equivalent in-flight request
    pub duplicates: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_start_at_zero() {
        let stats = PrefetchStats::default();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.duplicates, 0);
    }
}
