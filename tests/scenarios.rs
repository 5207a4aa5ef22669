//! End-to-end scenarios against the mock page server
//!
//! Every test runs a real `PageStore` over the in-memory collaborators from
//! `pagestore::testing`, so requests and responses travel through the actual
//! wire codec and the prefetch ring.

use pagestore::api::{
    LastWrittenLsn, LocalStorage, RelSizeCache, TransactionEvent, WalFacade,
};
use pagestore::codec::PageServerRequest;
use pagestore::config::PageStoreConfig;
use pagestore::lsn::Lsn;
use pagestore::page::{self, ZERO_PAGE};
use pagestore::prefetch::PrefetchStatus;
use pagestore::store::unlogged::UnloggedBuildPhase;
use pagestore::tag::{BufferTag, ForkNumber, Persistence, RelTag, Relation};
use pagestore::testing::TestEnv;
use pagestore::PageStoreError;

fn sample_rel() -> Relation {
    Relation::permanent(RelTag::new(1663, 12345, 16384))
}

fn page_with_lsn(lsn: Lsn) -> pagestore::page::PageBuf {
    let mut buf = ZERO_PAGE;
    page::set_page_lsn(&mut buf, lsn);
    buf
}

#[test]
fn simple_prefetch_then_read() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    let served = page_with_lsn(Lsn(0x4000));
    env.server.put_page(rel.tag, ForkNumber::Main, 42, &served);

    store.prefetch(&rel, ForkNumber::Main, 42).unwrap();
    assert_eq!(env.server.getpage_request_count(), 1);

    let mut buf = ZERO_PAGE;
    store.read(&rel, ForkNumber::Main, 42, &mut buf).unwrap();

    // One request total: the read was served from the prefetched response.
    assert_eq!(env.server.getpage_request_count(), 1);
    assert_eq!(buf[..], served[..]);
    assert_eq!(store.stats().hits, 1);
    assert_eq!(env.file_cache.write_count(), 1);

    // The slot was retired after the copy-out.
    let tag = BufferTag::new(rel.tag, ForkNumber::Main, 42);
    assert!(store.pipeline().lookup(&tag).is_none());
    store.pipeline().check_invariants();
}

#[test]
fn prefetch_collision_on_stale_lsn() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    // Prefetch sees last-written 0/100 for the block.
    env.lwlsn
        .set_for_block(Lsn(0x100), &rel.tag, ForkNumber::Main, 7);
    store.prefetch(&rel, ForkNumber::Main, 7).unwrap();

    // A read demanding 0/200 cannot use the buffered response.
    let mut buf = ZERO_PAGE;
    store
        .read_at_lsn(rel.tag, ForkNumber::Main, 7, Lsn(0x200), true, &mut buf)
        .unwrap();

    let stats = store.stats();
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.misses, 1);

    let requests = env.server.sent_requests();
    let page_requests: Vec<_> = requests
        .iter()
        .filter_map(|r| match r {
            PageServerRequest::GetPage { lsn, latest, .. } => Some((*lsn, *latest)),
            _ => None,
        })
        .collect();
    assert_eq!(page_requests.len(), 2);
    assert!(page_requests[1].0 >= Lsn(0x200));
    assert!(page_requests[1].1);
    store.pipeline().check_invariants();
}

#[test]
fn ring_wrap_force_retires_oldest() {
    let env = TestEnv::new();
    let config = PageStoreConfig::new()
        .with_readahead_buffer_size(5)
        .unwrap()
        .with_flush_every_n_requests(0);
    let mut store = env.store(config);
    let rel = sample_rel();

    for block in 1..=4 {
        store.prefetch(&rel, ForkNumber::Main, block).unwrap();
    }
    assert_eq!(store.pipeline().n_requests_inflight(), 4);

    // The fifth prefetch forces the oldest slot out: flushed, waited,
    // retired.
    store.prefetch(&rel, ForkNumber::Main, 5).unwrap();
    store.pipeline().check_invariants();

    let lookup = |block| store.pipeline().lookup(&BufferTag::new(rel.tag, ForkNumber::Main, block));
    assert!(lookup(1).is_none());
    for block in 2..=5 {
        assert!(lookup(block).is_some(), "block {block} missing from ring");
    }
    assert_eq!(env.server.getpage_request_count(), 5);
}

#[test]
fn disconnect_mid_pipeline() {
    let env = TestEnv::new();
    let config = PageStoreConfig::new().with_flush_every_n_requests(0);
    let mut store = env.store(config);
    let rel = sample_rel();

    for block in 1..=3 {
        store.prefetch(&rel, ForkNumber::Main, block).unwrap();
    }
    store.on_pageserver_disconnect();
    store.pipeline().check_invariants();

    assert_eq!(store.pipeline().n_requests_inflight(), 0);
    assert_eq!(store.pipeline().ring_receive(), store.pipeline().ring_unused());
    for block in 1..=3 {
        let tag = BufferTag::new(rel.tag, ForkNumber::Main, block);
        let ring_index = store.pipeline().lookup(&tag).expect("tag must survive");
        assert_eq!(
            store.pipeline().slot_status(ring_index),
            PrefetchStatus::TagRemains
        );
    }

    // A new prefetch for an orphaned block retires the orphan and issues a
    // fresh request.
    store.prefetch(&rel, ForkNumber::Main, 2).unwrap();
    let tag = BufferTag::new(rel.tag, ForkNumber::Main, 2);
    let ring_index = store.pipeline().lookup(&tag).unwrap();
    assert_eq!(
        store.pipeline().slot_status(ring_index),
        PrefetchStatus::Requested
    );
    assert_eq!(env.server.getpage_request_count(), 4);
    store.pipeline().check_invariants();
}

#[test]
fn fsm_eviction_is_force_logged() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    let buf = page_with_lsn(Lsn(0x3000));
    store
        .write(&rel, ForkNumber::Fsm, 3, &buf, false)
        .unwrap();

    let logged = env.wal.logged_pages();
    assert_eq!(logged.len(), 1);
    let (logged_rel, logged_fork, logged_block, record_lsn) = logged[0];
    assert_eq!(logged_rel, rel.tag);
    assert_eq!(logged_fork, ForkNumber::Fsm);
    assert_eq!(logged_block, 3);

    // The record was flushed and published as the block's last-written LSN.
    assert!(env.wal.flush_lsn() >= record_lsn);
    assert_eq!(env.lwlsn.get(&rel.tag, ForkNumber::Fsm, 3), record_lsn);

    // Nothing was asked of the page server.
    assert!(env.server.sent_requests().is_empty());
}

#[test]
#[should_panic(expected = "evicted with zero LSN")]
fn zero_lsn_dirty_eviction_panics() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    // Initialized, carries data, but has no LSN: an unlogged modification.
    let mut buf = ZERO_PAGE;
    page::init_page(&mut buf);
    buf[100] = 0xAB;

    let _ = store.write(&rel, ForkNumber::Main, 0, &buf, false);
}

#[test]
fn redo_filter_skips_missing_block() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();
    let end_record_lsn = Lsn(0x5_0000_0000);

    env.relsize.set(&rel.tag, ForkNumber::Main, 10);

    let skip = store
        .redo_read_buffer_filter(rel.tag, ForkNumber::Main, 3, end_record_lsn)
        .unwrap();
    assert!(skip);

    // The watermark moved past the record whether or not redo was skipped.
    assert_eq!(env.lwlsn.get(&rel.tag, ForkNumber::Main, 3), end_record_lsn);
    // The stale copy was pushed out of the file cache, under the lock.
    assert_eq!(env.file_cache.eviction_count(), 1);
    assert_eq!(env.shared_buffers.lock_acquisitions(), 1);
}

#[test]
fn redo_filter_applies_to_resident_block() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();
    let end_record_lsn = Lsn(0x5_0000_0000);

    env.relsize.set(&rel.tag, ForkNumber::Main, 10);
    env.shared_buffers
        .add_resident(BufferTag::new(rel.tag, ForkNumber::Main, 3));

    let skip = store
        .redo_read_buffer_filter(rel.tag, ForkNumber::Main, 3, end_record_lsn)
        .unwrap();
    assert!(!skip);

    // The watermark is published regardless of the decision.
    assert_eq!(env.lwlsn.get(&rel.tag, ForkNumber::Main, 3), end_record_lsn);
    assert_eq!(env.file_cache.eviction_count(), 0);
}

#[test]
fn redo_filter_never_skips_shared_catalogs() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let shared_catalog = RelTag::new(1664, 0, 1262);

    let skip = store
        .redo_read_buffer_filter(shared_catalog, ForkNumber::Main, 0, Lsn(0x5_0000_0000))
        .unwrap();
    assert!(!skip);
    assert_eq!(env.shared_buffers.lock_acquisitions(), 0);
}

#[test]
fn redo_filter_seeds_unknown_relation_size() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();
    let end_record_lsn = Lsn(0x5_0000_0000);

    env.server.set_relsize(rel.tag, ForkNumber::Main, 8);

    let skip = store
        .redo_read_buffer_filter(rel.tag, ForkNumber::Main, 3, end_record_lsn)
        .unwrap();
    assert!(skip);
    assert_eq!(env.relsize.get(&rel.tag, ForkNumber::Main), Some(8));
    // The relation-level watermark covers the seeded size.
    assert_eq!(env.lwlsn.get(&rel.tag, ForkNumber::Main, 99), end_record_lsn);
}

#[test]
fn redo_filter_grows_known_relation_size() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    env.relsize.set(&rel.tag, ForkNumber::Main, 4);
    store
        .redo_read_buffer_filter(rel.tag, ForkNumber::Main, 6, Lsn(0x5_0000_0000))
        .unwrap();
    assert_eq!(env.relsize.get(&rel.tag, ForkNumber::Main), Some(7));
}

#[test]
fn exists_answers_from_cache_and_server() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    // Cache hit: no request.
    env.relsize.set(&rel.tag, ForkNumber::Main, 1);
    assert!(store.exists(&rel, ForkNumber::Main).unwrap());
    assert!(env.server.sent_requests().is_empty());

    // Cache miss: round trip.
    let other = Relation::permanent(RelTag::new(1663, 12345, 16500));
    assert!(!store.exists(&other, ForkNumber::Main).unwrap());
    env.server.set_relsize(other.tag, ForkNumber::Main, 3);
    assert!(store.exists(&other, ForkNumber::Main).unwrap());
}

#[test]
fn exists_zero_relation_is_answered_locally() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = Relation::permanent(RelTag::default());

    assert!(!store.exists(&rel, ForkNumber::Main).unwrap());
    assert!(env.server.sent_requests().is_empty());
}

#[test]
fn nblocks_round_trips_once_then_caches() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    env.server.set_relsize(rel.tag, ForkNumber::Main, 7);
    assert_eq!(store.nblocks(&rel, ForkNumber::Main).unwrap(), 7);
    let requests_after_first = env.server.sent_requests().len();

    assert_eq!(store.nblocks(&rel, ForkNumber::Main).unwrap(), 7);
    assert_eq!(env.server.sent_requests().len(), requests_after_first);
}

#[test]
fn extend_logs_gap_blocks() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    env.relsize.set(&rel.tag, ForkNumber::Main, 0);
    store
        .extend(&rel, ForkNumber::Main, 3, &ZERO_PAGE, false)
        .unwrap();

    // Blocks 0..2 were synthesized with forced images; block 3 itself is
    // all-zeros and needs no record.
    let logged = env.wal.logged_pages();
    let blocks: Vec<u32> = logged.iter().map(|(_, _, block, _)| *block).collect();
    assert_eq!(blocks, vec![0, 1, 2]);

    assert_eq!(env.relsize.get(&rel.tag, ForkNumber::Main), Some(4));
    // The all-zeros page still got a valid last-written position.
    assert!(env.lwlsn.get(&rel.tag, ForkNumber::Main, 3).is_valid());
    assert_eq!(env.file_cache.write_count(), 1);
}

#[test]
fn extend_respects_cluster_size_limit() {
    let env = TestEnv::new();
    let config = PageStoreConfig::new().with_max_cluster_size_mb(1);
    let mut store = env.store(config);
    let rel = sample_rel();

    env.relsize.set(&rel.tag, ForkNumber::Main, 0);
    env.process.set_cluster_size(2 * 1024 * 1024);

    let err = store
        .extend(&rel, ForkNumber::Main, 0, &ZERO_PAGE, false)
        .unwrap_err();
    assert!(matches!(
        err,
        PageStoreError::ClusterSizeExceeded { limit_mb: 1 }
    ));

    // Autovacuum is exempt from the limit.
    env.process.set_autovacuum_worker(true);
    store
        .extend(&rel, ForkNumber::Main, 0, &ZERO_PAGE, false)
        .unwrap();
}

#[test]
fn truncate_publishes_relation_watermark() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    env.relsize.set(&rel.tag, ForkNumber::Main, 10);
    store.truncate(&rel, ForkNumber::Main, 4).unwrap();

    assert_eq!(env.relsize.get(&rel.tag, ForkNumber::Main), Some(4));
    // The relation watermark covers the dropped blocks, and it is flushed.
    let watermark = env.lwlsn.get(&rel.tag, ForkNumber::Main, 7);
    assert!(watermark.is_valid());
    assert!(env.wal.flush_lsn() >= watermark);
}

#[test]
fn db_size_round_trip() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());

    env.server.set_db_size(12345, 987_654_321);
    assert_eq!(store.db_size(12345).unwrap(), 987_654_321);
}

#[test]
fn page_server_error_carries_context() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    env.server
        .set_error(rel.tag, ForkNumber::Main, 9, "tenant is gone");

    let mut buf = ZERO_PAGE;
    let err = store.read(&rel, ForkNumber::Main, 9, &mut buf).unwrap_err();
    let text = err.to_string();
    assert!(text.contains("block 9"), "got: {text}");
    assert!(text.contains("tenant is gone"), "got: {text}");

    // The failed read still left the pipeline coherent.
    store.pipeline().check_invariants();
    let tag = BufferTag::new(rel.tag, ForkNumber::Main, 9);
    assert!(store.pipeline().lookup(&tag).is_none());
}

#[test]
fn read_retries_through_transport_failure() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    let served = page_with_lsn(Lsn(0x7000));
    env.server.put_page(rel.tag, ForkNumber::Main, 1, &served);
    env.server.fail_next_receives(1);

    let mut buf = ZERO_PAGE;
    store.read(&rel, ForkNumber::Main, 1, &mut buf).unwrap();
    assert_eq!(buf[..], served[..]);

    // The first request was lost with the connection; a second one made it.
    assert_eq!(env.server.getpage_request_count(), 2);
    store.pipeline().check_invariants();
}

#[test]
fn temp_relations_stay_local() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = Relation::new(RelTag::new(1663, 12345, 17000), Persistence::Temp);

    store.create(&rel, ForkNumber::Main, false).unwrap();
    let buf = page_with_lsn(Lsn(0x100));
    store.extend(&rel, ForkNumber::Main, 0, &buf, false).unwrap();
    assert_eq!(store.nblocks(&rel, ForkNumber::Main).unwrap(), 1);

    let mut out = ZERO_PAGE;
    store.read(&rel, ForkNumber::Main, 0, &mut out).unwrap();
    assert_eq!(out[..], buf[..]);

    // The page server never heard about any of it.
    assert!(env.server.sent_requests().is_empty());
}

#[test]
fn unknown_persistence_write_probes_local_disk() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let tag = RelTag::new(1663, 12345, 17001);

    // Local file exists: treated as unlogged, written locally.
    env.local
        .create(&tag, ForkNumber::Main, false)
        .unwrap();
    let unresolved = Relation::unresolved(tag);
    let buf = page_with_lsn(Lsn(0x2000));
    store
        .write(&unresolved, ForkNumber::Main, 0, &buf, false)
        .unwrap();
    let mut out = ZERO_PAGE;
    env.local.read(&tag, ForkNumber::Main, 0, &mut out).unwrap();
    assert_eq!(out[..], buf[..]);

    // No local file: assumed permanent, the write only records the LSN.
    let remote_tag = RelTag::new(1663, 12345, 17002);
    let remote = Relation::unresolved(remote_tag);
    store
        .write(&remote, ForkNumber::Main, 5, &buf, false)
        .unwrap();
    assert_eq!(env.lwlsn.get(&remote_tag, ForkNumber::Main, 5), Lsn(0x2000));

    // Reads are not permitted while persistence is unresolved.
    let err = store
        .read(&unresolved, ForkNumber::Main, 0, &mut out)
        .unwrap_err();
    assert!(matches!(err, PageStoreError::UnsupportedOperation { .. }));
}

#[test]
fn unlogged_build_lifecycle() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let mut rel = sample_rel();

    env.relsize.set(&rel.tag, ForkNumber::Main, 0);

    store.start_unlogged_build(&mut rel).unwrap();
    assert_eq!(store.unlogged_build_phase(), UnloggedBuildPhase::Phase1);
    assert_eq!(rel.persistence, Persistence::Unlogged);
    assert!(env.local.exists(&rel.tag, ForkNumber::Main));

    // Phase-1 writes land on local disk.
    let buf = page_with_lsn(Lsn(0x100));
    store.extend(&rel, ForkNumber::Main, 0, &buf, false).unwrap();
    assert!(env.server.sent_requests().is_empty());

    store.finish_unlogged_build_phase_1(&rel).unwrap();
    assert_eq!(store.unlogged_build_phase(), UnloggedBuildPhase::Phase2);

    store.end_unlogged_build(&mut rel).unwrap();
    assert_eq!(store.unlogged_build_phase(), UnloggedBuildPhase::NotInProgress);
    assert_eq!(rel.persistence, Persistence::Permanent);
    // Local copy dropped, relsize forgotten.
    assert!(!env.local.exists(&rel.tag, ForkNumber::Main));
    assert_eq!(env.relsize.get(&rel.tag, ForkNumber::Main), None);
}

#[test]
fn unlogged_build_on_temp_relation_is_a_noop() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let mut rel = Relation::new(RelTag::new(1663, 12345, 17003), Persistence::Temp);

    store.start_unlogged_build(&mut rel).unwrap();
    assert_eq!(store.unlogged_build_phase(), UnloggedBuildPhase::NotPermanent);
    assert_eq!(rel.persistence, Persistence::Temp);

    store.finish_unlogged_build_phase_1(&rel).unwrap();
    store.end_unlogged_build(&mut rel).unwrap();
    assert_eq!(store.unlogged_build_phase(), UnloggedBuildPhase::NotInProgress);
}

#[test]
fn unlogged_build_transaction_hooks() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let mut rel = sample_rel();

    env.relsize.set(&rel.tag, ForkNumber::Main, 0);
    store.start_unlogged_build(&mut rel).unwrap();

    // Abort resets unconditionally.
    store.at_transaction_end(TransactionEvent::Abort).unwrap();
    assert_eq!(store.unlogged_build_phase(), UnloggedBuildPhase::NotInProgress);

    // Commit with a live build is an internal error and also resets.
    let mut rel2 = Relation::permanent(RelTag::new(1663, 12345, 17004));
    env.relsize.set(&rel2.tag, ForkNumber::Main, 0);
    store.start_unlogged_build(&mut rel2).unwrap();
    let err = store
        .at_transaction_end(TransactionEvent::Commit)
        .unwrap_err();
    assert!(matches!(err, PageStoreError::Internal { .. }));
    assert_eq!(store.unlogged_build_phase(), UnloggedBuildPhase::NotInProgress);

    // A clean commit is fine.
    store.at_transaction_end(TransactionEvent::Commit).unwrap();
}

#[test]
fn only_one_unlogged_build_at_a_time() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let mut rel = sample_rel();
    let mut other = Relation::permanent(RelTag::new(1663, 12345, 17005));

    env.relsize.set(&rel.tag, ForkNumber::Main, 0);
    store.start_unlogged_build(&mut rel).unwrap();
    let err = store.start_unlogged_build(&mut other).unwrap_err();
    assert!(matches!(err, PageStoreError::Internal { .. }));
}

#[test]
fn runtime_ring_resize() {
    let env = TestEnv::new();
    let config = PageStoreConfig::new().with_flush_every_n_requests(0);
    let mut store = env.store(config);
    let rel = sample_rel();

    for block in 0..6 {
        store.prefetch(&rel, ForkNumber::Main, block).unwrap();
    }
    store.resize_readahead_buffer(4).unwrap();
    store.pipeline().check_invariants();
    assert_eq!(store.pipeline().capacity(), 4);
    assert_eq!(store.config().readahead_buffer_size, 4);

    // Reads still work after the resize.
    let mut buf = ZERO_PAGE;
    store.read(&rel, ForkNumber::Main, 0, &mut buf).unwrap();
    store.pipeline().check_invariants();

    assert!(store.resize_readahead_buffer(0).is_err());
}

#[test]
fn wal_sender_requests_server_side_latest() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    env.process.set_wal_sender(true);
    let mut buf = ZERO_PAGE;
    store.read(&rel, ForkNumber::Main, 0, &mut buf).unwrap();

    let requests = env.server.sent_requests();
    match requests[0] {
        PageServerRequest::GetPage { lsn, latest, .. } => {
            assert_eq!(lsn, Lsn::INVALID);
            assert!(latest);
        }
        ref other => panic!("unexpected request {other}"),
    }
}

#[test]
fn unlink_forgets_cached_sizes() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    env.relsize.set(&rel.tag, ForkNumber::Main, 5);
    env.relsize.set(&rel.tag, ForkNumber::Fsm, 1);

    store.unlink(&rel, None, false);
    assert_eq!(env.relsize.get(&rel.tag, ForkNumber::Main), None);
    assert_eq!(env.relsize.get(&rel.tag, ForkNumber::Fsm), None);
}

#[test]
fn shutdown_short_circuits_eviction_logging() {
    let env = TestEnv::new();
    let mut store = env.store(PageStoreConfig::default());
    let rel = sample_rel();

    env.process.set_shutdown_requested(true);
    let buf = page_with_lsn(Lsn(0x3000));
    store.write(&rel, ForkNumber::Fsm, 0, &buf, false).unwrap();

    assert!(env.wal.logged_pages().is_empty());
    // The watermark was not touched either; logging was skipped entirely.
    assert_eq!(env.lwlsn.get(&rel.tag, ForkNumber::Fsm, 0), Lsn(0x1000));
}
