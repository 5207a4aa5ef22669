//! In-memory collaborators and a mock page server
//!
//! Everything the adaptor consumes from its environment has a small
//! in-memory implementation here, so the crate can be exercised end to end
//! without a database engine or a network. The module is compiled only for
//! this crate's own tests or under the `testing` cargo feature; production
//! consumers never link it. The mock page server speaks the
//! real wire format: requests are encoded on send and decoded on flush,
//! responses are encoded when produced and decoded on receive, so every test
//! that goes through it also exercises the codec.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::{
    EngineHooks, FileCache, LastWrittenLsn, LocalStorage, PageServerApi, ProcessState,
    RelSizeCache, SharedBuffers, WalFacade,
};
use crate::codec::{PageServerRequest, PageServerResponse};
use crate::config::PageStoreConfig;
use crate::constants::BLCKSZ;
use crate::error::Result;
use crate::lsn::Lsn;
use crate::page::{PageBuf, ZERO_PAGE};
use crate::prefetch::PagePool;
use crate::store::PageStore;
use crate::tag::{BufferTag, ForkNumber, RelTag};

/// One logical page server with scripted contents and failure injection.
#[derive(Default)]
struct MockPageServerState {
    pages: HashMap<(RelTag, ForkNumber, u32), Box<PageBuf>>,
    relsizes: HashMap<(RelTag, ForkNumber), u32>,
    db_sizes: HashMap<u32, i64>,
    errors: HashMap<(RelTag, ForkNumber, u32), String>,
    unflushed: VecDeque<Vec<u8>>,
    pending: VecDeque<Vec<u8>>,
    requests: Vec<PageServerRequest>,
    fail_next_flushes: u32,
    fail_next_receives: u32,
}

impl MockPageServerState {
    fn drop_connection(&mut self) {
        self.unflushed.clear();
        self.pending.clear();
    }

    fn answer(&self, request: PageServerRequest) -> PageServerResponse {
        match request {
            PageServerRequest::Exists { rel, fork, .. } => PageServerResponse::Exists {
                exists: self.relsizes.contains_key(&(rel, fork)),
            },
            PageServerRequest::Nblocks { rel, fork, .. } => PageServerResponse::Nblocks {
                n_blocks: self.relsizes.get(&(rel, fork)).copied().unwrap_or(0),
            },
            PageServerRequest::DbSize { db_node, .. } => PageServerResponse::DbSize {
                db_size: self.db_sizes.get(&db_node).copied().unwrap_or(0),
            },
            PageServerRequest::GetPage {
                rel, fork, block, ..
            } => {
                if let Some(message) = self.errors.get(&(rel, fork, block)) {
                    PageServerResponse::Error {
                        message: message.clone(),
                    }
                } else {
                    // Unknown blocks come back as zeros, like a page the WAL
                    // never touched.
                    let page = self
                        .pages
                        .get(&(rel, fork, block))
                        .cloned()
                        .unwrap_or_else(|| Box::new(ZERO_PAGE));
                    PageServerResponse::GetPage { page }
                }
            }
        }
    }
}

/// Clonable handle to a mock page server; clones share state, so one clone
/// can be handed to the adaptor while the test keeps another for scripting
/// and inspection.
#[derive(Clone, Default)]
pub struct MockPageServer {
    state: Arc<Mutex<MockPageServerState>>,
}

impl MockPageServer {
    /// Create an empty mock server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `page` for the given block.
    pub fn put_page(&self, rel: RelTag, fork: ForkNumber, block: u32, page: &PageBuf) {
        self.state
            .lock()
            .pages
            .insert((rel, fork, block), Box::new(*page));
    }

    /// Serve `n_blocks` as the fork's size (also makes the fork exist).
    pub fn set_relsize(&self, rel: RelTag, fork: ForkNumber, n_blocks: u32) {
        self.state.lock().relsizes.insert((rel, fork), n_blocks);
    }

    /// Serve `db_size` for the database.
    pub fn set_db_size(&self, db_node: u32, db_size: i64) {
        self.state.lock().db_sizes.insert(db_node, db_size);
    }

    /// Answer page requests for the given block with an error response.
    pub fn set_error(&self, rel: RelTag, fork: ForkNumber, block: u32, message: &str) {
        self.state
            .lock()
            .errors
            .insert((rel, fork, block), message.to_owned());
    }

    /// Make the next `n` flushes fail, dropping the connection each time.
    pub fn fail_next_flushes(&self, n: u32) {
        self.state.lock().fail_next_flushes = n;
    }

    /// Make the next `n` receives fail, dropping the connection each time.
    pub fn fail_next_receives(&self, n: u32) {
        self.state.lock().fail_next_receives = n;
    }

    /// Every request the adaptor has sent, in order.
    pub fn sent_requests(&self) -> Vec<PageServerRequest> {
        self.state.lock().requests.clone()
    }

    /// How many page requests have been sent.
    pub fn getpage_request_count(&self) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| matches!(r, PageServerRequest::GetPage { .. }))
            .count()
    }
}

impl PageServerApi for MockPageServer {
    fn send(&mut self, request: &PageServerRequest) -> bool {
        let mut state = self.state.lock();
        state.requests.push(*request);
        state.unflushed.push_back(request.encode());
        true
    }

    fn flush(&mut self) -> bool {
        let mut state = self.state.lock();
        if state.fail_next_flushes > 0 {
            state.fail_next_flushes -= 1;
            state.drop_connection();
            return false;
        }
        while let Some(bytes) = state.unflushed.pop_front() {
            let request =
                PageServerRequest::decode(&bytes).expect("adaptor sent a malformed request");
            let response = state.answer(request);
            state.pending.push_back(response.encode());
        }
        true
    }

    fn receive(&mut self, pool: &mut PagePool) -> Option<PageServerResponse> {
        let mut state = self.state.lock();
        if state.fail_next_receives > 0 {
            state.fail_next_receives -= 1;
            state.drop_connection();
            return None;
        }
        let bytes = state.pending.pop_front()?;
        Some(
            PageServerResponse::decode(&bytes, pool).expect("mock server produced malformed bytes"),
        )
    }
}

/// In-memory relation size cache.
#[derive(Default)]
pub struct InMemoryRelSizeCache {
    sizes: Mutex<HashMap<(RelTag, ForkNumber), u32>>,
}

impl InMemoryRelSizeCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RelSizeCache for InMemoryRelSizeCache {
    fn get(&self, rel: &RelTag, fork: ForkNumber) -> Option<u32> {
        self.sizes.lock().get(&(*rel, fork)).copied()
    }

    fn set(&self, rel: &RelTag, fork: ForkNumber, n_blocks: u32) {
        self.sizes.lock().insert((*rel, fork), n_blocks);
    }

    fn update(&self, rel: &RelTag, fork: ForkNumber, n_blocks: u32) {
        let mut sizes = self.sizes.lock();
        let entry = sizes.entry((*rel, fork)).or_insert(n_blocks);
        if *entry < n_blocks {
            *entry = n_blocks;
        }
    }

    fn forget(&self, rel: &RelTag, fork: ForkNumber) {
        self.sizes.lock().remove(&(*rel, fork));
    }
}

/// In-memory last-written-LSN service: per-block entries, per-relation
/// entries, and a conservative fallback for blocks never written.
pub struct InMemoryLastWrittenLsn {
    blocks: Mutex<HashMap<(RelTag, ForkNumber, u32), Lsn>>,
    relations: Mutex<HashMap<(RelTag, ForkNumber), Lsn>>,
    fallback: Lsn,
}

impl InMemoryLastWrittenLsn {
    /// Create the service with `fallback` answered for unknown blocks.
    pub fn new(fallback: Lsn) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            relations: Mutex::new(HashMap::new()),
            fallback,
        }
    }
}

impl LastWrittenLsn for InMemoryLastWrittenLsn {
    fn get(&self, rel: &RelTag, fork: ForkNumber, block: u32) -> Lsn {
        if let Some(lsn) = self.blocks.lock().get(&(*rel, fork, block)) {
            return *lsn;
        }
        if let Some(lsn) = self.relations.lock().get(&(*rel, fork)) {
            return *lsn;
        }
        self.fallback
    }

    fn set_for_block(&self, lsn: Lsn, rel: &RelTag, fork: ForkNumber, block: u32) {
        self.blocks.lock().insert((*rel, fork, block), lsn);
    }

    fn set_for_relation(&self, lsn: Lsn, rel: &RelTag, fork: ForkNumber) {
        self.relations.lock().insert((*rel, fork), lsn);
    }
}

/// In-memory local file cache with call counters.
#[derive(Default)]
pub struct InMemoryFileCache {
    pages: Mutex<HashMap<(RelTag, ForkNumber, u32), Box<PageBuf>>>,
    writes: AtomicU64,
    evictions: AtomicU64,
}

impl InMemoryFileCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages written through so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of evictions so far.
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

impl FileCache for InMemoryFileCache {
    fn read(&self, rel: &RelTag, fork: ForkNumber, block: u32, buf: &mut PageBuf) -> bool {
        match self.pages.lock().get(&(*rel, fork, block)) {
            Some(page) => {
                buf.copy_from_slice(&page[..]);
                true
            }
            None => false,
        }
    }

    fn write(&self, rel: &RelTag, fork: ForkNumber, block: u32, page: &PageBuf) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.pages
            .lock()
            .insert((*rel, fork, block), Box::new(*page));
    }

    fn contains(&self, rel: &RelTag, fork: ForkNumber, block: u32) -> bool {
        self.pages.lock().contains_key(&(*rel, fork, block))
    }

    fn evict(&self, rel: &RelTag, fork: ForkNumber, block: u32) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.pages.lock().remove(&(*rel, fork, block));
    }
}

struct MockWalInner {
    insert_lsn: Lsn,
    flush_lsn: Lsn,
    logged: Vec<(RelTag, ForkNumber, u32, Lsn)>,
}

/// In-memory WAL facade: an insert position that advances on every logged
/// page image, and a flush position that trails it.
pub struct MockWal {
    inner: Mutex<MockWalInner>,
    insert_allowed: AtomicBool,
}

impl MockWal {
    /// Create the facade with both positions at `start`.
    pub fn new(start: Lsn) -> Self {
        Self {
            inner: Mutex::new(MockWalInner {
                insert_lsn: start,
                flush_lsn: start,
                logged: Vec::new(),
            }),
            insert_allowed: AtomicBool::new(true),
        }
    }

    /// Forbid or allow WAL insertion.
    pub fn set_insert_allowed(&self, allowed: bool) {
        self.insert_allowed.store(allowed, Ordering::Relaxed);
    }

    /// Every full-page image logged so far, with its record LSN.
    pub fn logged_pages(&self) -> Vec<(RelTag, ForkNumber, u32, Lsn)> {
        self.inner.lock().logged.clone()
    }
}

impl WalFacade for MockWal {
    fn flush_lsn(&self) -> Lsn {
        self.inner.lock().flush_lsn
    }

    fn insert_lsn(&self) -> Lsn {
        self.inner.lock().insert_lsn
    }

    fn flush(&self, lsn: Lsn) {
        let mut inner = self.inner.lock();
        inner.flush_lsn = inner.flush_lsn.max(lsn);
    }

    fn log_page_image(&self, rel: &RelTag, fork: ForkNumber, block: u32, _page: &PageBuf) -> Lsn {
        let mut inner = self.inner.lock();
        // A full-page-image record is roughly a header plus the page.
        let record_lsn = Lsn(inner.insert_lsn.0 + BLCKSZ as u64 + 64);
        inner.insert_lsn = record_lsn;
        inner.logged.push((*rel, fork, block, record_lsn));
        record_lsn
    }

    fn insert_allowed(&self) -> bool {
        self.insert_allowed.load(Ordering::Relaxed)
    }
}

/// Process facts with settable flags.
#[derive(Default)]
pub struct MockProcessState {
    in_recovery: AtomicBool,
    wal_sender: AtomicBool,
    autovacuum: AtomicBool,
    shutdown: AtomicBool,
    cluster_size: AtomicU64,
}

impl MockProcessState {
    /// Create with every flag off and a zero cluster size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the recovery flag.
    pub fn set_in_recovery(&self, value: bool) {
        self.in_recovery.store(value, Ordering::Relaxed);
    }

    /// Flip the WAL-sender flag.
    pub fn set_wal_sender(&self, value: bool) {
        self.wal_sender.store(value, Ordering::Relaxed);
    }

    /// Flip the autovacuum flag.
    pub fn set_autovacuum_worker(&self, value: bool) {
        self.autovacuum.store(value, Ordering::Relaxed);
    }

    /// Flip the pending-shutdown flag.
    pub fn set_shutdown_requested(&self, value: bool) {
        self.shutdown.store(value, Ordering::Relaxed);
    }

    /// Set the reported cluster size in bytes.
    pub fn set_cluster_size(&self, bytes: u64) {
        self.cluster_size.store(bytes, Ordering::Relaxed);
    }
}

impl ProcessState for MockProcessState {
    fn in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::Relaxed)
    }

    fn is_wal_sender(&self) -> bool {
        self.wal_sender.load(Ordering::Relaxed)
    }

    fn is_autovacuum_worker(&self) -> bool {
        self.autovacuum.load(Ordering::Relaxed)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn current_cluster_size(&self) -> u64 {
        self.cluster_size.load(Ordering::Relaxed)
    }
}

/// Local-disk fallback backed by vectors of pages.
#[derive(Default)]
pub struct InMemoryLocalStorage {
    files: Mutex<HashMap<(RelTag, ForkNumber), Vec<Box<PageBuf>>>>,
}

impl InMemoryLocalStorage {
    /// Create empty local storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(rel: &RelTag, fork: ForkNumber) -> crate::error::PageStoreError {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("relation file {rel}.{fork} does not exist"),
        )
        .into()
    }
}

impl LocalStorage for InMemoryLocalStorage {
    fn exists(&self, rel: &RelTag, fork: ForkNumber) -> bool {
        self.files.lock().contains_key(&(*rel, fork))
    }

    fn create(&self, rel: &RelTag, fork: ForkNumber, is_redo: bool) -> Result<()> {
        let mut files = self.files.lock();
        if files.contains_key(&(*rel, fork)) && !is_redo {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("relation file {rel}.{fork} already exists"),
            )
            .into());
        }
        files.entry((*rel, fork)).or_default();
        Ok(())
    }

    fn extend(
        &self,
        rel: &RelTag,
        fork: ForkNumber,
        block: u32,
        page: &PageBuf,
        _skip_fsync: bool,
    ) -> Result<()> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(&(*rel, fork))
            .ok_or_else(|| Self::not_found(rel, fork))?;
        // Writing beyond EOF fills the gap with zeroes.
        while file.len() <= block as usize {
            file.push(Box::new(ZERO_PAGE));
        }
        file[block as usize] = Box::new(*page);
        Ok(())
    }

    fn read(&self, rel: &RelTag, fork: ForkNumber, block: u32, buf: &mut PageBuf) -> Result<()> {
        let files = self.files.lock();
        let page = files
            .get(&(*rel, fork))
            .and_then(|file| file.get(block as usize))
            .ok_or_else(|| Self::not_found(rel, fork))?;
        buf.copy_from_slice(&page[..]);
        Ok(())
    }

    fn write(
        &self,
        rel: &RelTag,
        fork: ForkNumber,
        block: u32,
        page: &PageBuf,
        _skip_fsync: bool,
    ) -> Result<()> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(&(*rel, fork))
            .ok_or_else(|| Self::not_found(rel, fork))?;
        while file.len() <= block as usize {
            file.push(Box::new(ZERO_PAGE));
        }
        file[block as usize] = Box::new(*page);
        Ok(())
    }

    fn nblocks(&self, rel: &RelTag, fork: ForkNumber) -> Result<u32> {
        let files = self.files.lock();
        let file = files
            .get(&(*rel, fork))
            .ok_or_else(|| Self::not_found(rel, fork))?;
        Ok(file.len() as u32)
    }

    fn truncate(&self, rel: &RelTag, fork: ForkNumber, n_blocks: u32) -> Result<()> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(&(*rel, fork))
            .ok_or_else(|| Self::not_found(rel, fork))?;
        file.truncate(n_blocks as usize);
        Ok(())
    }

    fn immedsync(&self, _rel: &RelTag, _fork: ForkNumber) -> Result<()> {
        Ok(())
    }

    fn unlink(&self, rel: &RelTag, fork: Option<ForkNumber>, is_redo: bool) -> Result<()> {
        let mut files = self.files.lock();
        match fork {
            Some(fork) => {
                if files.remove(&(*rel, fork)).is_none() && !is_redo {
                    return Err(Self::not_found(rel, fork));
                }
            }
            None => {
                for fork in ForkNumber::ALL {
                    files.remove(&(*rel, fork));
                }
            }
        }
        Ok(())
    }

    fn prefetch(&self, rel: &RelTag, fork: ForkNumber, _block: u32) -> bool {
        self.files.lock().contains_key(&(*rel, fork))
    }

    fn writeback(&self, _rel: &RelTag, _fork: ForkNumber, _block: u32, _n_blocks: u32) {}

    fn open(&self, _rel: &RelTag) {}

    fn close(&self, _rel: &RelTag, _fork: ForkNumber) {}
}

/// Shared-buffer residency backed by a set of tags.
#[derive(Default)]
pub struct MockSharedBuffers {
    resident: Mutex<HashSet<BufferTag>>,
    lock_acquisitions: AtomicU64,
}

impl MockSharedBuffers {
    /// Create with no resident blocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a block resident in shared buffers.
    pub fn add_resident(&self, tag: BufferTag) {
        self.resident.lock().insert(tag);
    }

    /// Remove a block from shared buffers.
    pub fn remove_resident(&self, tag: &BufferTag) {
        self.resident.lock().remove(tag);
    }

    /// How many times a partition lock was taken.
    pub fn lock_acquisitions(&self) -> u64 {
        self.lock_acquisitions.load(Ordering::Relaxed)
    }
}

impl SharedBuffers for MockSharedBuffers {
    fn with_partition_shared(&self, tag: &BufferTag, f: &mut dyn FnMut(bool)) {
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
        // Hold the lock for the duration of the callback, like the real
        // partition lock.
        let resident = self.resident.lock();
        f(resident.contains(tag));
    }
}

/// A full test environment: one mock server plus every in-memory
/// collaborator, with the concrete handles kept for scripting and
/// inspection.
pub struct TestEnv {
    /// The mock page server
    pub server: MockPageServer,
    /// Relation size cache
    pub relsize: Arc<InMemoryRelSizeCache>,
    /// Last-written-LSN service
    pub lwlsn: Arc<InMemoryLastWrittenLsn>,
    /// Local file cache
    pub file_cache: Arc<InMemoryFileCache>,
    /// WAL facade
    pub wal: Arc<MockWal>,
    /// Process facts
    pub process: Arc<MockProcessState>,
    /// Local-disk fallback
    pub local: Arc<InMemoryLocalStorage>,
    /// Shared buffer residency
    pub shared_buffers: Arc<MockSharedBuffers>,
}

impl TestEnv {
    /// A fresh environment. The last-written fallback starts at `0/1000`
    /// and the WAL positions at `1/0`.
    pub fn new() -> Self {
        Self {
            server: MockPageServer::new(),
            relsize: Arc::new(InMemoryRelSizeCache::new()),
            lwlsn: Arc::new(InMemoryLastWrittenLsn::new(Lsn(0x1000))),
            file_cache: Arc::new(InMemoryFileCache::new()),
            wal: Arc::new(MockWal::new(Lsn(0x1_0000_0000))),
            process: Arc::new(MockProcessState::new()),
            local: Arc::new(InMemoryLocalStorage::new()),
            shared_buffers: Arc::new(MockSharedBuffers::new()),
        }
    }

    /// The collaborator bundle for [`PageStore::new`].
    pub fn hooks(&self) -> EngineHooks {
        EngineHooks {
            relsize: self.relsize.clone() as Arc<dyn RelSizeCache>,
            lwlsn: self.lwlsn.clone() as Arc<dyn LastWrittenLsn>,
            file_cache: self.file_cache.clone() as Arc<dyn FileCache>,
            wal: self.wal.clone() as Arc<dyn WalFacade>,
            process: self.process.clone() as Arc<dyn ProcessState>,
            local: self.local.clone() as Arc<dyn LocalStorage>,
            shared_buffers: self.shared_buffers.clone() as Arc<dyn SharedBuffers>,
        }
    }

    /// Build a [`PageStore`] over this environment.
    pub fn store(&self, config: PageStoreConfig) -> PageStore {
        PageStore::new(config, Box::new(self.server.clone()), self.hooks())
            .expect("test configuration is valid")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
