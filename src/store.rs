//! The store handle and its transactions.
//!
//! A [`Store`] is a cheaply clonable handle over one store file and its WAL
//! sidecar. All access goes through transactions: [`ReadTransaction`] pins
//! the committed tree at begin time, [`WriteTransaction`] buffers a new tree
//! in the page cache and publishes it atomically at commit.

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::btree::iterator::RangeScan;
use crate::btree::node::{Node, NodeLimits};
use crate::btree::{TreeReader, TreeState, TreeWriter};
use crate::storage::buffer::PageCache;
use crate::storage::disk::PageManager;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::meta::{read_page_size, FreeEntry, Meta};
use crate::storage::page::{valid_page_size, PageId, DEFAULT_PAGE_SIZE};
use crate::storage::wal::{Lsn, WalManager, WalRecord};
use crate::transaction::{TransactionManager, TransactionState};

/// When commits become durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Every commit fsyncs the WAL before returning.
    Sync,
    /// Commits return once the WAL write is buffered; durability arrives
    /// with the next sync or checkpoint. A crash may lose recent commits
    /// but never corrupts the store.
    Batched,
}

/// How [`Store::open`] treats the file at the given path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing store; fail if it does not exist. No writes allowed.
    ReadOnly,
    /// Open an existing store for reading and writing.
    ReadWrite,
    /// Like `ReadWrite`, but create an empty store if none exists.
    CreateIfMissing,
}

/// Store configuration.
///
/// `page_size` and `branch_factor` only take effect when a store is created;
/// an existing store keeps the geometry in its metadata page.
#[derive(Debug, Clone)]
pub struct Options {
    pub mode: OpenMode,
    pub page_size: usize,
    /// Page cache capacity, in pages.
    pub cache_pages: usize,
    /// Maximum entries per B-tree node.
    pub branch_factor: usize,
    pub durability: Durability,
    /// WAL size that triggers an automatic checkpoint after commit.
    pub checkpoint_wal_bytes: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: OpenMode::CreateIfMissing,
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            branch_factor: 128,
            durability: Durability::Sync,
            checkpoint_wal_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Options {
    fn validate(&self) -> StoreResult<()> {
        if !valid_page_size(self.page_size) {
            return Err(StoreError::InvalidState(
                "page size must be a power of two between 512 bytes and 1 MiB",
            ));
        }
        if self.branch_factor < 4 {
            return Err(StoreError::InvalidState("branch factor must be at least 4"));
        }
        if self.cache_pages < 2 {
            return Err(StoreError::InvalidState("cache needs at least two pages"));
        }
        Ok(())
    }
}

struct StoreInner {
    cache: PageCache,
    /// Absent in read-only mode.
    wal: Mutex<Option<WalManager>>,
    meta: RwLock<Meta>,
    txns: TransactionManager,
    limits: NodeLimits,
    checkpoint_wal_bytes: u64,
    read_only: bool,
    closed: AtomicBool,
}

impl StoreInner {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::InvalidState("store is closed"));
        }
        Ok(())
    }

    /// Flushes committed pages to the main file and truncates the WAL.
    fn checkpoint_with(&self, wal: &mut WalManager) -> StoreResult<()> {
        self.cache.flush()?;
        wal.truncate()?;
        debug!("checkpoint complete");
        Ok(())
    }
}

/// Handle to an open store. Clones share the same underlying store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens a store file, running WAL recovery first if the last process
    /// did not shut down cleanly.
    pub fn open(path: impl AsRef<Path>, options: Options) -> StoreResult<Store> {
        options.validate()?;
        let path = path.as_ref();
        let wal_path = wal_path_for(path);
        let read_only = options.mode == OpenMode::ReadOnly;

        let create = options.mode == OpenMode::CreateIfMissing && !path.exists();
        let (disk, recovered) = if create {
            let disk = create_store_file(path, options.page_size, options.branch_factor as u32)?;
            (disk, None)
        } else {
            let page_size = read_page_size(path)?;
            let mut disk = PageManager::open(path, page_size, read_only)?;

            if read_only {
                // Recovery rewrites the main file, which a read-only open
                // must not do. A non-empty log means there is pending state.
                let wal_len = std::fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);
                if wal_len > 0 {
                    return Err(StoreError::InvalidState(
                        "store has unrecovered WAL data; open it read-write first",
                    ));
                }
                (disk, None)
            } else {
                let mut wal = WalManager::open(&wal_path, true)?;
                let recovered = wal.recover(&mut disk)?;
                (disk, recovered)
            }
        };

        let wal = if read_only {
            None
        } else {
            Some(WalManager::open(
                &wal_path,
                options.durability == Durability::Sync,
            )?)
        };

        let page_size = disk.page_size();
        let cache = PageCache::new(disk, options.cache_pages);
        let meta_image = cache.fetch(PageId::META)?;
        let meta = Meta::decode(&meta_image)?;

        if let Some(seq) = recovered {
            if meta.commit_seq != seq {
                return Err(StoreError::Recovery(format!(
                    "metadata at commit {} after replaying through commit {seq}",
                    meta.commit_seq
                )));
            }
        }
        info!(
            "opened store at commit {} with root {}",
            meta.commit_seq, meta.root
        );
        // Geometry comes from the store itself; the options only apply at
        // creation.
        let limits = NodeLimits::new(page_size, meta.branch_factor as usize);

        Ok(Store {
            inner: Arc::new(StoreInner {
                cache,
                wal: Mutex::new(wal),
                meta: RwLock::new(meta),
                txns: TransactionManager::new(),
                limits,
                checkpoint_wal_bytes: options.checkpoint_wal_bytes,
                read_only,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Begins a read transaction pinned to the current committed state.
    pub fn begin_read(&self) -> StoreResult<ReadTransaction> {
        self.inner.ensure_open()?;
        // Registration happens under the meta lock: a commit replaces meta
        // through the write half, so no writer can free pages of this root
        // between the snapshot and the reader becoming visible to
        // oldest_active_reader.
        let meta = self.inner.meta.read();
        let root = meta.root;
        let commit_seq = meta.commit_seq;
        self.inner.txns.begin_read(commit_seq);
        drop(meta);
        Ok(ReadTransaction {
            inner: Arc::clone(&self.inner),
            root,
            commit_seq,
            done: false,
        })
    }

    /// Begins the write transaction, or fails with a retryable
    /// [`StoreError::Busy`] if one is already active.
    pub fn begin_write(&self) -> StoreResult<WriteTransaction> {
        self.inner.ensure_open()?;
        if self.inner.read_only {
            return Err(StoreError::InvalidState("store is open read-only"));
        }
        let txn_id = self.inner.txns.try_begin_write()?;

        let meta = self.inner.meta.read().clone();

        // Freed pages may be recycled once every active reader's snapshot
        // postdates the commit that freed them.
        let horizon = self
            .inner
            .txns
            .oldest_active_reader()
            .unwrap_or(meta.commit_seq);
        let (pool, pending): (Vec<FreeEntry>, Vec<FreeEntry>) = meta
            .freelist
            .iter()
            .copied()
            .partition(|e| e.freed_seq <= horizon);

        Ok(WriteTransaction {
            inner: Arc::clone(&self.inner),
            txn_id,
            base: meta.clone(),
            tree: TreeState::new(meta.root, pool, meta.page_count),
            pending,
            state: TransactionState::WriterActive,
        })
    }

    /// Flushes all committed pages to the main file and truncates the WAL.
    /// A checkpointed store opens without any recovery work.
    pub fn checkpoint(&self) -> StoreResult<()> {
        self.inner.ensure_open()?;
        let mut wal = self.inner.wal.lock();
        match wal.as_mut() {
            Some(wal) => self.inner.checkpoint_with(wal),
            None => Ok(()),
        }
    }

    /// Checkpoints and marks the handle family closed. Fails with
    /// [`StoreError::Busy`] while a write transaction is active, and with
    /// [`StoreError::InvalidState`] if already closed.
    pub fn close(&self) -> StoreResult<()> {
        self.inner.ensure_open()?;
        if self.inner.txns.writer_active() {
            return Err(StoreError::Busy("a write transaction is still active"));
        }
        self.checkpoint()?;
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Levels on a root-to-leaf path of the committed tree.
    pub fn tree_height(&self) -> StoreResult<u32> {
        self.inner.ensure_open()?;
        let root = self.inner.meta.read().root;
        TreeReader {
            cache: &self.inner.cache,
            root,
        }
        .height()
    }

    /// Commit sequence of the latest committed state.
    pub fn commit_seq(&self) -> u64 {
        self.inner.meta.read().commit_seq
    }
}

/// A snapshot-isolated reader. The view never changes, no matter what
/// commits after [`Store::begin_read`] returned.
pub struct ReadTransaction {
    inner: Arc<StoreInner>,
    root: PageId,
    commit_seq: u64,
    done: bool,
}

impl ReadTransaction {
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        TreeReader {
            cache: &self.inner.cache,
            root: self.root,
        }
        .get(key)
    }

    /// Ascending scan over `[start, end)` bounds of this snapshot.
    pub fn range(&self, start: Bound<&[u8]>, end: Bound<&[u8]>) -> RangeScan<'_> {
        RangeScan::new(&self.inner.cache, self.root, start, end)
    }

    pub fn state(&self) -> TransactionState {
        if self.done {
            TransactionState::Idle
        } else {
            TransactionState::ReaderActive
        }
    }

    /// Releases the snapshot early; dropping the handle does the same.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.done {
            self.done = true;
            self.inner.txns.end_read(self.commit_seq);
        }
    }
}

impl Drop for ReadTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

/// The single write transaction.
///
/// Mutations build a new tree out of fresh pages in the cache; nothing is
/// visible to readers, or durable, until [`commit`](Self::commit). Dropping
/// an uncommitted writer rolls it back.
pub struct WriteTransaction {
    inner: Arc<StoreInner>,
    txn_id: u64,
    base: Meta,
    tree: TreeState,
    /// Freelist entries still gated by an active reader snapshot.
    pending: Vec<FreeEntry>,
    state: TransactionState,
}

impl WriteTransaction {
    fn ensure_active(&self) -> StoreResult<()> {
        if self.state != TransactionState::WriterActive {
            return Err(StoreError::InvalidState("write transaction is finished"));
        }
        Ok(())
    }

    /// Reads through this transaction's own uncommitted state.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.ensure_active()?;
        self.writer_view().get(key)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.ensure_active()?;
        let mut writer = TreeWriter {
            cache: &self.inner.cache,
            state: &mut self.tree,
            limits: self.inner.limits,
        };
        writer.put(key, value)
    }

    /// Removes a key; returns false if it was not present.
    pub fn delete(&mut self, key: &[u8]) -> StoreResult<bool> {
        self.ensure_active()?;
        let mut writer = TreeWriter {
            cache: &self.inner.cache,
            state: &mut self.tree,
            limits: self.inner.limits,
        };
        writer.delete(key)
    }

    /// Ascending scan including this transaction's uncommitted writes.
    pub fn range(&self, start: Bound<&[u8]>, end: Bound<&[u8]>) -> StoreResult<RangeScan<'_>> {
        self.ensure_active()?;
        Ok(RangeScan::new(
            &self.inner.cache,
            self.tree.root,
            start,
            end,
        ))
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Publishes this transaction's tree as the new committed state.
    ///
    /// The WAL batch (page images, metadata image, commit marker) is written
    /// first; once it is down, the new root is published to readers and the
    /// commit is final. A failure before that point rolls the transaction
    /// back and nothing is visible.
    pub fn commit(mut self) -> StoreResult<()> {
        self.ensure_active()?;
        self.state = TransactionState::Committing;

        // Nothing written: release the slot and skip the WAL round trip.
        if self.tree.owned.is_empty() && self.tree.freed.is_empty() {
            self.inner.txns.end_write();
            self.state = TransactionState::Idle;
            return Ok(());
        }

        let commit_seq = self.base.commit_seq + 1;
        let meta = self.build_meta(commit_seq);
        let meta_image = match meta.encode(self.inner.cache.page_size()) {
            Ok(image) => image,
            Err(e) => {
                self.rollback_inner();
                return Err(e);
            }
        };

        let result = self.append_commit_batch(commit_seq, &meta_image);
        let lsn = match result {
            Ok(lsn) => lsn,
            Err(e) => {
                self.rollback_inner();
                return Err(e);
            }
        };

        // The batch is in the log; from here the commit is final, so the
        // slot is released and the new state published whatever else errors.
        let published = self.inner.cache.put_page(PageId::META, meta_image);
        *self.inner.meta.write() = meta;
        self.inner.txns.end_write();
        self.state = TransactionState::Idle;
        published?;
        debug!("txn {} committed as sequence {commit_seq} at {lsn}", self.txn_id);

        self.maybe_checkpoint();
        Ok(())
    }

    /// Discards every buffered change and releases the write slot.
    pub fn rollback(mut self) {
        if self.state == TransactionState::WriterActive {
            self.rollback_inner();
        }
    }

    fn writer_view(&self) -> TreeReader<'_> {
        TreeReader {
            cache: &self.inner.cache,
            root: self.tree.root,
        }
    }

    fn build_meta(&self, commit_seq: u64) -> Meta {
        let mut freelist = self.pending.clone();
        // Pool entries the transaction never handed out keep their tags;
        // pages this commit freed get tagged with the new sequence.
        freelist.extend(self.tree.alloc.pool.iter().copied());
        freelist.extend(self.tree.freed.iter().map(|&page| FreeEntry {
            page,
            freed_seq: commit_seq,
        }));
        Meta {
            version: self.base.version,
            branch_factor: self.base.branch_factor,
            root: self.tree.root,
            commit_seq,
            page_count: self.tree.alloc.next_page,
            freelist,
        }
    }

    fn append_commit_batch(&self, commit_seq: u64, meta_image: &[u8]) -> StoreResult<Lsn> {
        let mut pages: Vec<PageId> = self.tree.owned.iter().copied().collect();
        pages.sort();

        let mut records = Vec::with_capacity(pages.len() + 2);
        for page in pages {
            let image = self.inner.cache.fetch(page)?;
            records.push(WalRecord::PageImage {
                txn_id: self.txn_id,
                page,
                image: image.to_vec(),
            });
        }
        records.push(WalRecord::PageImage {
            txn_id: self.txn_id,
            page: PageId::META,
            image: meta_image.to_vec(),
        });
        records.push(WalRecord::Commit {
            txn_id: self.txn_id,
            commit_seq,
        });

        let mut wal = self.inner.wal.lock();
        let wal = wal
            .as_mut()
            .ok_or(StoreError::InvalidState("store is open read-only"))?;
        wal.append_commit(&records)
    }

    /// The commit is already durable and published by the time this runs;
    /// a checkpoint failure here is retried at the next commit or at close.
    fn maybe_checkpoint(&self) {
        let mut wal = self.inner.wal.lock();
        if let Some(wal) = wal.as_mut() {
            if wal.size() >= self.inner.checkpoint_wal_bytes {
                if let Err(e) = self.inner.checkpoint_with(wal) {
                    log::warn!("deferred checkpoint failed: {e}");
                }
            }
        }
    }

    fn rollback_inner(&mut self) {
        self.inner.cache.discard(self.tree.owned.drain());
        self.inner.txns.end_write();
        self.state = TransactionState::RolledBack;
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if self.state == TransactionState::WriterActive {
            debug!("txn {} dropped without commit, rolling back", self.txn_id);
            self.rollback_inner();
        }
    }
}

/// WAL sidecar path: the store path with `-wal` appended.
fn wal_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push("-wal");
    PathBuf::from(s)
}

/// Lays out a fresh store file: an empty leaf root at page 1, then the
/// metadata page, fsynced before the store is considered created.
fn create_store_file(
    path: &Path,
    page_size: usize,
    branch_factor: u32,
) -> StoreResult<PageManager> {
    let mut disk = PageManager::create(path, page_size)?;
    let meta = Meta::fresh(branch_factor);

    let root_image = Node::empty_leaf().encode(meta.root, page_size)?;
    disk.write_page(meta.root, &root_image)?;
    disk.write_page(PageId::META, &meta.encode(page_size)?)?;
    disk.sync()?;
    info!("created store at {}", path.display());
    Ok(disk)
}
