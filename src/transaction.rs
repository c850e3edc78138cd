//! Transaction lifecycle coordination.
//!
//! One writer at a time, any number of readers. A second writer is refused
//! immediately with a retryable busy error rather than queued. Readers
//! register the commit sequence they snapshot at; the oldest registered
//! sequence gates which freed pages the next writer may recycle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::storage::error::{StoreError, StoreResult};

/// The possible states of a transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No transaction in progress.
    Idle,
    /// A read snapshot is held.
    ReaderActive,
    /// The write slot is held and mutations are buffered.
    WriterActive,
    /// Commit is in flight; no further operations are accepted.
    Committing,
    /// The transaction was rolled back and its buffered work discarded.
    RolledBack,
}

impl TransactionState {
    /// Returns true if the transaction can still serve operations.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::ReaderActive | Self::WriterActive)
    }

    /// Returns true if the transaction is finished one way or the other.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Idle | Self::RolledBack)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::ReaderActive => write!(f, "ReaderActive"),
            Self::WriterActive => write!(f, "WriterActive"),
            Self::Committing => write!(f, "Committing"),
            Self::RolledBack => write!(f, "RolledBack"),
        }
    }
}

/// Tracks the writer slot and the set of active reader snapshots.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    writer_active: AtomicBool,
    /// Commit sequence -> number of readers pinned to it.
    readers: Mutex<BTreeMap<u64, usize>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            writer_active: AtomicBool::new(false),
            readers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers a reader pinned to `commit_seq` and returns its id.
    pub fn begin_read(&self, commit_seq: u64) -> u64 {
        *self.readers.lock().entry(commit_seq).or_insert(0) += 1;
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Unregisters a reader pinned to `commit_seq`.
    pub fn end_read(&self, commit_seq: u64) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&commit_seq) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&commit_seq);
            }
        }
    }

    /// Claims the writer slot, or fails with a retryable busy error if
    /// another writer holds it.
    pub fn try_begin_write(&self) -> StoreResult<u64> {
        if self
            .writer_active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(StoreError::Busy("another write transaction is active"));
        }
        Ok(self.next_txn_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Releases the writer slot after commit or rollback.
    pub fn end_write(&self) {
        self.writer_active.store(false, Ordering::Release);
    }

    pub fn writer_active(&self) -> bool {
        self.writer_active.load(Ordering::Acquire)
    }

    /// Oldest commit sequence any reader is still pinned to.
    pub fn oldest_active_reader(&self) -> Option<u64> {
        self.readers.lock().keys().next().copied()
    }

    pub fn active_readers(&self) -> usize {
        self.readers.lock().values().sum()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
