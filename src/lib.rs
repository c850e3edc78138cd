//! pagekv: an embedded, single-file, page-oriented key-value store.
//!
//! The engine is built from a small number of layers:
//!
//! - **Page file** (`storage::disk::PageManager`): fixed-size pages with
//!   CRC32 trailers, read and written at page granularity.
//! - **Page cache** (`storage::buffer::PageCache`): bounded in-memory pool
//!   with LRU eviction of clean pages; dirty pages are only ever written back.
//! - **Write-ahead log** (`storage::wal`): commits are appended as atomic
//!   record batches and replayed into the main file on open.
//! - **B-tree** (`btree`): copy-on-write ordered index; every child
//!   reference is a page number resolved through the cache.
//! - **Transactions** (`transaction`, `store`): a single writer and any
//!   number of snapshot readers, each pinned to the commit point it saw at
//!   `begin`.
//!
//! The public entry point is [`Store`].

pub mod btree;
pub mod storage;
pub mod store;
pub mod transaction;

pub use btree::iterator::RangeScan;
pub use storage::error::{StoreError, StoreResult};
pub use storage::page::PageId;
pub use store::{Durability, OpenMode, Options, ReadTransaction, Store, WriteTransaction};
pub use transaction::TransactionState;
