//! Storage layer: everything below the B-tree.
//!
//! This module provides page-based persistent storage. Key components:
//!
//! - **PageManager**: reads and writes fixed-size pages, verifying a CRC32
//!   trailer on every read
//! - **PageCache**: bounded in-memory pool with LRU eviction of clean pages
//! - **Meta**: the metadata page (page 0) holding the root pointer, the
//!   commit sequence number, and the freelist
//! - **WAL**: append-only commit journal replayed at open time
//!
//! Page 0 is always the metadata page; all other pages are B-tree nodes or
//! overflow pages.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod meta;
pub mod page;
pub mod wal;

pub use buffer::PageCache;
pub use disk::PageManager;
pub use error::{StoreError, StoreResult};
pub use meta::Meta;
pub use page::{PageId, PageKind};
