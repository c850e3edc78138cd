//! Write-ahead log.
//!
//! Commits are appended as atomic batches of page-image records terminated
//! by a commit record; recovery replays every complete batch into the main
//! file and silently drops a torn tail.

pub mod manager;
pub mod record;

pub use manager::WalManager;
pub use record::{Lsn, WalRecord};
