//! WAL record types.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::page::PageId;

/// Log sequence number. Monotonically increasing, one per record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Lsn(pub u64);

impl Lsn {
    pub fn next(self) -> Self {
        Lsn(self.0 + 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn {}", self.0)
    }
}

/// A single WAL record.
///
/// A commit batch is a run of `PageImage` records (the writer's dirty pages,
/// metadata page last) followed by one `Commit` record. The commit record is
/// the commit marker: a batch without one is ignored at recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecord {
    /// Full after-image of one page.
    PageImage {
        txn_id: u64,
        page: PageId,
        image: Vec<u8>,
    },
    /// Commit marker carrying the new commit sequence number.
    Commit { txn_id: u64, commit_seq: u64 },
}

impl WalRecord {
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    pub fn txn_id(&self) -> u64 {
        match self {
            WalRecord::PageImage { txn_id, .. } => *txn_id,
            WalRecord::Commit { txn_id, .. } => *txn_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let records = [
            WalRecord::PageImage {
                txn_id: 7,
                page: PageId(3),
                image: vec![1, 2, 3, 4],
            },
            WalRecord::Commit {
                txn_id: 7,
                commit_seq: 12,
            },
        ];
        for record in &records {
            let bytes = record.serialize().unwrap();
            assert_eq!(&WalRecord::deserialize(&bytes).unwrap(), record);
        }
    }

    #[test]
    fn test_lsn_ordering() {
        let a = Lsn(1);
        let b = a.next();
        assert!(a < b);
        assert_eq!(b, Lsn(2));
        assert_eq!(b.to_string(), "lsn 2");
    }

    #[test]
    fn test_deserialize_garbage_fails() {
        assert!(WalRecord::deserialize(&[0xff; 3]).is_err());
    }
}
