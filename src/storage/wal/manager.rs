//! WAL file management: append, recovery, truncation.
//!
//! On-disk framing, per record: `[u32 payload len][payload][u32 crc32]`, all
//! little-endian. A commit batch is appended with a single `write_all`, so a
//! crash leaves at worst a torn tail that recovery drops.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::{debug, info};

use super::record::{Lsn, WalRecord};
use crate::storage::disk::PageManager;
use crate::storage::error::StoreResult;
use crate::storage::page::PageId;

const FRAME_OVERHEAD: usize = 8;

pub struct WalManager {
    file: File,
    len: u64,
    next_lsn: Lsn,
    sync_on_commit: bool,
}

impl WalManager {
    /// Opens (creating if missing) the WAL sidecar file.
    pub fn open(path: &Path, sync_on_commit: bool) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            next_lsn: Lsn(1),
            sync_on_commit,
        })
    }

    /// Appends one commit batch atomically. `records` must end with the
    /// commit marker; the whole batch goes out in a single write.
    ///
    /// Returns the LSN of the commit record. With `sync_on_commit` the batch
    /// is fsynced before returning; otherwise durability waits for the next
    /// checkpoint or explicit sync (batched durability).
    pub fn append_commit(&mut self, records: &[WalRecord]) -> StoreResult<Lsn> {
        debug_assert!(matches!(records.last(), Some(WalRecord::Commit { .. })));

        let mut buf = Vec::new();
        for record in records {
            let payload = record
                .serialize()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            buf.write_u32::<LittleEndian>(payload.len() as u32)?;
            let crc = crc32fast::hash(&payload);
            buf.extend_from_slice(&payload);
            buf.write_u32::<LittleEndian>(crc)?;
        }

        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(&buf)?;
        if self.sync_on_commit {
            self.file.sync_data()?;
        }
        self.len += buf.len() as u64;
        for _ in 0..records.len() {
            self.next_lsn = self.next_lsn.next();
        }
        Ok(Lsn(self.next_lsn.0 - 1))
    }

    /// Current log size in bytes; drives checkpoint scheduling.
    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Discards the log after a checkpoint has made its contents redundant.
    pub fn truncate(&mut self) -> StoreResult<()> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        self.len = 0;
        Ok(())
    }

    /// Replays the log into the main file at open time.
    ///
    /// Scans forward validating frame lengths and checksums. Each complete
    /// batch (ending in a commit record) is applied in append order; the
    /// first invalid or truncated frame ends the scan; a torn tail is
    /// normal, not an error. The log is truncated afterwards.
    ///
    /// Returns the last replayed commit sequence, if any.
    pub fn recover(&mut self, disk: &mut PageManager) -> StoreResult<Option<u64>> {
        if self.len == 0 {
            return Ok(None);
        }

        let mut raw = Vec::with_capacity(self.len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut raw)?;

        let page_size = disk.page_size();
        let max_payload = page_size + 1024;

        let mut pos = 0usize;
        let mut pending: Vec<(PageId, Vec<u8>)> = Vec::new();
        let mut last_commit = None;
        let mut batches = 0u64;
        let mut applied = false;

        'scan: while raw.len() - pos >= FRAME_OVERHEAD {
            let payload_len = LittleEndian::read_u32(&raw[pos..pos + 4]) as usize;
            if payload_len > max_payload || raw.len() - pos < FRAME_OVERHEAD + payload_len {
                break;
            }
            let payload = &raw[pos + 4..pos + 4 + payload_len];
            let stored_crc = LittleEndian::read_u32(&raw[pos + 4 + payload_len..][..4]);
            if crc32fast::hash(payload) != stored_crc {
                debug!("wal: checksum mismatch at byte {pos}, dropping tail");
                break;
            }
            let record = match WalRecord::deserialize(payload) {
                Ok(r) => r,
                Err(e) => {
                    debug!("wal: undecodable record at byte {pos}: {e}");
                    break;
                }
            };
            pos += FRAME_OVERHEAD + payload_len;

            match record {
                WalRecord::PageImage { page, image, .. } => {
                    if image.len() != page_size {
                        debug!("wal: page image with wrong size, dropping tail");
                        break 'scan;
                    }
                    pending.push((page, image));
                }
                WalRecord::Commit { commit_seq, .. } => {
                    for (page, image) in pending.drain(..) {
                        disk.write_page(page, &image)?;
                        applied = true;
                    }
                    last_commit = Some(commit_seq);
                    batches += 1;
                }
            }
        }

        // Page images after the last commit marker belong to an unfinished
        // batch and are discarded with the rest of the tail.
        if applied {
            disk.sync()?;
        }
        if batches > 0 || pos < raw.len() {
            info!(
                "wal recovery: replayed {batches} commits, dropped {} tail bytes",
                raw.len() - pos
            );
        }
        self.truncate()?;
        Ok(last_commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PS: usize = 512;

    fn image(byte: u8) -> Vec<u8> {
        let mut p = vec![0u8; PS];
        p[0] = byte;
        p
    }

    fn commit_batch(txn_id: u64, commit_seq: u64, pages: &[(u32, u8)]) -> Vec<WalRecord> {
        let mut records: Vec<WalRecord> = pages
            .iter()
            .map(|&(p, b)| WalRecord::PageImage {
                txn_id,
                page: PageId(p),
                image: image(b),
            })
            .collect();
        records.push(WalRecord::Commit { txn_id, commit_seq });
        records
    }

    #[test]
    fn test_append_and_recover() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("t.wal");
        let db_path = dir.path().join("t.db");

        let mut wal = WalManager::open(&wal_path, true)?;
        wal.append_commit(&commit_batch(1, 1, &[(1, 10), (2, 20)]))?;
        wal.append_commit(&commit_batch(2, 2, &[(1, 11)]))?;
        drop(wal);

        let mut disk = PageManager::create(&db_path, PS)?;
        let mut wal = WalManager::open(&wal_path, true)?;
        let last = wal.recover(&mut disk)?;
        assert_eq!(last, Some(2));
        assert_eq!(wal.size(), 0);

        // Later batch wins on page 1.
        assert_eq!(disk.read_page(PageId(1))?[0], 11);
        assert_eq!(disk.read_page(PageId(2))?[0], 20);
        Ok(())
    }

    #[test]
    fn test_recover_empty_log() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let mut disk = PageManager::create(&dir.path().join("t.db"), PS)?;
        let mut wal = WalManager::open(&dir.path().join("t.wal"), true)?;
        assert_eq!(wal.recover(&mut disk)?, None);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_dropped() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("t.wal");
        let db_path = dir.path().join("t.db");

        {
            let mut wal = WalManager::open(&wal_path, true)?;
            wal.append_commit(&commit_batch(1, 1, &[(1, 10)]))?;
            wal.append_commit(&commit_batch(2, 2, &[(1, 99), (2, 99)]))?;
        }

        // Chop the file mid-way through the second batch.
        let full = std::fs::metadata(&wal_path).unwrap().len();
        let first_batch_end = {
            // Re-measure by writing only the first batch elsewhere.
            let p = dir.path().join("probe.wal");
            let mut probe = WalManager::open(&p, false)?;
            probe.append_commit(&commit_batch(1, 1, &[(1, 10)]))?;
            probe.size()
        };
        let cut = first_batch_end + (full - first_batch_end) / 2;
        OpenOptions::new()
            .write(true)
            .open(&wal_path)
            .unwrap()
            .set_len(cut)
            .unwrap();

        let mut disk = PageManager::create(&db_path, PS)?;
        let mut wal = WalManager::open(&wal_path, true)?;
        assert_eq!(wal.recover(&mut disk)?, Some(1));
        assert_eq!(disk.read_page(PageId(1))?[0], 10);
        assert!(disk.read_page(PageId(2)).is_err());
        Ok(())
    }

    #[test]
    fn test_corrupt_record_ends_scan() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("t.wal");

        {
            let mut wal = WalManager::open(&wal_path, true)?;
            wal.append_commit(&commit_batch(1, 1, &[(1, 10)]))?;
            wal.append_commit(&commit_batch(2, 2, &[(1, 20)]))?;
        }

        // Flip a payload byte inside the second batch.
        let first_batch_end = {
            let p = dir.path().join("probe.wal");
            let mut probe = WalManager::open(&p, false)?;
            probe.append_commit(&commit_batch(1, 1, &[(1, 10)]))?;
            probe.size()
        };
        {
            let mut f = OpenOptions::new().write(true).open(&wal_path).unwrap();
            f.seek(SeekFrom::Start(first_batch_end + 20)).unwrap();
            f.write_all(&[0xff]).unwrap();
        }

        let mut disk = PageManager::create(&dir.path().join("t.db"), PS)?;
        let mut wal = WalManager::open(&wal_path, true)?;
        assert_eq!(wal.recover(&mut disk)?, Some(1));
        assert_eq!(disk.read_page(PageId(1))?[0], 10);
        Ok(())
    }

    #[test]
    fn test_uncommitted_batch_not_applied() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("t.wal");

        // Write page images with no commit marker by framing them manually
        // through append_commit on a probe, then stripping the marker. Easier:
        // append a full batch then cut exactly the commit record off the end.
        let (full, without_commit) = {
            let p = dir.path().join("probe.wal");
            let mut probe = WalManager::open(&p, false)?;
            let pages_only: Vec<WalRecord> = vec![WalRecord::PageImage {
                txn_id: 1,
                page: PageId(1),
                image: image(55),
            }];
            // Measure the commit record's framed size.
            let mut records = pages_only.clone();
            records.push(WalRecord::Commit {
                txn_id: 1,
                commit_seq: 1,
            });
            probe.append_commit(&records)?;
            let full = probe.size();
            let commit_len = WalRecord::Commit {
                txn_id: 1,
                commit_seq: 1,
            }
            .serialize()
            .unwrap()
            .len() as u64
                + FRAME_OVERHEAD as u64;
            (full, full - commit_len)
        };

        {
            let mut wal = WalManager::open(&wal_path, true)?;
            wal.append_commit(&commit_batch(1, 1, &[(1, 55)]))?;
            assert_eq!(wal.size(), full);
        }
        OpenOptions::new()
            .write(true)
            .open(&wal_path)
            .unwrap()
            .set_len(without_commit)
            .unwrap();

        let mut disk = PageManager::create(&dir.path().join("t.db"), PS)?;
        let mut wal = WalManager::open(&wal_path, true)?;
        assert_eq!(wal.recover(&mut disk)?, None);
        assert!(disk.read_page(PageId(1)).is_err());
        Ok(())
    }

    #[test]
    fn test_truncate_resets_size() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let mut wal = WalManager::open(&dir.path().join("t.wal"), false)?;
        wal.append_commit(&commit_batch(1, 1, &[(1, 1)]))?;
        assert!(wal.size() > 0);
        wal.truncate()?;
        assert_eq!(wal.size(), 0);
        Ok(())
    }
}
