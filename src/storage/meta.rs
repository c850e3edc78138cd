//! The metadata page (page 0).
//!
//! Layout: a one-byte kind tag, a fixed header (magic, page size) readable
//! before the page size is known, then a bincode body with the root pointer,
//! commit sequence number, page count, branch factor and freelist. Like
//! every page it ends in a CRC32 trailer.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::storage::disk::page_body_len;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::page::{valid_page_size, PageId, PageKind};

/// "PKV1", the store file magic.
pub const MAGIC: u32 = 0x504b_5631;

/// On-disk format version.
pub const FORMAT_VERSION: u16 = 1;

/// Bytes before the bincode body: kind tag + magic + page size.
const FIXED_HEADER_LEN: usize = 1 + 4 + 4;

/// A reclaimed page and the commit sequence that freed it. The page may be
/// reused once no active reader's snapshot is older than `freed_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeEntry {
    pub page: PageId,
    pub freed_seq: u64,
}

/// Decoded contents of the metadata page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub version: u16,
    /// Root page of the B-tree.
    pub root: PageId,
    /// Sequence number of the most recent durable commit.
    pub commit_seq: u64,
    /// Pages ever allocated, including page 0; the next fresh page number.
    pub page_count: u32,
    /// Maximum entries per B-tree node. Fixed at creation, like the page
    /// size; the tree's occupancy invariants depend on it staying put.
    pub branch_factor: u32,
    /// Reclaimed pages awaiting reuse.
    pub freelist: Vec<FreeEntry>,
}

impl Meta {
    /// Metadata for a freshly created store: an empty leaf root at page 1.
    pub fn fresh(branch_factor: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            root: PageId(1),
            commit_seq: 0,
            page_count: 2,
            branch_factor,
            freelist: Vec::new(),
        }
    }

    /// Encodes into a full page image of `page_size` bytes (trailer zeroed;
    /// the page manager stamps it on write).
    ///
    /// The freelist lives inside the metadata page, so it is bounded: entries
    /// that do not fit are dropped oldest-first. The pages they named leak,
    /// which is safe, and rare at realistic page sizes.
    pub fn encode(&self, page_size: usize) -> StoreResult<Vec<u8>> {
        let budget = page_body_len(page_size) - FIXED_HEADER_LEN;
        let mut meta = self.clone();
        let mut body = encode_body(&meta)?;
        while body.len() > budget && !meta.freelist.is_empty() {
            meta.freelist.remove(0);
            body = encode_body(&meta)?;
        }
        if body.len() > budget {
            return Err(StoreError::Recovery(format!(
                "metadata does not fit a {page_size}-byte page"
            )));
        }
        if meta.freelist.len() != self.freelist.len() {
            log::warn!(
                "freelist overflowed the metadata page, leaking {} pages",
                self.freelist.len() - meta.freelist.len()
            );
        }

        let mut page = vec![0u8; page_size];
        page[0] = PageKind::Meta.tag();
        LittleEndian::write_u32(&mut page[1..5], MAGIC);
        LittleEndian::write_u32(&mut page[5..9], page_size as u32);
        page[FIXED_HEADER_LEN..FIXED_HEADER_LEN + body.len()].copy_from_slice(&body);
        Ok(page)
    }

    /// Decodes a metadata page image (checksum already verified by the
    /// reader). All failures map to `Recovery`: a bad metadata page is what
    /// makes a store unrecoverable.
    pub fn decode(page: &[u8]) -> StoreResult<Meta> {
        if page.len() < FIXED_HEADER_LEN {
            return Err(StoreError::Recovery("metadata page too short".into()));
        }
        if page[0] != PageKind::Meta.tag() {
            return Err(StoreError::Recovery("page 0 is not a metadata page".into()));
        }
        if LittleEndian::read_u32(&page[1..5]) != MAGIC {
            return Err(StoreError::Recovery("bad magic number".into()));
        }
        let meta: Meta = bincode::deserialize(&page[FIXED_HEADER_LEN..])
            .map_err(|e| StoreError::Recovery(format!("undecodable metadata: {e}")))?;
        if meta.version != FORMAT_VERSION {
            return Err(StoreError::Recovery(format!(
                "unsupported format version {}",
                meta.version
            )));
        }
        Ok(meta)
    }
}

fn encode_body(meta: &Meta) -> StoreResult<Vec<u8>> {
    bincode::serialize(meta).map_err(|e| StoreError::Recovery(format!("metadata encode: {e}")))
}

/// Reads the page size out of the fixed header of an existing store file,
/// before any page can be read whole.
pub fn read_page_size(path: &Path) -> StoreResult<usize> {
    let mut file = File::open(path)?;
    let mut header = [0u8; FIXED_HEADER_LEN];
    file.read_exact(&mut header)
        .map_err(|_| StoreError::Recovery("store file too short for a header".into()))?;

    if header[0] != PageKind::Meta.tag() || LittleEndian::read_u32(&header[1..5]) != MAGIC {
        return Err(StoreError::Recovery("not a pagekv store file".into()));
    }
    let page_size = LittleEndian::read_u32(&header[5..9]) as usize;
    if !valid_page_size(page_size) {
        return Err(StoreError::Recovery(format!(
            "implausible page size {page_size} in header"
        )));
    }
    Ok(page_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_encode_decode_round_trip() -> StoreResult<()> {
        let meta = Meta {
            version: FORMAT_VERSION,
            root: PageId(17),
            commit_seq: 42,
            page_count: 100,
            branch_factor: 64,
            freelist: vec![
                FreeEntry {
                    page: PageId(5),
                    freed_seq: 40,
                },
                FreeEntry {
                    page: PageId(9),
                    freed_seq: 41,
                },
            ],
        };
        let page = meta.encode(512)?;
        assert_eq!(page.len(), 512);
        assert_eq!(Meta::decode(&page)?, meta);
        Ok(())
    }

    #[test]
    fn test_fresh_meta() {
        let meta = Meta::fresh(4);
        assert_eq!(meta.root, PageId(1));
        assert_eq!(meta.commit_seq, 0);
        assert_eq!(meta.page_count, 2);
        assert_eq!(meta.branch_factor, 4);
        assert!(meta.freelist.is_empty());
    }

    #[test]
    fn test_freelist_overflow_drops_oldest() -> StoreResult<()> {
        let mut meta = Meta::fresh(4);
        for i in 0..1000 {
            meta.freelist.push(FreeEntry {
                page: PageId(i + 10),
                freed_seq: i as u64,
            });
        }
        let page = meta.encode(512)?;
        let decoded = Meta::decode(&page)?;
        assert!(decoded.freelist.len() < 1000);
        // The newest entries survive.
        assert_eq!(decoded.freelist.last(), meta.freelist.last());
        Ok(())
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let page = vec![0xabu8; 512];
        match Meta::decode(&page) {
            Err(StoreError::Recovery(_)) => {}
            other => panic!("expected recovery error, got {other:?}"),
        }
    }

    #[test]
    fn test_read_page_size() -> StoreResult<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.db");
        let page = Meta::fresh(8).encode(1024)?;
        std::fs::File::create(&path).unwrap().write_all(&page).unwrap();

        assert_eq!(read_page_size(&path)?, 1024);
        Ok(())
    }

    #[test]
    fn test_read_page_size_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreign.db");
        std::fs::write(&path, b"SQLite format 3\0 and then some").unwrap();
        match read_page_size(&path) {
            Err(StoreError::Recovery(_)) => {}
            other => panic!("expected recovery error, got {other:?}"),
        }
    }
}
