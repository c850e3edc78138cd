//! Page-granular file I/O.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::storage::error::{corruption, StoreError, StoreResult};
use crate::storage::page::{stamp_checksum, verify_checksum, PageId, PAGE_TRAILER_SIZE};

/// Reads and writes fixed-size pages in the store file.
///
/// Every page carries a CRC32 trailer: `write_page` stamps it, `read_page`
/// verifies it and surfaces a [`StoreError::Corruption`] on mismatch. Writes
/// are not individually synced; callers decide when to call [`sync`].
///
/// [`sync`]: PageManager::sync
pub struct PageManager {
    file: File,
    page_size: usize,
}

impl PageManager {
    /// Creates a fresh page file, truncating anything already at `path`.
    pub fn create(path: &Path, page_size: usize) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file, page_size })
    }

    /// Opens an existing page file.
    pub fn open(path: &Path, page_size: usize, read_only: bool) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(Self { file, page_size })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Reads a page and verifies its checksum trailer.
    pub fn read_page(&mut self, page_id: PageId) -> StoreResult<Vec<u8>> {
        let offset = self.page_offset(page_id);
        let file_size = self.file.metadata()?.len();
        if offset + self.page_size as u64 > file_size {
            return Err(corruption(
                page_id,
                format!("read past end of file ({} bytes)", file_size),
            ));
        }

        let mut buf = vec![0u8; self.page_size];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;

        if !verify_checksum(&buf) {
            return Err(corruption(page_id, "checksum mismatch"));
        }
        Ok(buf)
    }

    /// Writes a page, stamping its checksum trailer. Extends the file if the
    /// page lies past the current end.
    pub fn write_page(&mut self, page_id: PageId, page: &[u8]) -> StoreResult<()> {
        if page.len() != self.page_size {
            return Err(StoreError::InvalidState("page buffer has wrong size"));
        }

        let mut buf = page.to_vec();
        stamp_checksum(&mut buf);

        let offset = self.page_offset(page_id);
        let file_size = self.file.metadata()?.len();
        if offset + self.page_size as u64 > file_size {
            self.file.set_len(offset + self.page_size as u64)?;
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Number of whole pages currently in the file.
    pub fn num_pages(&self) -> StoreResult<u32> {
        let file_size = self.file.metadata()?.len();
        Ok((file_size / self.page_size as u64) as u32)
    }

    /// Flushes all written pages to stable storage.
    pub fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        page_id.0 as u64 * self.page_size as u64
    }
}

/// Usable body bytes of a page (excludes the checksum trailer).
pub fn page_body_len(page_size: usize) -> usize {
    page_size - PAGE_TRAILER_SIZE
}
