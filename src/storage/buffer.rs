//! Bounded in-memory page cache.
//!
//! Pages are cached as immutable `Arc<[u8]>` images. A fetched image stays
//! valid for as long as the caller holds the `Arc`, no matter what the cache
//! evicts afterwards; this is what keeps reader snapshots consistent while
//! the pool recycles memory underneath them.
//!
//! Dirty pages (staged by the single writer, or committed but not yet
//! checkpointed) are never evicted; only `flush` writes them back and makes
//! them evictable again.

pub mod lru;
pub mod replacer;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use self::lru::LruReplacer;
use self::replacer::Replacer;
use crate::storage::disk::PageManager;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::page::PageId;

struct Frame {
    image: Arc<[u8]>,
    dirty: bool,
}

struct CacheInner {
    disk: PageManager,
    frames: HashMap<PageId, Frame>,
    replacer: Box<dyn Replacer>,
}

/// Fixed-capacity pool of page images backed by a [`PageManager`].
pub struct PageCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    page_size: usize,
}

impl PageCache {
    pub fn new(disk: PageManager, capacity: usize) -> Self {
        let page_size = disk.page_size();
        Self {
            inner: Mutex::new(CacheInner {
                disk,
                frames: HashMap::with_capacity(capacity),
                replacer: Box::new(LruReplacer::new()),
            }),
            capacity,
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns a shared, read-only image of the page, loading it from disk on
    /// a cache miss.
    pub fn fetch(&self, page_id: PageId) -> StoreResult<Arc<[u8]>> {
        let mut inner = self.inner.lock();

        if let Some(frame) = inner.frames.get(&page_id) {
            let image = Arc::clone(&frame.image);
            if !frame.dirty {
                inner.replacer.record_access(page_id);
            }
            return Ok(image);
        }

        inner.make_room(self.capacity);

        let image: Arc<[u8]> = inner.disk.read_page(page_id)?.into();
        inner.frames.insert(
            page_id,
            Frame {
                image: Arc::clone(&image),
                dirty: false,
            },
        );
        inner.replacer.record_access(page_id);
        Ok(image)
    }

    /// Stages a new page image, marking it dirty. Dirty pages stay resident
    /// until the next `flush`.
    pub fn put_page(&self, page_id: PageId, image: Vec<u8>) -> StoreResult<()> {
        if image.len() != self.page_size {
            return Err(StoreError::InvalidState("page image has wrong size"));
        }
        let mut inner = self.inner.lock();
        inner.make_room(self.capacity);
        inner.frames.insert(
            page_id,
            Frame {
                image: image.into(),
                dirty: true,
            },
        );
        inner.replacer.remove(page_id);
        Ok(())
    }

    /// Drops the given pages from the cache without writing them back.
    /// Used on rollback: the next fetch re-reads the last committed image.
    pub fn discard<I: IntoIterator<Item = PageId>>(&self, pages: I) {
        let mut inner = self.inner.lock();
        for page_id in pages {
            inner.frames.remove(&page_id);
            inner.replacer.remove(page_id);
        }
    }

    /// Writes all dirty pages to disk and clears their dirty flags.
    ///
    /// The metadata page is written last, behind an fsync barrier, so the
    /// main file's commit pointer only advances once every page it refers to
    /// is durable.
    pub fn flush(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock();

        let mut dirty: Vec<PageId> = inner
            .frames
            .iter()
            .filter(|(_, f)| f.dirty)
            .map(|(id, _)| *id)
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        dirty.sort();
        let meta_dirty = dirty.first() == Some(&PageId::META);
        trace!("flushing {} dirty pages", dirty.len());

        for page_id in dirty.iter().skip(meta_dirty as usize) {
            let image = Arc::clone(&inner.frames[page_id].image);
            inner.disk.write_page(*page_id, &image)?;
        }
        inner.disk.sync()?;

        if meta_dirty {
            let image = Arc::clone(&inner.frames[&PageId::META].image);
            inner.disk.write_page(PageId::META, &image)?;
            inner.disk.sync()?;
        }

        for page_id in dirty {
            if let Some(frame) = inner.frames.get_mut(&page_id) {
                frame.dirty = false;
            }
            inner.replacer.record_access(page_id);
        }
        inner.make_room(self.capacity);
        Ok(())
    }

    /// Number of resident pages. Test/introspection helper.
    pub fn cached_pages(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Number of resident dirty pages. Test/introspection helper.
    pub fn dirty_pages(&self) -> usize {
        self.inner.lock().frames.values().filter(|f| f.dirty).count()
    }
}

impl CacheInner {
    /// Evicts clean pages until the pool is back under `capacity`. If every
    /// resident page is dirty the pool is allowed to grow past capacity; a
    /// large write transaction shrinks back at its next flush.
    fn make_room(&mut self, capacity: usize) {
        while self.frames.len() >= capacity {
            match self.replacer.evict() {
                Some(victim) => {
                    debug_assert!(!self.frames[&victim].dirty);
                    self.frames.remove(&victim);
                }
                None => {
                    debug!(
                        "page cache over capacity with {} dirty pages resident",
                        self.frames.len()
                    );
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::stamp_checksum;
    use tempfile::tempdir;

    const PS: usize = 512;

    fn test_cache(capacity: usize) -> PageCache {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let disk = PageManager::create(&path, PS).unwrap();
        // Leak the tempdir so the backing file outlives the helper.
        std::mem::forget(dir);
        PageCache::new(disk, capacity)
    }

    fn image(byte: u8) -> Vec<u8> {
        let mut p = vec![0u8; PS];
        p[0] = byte;
        p
    }

    #[test]
    fn test_put_and_fetch() -> StoreResult<()> {
        let cache = test_cache(8);
        cache.put_page(PageId(1), image(42))?;
        assert_eq!(cache.fetch(PageId(1))?[0], 42);
        assert_eq!(cache.dirty_pages(), 1);
        Ok(())
    }

    #[test]
    fn test_flush_clears_dirty_and_persists() -> StoreResult<()> {
        let cache = test_cache(8);
        cache.put_page(PageId(0), image(9))?;
        cache.put_page(PageId(1), image(10))?;
        cache.flush()?;
        assert_eq!(cache.dirty_pages(), 0);

        // Evict everything by filling the pool, then re-read from disk.
        for i in 2..12 {
            cache.put_page(PageId(i), image(i as u8))?;
        }
        cache.flush()?;
        assert_eq!(cache.fetch(PageId(1))?[0], 10);
        Ok(())
    }

    #[test]
    fn test_eviction_prefers_clean_pages() -> StoreResult<()> {
        let cache = test_cache(2);
        cache.put_page(PageId(1), image(1))?;
        cache.put_page(PageId(2), image(2))?;
        // Pool full of dirty pages; a third put must still succeed.
        cache.put_page(PageId(3), image(3))?;
        assert_eq!(cache.cached_pages(), 3);
        assert_eq!(cache.dirty_pages(), 3);

        // After a flush the pool shrinks back to capacity.
        cache.flush()?;
        assert!(cache.cached_pages() <= 2);
        Ok(())
    }

    #[test]
    fn test_fetched_image_survives_eviction() -> StoreResult<()> {
        let cache = test_cache(2);
        cache.put_page(PageId(1), image(1))?;
        cache.flush()?;

        let pinned = cache.fetch(PageId(1))?;
        for i in 2..6 {
            cache.put_page(PageId(i), image(i as u8))?;
        }
        cache.flush()?;
        // Page 1 may be long gone from the pool; the image is still intact.
        assert_eq!(pinned[0], 1);
        Ok(())
    }

    #[test]
    fn test_discard_restores_committed_image() -> StoreResult<()> {
        let cache = test_cache(8);
        cache.put_page(PageId(1), image(1))?;
        cache.flush()?;

        cache.put_page(PageId(1), image(99))?;
        assert_eq!(cache.fetch(PageId(1))?[0], 99);

        cache.discard([PageId(1)]);
        assert_eq!(cache.fetch(PageId(1))?[0], 1);
        Ok(())
    }

    #[test]
    fn test_fetch_unwritten_page_fails() {
        let cache = test_cache(4);
        assert!(cache.fetch(PageId(7)).is_err());
    }

    #[test]
    fn test_wrong_image_size_rejected() {
        let cache = test_cache(4);
        assert!(cache.put_page(PageId(1), vec![0u8; 10]).is_err());
    }

    #[test]
    fn test_checksum_helpers_agree_with_disk() -> StoreResult<()> {
        // A page written through the cache reads back verbatim, trailer and
        // all, through a fresh manager.
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.db");
        let cache = PageCache::new(PageManager::create(&path, PS)?, 4);
        cache.put_page(PageId(0), image(5))?;
        cache.flush()?;
        drop(cache);

        let mut expected = image(5);
        stamp_checksum(&mut expected);
        let mut pm = PageManager::open(&path, PS, false)?;
        assert_eq!(pm.read_page(PageId(0))?, expected);
        Ok(())
    }
}
