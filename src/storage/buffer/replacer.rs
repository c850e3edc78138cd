use crate::storage::page::PageId;

/// Eviction policy over clean cached pages.
///
/// Only clean pages are ever registered; dirty pages are removed from the
/// replacer when staged and re-registered once flushed.
pub trait Replacer: Send {
    /// Records that `page_id` became evictable (or was used again).
    fn record_access(&mut self, page_id: PageId);

    /// Removes a page from eviction candidacy.
    fn remove(&mut self, page_id: PageId);

    /// Selects a page to evict. Returns None if nothing is evictable.
    fn evict(&mut self) -> Option<PageId>;

    /// Number of evictable pages.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
