use std::collections::HashMap;

use super::replacer::Replacer;
use crate::storage::page::PageId;

/// Least-recently-used eviction.
///
/// Each access stamps the page with a monotonically increasing counter;
/// eviction picks the smallest stamp. Linear scan on evict is fine at the
/// pool sizes this cache runs with.
#[derive(Debug, Default)]
pub struct LruReplacer {
    stamps: HashMap<PageId, u64>,
    clock: u64,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Replacer for LruReplacer {
    fn record_access(&mut self, page_id: PageId) {
        self.clock += 1;
        self.stamps.insert(page_id, self.clock);
    }

    fn remove(&mut self, page_id: PageId) {
        self.stamps.remove(&page_id);
    }

    fn evict(&mut self) -> Option<PageId> {
        let victim = self
            .stamps
            .iter()
            .min_by_key(|(_, stamp)| **stamp)
            .map(|(page_id, _)| *page_id)?;
        self.stamps.remove(&victim);
        Some(victim)
    }

    fn len(&self) -> usize {
        self.stamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_recently_used() {
        let mut lru = LruReplacer::new();
        lru.record_access(PageId(1));
        lru.record_access(PageId(2));
        lru.record_access(PageId(3));

        assert_eq!(lru.evict(), Some(PageId(1)));
        assert_eq!(lru.evict(), Some(PageId(2)));
        assert_eq!(lru.evict(), Some(PageId(3)));
        assert_eq!(lru.evict(), None);
    }

    #[test]
    fn test_reaccess_moves_to_back() {
        let mut lru = LruReplacer::new();
        lru.record_access(PageId(1));
        lru.record_access(PageId(2));
        lru.record_access(PageId(1));

        assert_eq!(lru.evict(), Some(PageId(2)));
        assert_eq!(lru.evict(), Some(PageId(1)));
    }

    #[test]
    fn test_remove() {
        let mut lru = LruReplacer::new();
        lru.record_access(PageId(1));
        lru.record_access(PageId(2));
        lru.remove(PageId(1));

        assert_eq!(lru.len(), 1);
        assert_eq!(lru.evict(), Some(PageId(2)));
        assert_eq!(lru.evict(), None);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut lru = LruReplacer::new();
        lru.remove(PageId(42));
        assert!(lru.is_empty());
    }
}
