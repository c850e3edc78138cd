//! Ascending range scans.
//!
//! Pages are never chained sibling-to-sibling, so a scan re-descends from the
//! root for each leaf, keyed by the successor of the last key it returned.
//! That makes the scan restartable from any key, and immune to the tree being
//! a different shape than when the scan began.

use std::collections::VecDeque;
use std::ops::Bound;

use super::node::{Node, ValueRef};
use super::{load_node, read_value};
use crate::storage::buffer::PageCache;
use crate::storage::error::StoreResult;
use crate::storage::page::PageId;

/// Iterator over `(key, value)` pairs in ascending key order.
pub struct RangeScan<'a> {
    cache: &'a PageCache,
    root: PageId,
    /// Inclusive lower bound for the next leaf descent.
    next_key: Vec<u8>,
    end: Bound<Vec<u8>>,
    buffered: VecDeque<(Vec<u8>, ValueRef)>,
    exhausted: bool,
}

impl<'a> RangeScan<'a> {
    pub(crate) fn new(
        cache: &'a PageCache,
        root: PageId,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
    ) -> Self {
        let next_key = match start {
            Bound::Unbounded => Vec::new(),
            Bound::Included(k) => k.to_vec(),
            Bound::Excluded(k) => successor(k),
        };
        Self {
            cache,
            root,
            next_key,
            end: match end {
                Bound::Unbounded => Bound::Unbounded,
                Bound::Included(k) => Bound::Included(k.to_vec()),
                Bound::Excluded(k) => Bound::Excluded(k.to_vec()),
            },
            buffered: VecDeque::new(),
            exhausted: false,
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(end) => key > end.as_slice(),
            Bound::Excluded(end) => key >= end.as_slice(),
        }
    }

    /// Descends to the leaf covering `next_key` and buffers its in-range
    /// entries. Sets `exhausted` when the range is done.
    fn refill(&mut self) -> StoreResult<()> {
        loop {
            let mut page_id = self.root;
            // Smallest key of the next subtree to the right of this descent,
            // if the descent ever turns away from the rightmost child.
            let mut fence: Option<Vec<u8>> = None;

            let entries = loop {
                match load_node(self.cache, page_id)? {
                    Node::Leaf { entries } => break entries,
                    Node::Interior { keys, children } => {
                        let idx = keys.partition_point(|k| k.as_slice() <= &self.next_key);
                        if idx < keys.len() {
                            fence = Some(keys[idx].clone());
                        }
                        page_id = children[idx];
                    }
                }
            };

            for entry in entries {
                if entry.key < self.next_key {
                    continue;
                }
                if self.past_end(&entry.key) {
                    self.exhausted = true;
                    return Ok(());
                }
                self.buffered.push_back((entry.key, entry.value));
            }

            if let Some((last, _)) = self.buffered.back() {
                self.next_key = successor(last);
                return Ok(());
            }

            // The leaf held nothing at or above next_key. Entries may still
            // exist under the subtree past the fence.
            match fence {
                Some(f) if !self.past_end(&f) => self.next_key = f,
                _ => {
                    self.exhausted = true;
                    return Ok(());
                }
            }
        }
    }
}

impl Iterator for RangeScan<'_> {
    type Item = StoreResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, value)) = self.buffered.pop_front() {
                return Some(read_value(self.cache, &value).map(|v| (key, v)));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

/// Immediate successor of `key` in bytewise order.
fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::NodeLimits;
    use crate::btree::{TreeState, TreeWriter};
    use crate::storage::disk::PageManager;
    use tempfile::tempdir;

    struct Harness {
        cache: PageCache,
        state: TreeState,
        limits: NodeLimits,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let disk = PageManager::create(&dir.path().join("t.db"), 512).unwrap();
        let cache = PageCache::new(disk, 1024);
        let root = Node::empty_leaf().encode(PageId(1), 512).unwrap();
        cache.put_page(PageId(1), root).unwrap();
        Harness {
            cache,
            state: TreeState::new(PageId(1), Vec::new(), 2),
            limits: NodeLimits::new(512, 4),
            _dir: dir,
        }
    }

    fn fill(h: &mut Harness, n: u32) {
        let mut w = TreeWriter {
            cache: &h.cache,
            state: &mut h.state,
            limits: h.limits,
        };
        for i in 0..n {
            w.put(&i.to_be_bytes(), &(i * 3).to_be_bytes()).unwrap();
        }
    }

    fn collect(scan: RangeScan<'_>) -> Vec<(Vec<u8>, Vec<u8>)> {
        scan.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_full_scan_in_order() {
        let mut h = harness();
        fill(&mut h, 300);
        let scan = RangeScan::new(
            &h.cache,
            h.state.root,
            Bound::Unbounded,
            Bound::Unbounded,
        );
        let got = collect(scan);
        assert_eq!(got.len(), 300);
        for (i, (k, v)) in got.iter().enumerate() {
            assert_eq!(k, &(i as u32).to_be_bytes());
            assert_eq!(v, &((i as u32) * 3).to_be_bytes());
        }
    }

    #[test]
    fn test_bounded_scan() {
        let mut h = harness();
        fill(&mut h, 100);
        let lo = 10u32.to_be_bytes();
        let hi = 20u32.to_be_bytes();
        let scan = RangeScan::new(
            &h.cache,
            h.state.root,
            Bound::Included(&lo),
            Bound::Excluded(&hi),
        );
        let keys: Vec<u32> = collect(scan)
            .into_iter()
            .map(|(k, _)| u32::from_be_bytes(k.try_into().unwrap()))
            .collect();
        assert_eq!(keys, (10..20).collect::<Vec<u32>>());
    }

    #[test]
    fn test_excluded_start_and_included_end() {
        let mut h = harness();
        fill(&mut h, 50);
        let lo = 5u32.to_be_bytes();
        let hi = 8u32.to_be_bytes();
        let scan = RangeScan::new(
            &h.cache,
            h.state.root,
            Bound::Excluded(&lo),
            Bound::Included(&hi),
        );
        let keys: Vec<u32> = collect(scan)
            .into_iter()
            .map(|(k, _)| u32::from_be_bytes(k.try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![6, 7, 8]);
    }

    #[test]
    fn test_empty_tree_scan() {
        let h = harness();
        let scan = RangeScan::new(
            &h.cache,
            h.state.root,
            Bound::Unbounded,
            Bound::Unbounded,
        );
        assert_eq!(collect(scan).len(), 0);
    }

    #[test]
    fn test_range_outside_keys_is_empty() {
        let mut h = harness();
        fill(&mut h, 10);
        let lo = 100u32.to_be_bytes();
        let scan = RangeScan::new(
            &h.cache,
            h.state.root,
            Bound::Included(&lo),
            Bound::Unbounded,
        );
        assert_eq!(collect(scan).len(), 0);
    }
}
