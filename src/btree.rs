//! Copy-on-write B-tree over the page cache.
//!
//! Nodes reference each other by page number only; there is no in-memory
//! pointer graph. A write transaction never modifies a committed page:
//! rewriting a node allocates a fresh page, and the superseded page number is
//! queued for the freelist. Pages the transaction itself allocated may be
//! rewritten in place. The new root becomes visible only when the metadata
//! page flips at commit, which is what gives readers their snapshots.

pub mod iterator;
pub mod node;

use std::collections::HashSet;

use self::node::{LeafEntry, Node, NodeLimits, OverflowPage, ValueRef};
use crate::storage::buffer::PageCache;
use crate::storage::error::{corruption, StoreError, StoreResult};
use crate::storage::meta::FreeEntry;
use crate::storage::page::PageId;

/// Page allocation state for one write transaction.
///
/// `pool` holds freelist entries whose freeing commit is older than every
/// active reader snapshot; they may be handed out immediately. Fresh pages
/// come from extending `next_page`.
#[derive(Debug)]
pub(crate) struct PageAlloc {
    pub pool: Vec<FreeEntry>,
    pub next_page: u32,
}

impl PageAlloc {
    pub fn allocate(&mut self) -> PageId {
        if let Some(entry) = self.pool.pop() {
            return entry.page;
        }
        let id = PageId(self.next_page);
        self.next_page += 1;
        id
    }
}

/// Mutable tree state carried by a write transaction.
#[derive(Debug)]
pub(crate) struct TreeState {
    /// Root of the transaction's (uncommitted) tree.
    pub root: PageId,
    /// Pages allocated by this transaction. Discarded wholesale on rollback.
    pub owned: HashSet<PageId>,
    /// Committed pages superseded by this transaction; they join the
    /// freelist at commit, tagged with the commit sequence.
    pub freed: Vec<PageId>,
    pub alloc: PageAlloc,
}

impl TreeState {
    pub fn new(root: PageId, pool: Vec<FreeEntry>, next_page: u32) -> Self {
        Self {
            root,
            owned: HashSet::new(),
            freed: Vec::new(),
            alloc: PageAlloc { pool, next_page },
        }
    }
}

pub(crate) fn load_node(cache: &PageCache, page_id: PageId) -> StoreResult<Node> {
    let image = cache.fetch(page_id)?;
    Node::decode(page_id, &image)
}

/// Resolves a leaf value, following an overflow chain if needed.
pub(crate) fn read_value(cache: &PageCache, value: &ValueRef) -> StoreResult<Vec<u8>> {
    match value {
        ValueRef::Inline(bytes) => Ok(bytes.clone()),
        ValueRef::Overflow { head, len } => {
            let mut out = Vec::with_capacity(*len as usize);
            let mut next = Some(*head);
            while let Some(page_id) = next {
                let image = cache.fetch(page_id)?;
                let link = OverflowPage::decode(page_id, &image)?;
                out.extend_from_slice(&link.chunk);
                if out.len() > *len as usize {
                    return Err(corruption(page_id, "overflow chain longer than recorded"));
                }
                next = link.next;
            }
            if out.len() != *len as usize {
                return Err(corruption(*head, "overflow chain shorter than recorded"));
            }
            Ok(out)
        }
    }
}

/// Read-only view of a tree rooted at a fixed page.
pub(crate) struct TreeReader<'a> {
    pub cache: &'a PageCache,
    pub root: PageId,
}

impl TreeReader<'_> {
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let mut page_id = self.root;
        loop {
            match load_node(self.cache, page_id)? {
                Node::Leaf { entries } => {
                    return match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                        Ok(i) => Ok(Some(read_value(self.cache, &entries[i].value)?)),
                        Err(_) => Ok(None),
                    };
                }
                Node::Interior { keys, children } => {
                    let idx = keys.partition_point(|k| k.as_slice() <= key);
                    page_id = children[idx];
                }
            }
        }
    }

    /// Number of levels on a root-to-leaf path.
    pub fn height(&self) -> StoreResult<u32> {
        let mut page_id = self.root;
        let mut height = 1;
        loop {
            match load_node(self.cache, page_id)? {
                Node::Leaf { .. } => return Ok(height),
                Node::Interior { children, .. } => {
                    page_id = children[0];
                    height += 1;
                }
            }
        }
    }
}

enum InsertOutcome {
    /// Child was rewritten (possibly in place).
    Updated(PageId),
    /// Child split; the separator and new right sibling go to the parent.
    Split(PageId, Vec<u8>, PageId),
}

/// Mutating view over a [`TreeState`].
pub(crate) struct TreeWriter<'a> {
    pub cache: &'a PageCache,
    pub state: &'a mut TreeState,
    pub limits: NodeLimits,
}

impl TreeWriter<'_> {
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        TreeReader {
            cache: self.cache,
            root: self.state.root,
        }
        .get(key)
    }

    /// Inserts or overwrites a key.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let max = self.limits.max_key_len();
        if key.len() > max {
            return Err(StoreError::KeyTooLarge {
                len: key.len(),
                max,
            });
        }

        let value = self.write_value(value)?;
        match self.insert_rec(self.state.root, key, value)? {
            InsertOutcome::Updated(root) => self.state.root = root,
            InsertOutcome::Split(left, sep, right) => {
                // Root split: the tree grows by one level, here and only here.
                let new_root = Node::Interior {
                    keys: vec![sep],
                    children: vec![left, right],
                };
                self.state.root = self.store_node(None, &new_root)?;
            }
        }
        Ok(())
    }

    /// Removes a key. Returns false if it was not present.
    pub fn delete(&mut self, key: &[u8]) -> StoreResult<bool> {
        let (root, removed, _) = self.delete_rec(self.state.root, key)?;
        self.state.root = root;
        if !removed {
            return Ok(false);
        }

        // The root sheds a level when it is an interior node with a single
        // child left.
        loop {
            match load_node(self.cache, self.state.root)? {
                Node::Interior { keys, children } if keys.is_empty() => {
                    let old_root = self.state.root;
                    self.state.root = children[0];
                    self.free_page(old_root);
                }
                _ => break,
            }
        }
        Ok(true)
    }

    fn insert_rec(
        &mut self,
        page_id: PageId,
        key: &[u8],
        value: ValueRef,
    ) -> StoreResult<InsertOutcome> {
        match load_node(self.cache, page_id)? {
            Node::Leaf { mut entries } => {
                match entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
                    Ok(i) => {
                        let old = std::mem::replace(&mut entries[i].value, value);
                        self.free_value(&old)?;
                    }
                    Err(i) => entries.insert(
                        i,
                        LeafEntry {
                            key: key.to_vec(),
                            value,
                        },
                    ),
                }

                let node = Node::Leaf { entries };
                if !self.limits.overflows(&node) {
                    return Ok(InsertOutcome::Updated(self.store_node(Some(page_id), &node)?));
                }

                let Node::Leaf { entries } = node else { unreachable!() };
                let split = split_point(entries.iter().map(entry_weight), entries.len());
                let right_entries = entries[split..].to_vec();
                let left_entries = {
                    let mut e = entries;
                    e.truncate(split);
                    e
                };
                let sep = right_entries[0].key.clone();
                let left = self.store_node(Some(page_id), &Node::Leaf {
                    entries: left_entries,
                })?;
                let right = self.store_node(None, &Node::Leaf {
                    entries: right_entries,
                })?;
                Ok(InsertOutcome::Split(left, sep, right))
            }
            Node::Interior {
                mut keys,
                mut children,
            } => {
                let idx = keys.partition_point(|k| k.as_slice() <= key);
                match self.insert_rec(children[idx], key, value)? {
                    InsertOutcome::Updated(child) => children[idx] = child,
                    InsertOutcome::Split(left, sep, right) => {
                        children[idx] = left;
                        keys.insert(idx, sep);
                        children.insert(idx + 1, right);
                    }
                }

                let node = Node::Interior { keys, children };
                if !self.limits.overflows(&node) {
                    return Ok(InsertOutcome::Updated(self.store_node(Some(page_id), &node)?));
                }

                let Node::Interior { mut keys, mut children } = node else { unreachable!() };
                // Interior keys are length-capped, so a plain median split is
                // balanced enough; keys[mid] moves up as the separator.
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let sep_up = keys.pop().expect("split point below key count");
                let right_children = children.split_off(mid + 1);

                let left = self.store_node(Some(page_id), &Node::Interior { keys, children })?;
                let right = self.store_node(None, &Node::Interior {
                    keys: right_keys,
                    children: right_children,
                })?;
                Ok(InsertOutcome::Split(left, sep_up, right))
            }
        }
    }

    fn delete_rec(&mut self, page_id: PageId, key: &[u8]) -> StoreResult<(PageId, bool, bool)> {
        match load_node(self.cache, page_id)? {
            Node::Leaf { mut entries } => {
                let Ok(i) = entries.binary_search_by(|e| e.key.as_slice().cmp(key)) else {
                    return Ok((page_id, false, false));
                };
                let removed = entries.remove(i);
                self.free_value(&removed.value)?;
                let node = Node::Leaf { entries };
                let underflow = self.limits.underflows(&node);
                Ok((self.store_node(Some(page_id), &node)?, true, underflow))
            }
            Node::Interior {
                mut keys,
                mut children,
            } => {
                let idx = keys.partition_point(|k| k.as_slice() <= key);
                let (child, removed, child_underflow) = self.delete_rec(children[idx], key)?;
                if !removed {
                    return Ok((page_id, false, false));
                }
                children[idx] = child;

                if child_underflow {
                    self.rebalance_child(&mut keys, &mut children, idx)?;
                }

                let node = Node::Interior { keys, children };
                let underflow = self.limits.underflows(&node);
                Ok((self.store_node(Some(page_id), &node)?, true, underflow))
            }
        }
    }

    /// Restores the occupancy of `children[idx]` by borrowing from or
    /// merging with an adjacent sibling, updating separators in place.
    fn rebalance_child(
        &mut self,
        keys: &mut Vec<Vec<u8>>,
        children: &mut Vec<PageId>,
        idx: usize,
    ) -> StoreResult<()> {
        // Work against the left sibling when there is one, else the right.
        let (left_idx, right_idx) = if idx > 0 { (idx - 1, idx) } else { (idx, idx + 1) };
        let sep_idx = left_idx;

        let left_id = children[left_idx];
        let right_id = children[right_idx];
        let mut left = load_node(self.cache, left_id)?;
        let mut right = load_node(self.cache, right_id)?;

        let donor_is_left = idx > 0;
        let donor = if donor_is_left { &left } else { &right };

        if donor.entry_count() > self.limits.min_entries() {
            // Redistribute one entry through the separator.
            match (&mut left, &mut right) {
                (Node::Leaf { entries: le }, Node::Leaf { entries: re }) => {
                    if donor_is_left {
                        let moved = le.pop().expect("donor leaf is non-empty");
                        re.insert(0, moved);
                    } else {
                        let moved = re.remove(0);
                        le.push(moved);
                    }
                    keys[sep_idx] = re[0].key.clone();
                }
                (
                    Node::Interior {
                        keys: lk,
                        children: lc,
                    },
                    Node::Interior {
                        keys: rk,
                        children: rc,
                    },
                ) => {
                    if donor_is_left {
                        let sep = std::mem::replace(
                            &mut keys[sep_idx],
                            lk.pop().expect("donor has a key"),
                        );
                        rk.insert(0, sep);
                        rc.insert(0, lc.pop().expect("donor has a child"));
                    } else {
                        let sep = std::mem::replace(&mut keys[sep_idx], rk.remove(0));
                        lk.push(sep);
                        lc.push(rc.remove(0));
                    }
                }
                _ => return Err(corruption(right_id, "sibling node kinds differ")),
            }
            children[left_idx] = self.store_node(Some(left_id), &left)?;
            children[right_idx] = self.store_node(Some(right_id), &right)?;
            return Ok(());
        }

        // Merge right into left.
        let merged = match (left, right) {
            (Node::Leaf { entries: mut le }, Node::Leaf { entries: re }) => {
                le.extend(re);
                Node::Leaf { entries: le }
            }
            (
                Node::Interior {
                    keys: mut lk,
                    children: mut lc,
                },
                Node::Interior {
                    keys: rk,
                    children: rc,
                },
            ) => {
                lk.push(keys[sep_idx].clone());
                lk.extend(rk);
                lc.extend(rc);
                Node::Interior {
                    keys: lk,
                    children: lc,
                }
            }
            _ => return Err(corruption(right_id, "sibling node kinds differ")),
        };

        if self.limits.overflows(&merged) {
            // Byte-governed nodes may be unmergeable with no surplus entry to
            // borrow; leaving the child slightly underfull is harmless.
            return Ok(());
        }

        keys.remove(sep_idx);
        children.remove(right_idx);
        self.free_page(right_id);
        children[left_idx] = self.store_node(Some(left_id), &merged)?;
        Ok(())
    }

    /// Writes a node image, copy-on-write: committed pages are superseded by
    /// a fresh page, pages this transaction allocated are rewritten in place.
    fn store_node(&mut self, old: Option<PageId>, node: &Node) -> StoreResult<PageId> {
        let page_id = match old {
            Some(p) if self.state.owned.contains(&p) => p,
            other => {
                if let Some(p) = other {
                    self.state.freed.push(p);
                }
                self.allocate()
            }
        };
        let image = node.encode(page_id, self.limits.page_size)?;
        self.cache.put_page(page_id, image)?;
        Ok(page_id)
    }

    fn allocate(&mut self) -> PageId {
        let page_id = self.state.alloc.allocate();
        self.state.owned.insert(page_id);
        page_id
    }

    fn free_page(&mut self, page_id: PageId) {
        if self.state.owned.remove(&page_id) {
            // Never committed: the frame can be dropped and the number
            // recycled within this transaction.
            self.cache.discard([page_id]);
            self.state.alloc.pool.push(FreeEntry {
                page: page_id,
                freed_seq: 0,
            });
        } else {
            self.state.freed.push(page_id);
        }
    }

    /// Stores a value inline or spills it to an overflow chain.
    fn write_value(&mut self, value: &[u8]) -> StoreResult<ValueRef> {
        if value.len() <= self.limits.inline_value_limit() {
            return Ok(ValueRef::Inline(value.to_vec()));
        }

        // Build the chain back to front so each link knows its successor.
        let chunk_len = self.limits.overflow_chunk_len();
        let mut next = None;
        for chunk in value.chunks(chunk_len).rev() {
            let page_id = self.allocate();
            let link = OverflowPage {
                next,
                chunk: chunk.to_vec(),
            };
            let image = link.encode(page_id, self.limits.page_size)?;
            self.cache.put_page(page_id, image)?;
            next = Some(page_id);
        }
        Ok(ValueRef::Overflow {
            head: next.expect("non-empty overflow value"),
            len: value.len() as u32,
        })
    }

    fn free_value(&mut self, value: &ValueRef) -> StoreResult<()> {
        if let ValueRef::Overflow { head, .. } = value {
            let mut next = Some(*head);
            while let Some(page_id) = next {
                let image = self.cache.fetch(page_id)?;
                next = OverflowPage::decode(page_id, &image)?.next;
                self.free_page(page_id);
            }
        }
        Ok(())
    }
}

fn entry_weight(entry: &LeafEntry) -> usize {
    let value_len = match &entry.value {
        ValueRef::Inline(v) => v.len(),
        ValueRef::Overflow { .. } => 8,
    };
    entry.key.len() + value_len + 20
}

/// Chooses the index of the first entry of the right half so that the two
/// halves carry roughly equal weight. Neither half is left empty.
fn split_point(weights: impl Iterator<Item = usize>, len: usize) -> usize {
    debug_assert!(len >= 2);
    let weights: Vec<usize> = weights.collect();
    let total: usize = weights.iter().sum();
    let mut acc = 0;
    for (i, w) in weights.iter().enumerate() {
        acc += w;
        if acc * 2 >= total {
            return (i + 1).clamp(1, len - 1);
        }
    }
    len / 2
}
