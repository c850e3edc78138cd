//! On-page B-tree node and overflow-page encodings.

use serde::{Deserialize, Serialize};

use crate::storage::disk::page_body_len;
use crate::storage::error::{corruption, StoreResult};
use crate::storage::page::{PageId, PageKind};

/// Where a leaf entry's value lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueRef {
    /// Value stored directly in the leaf.
    Inline(Vec<u8>),
    /// Value spilled to a chain of overflow pages.
    Overflow { head: PageId, len: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: ValueRef,
}

/// A B-tree node, bincode-encoded into one page.
///
/// Interior nodes keep `keys.len() + 1` children; `keys[i]` is the smallest
/// key reachable under `children[i + 1]`. Keys compare bytewise unsigned,
/// which `Vec<u8>`'s `Ord` already is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf { entries: Vec<LeafEntry> },
    Interior {
        keys: Vec<Vec<u8>>,
        children: Vec<PageId>,
    },
}

impl Node {
    pub fn empty_leaf() -> Self {
        Node::Leaf {
            entries: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    /// Occupancy measure: leaf entries, or interior separator keys.
    pub fn entry_count(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Interior { keys, .. } => keys.len(),
        }
    }

    fn kind(&self) -> PageKind {
        if self.is_leaf() {
            PageKind::Leaf
        } else {
            PageKind::Interior
        }
    }

    pub fn encoded_len(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(usize::MAX)
    }

    /// Encodes into a full page image (kind tag + body; trailer zeroed).
    pub fn encode(&self, page_id: PageId, page_size: usize) -> StoreResult<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| corruption(page_id, format!("node encode: {e}")))?;
        if 1 + body.len() > page_body_len(page_size) {
            return Err(corruption(page_id, "node exceeds page body"));
        }
        let mut page = vec![0u8; page_size];
        page[0] = self.kind().tag();
        page[1..1 + body.len()].copy_from_slice(&body);
        Ok(page)
    }

    pub fn decode(page_id: PageId, page: &[u8]) -> StoreResult<Node> {
        match PageKind::from_tag(page[0]) {
            Some(PageKind::Leaf) | Some(PageKind::Interior) => {}
            other => {
                return Err(corruption(
                    page_id,
                    format!("expected a node page, found {other:?}"),
                ))
            }
        }
        let node: Node = bincode::deserialize(&page[1..])
            .map_err(|e| corruption(page_id, format!("node decode: {e}")))?;
        if node.kind().tag() != page[0] {
            return Err(corruption(page_id, "node kind does not match page tag"));
        }
        Ok(node)
    }
}

/// One link of an overflow-value chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverflowPage {
    pub next: Option<PageId>,
    pub chunk: Vec<u8>,
}

impl OverflowPage {
    pub fn encode(&self, page_id: PageId, page_size: usize) -> StoreResult<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| corruption(page_id, format!("overflow encode: {e}")))?;
        if 1 + body.len() > page_body_len(page_size) {
            return Err(corruption(page_id, "overflow chunk exceeds page body"));
        }
        let mut page = vec![0u8; page_size];
        page[0] = PageKind::Overflow.tag();
        page[1..1 + body.len()].copy_from_slice(&body);
        Ok(page)
    }

    pub fn decode(page_id: PageId, page: &[u8]) -> StoreResult<OverflowPage> {
        if PageKind::from_tag(page[0]) != Some(PageKind::Overflow) {
            return Err(corruption(page_id, "expected an overflow page"));
        }
        bincode::deserialize(&page[1..])
            .map_err(|e| corruption(page_id, format!("overflow decode: {e}")))
    }
}

/// Sizing rules derived from the page size and the configured fanout.
#[derive(Debug, Clone, Copy)]
pub struct NodeLimits {
    pub page_size: usize,
    /// Maximum leaf entries / interior separator keys per node.
    pub max_entries: usize,
}

impl NodeLimits {
    pub fn new(page_size: usize, branch_factor: usize) -> Self {
        Self {
            page_size,
            max_entries: branch_factor,
        }
    }

    /// Bytes available for an encoded node body.
    pub fn body_budget(&self) -> usize {
        page_body_len(self.page_size) - 1
    }

    /// Minimum occupancy for non-root nodes.
    pub fn min_entries(&self) -> usize {
        self.max_entries / 2
    }

    /// Keys longer than this are rejected outright. Sized so that even a
    /// two-entry node always fits its page.
    pub fn max_key_len(&self) -> usize {
        self.body_budget() / 16
    }

    /// Values longer than this move to an overflow chain.
    pub fn inline_value_limit(&self) -> usize {
        self.body_budget() / 8
    }

    /// Payload bytes per overflow page.
    pub fn overflow_chunk_len(&self) -> usize {
        self.body_budget() - 32
    }

    /// True if the node must split before it can be written out.
    pub fn overflows(&self, node: &Node) -> bool {
        node.entry_count() > self.max_entries || node.encoded_len() + 1 > self.body_budget()
    }

    /// True if a non-root node must borrow or merge.
    pub fn underflows(&self, node: &Node) -> bool {
        node.entry_count() < self.min_entries()
    }
}
