//! The in-memory tree of known block headers.
//!
//! Nodes live in an arena addressed by stable indices; parent and child
//! links are indices into it, which keeps deep chains free of ownership
//! cycles. All access goes through the single mutex the owning
//! [`crate::Chain`] wraps around the tree.

use std::collections::HashMap;

use btcd_consensus::constants::MEDIAN_TIME_SPAN;
use btcd_consensus::{bidx, hash_to_hex, Hash256};
use btcd_primitives::block::HEADER_LEN;
use btcd_primitives::hash::sha256d;

pub type NodeId = usize;

#[derive(Clone, Debug)]
pub struct TreeNode {
    pub hash: Hash256,
    pub height: u32,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub header: [u8; HEADER_LEN],
    /// Zero while only the header is known; set once the body commits.
    pub block_size: u32,
    pub tx_count: u32,
    pub sigops: u32,
}

impl TreeNode {
    pub fn version(&self) -> u32 {
        u32::from_le_bytes([self.header[0], self.header[1], self.header[2], self.header[3]])
    }

    pub fn prev_hash(&self) -> Hash256 {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.header[4..36]);
        out
    }

    pub fn time(&self) -> u32 {
        u32::from_le_bytes([
            self.header[68],
            self.header[69],
            self.header[70],
            self.header[71],
        ])
    }

    pub fn bits(&self) -> u32 {
        u32::from_le_bytes([
            self.header[72],
            self.header[73],
            self.header[74],
            self.header[75],
        ])
    }

    pub fn has_body(&self) -> bool {
        self.block_size > 0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderLink {
    Added(NodeId),
    Duplicate(NodeId),
    /// The parent is not in the index; the caller re-requests headers.
    Orphan,
}

pub struct BlockTree {
    slots: Vec<Option<TreeNode>>,
    free: Vec<NodeId>,
    index: HashMap<u64, NodeId>,
    root: NodeId,
}

impl BlockTree {
    /// Builds a tree containing just the genesis header.
    pub fn new(header: [u8; HEADER_LEN]) -> Self {
        let hash = sha256d(&header);
        let node = TreeNode {
            hash,
            height: 0,
            parent: None,
            children: Vec::new(),
            header,
            block_size: 0,
            tx_count: 0,
            sigops: 0,
        };
        let mut index = HashMap::new();
        index.insert(bidx(&hash), 0);
        Self {
            slots: vec![Some(node)],
            free: Vec::new(),
            index,
            root: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, hash: &Hash256) -> Option<NodeId> {
        self.index.get(&bidx(hash)).copied()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.get(hash).is_some()
    }

    /// Panics on a dead or out-of-range id; holding a stale `NodeId`
    /// across a `delete_branch` is a programming error.
    pub fn node(&self, id: NodeId) -> &TreeNode {
        self.slots[id].as_ref().expect("live tree node")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        self.slots[id].as_mut().expect("live tree node")
    }

    /// Links a header under its parent. Orphans are not stored.
    pub fn add_header(&mut self, header: [u8; HEADER_LEN]) -> HeaderLink {
        let hash = sha256d(&header);
        if let Some(existing) = self.get(&hash) {
            return HeaderLink::Duplicate(existing);
        }
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&header[4..36]);
        let Some(parent) = self.get(&prev) else {
            return HeaderLink::Orphan;
        };
        let height = self.node(parent).height + 1;
        let node = TreeNode {
            hash,
            height,
            parent: Some(parent),
            children: Vec::new(),
            header,
            block_size: 0,
            tx_count: 0,
            sigops: 0,
        };
        let id = self.insert_slot(node);
        self.index.insert(bidx(&hash), id);
        self.node_mut(parent).children.push(id);
        HeaderLink::Added(id)
    }

    fn insert_slot(&mut self, node: TreeNode) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.slots[id] = Some(node);
            id
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        }
    }

    /// Tip of the longest branch rooted at `from`; ties resolve to the
    /// earliest-inserted sibling. Breadth-first, so the first node seen
    /// at the maximal height is the first-seen one.
    pub fn find_farthest(&self, from: NodeId) -> NodeId {
        let mut best = from;
        let mut best_height = self.node(from).height;
        let mut queue = std::collections::VecDeque::from([from]);
        while let Some(id) = queue.pop_front() {
            let node = self.node(id);
            if node.height > best_height {
                best = id;
                best_height = node.height;
            }
            for child in &node.children {
                queue.push_back(*child);
            }
        }
        best
    }

    /// The next node on the path from `from` down to `end`.
    ///
    /// Panics when `end` is not strictly below a descendant path of
    /// `from`; callers must have verified ancestry.
    pub fn find_path_to(&self, from: NodeId, end: NodeId) -> Option<NodeId> {
        if from == end {
            return None;
        }
        let from_node = self.node(from);
        assert!(
            self.node(end).height > from_node.height,
            "find_path_to: end block {} is not higher than current",
            hash_to_hex(&self.node(end).hash)
        );
        assert!(
            !from_node.children.is_empty(),
            "find_path_to: unknown path to block {}",
            hash_to_hex(&self.node(end).hash)
        );
        if from_node.children.len() == 1 {
            return Some(from_node.children[0]);
        }
        // more than one child: walk up from the destination instead
        let mut cur = end;
        loop {
            let parent = self
                .node(cur)
                .parent
                .expect("find_path_to: destination not descended from start");
            if parent == from {
                return Some(cur);
            }
            cur = parent;
        }
    }

    /// Deepest node that is an ancestor of both arguments.
    pub fn first_common_parent(&self, a: NodeId, b: NodeId) -> NodeId {
        let mut a = a;
        let mut b = b;
        while self.node(a).height > self.node(b).height {
            a = self.node(a).parent.expect("walk above root");
        }
        while self.node(b).height > self.node(a).height {
            b = self.node(b).parent.expect("walk above root");
        }
        while a != b {
            a = self.node(a).parent.expect("forked below root");
            b = self.node(b).parent.expect("forked below root");
        }
        a
    }

    /// Detaches `id` from its parent and drops it with every descendant,
    /// returning the removed hashes so the caller can mark the stored
    /// blocks invalid. Iterative on purpose: a deep branch must not
    /// recurse.
    pub fn delete_branch(&mut self, id: NodeId) -> Vec<Hash256> {
        assert!(id != self.root, "cannot delete the tree root");
        if let Some(parent) = self.node(id).parent {
            self.node_mut(parent).children.retain(|child| *child != id);
        }
        let mut removed = Vec::new();
        let mut worklist = vec![id];
        while let Some(cur) = worklist.pop() {
            let node = self.slots[cur].take().expect("live tree node");
            self.index.remove(&bidx(&node.hash));
            self.free.push(cur);
            removed.push(node.hash);
            worklist.extend(node.children);
        }
        removed
    }

    /// Median timestamp of the node and up to ten ancestors.
    pub fn median_time_past(&self, id: NodeId) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cur = Some(id);
        while let Some(node_id) = cur {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = self.node(node_id);
            times.push(node.time());
            cur = node.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Walks parents until the requested height.
    pub fn ancestor(&self, id: NodeId, height: u32) -> Option<NodeId> {
        let mut cur = id;
        loop {
            let node = self.node(cur);
            if node.height == height {
                return Some(cur);
            }
            if node.height < height {
                return None;
            }
            cur = node.parent?;
        }
    }

    /// Live node ids, root included, no particular order.
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.index.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcd_primitives::block::BlockHeader;

    fn header(prev: Hash256, time: u32, tag: u32) -> [u8; HEADER_LEN] {
        BlockHeader {
            version: 2,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time,
            bits: 0x207f_ffff,
            nonce: tag,
        }
        .consensus_encode()
    }

    fn extend(tree: &mut BlockTree, parent: NodeId, time: u32, tag: u32) -> NodeId {
        let parent_hash = tree.node(parent).hash;
        match tree.add_header(header(parent_hash, time, tag)) {
            HeaderLink::Added(id) => id,
            other => panic!("unexpected link outcome {other:?}"),
        }
    }

    fn genesis_tree() -> BlockTree {
        BlockTree::new(header([0u8; 32], 1_000_000, 0))
    }

    #[test]
    fn heights_follow_parents() {
        let mut tree = genesis_tree();
        let root = tree.root();
        let a = extend(&mut tree, root, 1_000_010, 1);
        let b = extend(&mut tree, a, 1_000_020, 2);
        assert_eq!(tree.node(a).height, 1);
        assert_eq!(tree.node(b).height, 2);
        assert_eq!(tree.node(b).parent, Some(a));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn duplicates_and_orphans() {
        let mut tree = genesis_tree();
        let root_hash = tree.node(tree.root()).hash;
        let raw = header(root_hash, 1_000_010, 1);
        let a = tree.add_header(raw);
        assert!(matches!(a, HeaderLink::Added(_)));
        assert!(matches!(tree.add_header(raw), HeaderLink::Duplicate(_)));
        assert_eq!(
            tree.add_header(header([9u8; 32], 1_000_020, 2)),
            HeaderLink::Orphan
        );
    }

    #[test]
    fn farthest_prefers_longer_then_first_seen() {
        let mut tree = genesis_tree();
        let root = tree.root();
        let a1 = extend(&mut tree, root, 10, 1);
        let b1 = extend(&mut tree, root, 10, 2);
        assert_eq!(tree.find_farthest(tree.root()), a1);

        // branch b grows past a
        let b2 = extend(&mut tree, b1, 20, 3);
        assert_eq!(tree.find_farthest(tree.root()), b2);

        // equal depth again: a was inserted first, so its tip wins
        let a2 = extend(&mut tree, a1, 20, 4);
        assert_eq!(tree.find_farthest(tree.root()), a2);
    }

    #[test]
    fn path_finding_and_common_parent() {
        let mut tree = genesis_tree();
        let root = tree.root();
        let a1 = extend(&mut tree, root, 10, 1);
        let a2 = extend(&mut tree, a1, 20, 2);
        let b1 = extend(&mut tree, a1, 20, 3);
        let b2 = extend(&mut tree, b1, 30, 4);

        assert_eq!(tree.find_path_to(tree.root(), a2), Some(a1));
        assert_eq!(tree.find_path_to(a1, b2), Some(b1));
        assert_eq!(tree.find_path_to(b1, b2), Some(b2));
        assert_eq!(tree.find_path_to(b2, b2), None);

        assert_eq!(tree.first_common_parent(a2, b2), a1);
        assert_eq!(tree.first_common_parent(a2, a1), a1);
    }

    #[test]
    fn delete_branch_removes_descendants() {
        let mut tree = genesis_tree();
        let root = tree.root();
        let a1 = extend(&mut tree, root, 10, 1);
        let a2 = extend(&mut tree, a1, 20, 2);
        let a3 = extend(&mut tree, a2, 30, 3);
        let keep = extend(&mut tree, root, 10, 4);

        let a2_hash = tree.node(a2).hash;
        let removed = tree.delete_branch(a2);
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&a2_hash));
        assert!(!tree.contains(&a2_hash));
        assert_eq!(tree.node(a1).children.len(), 0);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.find_farthest(tree.root()), a1);
        let _ = a3;
        let _ = keep;
    }

    #[test]
    fn median_time_past_is_middle_element() {
        let mut tree = genesis_tree();
        let mut cur = tree.root();
        // genesis at t=1_000_000, then 12 blocks with increasing times
        for i in 1..=12u32 {
            cur = extend(&mut tree, cur, 1_000_000 + i * 10, i);
        }
        // the window is the last 11 blocks: times 1_000_020..=1_000_120
        assert_eq!(tree.median_time_past(cur), 1_000_070);

        // near the root the window shrinks
        let second = tree.ancestor(cur, 1).unwrap();
        assert_eq!(tree.median_time_past(second), 1_000_010);
    }

    #[test]
    fn slot_reuse_after_delete() {
        let mut tree = genesis_tree();
        let root = tree.root();
        let a = extend(&mut tree, root, 10, 1);
        tree.delete_branch(a);
        let b = extend(&mut tree, root, 20, 2);
        assert_eq!(a, b, "freed slot is reused");
        assert_eq!(tree.len(), 2);
    }
}
