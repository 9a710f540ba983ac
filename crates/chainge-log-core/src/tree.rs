//! The signed, append-only Merkle tree.
//!
//! ## Overview
//!
//! [`MerkleTree`] holds the nodes a chain has authenticated, the full roots of
//! its current head, and the signed summary `(length, byte_length, fork)`.
//! A writer holds every node; a replica holds only what proofs have given it.
//!
//! Mutations never touch the tree directly. Every operation computes a
//! [`TreeChangeset`] that the caller persists first and then hands back to
//! [`MerkleTree::commit`], so a failed write leaves the tree untouched.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::{signable, Blake3Hash, Ed25519Signature, Signer};
use crate::error::{CoreError, Result};
use crate::flat;
use crate::node::{byte_length, root_hash, Node};

/// Status bit: the committed length grew.
pub const STATUS_APPENDED: u8 = 0b01;

/// Status bit: previously committed blocks were invalidated.
pub const STATUS_TRUNCATED: u8 = 0b10;

/// Signed summary of a tree head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeState {
    pub length: u64,
    pub byte_length: u64,
    pub fork: u64,
    pub root_hash: Blake3Hash,
    pub signature: Ed25519Signature,
}

impl TreeState {
    /// State of a tree with no blocks, never signed.
    pub fn empty() -> Self {
        Self {
            length: 0,
            byte_length: 0,
            fork: 0,
            root_hash: root_hash(&[]),
            signature: Ed25519Signature::ZERO,
        }
    }

    /// The message the signature covers.
    pub fn signable(&self) -> Vec<u8> {
        signable(&self.root_hash, self.length, self.fork)
    }
}

impl Default for TreeState {
    fn default() -> Self {
        Self::empty()
    }
}

/// Range of blocks affected by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UpdateRange {
    /// True when the range was invalidated rather than added.
    pub drop: bool,
    pub start: u64,
    pub length: u64,
}

/// A block whose content was proven against the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedBlock {
    pub index: u64,
    /// The block bytes, when the proof carried them.
    pub value: Option<Bytes>,
}

/// A computed but not yet applied change to a [`MerkleTree`].
#[derive(Debug, Clone)]
pub struct TreeChangeset {
    pub from_length: u64,
    pub from_fork: u64,

    /// Length of the prefix of the old tree that survives.
    pub ancestors: u64,

    pub length: u64,
    pub byte_length: u64,
    pub fork: u64,
    pub roots: Vec<Node>,
    pub signature: Ed25519Signature,

    /// Nodes to persist.
    pub nodes: Vec<Node>,

    /// Indices of held nodes that no longer belong to the tree.
    pub dropped: Vec<u64>,

    pub block: Option<VerifiedBlock>,
}

impl TreeChangeset {
    pub(crate) fn unchanged(tree: &MerkleTree) -> Self {
        Self {
            from_length: tree.length,
            from_fork: tree.fork,
            ancestors: tree.length,
            length: tree.length,
            byte_length: tree.byte_length,
            fork: tree.fork,
            roots: tree.roots.clone(),
            signature: tree.signature,
            nodes: Vec::new(),
            dropped: Vec::new(),
            block: None,
        }
    }

    pub fn root_hash(&self) -> Blake3Hash {
        root_hash(&self.roots)
    }

    /// The message a signer must sign for the new head.
    pub fn signable(&self) -> Vec<u8> {
        signable(&self.root_hash(), self.length, self.fork)
    }

    /// Sign the new head.
    pub fn sign(&mut self, signer: &dyn Signer) {
        self.signature = signer.sign(&self.signable());
    }

    /// Summary of the head after this change.
    pub fn state(&self) -> TreeState {
        TreeState {
            length: self.length,
            byte_length: self.byte_length,
            fork: self.fork,
            root_hash: self.root_hash(),
            signature: self.signature,
        }
    }

    /// True if the head changes.
    pub fn upgraded(&self) -> bool {
        self.length != self.from_length
            || self.fork != self.from_fork
            || self.ancestors < self.from_length
    }

    /// True if previously committed blocks are invalidated.
    pub fn truncated(&self) -> bool {
        self.ancestors < self.from_length
    }

    /// Two-bit update status.
    ///
    /// Bit 0 is set when blocks were added past the surviving prefix, bit 1
    /// when part of the old tree was dropped.
    pub fn status(&self) -> u8 {
        let mut status = 0;
        if self.length > self.ancestors {
            status |= STATUS_APPENDED;
        }
        if self.truncated() {
            status |= STATUS_TRUNCATED;
        }
        status
    }

    /// The net affected range, if anything is reported.
    ///
    /// A drop takes precedence over a verified block, which takes precedence
    /// over plain growth.
    pub fn range(&self) -> Option<UpdateRange> {
        if self.truncated() {
            return Some(UpdateRange {
                drop: true,
                start: self.ancestors,
                length: self.from_length - self.ancestors,
            });
        }
        if let Some(VerifiedBlock {
            index,
            value: Some(_),
        }) = &self.block
        {
            return Some(UpdateRange {
                drop: false,
                start: *index,
                length: 1,
            });
        }
        if self.length > self.from_length {
            return Some(UpdateRange {
                drop: false,
                start: self.from_length,
                length: self.length - self.from_length,
            });
        }
        None
    }
}

/// Sparse Merkle tree over a chain's blocks.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    nodes: BTreeMap<u64, Node>,
    roots: Vec<Node>,
    length: u64,
    byte_length: u64,
    fork: u64,
    signature: Ed25519Signature,
}

impl Default for MerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MerkleTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            roots: Vec::new(),
            length: 0,
            byte_length: 0,
            fork: 0,
            signature: Ed25519Signature::ZERO,
        }
    }

    /// Rebuild a tree from a persisted state and its stored nodes.
    ///
    /// Nodes not complete within the persisted length are left over from an
    /// interrupted write and are ignored.
    pub fn open(state: &TreeState, nodes: impl IntoIterator<Item = Node>) -> Result<Self> {
        if state.length > flat::MAX_LENGTH {
            return Err(CoreError::Decoding(format!(
                "stored length {} is out of bounds",
                state.length
            )));
        }

        let nodes: BTreeMap<u64, Node> = nodes
            .into_iter()
            .filter(|n| flat::is_complete(n.index, state.length))
            .map(|n| (n.index, n))
            .collect();

        let roots = flat::full_roots(state.length)
            .into_iter()
            .map(|index| nodes.get(&index).copied().ok_or(CoreError::MissingNode(index)))
            .collect::<Result<Vec<_>>>()?;

        if root_hash(&roots) != state.root_hash {
            return Err(CoreError::Decoding(
                "stored roots do not match the tree state".into(),
            ));
        }

        let byte_length = byte_length(&roots)
            .map_err(|_| CoreError::Decoding("stored root sizes overflow".into()))?;
        if byte_length != state.byte_length {
            return Err(CoreError::Decoding(format!(
                "stored byte length {} does not match roots ({byte_length})",
                state.byte_length
            )));
        }

        Ok(Self {
            nodes,
            roots,
            length: state.length,
            byte_length,
            fork: state.fork,
            signature: state.signature,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    pub fn fork(&self) -> u64 {
        self.fork
    }

    pub fn signature(&self) -> Ed25519Signature {
        self.signature
    }

    /// Full roots of the current head, left to right.
    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    pub fn root_hash(&self) -> Blake3Hash {
        root_hash(&self.roots)
    }

    pub fn state(&self) -> TreeState {
        TreeState {
            length: self.length,
            byte_length: self.byte_length,
            fork: self.fork,
            root_hash: self.root_hash(),
            signature: self.signature,
        }
    }

    /// The node at `index`, if held.
    pub fn get(&self, index: u64) -> Option<&Node> {
        self.nodes.get(&index)
    }

    /// The node at `index`, or [`CoreError::MissingNode`].
    pub fn node(&self, index: u64) -> Result<&Node> {
        self.nodes.get(&index).ok_or(CoreError::MissingNode(index))
    }

    /// Number of nodes held.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Byte length of block `block`.
    pub fn block_size(&self, block: u64) -> Result<u64> {
        self.check_block(block)?;
        Ok(self.node(flat::leaf(block))?.size)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Root hash the tree had when it was `length` blocks long.
    pub fn tree_hash(&self, length: u64) -> Result<Blake3Hash> {
        if length > self.length {
            return Err(CoreError::OutOfRange {
                index: length,
                length: self.length,
            });
        }
        Ok(root_hash(&self.roots_at(length)?))
    }

    /// Number of nodes a block proof must carry to link tree index `index`
    /// to a node this tree already holds.
    ///
    /// Returns 0 when `index` is not inside the current tree.
    pub fn missing_nodes(&self, index: u64) -> u64 {
        if flat::right_span(index) >= flat::leaf(self.length) {
            return 0;
        }

        // The covering root is always held, so the walk terminates.
        let mut count = 0;
        let mut cur = index;
        while !self.nodes.contains_key(&cur) {
            count += 1;
            cur = flat::parent(cur);
        }
        count
    }

    /// Byte offset of block `block` within the chain.
    pub fn byte_offset(&self, block: u64) -> Result<u64> {
        self.check_block(block)?;

        let target = flat::leaf(block);
        let mut offset = 0;

        for root in &self.roots {
            if flat::right_span(root.index) < target {
                offset += root.size;
                continue;
            }

            let mut cur = root.index;
            while let Some((left, right)) = flat::children(cur) {
                if target >= flat::left_span(right) {
                    offset += self.node(left)?.size;
                    cur = right;
                } else {
                    cur = left;
                }
            }
            return Ok(offset);
        }

        Err(CoreError::OutOfRange {
            index: block,
            length: self.length,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Compute the change that appends `blocks`.
    ///
    /// The returned changeset is unsigned.
    pub fn append<B: AsRef<[u8]>>(&self, blocks: &[B]) -> TreeChangeset {
        let mut cs = TreeChangeset::unchanged(self);

        for block in blocks {
            let leaf = Node::leaf(cs.length, block.as_ref());
            cs.length += 1;
            cs.byte_length += leaf.size;
            cs.nodes.push(leaf);
            cs.roots.push(leaf);

            // Merge equal-depth roots into their parent.
            while cs.roots.len() > 1 {
                let n = cs.roots.len();
                let (left, right) = (cs.roots[n - 2], cs.roots[n - 1]);
                if flat::parent(left.index) != flat::parent(right.index) {
                    break;
                }
                let parent = Node::parent(&left, &right);
                cs.roots.truncate(n - 2);
                cs.roots.push(parent);
                cs.nodes.push(parent);
            }
        }

        cs
    }

    /// Compute the change that cuts the tree to `length` under `fork`.
    ///
    /// The returned changeset is unsigned.
    pub fn truncate(&self, length: u64, fork: u64) -> Result<TreeChangeset> {
        if length > self.length {
            return Err(CoreError::OutOfRange {
                index: length,
                length: self.length,
            });
        }

        let mut cs = TreeChangeset::unchanged(self);
        cs.roots = self.roots_at(length)?;
        cs.length = length;
        cs.byte_length = cs.roots.iter().map(|r| r.size).sum();
        cs.fork = fork;
        cs.ancestors = length;
        cs.dropped = self.dropped_beyond(length);
        Ok(cs)
    }

    /// Apply a changeset computed against this tree.
    pub fn commit(&mut self, cs: TreeChangeset) {
        debug_assert_eq!(cs.from_length, self.length);
        debug_assert_eq!(cs.from_fork, self.fork);

        for index in &cs.dropped {
            self.nodes.remove(index);
        }
        for node in cs.nodes.iter().chain(cs.roots.iter()) {
            self.nodes.insert(node.index, *node);
        }

        self.roots = cs.roots;
        self.length = cs.length;
        self.byte_length = cs.byte_length;
        self.fork = cs.fork;
        self.signature = cs.signature;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn check_block(&self, block: u64) -> Result<()> {
        if block >= self.length {
            return Err(CoreError::OutOfRange {
                index: block,
                length: self.length,
            });
        }
        Ok(())
    }

    pub(crate) fn roots_at(&self, length: u64) -> Result<Vec<Node>> {
        flat::full_roots(length)
            .into_iter()
            .map(|index| self.node(index).copied())
            .collect()
    }

    pub(crate) fn holds(&self, index: u64) -> bool {
        self.nodes.contains_key(&index)
    }

    /// Held nodes that are not complete within `ancestors` blocks.
    pub(crate) fn dropped_beyond(&self, ancestors: u64) -> Vec<u64> {
        let boundary = flat::leaf(ancestors);
        let mut dropped: Vec<u64> = self.nodes.range(boundary..).map(|(&i, _)| i).collect();

        // Parents straddling the boundary sit below it in index order.
        let mut cur = boundary;
        while flat::right_span(cur) < flat::leaf(self.length) {
            cur = flat::parent(cur);
            if flat::left_span(cur) < boundary && self.nodes.contains_key(&cur) {
                dropped.push(cur);
            }
        }

        dropped.sort_unstable();
        dropped.dedup();
        dropped
    }
}
