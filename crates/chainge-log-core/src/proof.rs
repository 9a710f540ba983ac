//! Proof requests and proofs.
//!
//! A proof carries two independent parts:
//!
//! - an **upgrade**, proving the sender's signed head and linking it to a
//!   tree of `start` blocks the receiver already holds;
//! - a **block** part, the audit path from one leaf up to a node the receiver
//!   already trusts.
//!
//! Proofs are built by [`MerkleTree::proof`] and checked by
//! [`MerkleTree::verify`](crate::tree::MerkleTree).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::Ed25519Signature;
use crate::error::{CoreError, Result};
use crate::flat;
use crate::node::Node;
use crate::tree::MerkleTree;

/// What a receiver asks a sender to prove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProofRequest {
    pub block: Option<BlockRequest>,
    pub upgrade: Option<UpgradeRequest>,
}

impl ProofRequest {
    /// Request a block audit path.
    pub fn block(index: u64, nodes: u32, value: bool) -> Self {
        Self {
            block: Some(BlockRequest {
                index,
                nodes,
                value,
            }),
            upgrade: None,
        }
    }

    /// Request an upgrade from a tree of `start` blocks.
    pub fn upgrade(start: u64, length: u64) -> Self {
        Self {
            block: None,
            upgrade: Some(UpgradeRequest { start, length }),
        }
    }

    /// Add an upgrade to this request.
    pub fn with_upgrade(mut self, start: u64, length: u64) -> Self {
        self.upgrade = Some(UpgradeRequest { start, length });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    pub index: u64,
    /// Maximum co-path nodes to include; 0 means the full path to the root.
    pub nodes: u32,
    /// Whether the block bytes should be carried.
    pub value: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub start: u64,
    pub length: u64,
}

/// A proof produced by a sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub fork: u64,
    pub block: Option<BlockProof>,
    pub upgrade: Option<UpgradeProof>,
}

impl Proof {
    /// Encode as CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CoreError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::Decoding(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProof {
    pub index: u64,
    /// Block bytes, filled in by whoever holds them.
    pub value: Option<Bytes>,
    /// The leaf (only when `value` is absent) followed by co-path siblings.
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeProof {
    pub start: u64,
    /// Length of the signed head.
    pub length: u64,
    /// Full roots of the signed head.
    pub roots: Vec<Node>,
    /// Right-hand siblings linking the last root of `start` to its head root.
    pub nodes: Vec<Node>,
    pub signature: Ed25519Signature,
}

impl MerkleTree {
    /// Build a proof for `request` against the current head.
    ///
    /// The block value is never filled here; it lives in block storage.
    pub fn proof(&self, request: &ProofRequest) -> Result<Proof> {
        let upgrade = request
            .upgrade
            .map(|u| self.upgrade_proof(u))
            .transpose()?;
        let block = request.block.map(|b| self.block_proof(b)).transpose()?;

        Ok(Proof {
            fork: self.fork(),
            block,
            upgrade,
        })
    }

    fn upgrade_proof(&self, request: UpgradeRequest) -> Result<UpgradeProof> {
        let end = request
            .start
            .checked_add(request.length)
            .ok_or(CoreError::OutOfRange {
                index: u64::MAX,
                length: self.length(),
            })?;
        if end > self.length() {
            return Err(CoreError::OutOfRange {
                index: end,
                length: self.length(),
            });
        }

        let mut nodes = Vec::new();
        if let Some(&last) = flat::full_roots(request.start).last() {
            let head = self.covering_root(flat::right_span(last) / 2)?;
            let mut cur = last;
            while cur != head {
                if flat::is_left(cur) {
                    nodes.push(*self.node(flat::sibling(cur))?);
                }
                cur = flat::parent(cur);
            }
        }

        Ok(UpgradeProof {
            start: request.start,
            length: self.length(),
            roots: self.roots().to_vec(),
            nodes,
            signature: self.signature(),
        })
    }

    fn block_proof(&self, request: BlockRequest) -> Result<BlockProof> {
        self.check_block(request.index)?;

        let leaf = flat::leaf(request.index);
        let head = self.covering_root(request.index)?;
        let limit = match request.nodes {
            0 => u64::MAX,
            n => u64::from(n),
        };

        let mut nodes = Vec::new();
        if !request.value {
            nodes.push(*self.node(leaf)?);
        }

        let mut cur = leaf;
        let mut count = 0;
        while cur != head && count < limit {
            nodes.push(*self.node(flat::sibling(cur))?);
            cur = flat::parent(cur);
            count += 1;
        }

        Ok(BlockProof {
            index: request.index,
            value: None,
            nodes,
        })
    }

    fn covering_root(&self, block: u64) -> Result<u64> {
        let roots: Vec<u64> = self.roots().iter().map(|r| r.index).collect();
        flat::covering_root(&roots, block).ok_or(CoreError::OutOfRange {
            index: block,
            length: self.length(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn writer(blocks: &[&[u8]]) -> MerkleTree {
        let keypair = Keypair::from_seed(&[3u8; 32]);
        let mut tree = MerkleTree::new();
        let mut cs = tree.append(blocks);
        cs.sign(&keypair);
        tree.commit(cs);
        tree
    }

    #[test]
    fn test_upgrade_from_zero_carries_roots_only() {
        let tree = writer(&[b"a", b"b", b"c"]);
        let proof = tree.proof(&ProofRequest::upgrade(0, 3)).unwrap();
        let upgrade = proof.upgrade.unwrap();
        assert_eq!(upgrade.length, 3);
        assert_eq!(upgrade.roots.len(), 2);
        assert!(upgrade.nodes.is_empty());
    }

    #[test]
    fn test_upgrade_links_from_start() {
        let tree = writer(&[b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"h"]);
        let proof = tree.proof(&ProofRequest::upgrade(5, 3)).unwrap();
        let indices: Vec<u64> = proof.upgrade.unwrap().nodes.iter().map(|n| n.index).collect();
        assert_eq!(indices, vec![10, 13]);
    }

    #[test]
    fn test_upgrade_targets_head() {
        let tree = writer(&[b"a", b"b", b"c", b"d"]);
        let proof = tree.proof(&ProofRequest::upgrade(0, 2)).unwrap();
        assert_eq!(proof.upgrade.unwrap().length, 4);
    }

    #[test]
    fn test_upgrade_out_of_range() {
        let tree = writer(&[b"a", b"b"]);
        assert!(matches!(
            tree.proof(&ProofRequest::upgrade(1, 2)),
            Err(CoreError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_block_full_path() {
        let tree = writer(&[b"a", b"b", b"c", b"d"]);
        let proof = tree.proof(&ProofRequest::block(1, 0, true)).unwrap();
        let block = proof.block.unwrap();
        let indices: Vec<u64> = block.nodes.iter().map(|n| n.index).collect();
        assert_eq!(indices, vec![0, 5]);
        assert!(block.value.is_none());
    }

    #[test]
    fn test_block_limited_path_with_leaf() {
        let tree = writer(&[b"a", b"b", b"c", b"d"]);
        let proof = tree.proof(&ProofRequest::block(3, 1, false)).unwrap();
        let indices: Vec<u64> = proof.block.unwrap().nodes.iter().map(|n| n.index).collect();
        assert_eq!(indices, vec![6, 4]);
    }

    #[test]
    fn test_block_out_of_range() {
        let tree = writer(&[b"a"]);
        assert!(tree.proof(&ProofRequest::block(1, 0, true)).is_err());
    }

    #[test]
    fn test_proof_cbor_roundtrip() {
        let tree = writer(&[b"a", b"b", b"c"]);
        let mut proof = tree
            .proof(&ProofRequest::block(2, 0, true).with_upgrade(0, 3))
            .unwrap();
        if let Some(block) = proof.block.as_mut() {
            block.value = Some(Bytes::from_static(b"c"));
        }
        let bytes = proof.to_bytes().unwrap();
        assert_eq!(Proof::from_bytes(&bytes).unwrap(), proof);
    }
}
