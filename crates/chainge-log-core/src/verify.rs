//! Proof verification and fork reconciliation.
//!
//! ## Overview
//!
//! [`MerkleTree::verify`] checks a peer's proof against the local tree and
//! classifies it:
//!
//! - **Accepted** - the proof is consistent with local history. The changeset
//!   carries any new head, the nodes it authenticated, and the verified block.
//! - **Reorg** - the proof is signed under a newer fork. The descriptor records
//!   how much of local history survives (`ancestors`) and the new head.
//! - **Stale** - the proof is from an older fork, adds nothing, or was built
//!   against a tree size we no longer have.
//!
//! A bad signature, a tampered block, or two different histories signed under
//! the same fork are errors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::{signable, Ed25519PublicKey, Ed25519Signature};
use crate::error::{CoreError, Result};
use crate::flat;
use crate::node::{byte_length, root_hash, Node};
use crate::proof::{BlockProof, Proof, UpgradeProof};
use crate::tree::{MerkleTree, TreeChangeset, VerifiedBlock};

/// Result of checking a proof.
#[derive(Debug, Clone)]
pub enum VerifyOutcome {
    Accepted(TreeChangeset),
    Reorg(ReorgDescriptor),
    Stale,
}

/// Everything needed to move a tree onto a newer fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgDescriptor {
    /// Blocks shared by the local and the new history.
    pub ancestors: u64,
    pub fork: u64,
    pub length: u64,
    pub byte_length: u64,
    pub signature: Ed25519Signature,
    pub roots: Vec<Node>,
    /// Authenticated nodes of the new tree.
    pub nodes: Vec<Node>,
    pub block: Option<VerifiedBlock>,
    /// Fork the descriptor was computed against.
    pub from_fork: u64,
    /// Length the descriptor was computed against.
    pub from_length: u64,
}

impl ReorgDescriptor {
    /// Check the signature over the new head.
    pub fn verify_signature(&self, public_key: &Ed25519PublicKey) -> Result<()> {
        let message = signable(&root_hash(&self.roots), self.length, self.fork);
        public_key.verify(&message, &self.signature)
    }
}

enum Link {
    /// The head grew and links to local roots.
    Grown,
    /// The head is not longer than ours and agrees with what we hold.
    Known,
    /// The proof was built against a different start.
    Unlinked,
}

impl MerkleTree {
    /// Check `proof` against this tree and the chain's public key.
    pub fn verify(&self, proof: &Proof, public_key: &Ed25519PublicKey) -> Result<VerifyOutcome> {
        check_bounds(proof)?;
        if proof.fork < self.fork() {
            return Ok(VerifyOutcome::Stale);
        }

        if let Some(upgrade) = &proof.upgrade {
            check_upgrade(upgrade, proof.fork, public_key)?;
        }

        if proof.fork > self.fork() {
            return match &proof.upgrade {
                Some(upgrade) => Ok(VerifyOutcome::Reorg(self.plan_reorg(
                    upgrade,
                    proof.block.as_ref(),
                    proof.fork,
                )?)),
                None => Ok(VerifyOutcome::Stale),
            };
        }

        let mut cs = TreeChangeset::unchanged(self);
        let mut pending: BTreeMap<u64, Node> = BTreeMap::new();

        if let Some(upgrade) = &proof.upgrade {
            match self.link_upgrade(upgrade, &mut pending)? {
                Link::Grown => {
                    cs.length = upgrade.length;
                    cs.byte_length = byte_length(&upgrade.roots)?;
                    cs.roots = upgrade.roots.clone();
                    cs.signature = upgrade.signature;
                }
                Link::Known => {}
                Link::Unlinked => {
                    if proof.block.is_none() {
                        return Ok(VerifyOutcome::Stale);
                    }
                }
            }
        }

        if let Some(block) = &proof.block {
            let (verified, nodes) = verify_path(block, cs.length, |index| {
                pending
                    .get(&index)
                    .or_else(|| self.get(index))
                    .copied()
            })?;
            for node in nodes {
                pending.insert(node.index, node);
            }
            cs.block = Some(verified);
        }

        cs.nodes = pending
            .into_values()
            .filter(|n| !self.holds(n.index))
            .collect();

        if !cs.upgraded() && cs.nodes.is_empty() && cs.block.is_none() {
            return Ok(VerifyOutcome::Stale);
        }
        Ok(VerifyOutcome::Accepted(cs))
    }

    /// Turn a reorg descriptor into a changeset.
    ///
    /// Returns `None` when the tree moved since the descriptor was computed.
    pub fn reorg(
        &self,
        descriptor: &ReorgDescriptor,
        public_key: &Ed25519PublicKey,
    ) -> Result<Option<TreeChangeset>> {
        if descriptor.length > flat::MAX_LENGTH || descriptor.ancestors > descriptor.length {
            return Err(CoreError::InvalidProof(format!(
                "reorg to length {} is out of bounds",
                descriptor.length
            )));
        }
        descriptor.verify_signature(public_key)?;

        if descriptor.from_fork != self.fork() || descriptor.from_length != self.length() {
            return Ok(None);
        }

        let mut cs = TreeChangeset::unchanged(self);
        cs.ancestors = descriptor.ancestors.min(self.length());
        if cs.ancestors < self.length() {
            cs.dropped = self.dropped_beyond(cs.ancestors);
        }
        cs.length = descriptor.length;
        cs.byte_length = descriptor.byte_length;
        cs.fork = descriptor.fork;
        cs.roots = descriptor.roots.clone();
        cs.signature = descriptor.signature;
        cs.nodes = descriptor.nodes.clone();
        cs.block = descriptor.block.clone();
        Ok(Some(cs))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Upgrades
    // ─────────────────────────────────────────────────────────────────────────

    fn link_upgrade(
        &self,
        upgrade: &UpgradeProof,
        pending: &mut BTreeMap<u64, Node>,
    ) -> Result<Link> {
        for root in &upgrade.roots {
            if let Some(local) = self.get(root.index) {
                if local != root {
                    return Err(CoreError::Conflict { index: root.index });
                }
            }
        }

        // Signed roots are authentic even when we cannot link them further.
        let authenticated = upgrade.roots.iter().map(|r| (r.index, *r));

        if upgrade.length <= self.length() {
            pending.extend(authenticated);
            return Ok(Link::Known);
        }

        let Some(last) = self.roots().last().copied() else {
            pending.extend(authenticated);
            return Ok(Link::Grown);
        };

        let head_root = upgrade
            .roots
            .iter()
            .find(|r| {
                flat::left_span(r.index) <= last.index && last.index <= flat::right_span(r.index)
            })
            .copied()
            .ok_or_else(|| CoreError::InvalidProof("head does not cover local tree".into()))?;

        let linkable = upgrade.start == self.length();
        let mut linked = Vec::new();
        let mut extra = upgrade.nodes.iter();
        let mut cur = last;

        while cur.index != head_root.index {
            let sibling_index = flat::sibling(cur.index);
            let sibling = if flat::is_left(cur.index) {
                match extra.next() {
                    Some(n) if n.index == sibling_index => *n,
                    _ if linkable => {
                        return Err(CoreError::InvalidProof(format!(
                            "upgrade is missing node {sibling_index}"
                        )))
                    }
                    _ => return Ok(Link::Unlinked),
                }
            } else {
                *self.node(sibling_index)?
            };

            linked.push(sibling);
            cur = cur.join(&sibling)?;
            linked.push(cur);
        }

        if cur != head_root {
            return if linkable {
                Err(CoreError::Conflict {
                    index: head_root.index,
                })
            } else {
                Ok(Link::Unlinked)
            };
        }

        pending.extend(authenticated);
        pending.extend(linked.into_iter().map(|n| (n.index, n)));
        Ok(Link::Grown)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reorgs
    // ─────────────────────────────────────────────────────────────────────────

    fn plan_reorg(
        &self,
        upgrade: &UpgradeProof,
        block: Option<&BlockProof>,
        fork: u64,
    ) -> Result<ReorgDescriptor> {
        let mut known: BTreeMap<u64, Node> =
            upgrade.roots.iter().map(|r| (r.index, *r)).collect();

        let verified = match block {
            Some(block) => {
                let (verified, nodes) =
                    verify_path(block, upgrade.length, |index| known.get(&index).copied())?;
                known.extend(nodes.into_iter().map(|n| (n.index, n)));
                Some(verified)
            }
            None => None,
        };

        let mut ancestors = 0;
        for root in &upgrade.roots {
            let (end, whole) = self.shared_within(root.index, &known);
            ancestors = end;
            if !whole {
                break;
            }
        }
        let ancestors = ancestors.min(self.length()).min(upgrade.length);

        Ok(ReorgDescriptor {
            ancestors,
            fork,
            length: upgrade.length,
            byte_length: byte_length(&upgrade.roots)?,
            signature: upgrade.signature,
            roots: upgrade.roots.clone(),
            nodes: known.into_values().collect(),
            block: verified,
            from_fork: self.fork(),
            from_length: self.length(),
        })
    }

    /// Shared prefix under `index`, as (end block, whole subtree shared).
    ///
    /// Only nodes present on both sides are compared, so the answer never
    /// overstates what is shared.
    fn shared_within(&self, index: u64, known: &BTreeMap<u64, Node>) -> (u64, bool) {
        let start = flat::left_span(index) / 2;
        if start >= self.length() {
            return (start, false);
        }

        if let (Some(theirs), Some(ours)) = (known.get(&index), self.get(index)) {
            if theirs == ours {
                return (flat::right_span(index) / 2 + 1, true);
            }
        }

        match flat::children(index) {
            None => (start, false),
            Some((left, right)) => {
                let (end, whole) = self.shared_within(left, known);
                if !whole {
                    return (end, false);
                }
                self.shared_within(right, known)
            }
        }
    }
}

/// Reject lengths and indices the flat-tree arithmetic cannot represent.
fn check_bounds(proof: &Proof) -> Result<()> {
    if let Some(upgrade) = &proof.upgrade {
        if upgrade.length > flat::MAX_LENGTH || upgrade.start > upgrade.length {
            return Err(CoreError::InvalidProof(format!(
                "upgrade from {} to length {} is out of bounds",
                upgrade.start, upgrade.length
            )));
        }
    }
    if let Some(block) = &proof.block {
        if block.index >= flat::MAX_LENGTH {
            return Err(CoreError::InvalidProof(format!(
                "block {} is out of bounds",
                block.index
            )));
        }
    }
    Ok(())
}

/// Check that the upgrade's roots describe its length and carry a valid signature.
fn check_upgrade(upgrade: &UpgradeProof, fork: u64, public_key: &Ed25519PublicKey) -> Result<()> {
    let expected = flat::full_roots(upgrade.length);
    if expected.len() != upgrade.roots.len()
        || expected.iter().zip(&upgrade.roots).any(|(&i, r)| i != r.index)
    {
        return Err(CoreError::InvalidProof(format!(
            "roots do not describe a tree of length {}",
            upgrade.length
        )));
    }

    let message = signable(&root_hash(&upgrade.roots), upgrade.length, fork);
    public_key.verify(&message, &upgrade.signature)
}

/// Walk a block's audit path up to a trusted node.
///
/// Returns the verified block and every node the walk authenticated.
fn verify_path(
    block: &BlockProof,
    length: u64,
    trusted: impl Fn(u64) -> Option<Node>,
) -> Result<(VerifiedBlock, Vec<Node>)> {
    if block.index >= length {
        return Err(CoreError::InvalidProof(format!(
            "block {} is beyond length {length}",
            block.index
        )));
    }

    let leaf_index = flat::leaf(block.index);
    let mut siblings = block.nodes.iter();

    let mut cur = match &block.value {
        Some(value) => Node::leaf(block.index, value),
        None => match siblings.next() {
            Some(n) if n.index == leaf_index => *n,
            _ => {
                return Err(CoreError::InvalidProof(
                    "block proof carries neither value nor leaf".into(),
                ))
            }
        },
    };

    let mut authenticated = vec![cur];
    loop {
        if let Some(known) = trusted(cur.index) {
            if known != cur {
                return Err(CoreError::InvalidProof(format!(
                    "block {} does not match tree node {}",
                    block.index, cur.index
                )));
            }
            break;
        }

        let Some(sibling) = siblings.next() else {
            return Err(CoreError::InvalidProof(
                "block proof does not reach a trusted node".into(),
            ));
        };
        if sibling.index != flat::sibling(cur.index) {
            return Err(CoreError::InvalidProof(format!(
                "unexpected node {} in audit path",
                sibling.index
            )));
        }

        authenticated.push(*sibling);
        cur = cur.join(sibling)?;
        authenticated.push(cur);
    }

    Ok((
        VerifiedBlock {
            index: block.index,
            value: block.value.clone(),
        },
        authenticated,
    ))
}
