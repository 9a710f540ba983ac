//! Tree nodes.

use serde::{Deserialize, Serialize};

use crate::crypto::Blake3Hash;
use crate::error::{CoreError, Result};
use crate::flat;

/// A hashed node at a flat-tree position.
///
/// `size` is the byte length of every block under the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub index: u64,
    pub size: u64,
    pub hash: Blake3Hash,
}

impl Node {
    /// Leaf node for the block at `block`.
    pub fn leaf(block: u64, data: &[u8]) -> Self {
        Self {
            index: flat::leaf(block),
            size: data.len() as u64,
            hash: Blake3Hash::leaf(data),
        }
    }

    /// Parent of two sibling nodes, given in left-right order.
    pub fn parent(left: &Node, right: &Node) -> Self {
        let size = left.size + right.size;
        Self {
            index: flat::parent(left.index),
            size,
            hash: Blake3Hash::parent(size, &left.hash, &right.hash),
        }
    }

    /// Parent of `self` and its sibling, ordering the pair by position.
    ///
    /// Used on nodes received from peers: fails instead of overflowing when
    /// the sizes cannot be added or the pair sits at the top of the tree.
    pub fn join(&self, sibling: &Node) -> Result<Self> {
        if flat::depth(self.index) >= flat::MAX_DEPTH {
            return Err(CoreError::InvalidProof(format!(
                "node {} has no parent",
                self.index
            )));
        }
        let size = self.size.checked_add(sibling.size).ok_or_else(|| {
            CoreError::InvalidProof(format!(
                "nodes {} and {} overflow the byte length",
                self.index, sibling.index
            ))
        })?;

        let (left, right) = if flat::is_left(self.index) {
            (self, sibling)
        } else {
            (sibling, self)
        };
        Ok(Self {
            index: flat::parent(self.index),
            size,
            hash: Blake3Hash::parent(size, &left.hash, &right.hash),
        })
    }
}

/// Total byte size of a set of roots.
pub fn byte_length(roots: &[Node]) -> Result<u64> {
    roots.iter().try_fold(0u64, |total, root| {
        total
            .checked_add(root.size)
            .ok_or_else(|| CoreError::InvalidProof("root sizes overflow the byte length".into()))
    })
}

/// Root hash over an ordered set of full roots.
pub fn root_hash(roots: &[Node]) -> Blake3Hash {
    Blake3Hash::roots(roots.iter().map(|r| (&r.hash, r.index, r.size)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_orders_by_position() {
        let a = Node::leaf(0, b"a");
        let b = Node::leaf(1, b"b");

        let p1 = a.join(&b).unwrap();
        let p2 = b.join(&a).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(p1, Node::parent(&a, &b));
        assert_eq!(p1.index, 1);
        assert_eq!(p1.size, 2);
    }

    #[test]
    fn test_join_rejects_overflowing_sizes() {
        let a = Node::leaf(0, b"a");
        let mut b = Node::leaf(1, b"b");
        b.size = u64::MAX;
        assert!(matches!(a.join(&b), Err(CoreError::InvalidProof(_))));

        let mut huge = a;
        huge.size = u64::MAX;
        assert!(matches!(byte_length(&[a, huge]), Err(CoreError::InvalidProof(_))));
        assert_eq!(byte_length(&[a, Node::leaf(2, b"cd")]).unwrap(), 3);
    }

    #[test]
    fn test_join_stops_at_the_top() {
        let top = Node {
            index: flat::index(flat::MAX_DEPTH, 0),
            size: 1,
            hash: Blake3Hash::hash(b"top"),
        };
        let mut sibling = top;
        sibling.index = flat::sibling(top.index);
        assert!(matches!(top.join(&sibling), Err(CoreError::InvalidProof(_))));
    }

    #[test]
    fn test_root_hash_depends_on_layout() {
        let a = Node::leaf(0, b"a");
        let mut moved = a;
        moved.index = 2;
        assert_ne!(root_hash(&[a]), root_hash(&[moved]));
    }
}
