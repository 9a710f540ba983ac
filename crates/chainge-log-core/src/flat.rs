//! Flat-tree arithmetic.
//!
//! A flat tree lays out a binary tree in a single array using in-order
//! numbering: leaf `i` sits at index `2i`, and every internal node sits at an
//! odd index between its two children.
//!
//! ```text
//!           3
//!       1       5
//!     0   2   4   6
//! ```
//!
//! The depth of a node is the number of trailing one bits in its index, and its
//! offset is its position among the nodes of that depth.
//!
//! The arithmetic is exact for trees of up to [`MAX_LENGTH`] blocks. Lengths
//! and indices taken from peers must be checked against it first.

/// Largest number of blocks a tree may hold.
pub const MAX_LENGTH: u64 = 1 << 62;

/// Depth of the single root of a [`MAX_LENGTH`] tree; no node sits higher.
pub const MAX_DEPTH: u32 = 62;

/// Index of the node at `depth` and `offset`.
pub const fn index(depth: u32, offset: u64) -> u64 {
    (offset << (depth + 1)) | ((1u64 << depth) - 1)
}

/// Depth of a node (0 for leaves).
pub const fn depth(index: u64) -> u32 {
    (!index).trailing_zeros()
}

/// Offset of a node among the nodes of its depth.
pub const fn offset(index: u64) -> u64 {
    index >> (depth(index) + 1)
}

/// Tree index of the leaf holding block `block`.
pub const fn leaf(block: u64) -> u64 {
    block * 2
}

/// Parent of a node.
pub const fn parent(index: u64) -> u64 {
    let d = depth(index);
    self::index(d + 1, offset(index) >> 1)
}

/// Sibling of a node.
pub const fn sibling(index: u64) -> u64 {
    let d = depth(index);
    self::index(d, offset(index) ^ 1)
}

/// True if the node is the left child of its parent.
pub const fn is_left(index: u64) -> bool {
    offset(index) & 1 == 0
}

/// Left and right children of an internal node, `None` for leaves.
pub const fn children(index: u64) -> Option<(u64, u64)> {
    let d = depth(index);
    if d == 0 {
        return None;
    }
    let off = offset(index) * 2;
    Some((self::index(d - 1, off), self::index(d - 1, off + 1)))
}

/// Leftmost leaf index covered by a node.
pub const fn left_span(index: u64) -> u64 {
    let d = depth(index);
    if d == 0 {
        index
    } else {
        offset(index) * (2u64 << d)
    }
}

/// Rightmost leaf index covered by a node.
pub const fn right_span(index: u64) -> u64 {
    let d = depth(index);
    if d == 0 {
        index
    } else {
        (offset(index) + 1) * (2u64 << d) - 2
    }
}

/// Number of blocks covered by a node.
pub const fn count_leaves(index: u64) -> u64 {
    1u64 << depth(index)
}

/// True if every leaf under `index` is a block below `length`.
pub const fn is_complete(index: u64, length: u64) -> bool {
    right_span(index) / 2 < length
}

/// Full roots of a tree of `length` blocks, left to right.
///
/// These are the maximal complete subtrees that together cover `[0, length)`.
pub fn full_roots(length: u64) -> Vec<u64> {
    let mut roots = Vec::new();
    let mut remaining = length;
    let mut offset = 0u64;

    while remaining > 0 {
        let d = 63 - remaining.leading_zeros();
        let span = 1u64 << d;
        roots.push(index(d, offset >> d));
        offset += span;
        remaining -= span;
    }

    roots
}

/// The root among `roots` whose span contains `block`.
pub fn covering_root(roots: &[u64], block: u64) -> Option<u64> {
    roots
        .iter()
        .copied()
        .find(|&r| left_span(r) / 2 <= block && block <= right_span(r) / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_largest_tree_has_one_root() {
        let roots = full_roots(MAX_LENGTH);
        assert_eq!(roots, vec![index(MAX_DEPTH, 0)]);
        assert_eq!(right_span(roots[0]) / 2, MAX_LENGTH - 1);
        assert!(is_complete(roots[0], MAX_LENGTH));
        assert_eq!(full_roots(MAX_LENGTH - 1).len(), MAX_DEPTH as usize);
    }

    #[test]
    fn test_index_depth_offset() {
        assert_eq!(index(0, 0), 0);
        assert_eq!(index(0, 3), 6);
        assert_eq!(index(1, 0), 1);
        assert_eq!(index(1, 1), 5);
        assert_eq!(index(2, 0), 3);
        assert_eq!(index(3, 0), 7);

        assert_eq!(depth(7), 3);
        assert_eq!(depth(5), 1);
        assert_eq!(offset(5), 1);
        assert_eq!(offset(11), 1);
    }

    #[test]
    fn test_parent_sibling_children() {
        assert_eq!(parent(0), 1);
        assert_eq!(parent(2), 1);
        assert_eq!(parent(1), 3);
        assert_eq!(parent(5), 3);
        assert_eq!(sibling(0), 2);
        assert_eq!(sibling(1), 5);
        assert_eq!(sibling(3), 11);
        assert_eq!(children(3), Some((1, 5)));
        assert_eq!(children(4), None);
        assert!(is_left(1));
        assert!(!is_left(5));
    }

    #[test]
    fn test_spans() {
        assert_eq!(left_span(3), 0);
        assert_eq!(right_span(3), 6);
        assert_eq!(left_span(11), 8);
        assert_eq!(right_span(11), 14);
        assert_eq!(count_leaves(7), 8);
        assert!(is_complete(3, 4));
        assert!(!is_complete(3, 3));
    }

    #[test]
    fn test_full_roots() {
        assert_eq!(full_roots(0), Vec::<u64>::new());
        assert_eq!(full_roots(1), vec![0]);
        assert_eq!(full_roots(3), vec![1, 4]);
        assert_eq!(full_roots(4), vec![3]);
        assert_eq!(full_roots(5), vec![3, 8]);
        assert_eq!(full_roots(7), vec![3, 9, 12]);
    }

    #[test]
    fn test_covering_root() {
        let roots = full_roots(7);
        assert_eq!(covering_root(&roots, 0), Some(3));
        assert_eq!(covering_root(&roots, 5), Some(9));
        assert_eq!(covering_root(&roots, 6), Some(12));
        assert_eq!(covering_root(&roots, 7), None);
    }

    proptest! {
        #[test]
        fn prop_full_roots_cover_length(length in 0u64..10_000) {
            let roots = full_roots(length);
            let covered: u64 = roots.iter().map(|&r| count_leaves(r)).sum();
            prop_assert_eq!(covered, length);

            let mut next = 0u64;
            for r in roots {
                prop_assert_eq!(left_span(r) / 2, next);
                next = right_span(r) / 2 + 1;
            }
        }

        #[test]
        fn prop_children_have_parent(index in 0u64..1_000_000) {
            if let Some((l, r)) = children(index) {
                prop_assert_eq!(parent(l), index);
                prop_assert_eq!(parent(r), index);
                prop_assert_eq!(sibling(l), r);
            }
        }
    }
}
