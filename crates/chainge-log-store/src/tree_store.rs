//! Tree node records.
//!
//! Each node occupies a fixed [`NODE_RECORD_SIZE`]-byte slot at
//! `index * NODE_RECORD_SIZE` in the [`Region::Tree`] region: the subtree
//! byte size as u64 LE followed by the 32-byte hash. An all-zero slot is an
//! absent node.

use std::sync::Arc;

use chainge_log_core::{Blake3Hash, Node};

use crate::error::{Result, StoreError};
use crate::traits::{Region, Storage, StorageExt};

/// Size of one node record in bytes.
pub const NODE_RECORD_SIZE: u64 = 40;

#[derive(Clone)]
pub struct TreeStore {
    storage: Arc<dyn Storage>,
}

impl TreeStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Load every stored node.
    pub async fn load(&self) -> Result<Vec<Node>> {
        let bytes = self.storage.read_all(Region::Tree).await?;
        if bytes.len() as u64 % NODE_RECORD_SIZE != 0 {
            return Err(StoreError::InvalidData(format!(
                "tree region is {} bytes, not a whole number of records",
                bytes.len()
            )));
        }

        let nodes = bytes
            .chunks_exact(NODE_RECORD_SIZE as usize)
            .enumerate()
            .filter(|(_, record)| record.iter().any(|&b| b != 0))
            .map(|(index, record)| decode(index as u64, record))
            .collect();
        Ok(nodes)
    }

    /// Persist nodes, one write per run of consecutive indices.
    pub async fn put(&self, nodes: &[Node]) -> Result<()> {
        let mut sorted = nodes.to_vec();
        sorted.sort_unstable_by_key(|n| n.index);
        sorted.dedup_by_key(|n| n.index);

        for run in runs(&sorted, |n| n.index) {
            let mut buf = Vec::with_capacity(run.len() * NODE_RECORD_SIZE as usize);
            for node in run {
                encode(node, &mut buf);
            }
            self.storage
                .write(Region::Tree, run[0].index * NODE_RECORD_SIZE, &buf)
                .await?;
        }
        Ok(())
    }

    /// Clear the records of the given node indices.
    pub async fn delete(&self, indices: &[u64]) -> Result<()> {
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        // Highest runs first so a run reaching the end shrinks the region.
        let runs: Vec<&[u64]> = runs(&sorted, |&i| i).collect();
        for run in runs.into_iter().rev() {
            self.storage
                .delete(
                    Region::Tree,
                    run[0] * NODE_RECORD_SIZE,
                    run.len() as u64 * NODE_RECORD_SIZE,
                )
                .await?;
        }
        Ok(())
    }
}

fn encode(node: &Node, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&node.size.to_le_bytes());
    buf.extend_from_slice(node.hash.as_bytes());
}

fn decode(index: u64, record: &[u8]) -> Node {
    let mut size = [0u8; 8];
    size.copy_from_slice(&record[..8]);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&record[8..40]);

    Node {
        index,
        size: u64::from_le_bytes(size),
        hash: Blake3Hash::from_bytes(hash),
    }
}

/// Split a sorted slice into runs of consecutive keys.
fn runs<T>(items: &[T], key: impl Fn(&T) -> u64) -> impl Iterator<Item = &[T]> {
    let mut rest = items;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let mut len = 1;
        while len < rest.len() && key(&rest[len]) == key(&rest[len - 1]) + 1 {
            len += 1;
        }
        let (run, tail) = rest.split_at(len);
        rest = tail;
        Some(run)
    })
}
