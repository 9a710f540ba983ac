//! Block bytes, stored back to back at their byte offsets.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::traits::{Region, Storage, StorageExt};

/// Index-free block storage over the [`Region::Blocks`] region.
///
/// Callers resolve a block's byte offset and size through the tree.
#[derive(Clone)]
pub struct BlockStore {
    storage: Arc<dyn Storage>,
}

impl BlockStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Read `size` bytes at `offset`.
    pub async fn get(&self, offset: u64, size: u64) -> Result<Bytes> {
        if size == 0 {
            return Ok(Bytes::new());
        }
        let data = self.storage.read(Region::Blocks, offset, size).await?;
        Ok(Bytes::from(data))
    }

    /// Write one block at `offset`.
    pub async fn put(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.storage.write(Region::Blocks, offset, data).await
    }

    /// Write consecutive blocks starting at `offset` in one write.
    pub async fn append<B: AsRef<[u8]>>(&self, offset: u64, blocks: &[B]) -> Result<()> {
        let total = blocks.iter().map(|b| b.as_ref().len()).sum();
        let mut buf = Vec::with_capacity(total);
        for block in blocks {
            buf.extend_from_slice(block.as_ref());
        }
        self.storage.write(Region::Blocks, offset, &buf).await
    }

    /// Drop every byte from `byte_offset` on.
    pub async fn truncate(&self, byte_offset: u64) -> Result<()> {
        self.storage.truncate(Region::Blocks, byte_offset).await
    }
}
