//! Block presence, one byte per block.

use std::sync::Arc;

use crate::error::Result;
use crate::traits::{Region, Storage, StorageExt};

#[derive(Clone)]
pub struct Bitfield {
    storage: Arc<dyn Storage>,
}

impl Bitfield {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// True if block `index` is stored locally.
    pub async fn get(&self, index: u64) -> Result<bool> {
        if index >= self.storage.stat(Region::Bitfield).await? {
            return Ok(false);
        }
        let byte = self.storage.read(Region::Bitfield, index, 1).await?;
        Ok(byte[0] != 0)
    }

    /// Mark `length` blocks from `start` as present or absent.
    pub async fn set_range(&self, start: u64, length: u64, present: bool) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        if present {
            self.storage
                .write(Region::Bitfield, start, &vec![1u8; length as usize])
                .await
        } else {
            self.storage.delete(Region::Bitfield, start, length).await
        }
    }

    /// Forget every block from `length` on.
    pub async fn truncate(&self, length: u64) -> Result<()> {
        self.storage.truncate(Region::Bitfield, length).await
    }

    /// Number of presence bytes stored, set or not.
    pub async fn size(&self) -> Result<u64> {
        self.storage.stat(Region::Bitfield).await
    }

    /// Raw presence bytes for `length` blocks from `start`, cut at the stored end.
    pub async fn snapshot(&self, start: u64, length: u64) -> Result<Vec<u8>> {
        let end = start
            .saturating_add(length)
            .min(self.storage.stat(Region::Bitfield).await?);
        if end <= start {
            return Ok(Vec::new());
        }
        self.storage.read(Region::Bitfield, start, end - start).await
    }

    /// Write back bytes taken by [`Self::snapshot`].
    pub async fn restore(&self, start: u64, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.storage.write(Region::Bitfield, start, bytes).await
    }
}
