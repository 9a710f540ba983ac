//! Storage trait: the byte-range interface a chain persists through.
//!
//! A chain keeps four named regions, each a flat, growable byte array.
//! Implementations include SQLite (persistent) and in-memory (for tests).

use async_trait::async_trait;

use crate::error::{Result, StoreError};

/// A named byte region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    /// Block bytes, laid out back to back at their byte offsets.
    Blocks,
    /// Fixed-size tree node records.
    Tree,
    /// One presence byte per block.
    Bitfield,
    /// The length-prefixed header record.
    Header,
}

impl Region {
    pub const ALL: [Region; 4] = [Region::Blocks, Region::Tree, Region::Bitfield, Region::Header];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Blocks => "blocks",
            Region::Tree => "tree",
            Region::Bitfield => "bitfield",
            Region::Header => "header",
        }
    }

    /// Stable numeric id used by persistent backends.
    pub fn id(&self) -> i64 {
        match self {
            Region::Blocks => 0,
            Region::Tree => 1,
            Region::Bitfield => 2,
            Region::Header => 3,
        }
    }
}

/// The Storage trait: async byte-range access to named regions.
///
/// All methods are async to support both sync (SQLite) and async backends.
///
/// # Design Notes
///
/// - **Reads are exact**: reading past the end of a region is `NotFound`.
/// - **Writes extend**: writing past the end grows the region, zero-filling any gap.
/// - **Deletes zero**: deleted bytes read back as zeros, and a delete reaching
///   the end of a region shrinks it.
#[async_trait]
pub trait Storage: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Byte Ranges
    // ─────────────────────────────────────────────────────────────────────────

    /// Read `len` bytes at `offset`.
    async fn read(&self, region: Region, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Write `data` at `offset`.
    async fn write(&self, region: Region, offset: u64, data: &[u8]) -> Result<()>;

    /// Zero `len` bytes at `offset`, shrinking the region if the range reaches its end.
    async fn delete(&self, region: Region, offset: u64, len: u64) -> Result<()>;

    /// Current size of a region in bytes.
    async fn stat(&self, region: Region) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Release underlying resources.
    async fn close(&self) -> Result<()>;
}

/// Extension trait for common storage patterns.
pub trait StorageExt: Storage {
    /// Read a whole region.
    fn read_all(&self, region: Region) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;

    /// True if no region holds any bytes.
    fn is_empty(&self) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Cut a region down to `len` bytes.
    fn truncate(
        &self,
        region: Region,
        len: u64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

impl<S: Storage + ?Sized> StorageExt for S {
    async fn read_all(&self, region: Region) -> Result<Vec<u8>> {
        let size = self.stat(region).await?;
        if size == 0 {
            return Ok(Vec::new());
        }
        self.read(region, 0, size).await
    }

    async fn is_empty(&self) -> Result<bool> {
        for region in Region::ALL {
            if self.stat(region).await? > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn truncate(&self, region: Region, len: u64) -> Result<()> {
        let size = self.stat(region).await?;
        if size > len {
            self.delete(region, len, size - len).await?;
        }
        Ok(())
    }
}

/// The error for a read past the end of a region.
pub(crate) fn out_of_bounds(region: Region, offset: u64, len: u64, size: u64) -> StoreError {
    StoreError::NotFound(format!(
        "{} bytes {}..{} (region size {})",
        region.as_str(),
        offset,
        offset + len,
        size
    ))
}
