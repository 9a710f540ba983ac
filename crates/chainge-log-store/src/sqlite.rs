//! SQLite implementation of the Storage trait.
//!
//! This is the persistent storage backend for Chainge Log. Each region is
//! split into fixed-size pages stored as rows, with the logical region size
//! tracked separately. It uses rusqlite with bundled SQLite, wrapped in async
//! via tokio::spawn_blocking. Every write runs in its own transaction.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{out_of_bounds, Region, Storage};

/// Size of one stored page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// SQLite-based storage.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime. After `close` every operation
/// fails with [`StoreError::Closed`].
pub struct SqliteStorage {
    /// The SQLite connection, protected by a mutex. `None` once closed.
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStorage {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run a blocking operation on the connection.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            let conn = guard.as_mut().ok_or(StoreError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }
}

fn region_size(conn: &Connection, region: Region) -> Result<u64> {
    let size: Option<i64> = conn
        .query_row(
            "SELECT size FROM regions WHERE region = ?1",
            params![region.id()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(size.map_or(0, |s| s as u64))
}

fn set_region_size(conn: &Connection, region: Region, size: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO regions (region, size) VALUES (?1, ?2)
         ON CONFLICT(region) DO UPDATE SET size = excluded.size",
        params![region.id(), size as i64],
    )?;
    Ok(())
}

/// Load a page, zero-filled to [`PAGE_SIZE`].
fn load_page(conn: &Connection, region: Region, page: u64) -> Result<Vec<u8>> {
    let data: Option<Vec<u8>> = conn
        .query_row(
            "SELECT data FROM pages WHERE region = ?1 AND page = ?2",
            params![region.id(), page as i64],
            |row| row.get(0),
        )
        .optional()?;

    let mut data = data.unwrap_or_default();
    if data.len() as u64 > PAGE_SIZE {
        return Err(StoreError::InvalidData(format!(
            "{} page {} is {} bytes",
            region.as_str(),
            page,
            data.len()
        )));
    }
    data.resize(PAGE_SIZE as usize, 0);
    Ok(data)
}

fn store_page(conn: &Connection, region: Region, page: u64, data: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO pages (region, page, data) VALUES (?1, ?2, ?3)",
        params![region.id(), page as i64, data],
    )?;
    Ok(())
}

fn read_range(conn: &Connection, region: Region, offset: u64, len: u64) -> Result<Vec<u8>> {
    let size = region_size(conn, region)?;
    if offset + len > size {
        return Err(out_of_bounds(region, offset, len, size));
    }

    let mut out = Vec::with_capacity(len as usize);
    let end = offset + len;
    let mut pos = offset;
    while pos < end {
        let page = pos / PAGE_SIZE;
        let start = (pos % PAGE_SIZE) as usize;
        let take = (PAGE_SIZE - start as u64).min(end - pos) as usize;

        let data = load_page(conn, region, page)?;
        out.extend_from_slice(&data[start..start + take]);
        pos += take as u64;
    }
    Ok(out)
}

fn write_range(conn: &Connection, region: Region, offset: u64, data: &[u8]) -> Result<()> {
    let mut pos = offset;
    let mut rest = data;
    while !rest.is_empty() {
        let page = pos / PAGE_SIZE;
        let start = (pos % PAGE_SIZE) as usize;
        let take = (PAGE_SIZE as usize - start).min(rest.len());

        let mut page_data = load_page(conn, region, page)?;
        page_data[start..start + take].copy_from_slice(&rest[..take]);
        store_page(conn, region, page, &page_data)?;

        rest = &rest[take..];
        pos += take as u64;
    }
    Ok(())
}

/// Drop everything from `offset` on, leaving no stale bytes past the end.
fn shrink(conn: &Connection, region: Region, offset: u64) -> Result<()> {
    let first_free = offset.div_ceil(PAGE_SIZE);
    conn.execute(
        "DELETE FROM pages WHERE region = ?1 AND page >= ?2",
        params![region.id(), first_free as i64],
    )?;

    let partial = offset % PAGE_SIZE;
    if partial != 0 {
        let page = offset / PAGE_SIZE;
        let mut data = load_page(conn, region, page)?;
        data[partial as usize..].fill(0);
        store_page(conn, region, page, &data)?;
    }

    set_region_size(conn, region, offset)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn read(&self, region: Region, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.run(move |conn| read_range(conn, region, offset, len))
            .await
    }

    async fn write(&self, region: Region, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let data = data.to_vec();

        self.run(move |conn| {
            let tx = conn.transaction()?;
            let size = region_size(&tx, region)?;
            write_range(&tx, region, offset, &data)?;

            let end = offset + data.len() as u64;
            if end > size {
                set_region_size(&tx, region, end)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, region: Region, offset: u64, len: u64) -> Result<()> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let size = region_size(&tx, region)?;
            if offset >= size || len == 0 {
                return Ok(());
            }

            if offset + len >= size {
                shrink(&tx, region, offset)?;
            } else {
                write_range(&tx, region, offset, &vec![0u8; len as usize])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn stat(&self, region: Region) -> Result<u64> {
        self.run(move |conn| region_size(conn, region)).await
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| StoreError::Database(e))?;
                tracing::debug!("closed sqlite storage");
            }
            Ok(())
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StorageExt;

    #[tokio::test]
    async fn test_write_and_read() {
        let storage = SqliteStorage::open_memory().unwrap();
        storage.write(Region::Blocks, 0, b"hello").await.unwrap();
        storage.write(Region::Blocks, 5, b" world").await.unwrap();

        assert_eq!(storage.read(Region::Blocks, 0, 11).await.unwrap(), b"hello world");
        assert_eq!(storage.stat(Region::Blocks).await.unwrap(), 11);
        assert_eq!(storage.stat(Region::Header).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_across_pages() {
        let storage = SqliteStorage::open_memory().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        storage.write(Region::Blocks, 100, &data).await.unwrap();

        assert_eq!(storage.stat(Region::Blocks).await.unwrap(), 10_100);
        assert_eq!(
            storage.read(Region::Blocks, 100, 10_000).await.unwrap(),
            data
        );
        assert_eq!(storage.read(Region::Blocks, 0, 100).await.unwrap(), vec![0u8; 100]);
    }

    #[tokio::test]
    async fn test_read_past_end() {
        let storage = SqliteStorage::open_memory().unwrap();
        storage.write(Region::Tree, 0, b"abc").await.unwrap();
        assert!(matches!(
            storage.read(Region::Tree, 0, 4).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_shrinks_and_zeroes() {
        let storage = SqliteStorage::open_memory().unwrap();
        let data = vec![7u8; 9000];
        storage.write(Region::Blocks, 0, &data).await.unwrap();

        storage.delete(Region::Blocks, 10, 20).await.unwrap();
        let middle = storage.read(Region::Blocks, 0, 40).await.unwrap();
        assert_eq!(&middle[..10], &[7u8; 10]);
        assert_eq!(&middle[10..30], &[0u8; 20]);
        assert_eq!(&middle[30..], &[7u8; 10]);

        storage.delete(Region::Blocks, 5000, 4000).await.unwrap();
        assert_eq!(storage.stat(Region::Blocks).await.unwrap(), 5000);

        // regrowing must not resurrect deleted bytes
        storage.write(Region::Blocks, 8999, b"x").await.unwrap();
        let tail = storage.read(Region::Blocks, 5000, 3999).await.unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_regions_are_independent() {
        let storage = SqliteStorage::open_memory().unwrap();
        storage.write(Region::Tree, 0, b"tree").await.unwrap();
        storage.write(Region::Header, 0, b"head").await.unwrap();
        storage.truncate(Region::Tree, 0).await.unwrap();

        assert_eq!(storage.stat(Region::Tree).await.unwrap(), 0);
        assert_eq!(storage.read_all(Region::Header).await.unwrap(), b"head");
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.write(Region::Header, 0, b"persisted").await.unwrap();
            storage.close().await.unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.read_all(Region::Header).await.unwrap(), b"persisted");
    }

    #[tokio::test]
    async fn test_closed_storage_rejects_operations() {
        let storage = SqliteStorage::open_memory().unwrap();
        storage.close().await.unwrap();
        storage.close().await.unwrap();
        assert!(matches!(
            storage.stat(Region::Blocks).await,
            Err(StoreError::Closed)
        ));
    }
}
