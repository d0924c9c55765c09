//! Fixed-capacity pool of file-backed blocks
//!
//! The pool owns two node-wide structures, each behind its own lock:
//! - the FIFO of free block ids
//! - the map of allocated ids to their [`Block`]
//!
//! Neither lock is ever held together with the other, across an `.await`, or
//! during file I/O. Block contents are protected by the per-block lock alone,
//! taken after the map lookup has released the map lock.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use blockfs_common::error::{BlockfsError, Result};
use blockfs_common::types::{BlockId, PoolStats};

use crate::block::Block;

pub struct BlockPool {
    capacity: usize,
    root: PathBuf,
    free: Mutex<VecDeque<BlockId>>,
    allocated: RwLock<HashMap<BlockId, Arc<Block>>>,
}

impl BlockPool {
    /// Create a pool of `capacity` free blocks stored under `root`.
    ///
    /// The directory must already exist; the pool never creates it.
    pub fn new(capacity: usize, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        info!("Creating block pool with {} blocks in {:?}", capacity, root);

        Self {
            capacity,
            root,
            free: Mutex::new((0..capacity as BlockId).collect()),
            allocated: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Backing file location for `id`.
    pub fn block_path(&self, id: BlockId) -> PathBuf {
        self.root.join(format!("blk_{}.bin", id))
    }

    /// Hand out the longest-free block, or `None` when every slot is taken.
    ///
    /// The block only becomes visible to readers and writers once its backing
    /// file exists. If the file cannot be created the id goes back to the head
    /// of the free list and the error is returned.
    pub async fn allocate(&self) -> Result<Option<BlockId>> {
        let next = self.free.lock().pop_front();
        let id = match next {
            Some(id) => id,
            None => {
                debug!("Allocation refused, all {} blocks in use", self.capacity);
                return Ok(None);
            }
        };

        let block = Arc::new(Block::new(id, self.block_path(id)));
        if let Err(source) = block.create_backing_file().await {
            error!(
                "Unable to create backing file {:?} for block {}: {}",
                block.path(),
                id,
                source
            );
            self.free.lock().push_front(id);
            return Err(BlockfsError::BlockIo { id, source });
        }

        self.allocated.write().insert(id, block);
        info!("Allocated block {}", id);
        Ok(Some(id))
    }

    /// Read the full contents of an allocated block.
    pub async fn read(&self, id: BlockId) -> Result<Vec<u8>> {
        let block = self.lookup(id)?;

        block
            .read_contents()
            .await
            .map_err(|source| file_error(&block, "read", source))
    }

    /// Replace the full contents of an allocated block. A block whose backing
    /// file has disappeared is invalid here exactly as it is for [`read`].
    ///
    /// [`read`]: BlockPool::read
    pub async fn write(&self, id: BlockId, contents: &[u8]) -> Result<()> {
        let block = self.lookup(id)?;

        block
            .write_contents(contents)
            .await
            .map_err(|source| file_error(&block, "write", source))?;

        debug!("Wrote {} bytes to block {}", contents.len(), id);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.free.lock().is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.read().len()
    }

    /// Allocated ids in ascending order.
    pub fn allocated_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.allocated.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Occupancy snapshot. The two counts come from separate lock acquisitions;
    /// `allocated` is sampled first so their sum never exceeds the capacity.
    pub fn stats(&self) -> PoolStats {
        let allocated = self.allocated_count();
        let free = self.free_count();
        PoolStats {
            capacity: self.capacity,
            free,
            allocated,
        }
    }

    /// Log every allocated block with its current size.
    pub async fn dump(&self) {
        let blocks: Vec<Arc<Block>> = {
            let allocated = self.allocated.read();
            let mut blocks: Vec<Arc<Block>> = allocated.values().cloned().collect();
            blocks.sort_unstable_by_key(|block| block.id());
            blocks
        };

        let stats = self.stats();
        info!(
            "Block pool in {:?}: {} allocated, {} free, {} in flight, capacity {}",
            self.root,
            stats.allocated,
            stats.free,
            stats.in_flight(),
            stats.capacity
        );
        for block in blocks {
            match block.read_contents().await {
                Ok(contents) => info!("Block {}: {} bytes", block.id(), contents.len()),
                Err(e) => warn!("Block {}: unreadable ({})", block.id(), e),
            }
        }
    }

    fn lookup(&self, id: BlockId) -> Result<Arc<Block>> {
        if id >= self.capacity as BlockId {
            warn!("Requested block {} is outside this node", id);
            return Err(BlockfsError::BlockOutOfRange {
                id,
                capacity: self.capacity,
            });
        }

        let block = self.allocated.read().get(&id).cloned();
        block.ok_or_else(|| {
            warn!("Requested block {} is not in use", id);
            BlockfsError::BlockNotAllocated(id)
        })
    }
}

fn file_error(block: &Block, op: &str, source: io::Error) -> BlockfsError {
    let id = block.id();
    if source.kind() == io::ErrorKind::NotFound {
        warn!("Backing file {:?} for block {} is missing", block.path(), id);
        BlockfsError::BackingFileMissing(id)
    } else {
        error!("Unable to {} block {} (file: {:?}): {}", op, id, block.path(), source);
        BlockfsError::BlockIo { id, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn pool(capacity: usize) -> (TempDir, BlockPool) {
        let temp_dir = TempDir::new().unwrap();
        let pool = BlockPool::new(capacity, temp_dir.path());
        (temp_dir, pool)
    }

    #[tokio::test]
    async fn test_allocates_in_fifo_order_until_full() {
        let (_dir, pool) = pool(3);

        assert_eq!(pool.allocate().await.unwrap(), Some(0));
        assert_eq!(pool.allocate().await.unwrap(), Some(1));
        assert_eq!(pool.allocate().await.unwrap(), Some(2));
        assert!(pool.is_full());
        assert_eq!(pool.allocate().await.unwrap(), None);
        assert_eq!(pool.allocate().await.unwrap(), None);

        assert_eq!(pool.allocated_ids(), vec![0, 1, 2]);
        assert_eq!(
            pool.stats(),
            PoolStats {
                capacity: 3,
                free: 0,
                allocated: 3
            }
        );
    }

    #[tokio::test]
    async fn test_allocate_creates_empty_backing_file() {
        let (_dir, pool) = pool(2);
        std::fs::write(pool.block_path(0), b"stale").unwrap();

        let id = pool.allocate().await.unwrap().unwrap();

        assert!(pool.block_path(id).exists());
        assert_eq!(pool.read(id).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_write_then_read_returns_exact_bytes() {
        let (_dir, pool) = pool(2);
        let id = pool.allocate().await.unwrap().unwrap();

        let payload = b"hello  world\t\x00\xff with spaces".to_vec();
        pool.write(id, &payload).await.unwrap();

        assert_eq!(pool.read(id).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_invalid_ids_never_touch_the_filesystem() {
        let (_dir, pool) = pool(2);

        let out_of_range = pool.read(7).await.unwrap_err();
        assert!(matches!(out_of_range, BlockfsError::BlockOutOfRange { id: 7, capacity: 2 }));

        let unallocated = pool.write(1, b"nope").await.unwrap_err();
        assert!(matches!(unallocated, BlockfsError::BlockNotAllocated(1)));
        assert!(unallocated.is_invalid_block());
        assert!(!pool.block_path(1).exists());
        assert_eq!(pool.free_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_file_creation_returns_id_to_free_list() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("not_created_yet");
        let pool = BlockPool::new(3, &root);

        let err = pool.allocate().await.unwrap_err();
        assert!(matches!(err, BlockfsError::BlockIo { id: 0, .. }));
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.allocated_count(), 0);
        assert!(matches!(
            pool.read(0).await,
            Err(BlockfsError::BlockNotAllocated(0))
        ));

        std::fs::create_dir(&root).unwrap();
        assert_eq!(pool.allocate().await.unwrap(), Some(0));
    }

    // A failed write surfaces as an error rather than a silent success.
    #[tokio::test]
    async fn test_write_io_failure_is_reported() {
        let (_dir, pool) = pool(2);
        let id = pool.allocate().await.unwrap().unwrap();

        let path = pool.block_path(id);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let err = pool.write(id, b"lost").await.unwrap_err();
        assert!(matches!(err, BlockfsError::BlockIo { .. }));
        assert!(!err.is_invalid_block());

        let err = pool.read(id).await.unwrap_err();
        assert!(matches!(err, BlockfsError::BlockIo { .. }));
    }

    #[tokio::test]
    async fn test_missing_backing_file_is_invalid_for_read_and_write() {
        let (_dir, pool) = pool(2);
        let id = pool.allocate().await.unwrap().unwrap();
        std::fs::remove_file(pool.block_path(id)).unwrap();

        let err = pool.write(id, b"x").await.unwrap_err();
        assert!(matches!(err, BlockfsError::BackingFileMissing(0)));
        assert!(err.is_invalid_block());
        assert!(!pool.block_path(id).exists());

        let err = pool.read(id).await.unwrap_err();
        assert!(matches!(err, BlockfsError::BackingFileMissing(0)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_are_unique() {
        let (_dir, pool) = pool(10);
        let pool = Arc::new(pool);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.allocate().await.unwrap() }));
        }

        let mut granted = Vec::new();
        let mut refused = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Some(id) => granted.push(id),
                None => refused += 1,
            }
        }

        let unique: HashSet<BlockId> = granted.iter().copied().collect();
        assert_eq!(granted.len(), 10);
        assert_eq!(unique.len(), 10);
        assert!(unique.iter().all(|id| *id < 10));
        assert_eq!(refused, 22);
        assert!(pool.is_full());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reads_never_see_torn_writes() {
        const SIZE: usize = 256 * 1024;
        let (_dir, pool) = pool(1);
        let pool = Arc::new(pool);
        let id = pool.allocate().await.unwrap().unwrap();
        pool.write(id, &vec![b'a'; SIZE]).await.unwrap();

        let writer = {
            let pool = pool.clone();
            tokio::spawn(async move {
                for round in 0..40 {
                    let fill = if round % 2 == 0 { b'b' } else { b'a' };
                    pool.write(id, &vec![fill; SIZE]).await.unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..40 {
                    let contents = pool.read(id).await.unwrap();
                    assert_eq!(contents.len(), SIZE);
                    let first = contents[0];
                    assert!(contents.iter().all(|b| *b == first), "torn read");
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_blocks_do_not_interfere() {
        const BLOCKS: usize = 8;
        let (_dir, pool) = pool(BLOCKS);
        let pool = Arc::new(pool);
        for _ in 0..BLOCKS {
            pool.allocate().await.unwrap().unwrap();
        }

        let mut handles = Vec::new();
        for id in 0..BLOCKS as BlockId {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..25 {
                    let value = format!("block {} round {}", id, round);
                    pool.write(id, value.as_bytes()).await.unwrap();
                    assert_eq!(pool.read(id).await.unwrap(), value.into_bytes());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for id in 0..BLOCKS as BlockId {
            let expected = format!("block {} round 24", id);
            assert_eq!(pool.read(id).await.unwrap(), expected.into_bytes());
        }
    }
}
