//! A single file-backed storage block

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use blockfs_common::types::BlockId;

/// One allocated block slot.
///
/// The lock guards the backing file, not any in-memory data. Readers of the
/// same block share it; a writer holds it exclusively for the whole
/// file replacement, so a concurrent reader sees the file either entirely
/// before or entirely after the write. Locks of different blocks are
/// unrelated.
///
/// The write guard travels with the blocking file write, so cancelling the
/// calling task never releases the lock while bytes are still landing.
#[derive(Debug)]
pub struct Block {
    id: BlockId,
    path: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl Block {
    pub fn new(id: BlockId, path: PathBuf) -> Self {
        Self {
            id,
            path,
            lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the backing file empty, discarding whatever a previous run left there.
    pub(crate) async fn create_backing_file(&self) -> io::Result<()> {
        let _guard = self.lock.write().await;
        tokio::fs::File::create(&self.path).await?;
        Ok(())
    }

    /// Read the whole backing file under the shared lock.
    pub async fn read_contents(&self) -> io::Result<Vec<u8>> {
        let _guard = self.lock.read().await;
        tokio::fs::read(&self.path).await
    }

    /// Replace the whole backing file under the exclusive lock.
    ///
    /// The file must already exist; a missing file is reported as
    /// [`io::ErrorKind::NotFound`] and is not recreated.
    pub async fn write_contents(&self, contents: &[u8]) -> io::Result<()> {
        let guard = self.lock.clone().write_owned().await;
        let path = self.path.clone();
        let contents = contents.to_vec();

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let mut file = OpenOptions::new().write(true).truncate(true).open(&path)?;
            file.write_all(&contents)?;
            file.flush()
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}
