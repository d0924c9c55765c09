//! Error handling for blockfs

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::BlockId;

/// Result type for blockfs operations
pub type Result<T> = std::result::Result<T, BlockfsError>;

/// Process exit statuses for fatal node errors
pub mod exit_code {
    /// Missing or invalid port, or an invalid configuration
    pub const USAGE: i32 = 1;
    /// The listening socket could not be bound
    pub const BIND: i32 = 2;
    /// The node failed after startup
    pub const RUNTIME: i32 = 3;
    /// The node's storage directory could not be created
    pub const STORAGE_DIR: i32 = 5;
}

/// Main error type for blockfs
#[derive(Error, Debug)]
pub enum BlockfsError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The listening socket could not be bound
    #[error("Unable to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The per-node storage directory could not be created
    #[error("Unable to create storage directory {path:?}: {source}")]
    StorageDirFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Block id outside the pool
    #[error("Block {id} is out of range (capacity {capacity})")]
    BlockOutOfRange { id: BlockId, capacity: usize },

    /// Block id inside the pool that has not been allocated
    #[error("Block {0} is not allocated")]
    BlockNotAllocated(BlockId),

    /// Allocated block whose backing file has disappeared
    #[error("Backing file for block {0} is missing")]
    BackingFileMissing(BlockId),

    /// I/O failure while touching a block's backing file
    #[error("I/O error on block {id}: {source}")]
    BlockIo {
        id: BlockId,
        #[source]
        source: io::Error,
    },

    /// Malformed request line
    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl BlockfsError {
    /// True for the errors a client sees as "invalid block" rather than a failure.
    pub fn is_invalid_block(&self) -> bool {
        matches!(
            self,
            BlockfsError::BlockOutOfRange { .. }
                | BlockfsError::BlockNotAllocated(_)
                | BlockfsError::BackingFileMissing(_)
        )
    }

    /// Exit status used when this error terminates the node.
    pub fn exit_code(&self) -> i32 {
        match self {
            BlockfsError::ConfigError(_) => exit_code::USAGE,
            BlockfsError::BindFailed { .. } => exit_code::BIND,
            BlockfsError::StorageDirFailed { .. } => exit_code::STORAGE_DIR,
            _ => exit_code::RUNTIME,
        }
    }
}

impl From<serde_json::Error> for BlockfsError {
    fn from(err: serde_json::Error) -> Self {
        BlockfsError::ConfigError(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for BlockfsError {
    fn from(err: toml::de::Error) -> Self {
        BlockfsError::ConfigError(format!("TOML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_block_classification() {
        assert!(BlockfsError::BlockNotAllocated(3).is_invalid_block());
        assert!(BlockfsError::BackingFileMissing(3).is_invalid_block());
        assert!(BlockfsError::BlockOutOfRange { id: 12, capacity: 10 }.is_invalid_block());

        assert!(!BlockfsError::ProtocolError("bad".to_string()).is_invalid_block());
        let io = BlockfsError::BlockIo {
            id: 1,
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!io.is_invalid_block());
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let bind = BlockfsError::BindFailed {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        let dir = BlockfsError::StorageDirFailed {
            path: PathBuf::from("/nope"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        let config = BlockfsError::ConfigError("bad".to_string());

        assert_eq!(bind.exit_code(), exit_code::BIND);
        assert_eq!(dir.exit_code(), exit_code::STORAGE_DIR);
        assert_eq!(config.exit_code(), exit_code::USAGE);
        assert_eq!(BlockfsError::BlockNotAllocated(0).exit_code(), exit_code::RUNTIME);
    }
}
