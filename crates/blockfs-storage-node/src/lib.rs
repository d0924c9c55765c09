//! blockfs Storage Node
//!
//! A storage node owns a fixed pool of file-backed blocks and serves
//! `ALLOC`, `READ` and `WRITE` requests from many concurrent TCP clients.
//! A coordinator (not part of this crate) decides which node holds which
//! block of which file.

pub mod block;
pub mod block_pool;
pub mod client;
pub mod protocol;
pub mod server;

pub use block::Block;
pub use block_pool::BlockPool;
pub use client::NodeClient;
pub use protocol::{Request, Response};
pub use server::NodeServer;

/// Re-export common types
pub use blockfs_common::error::*;
pub use blockfs_common::types::*;
pub use blockfs_common::NodeConfig;
