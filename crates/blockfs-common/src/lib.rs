//! # blockfs Common
//!
//! Shared types, configuration and errors for the blockfs storage node and
//! the clients that talk to it.

pub mod config;
pub mod error;
pub mod types;

pub use config::NodeConfig;
pub use error::{BlockfsError, Result};
pub use types::*;

/// Default number of block slots per storage node
pub const DEFAULT_BLOCK_CAPACITY: usize = 10;

/// Default bound on concurrently served connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Default time shutdown waits for in-flight sessions
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;

/// Default upper bound on one request line, terminator included
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024;
