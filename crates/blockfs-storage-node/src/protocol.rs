//! Line protocol spoken between a storage node and its clients
//!
//! Every request and every response is a single newline-terminated line.
//!
//! | Request                | Response                                  |
//! |------------------------|-------------------------------------------|
//! | `ALLOC`                | `<id>` or `FULL`                          |
//! | `READ <id>`            | block contents or `INVALID`               |
//! | `WRITE <id> <content>` | `OK`, `INVALID` or `ERROR <reason>`       |
//! | `STATUS`               | `FREE <n> USED <n> CAPACITY <n>`          |
//! | `.`                    | `BYE`, then the node closes the socket    |
//!
//! Verbs are case-insensitive. Anything unparseable gets `ERROR <reason>`.

use std::fmt;
use std::num::IntErrorKind;

use blockfs_common::error::{BlockfsError, Result};
use blockfs_common::types::{BlockId, PoolStats};

/// Line that ends a session
pub const TERMINATOR: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Alloc,
    /// Ids are kept signed so that `READ -1` is an invalid block rather than a
    /// malformed request. Integers too large for an `i64` saturate, which
    /// still lands outside every pool.
    Read { id: i64 },
    Write { id: i64, content: String },
    Status,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Allocated(BlockId),
    Full,
    Contents(String),
    Written,
    Invalid,
    Status(PoolStats),
    Bye,
    Error(String),
}

impl Request {
    /// Parse one request line. Only the line terminator is stripped, so
    /// whitespace inside `WRITE` content survives.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim() == TERMINATOR {
            return Ok(Request::Quit);
        }

        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, Some(rest)),
            None => (line, None),
        };

        match (verb.to_ascii_uppercase().as_str(), rest) {
            ("ALLOC", None) => Ok(Request::Alloc),
            ("STATUS", None) => Ok(Request::Status),
            ("READ", Some(id)) => Ok(Request::Read {
                id: parse_id(id.trim())?,
            }),
            ("WRITE", Some(rest)) => {
                let (id, content) = rest.split_once(' ').ok_or_else(|| {
                    BlockfsError::ProtocolError("usage: WRITE <id> <content>".to_string())
                })?;
                Ok(Request::Write {
                    id: parse_id(id)?,
                    content: content.to_string(),
                })
            }
            ("ALLOC", Some(_)) | ("STATUS", Some(_)) => Err(BlockfsError::ProtocolError(
                format!("{} takes no arguments", verb.to_ascii_uppercase()),
            )),
            ("READ", None) => Err(BlockfsError::ProtocolError(
                "usage: READ <id>".to_string(),
            )),
            ("WRITE", None) => Err(BlockfsError::ProtocolError(
                "usage: WRITE <id> <content>".to_string(),
            )),
            _ => Err(BlockfsError::ProtocolError(format!(
                "unknown command: {}",
                verb
            ))),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Alloc => write!(f, "ALLOC"),
            Request::Read { id } => write!(f, "READ {}", id),
            Request::Write { id, content } => write!(f, "WRITE {} {}", id, content),
            Request::Status => write!(f, "STATUS"),
            Request::Quit => write!(f, "{}", TERMINATOR),
        }
    }
}

impl Response {
    /// Interpret a response line. `READ` replies are ambiguous on their own
    /// (block contents may look like a marker), so callers that know they
    /// issued a `READ` should match `INVALID` themselves instead.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        match line {
            "FULL" => return Ok(Response::Full),
            "OK" => return Ok(Response::Written),
            "INVALID" => return Ok(Response::Invalid),
            "BYE" => return Ok(Response::Bye),
            _ => {}
        }

        if let Some(reason) = line.strip_prefix("ERROR ") {
            return Ok(Response::Error(reason.to_string()));
        }
        if let Ok(id) = line.parse::<BlockId>() {
            return Ok(Response::Allocated(id));
        }
        if let Some(stats) = parse_status(line) {
            return Ok(Response::Status(stats));
        }

        Err(BlockfsError::ProtocolError(format!(
            "unexpected response: {}",
            line
        )))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Allocated(id) => write!(f, "{}", id),
            Response::Full => write!(f, "FULL"),
            Response::Contents(contents) => write!(f, "{}", contents),
            Response::Written => write!(f, "OK"),
            Response::Invalid => write!(f, "INVALID"),
            Response::Status(stats) => write!(
                f,
                "FREE {} USED {} CAPACITY {}",
                stats.free, stats.allocated, stats.capacity
            ),
            Response::Bye => write!(f, "BYE"),
            Response::Error(reason) => write!(f, "ERROR {}", reason),
        }
    }
}

fn parse_id(raw: &str) -> Result<i64> {
    match raw.parse::<i64>() {
        Ok(id) => Ok(id),
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => Ok(i64::MAX),
        Err(e) if *e.kind() == IntErrorKind::NegOverflow => Ok(i64::MIN),
        Err(_) => Err(BlockfsError::ProtocolError(format!(
            "invalid block id: {:?}",
            raw
        ))),
    }
}

fn parse_status(line: &str) -> Option<PoolStats> {
    let mut fields = line.split(' ');
    let mut next_count = |label: &str| -> Option<usize> {
        if fields.next()? != label {
            return None;
        }
        fields.next()?.parse().ok()
    };

    let free = next_count("FREE")?;
    let allocated = next_count("USED")?;
    let capacity = next_count("CAPACITY")?;
    Some(PoolStats {
        capacity,
        free,
        allocated,
    })
}
