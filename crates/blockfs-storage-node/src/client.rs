use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use blockfs_common::types::{BlockId, PoolStats};

use crate::protocol::{Request, Response};

/// Persistent connection to one storage node.
///
/// This is what a coordinator uses to drive a node; every call is one
/// request line followed by one response line.
pub struct NodeClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl NodeClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to storage node")?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Allocate a block, `None` when the node is full.
    pub async fn allocate(&mut self) -> Result<Option<BlockId>> {
        match self.send(&Request::Alloc).await? {
            Response::Allocated(id) => Ok(Some(id)),
            Response::Full => Ok(None),
            Response::Error(message) => Err(anyhow!("Failed to allocate block: {}", message)),
            other => Err(anyhow!("Unexpected response to ALLOC: {}", other)),
        }
    }

    /// Block contents, `None` when the node reports the block invalid.
    pub async fn read(&mut self, id: BlockId) -> Result<Option<String>> {
        let request = Request::Read { id: wire_id(id)? };
        let line = self.request(&request.to_string()).await?;
        if line == Response::Invalid.to_string() {
            return Ok(None);
        }
        Ok(Some(line))
    }

    /// `false` when the node reports the block invalid.
    pub async fn write(&mut self, id: BlockId, content: &str) -> Result<bool> {
        if content.contains(['\n', '\r']) {
            bail!("block content must fit on one line");
        }

        let request = Request::Write {
            id: wire_id(id)?,
            content: content.to_string(),
        };
        match self.send(&request).await? {
            Response::Written => Ok(true),
            Response::Invalid => Ok(false),
            Response::Error(message) => Err(anyhow!("Failed to write block {}: {}", id, message)),
            other => Err(anyhow!("Unexpected response to WRITE: {}", other)),
        }
    }

    pub async fn status(&mut self) -> Result<PoolStats> {
        match self.send(&Request::Status).await? {
            Response::Status(stats) => Ok(stats),
            other => Err(anyhow!("Unexpected response to STATUS: {}", other)),
        }
    }

    /// Send the terminator and wait for the node to acknowledge it.
    pub async fn close(mut self) -> Result<()> {
        match self.send(&Request::Quit).await? {
            Response::Bye => Ok(()),
            other => Err(anyhow!("Unexpected response to terminator: {}", other)),
        }
    }

    /// Send one raw line and return the raw response line without its terminator.
    pub async fn request(&mut self, line: &str) -> Result<String> {
        debug!("📤 Sending request: {}", line);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;

        let mut response = String::new();
        let read = self.reader.read_line(&mut response).await?;
        if read == 0 {
            bail!("storage node closed the connection");
        }

        let response = response.trim_end_matches(['\r', '\n']).to_string();
        debug!("📨 Received response: {}", response);
        Ok(response)
    }

    async fn send(&mut self, request: &Request) -> Result<Response> {
        let line = self.request(&request.to_string()).await?;
        Ok(Response::parse(&line)?)
    }
}

fn wire_id(id: BlockId) -> Result<i64> {
    i64::try_from(id).with_context(|| format!("block id {} is too large to send", id))
}
