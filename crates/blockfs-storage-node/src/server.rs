//! TCP front end for a storage node
//!
//! One listener task accepts connections and spawns one session task per
//! connection. Sessions share nothing except the [`BlockPool`].

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use blockfs_common::config::NodeConfig;
use blockfs_common::error::BlockfsError;
use blockfs_common::types::BlockId;

use crate::block_pool::BlockPool;
use crate::protocol::{Request, Response};

/// Storage node listener
pub struct NodeServer {
    pool: Arc<BlockPool>,
    listener: TcpListener,
    connection_limit: Arc<Semaphore>,
    session: SessionLimits,
    drain_timeout: Duration,
}

/// Per-connection bounds applied by every session
#[derive(Debug, Clone, Copy)]
struct SessionLimits {
    idle_timeout: Option<Duration>,
    max_request_bytes: usize,
}

/// Outcome of waiting for the next request line
enum Frame {
    Line(String),
    NotUtf8,
    TooLong,
    Closed,
    Idle,
}

impl NodeServer {
    /// Bind the listening socket. A bind failure surfaces as
    /// [`BlockfsError::BindFailed`] so the caller can pick the exit status.
    pub async fn bind(config: &NodeConfig, pool: Arc<BlockPool>) -> Result<Self> {
        let addr = config.bind_address();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BlockfsError::BindFailed { addr, source })?;

        info!("🚀 Storage node listening on {}", listener.local_addr()?);

        Ok(Self {
            pool,
            listener,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            session: SessionLimits {
                idle_timeout: config.idle_timeout(),
                max_request_bytes: config.max_request_bytes,
            },
            drain_timeout: config.drain_timeout(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves, then close the listening
    /// socket and give in-flight sessions up to the drain timeout to finish
    /// the request they are serving.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.connection_limit.clone().acquire_owned() => {
                    permit.context("connection limiter closed")?
                }
            };

            let (stream, addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let session_id = Uuid::new_v4();
            info!("📞 Connection {} established from {}", session_id, addr);

            let pool = self.pool.clone();
            let limits = self.session;
            let shutdown_rx = shutdown_rx.clone();
            sessions.spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(session_id, stream, pool, limits, shutdown_rx).await {
                    error!("Connection {} failed: {}", session_id, e);
                }
                info!("📴 Connection {} closed", session_id);
            });

            while let Some(finished) = sessions.try_join_next() {
                if let Err(e) = finished {
                    error!("Session task panicked: {}", e);
                }
            }
        }

        info!("🛑 Closing listener, {} sessions still open", sessions.len());
        drop(self.listener);
        let _ = shutdown_tx.send(true);

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(finished) = sessions.join_next().await {
                if let Err(e) = finished {
                    error!("Session task panicked: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Drain timeout reached, aborting {} sessions",
                sessions.len()
            );
            sessions.shutdown().await;
        }

        info!("✅ Storage node server stopped");
        Ok(())
    }
}

/// Serve one client until it disconnects, sends the terminator, goes idle,
/// or the node shuts down. Bad request lines get an error response and the
/// session carries on.
async fn handle_connection(
    session_id: Uuid,
    mut stream: TcpStream,
    pool: Arc<BlockPool>,
    limits: SessionLimits,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let frame = tokio::select! {
            frame = next_frame(&mut reader, &mut buf, limits) => frame?,
            _ = shutdown.changed() => {
                debug!("Node shutting down, ending session {}", session_id);
                break;
            }
        };

        let line = match frame {
            Frame::Line(line) => line,
            Frame::Closed => {
                debug!("Client on {} disconnected", session_id);
                break;
            }
            Frame::Idle => {
                info!("Closing idle connection {}", session_id);
                break;
            }
            Frame::NotUtf8 => {
                warn!("{} sent a request that is not valid UTF-8", session_id);
                let e = BlockfsError::ProtocolError("request is not valid UTF-8".to_string());
                send_response(&mut writer, &Response::Error(e.to_string())).await?;
                continue;
            }
            Frame::TooLong => {
                warn!(
                    "{} sent a request longer than {} bytes",
                    session_id, limits.max_request_bytes
                );
                let e = BlockfsError::ProtocolError(format!(
                    "request exceeds {} bytes",
                    limits.max_request_bytes
                ));
                send_response(&mut writer, &Response::Error(e.to_string())).await?;
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        debug!("📨 {} request: {}", session_id, line.trim_end());

        let (response, quit) = match Request::parse(&line) {
            Ok(Request::Quit) => (Response::Bye, true),
            Ok(request) => (process_request(request, &pool).await, false),
            Err(e) => {
                warn!("{} sent a bad request {:?}: {}", session_id, line.trim_end(), e);
                (Response::Error(e.to_string()), false)
            }
        };

        send_response(&mut writer, &response).await?;

        if quit {
            break;
        }
    }

    Ok(())
}

async fn send_response<W>(writer: &mut W, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reply = format!("{}\n", response);
    writer
        .write_all(reply.as_bytes())
        .await
        .context("failed to send response")
}

/// Wait for the next request line, applying the idle timeout to the whole read.
async fn next_frame<R>(reader: &mut R, buf: &mut Vec<u8>, limits: SessionLimits) -> Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let read = read_frame(reader, buf, limits.max_request_bytes);
    let frame = match limits.idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, read).await {
            Ok(frame) => frame,
            Err(_) => return Ok(Frame::Idle),
        },
        None => read.await,
    };

    frame.context("failed to read request")
}

/// Read at most `max_bytes` of one line. An oversized line is consumed up to
/// and including its newline so the next request starts clean.
async fn read_frame<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader)
        .take(max_bytes as u64)
        .read_until(b'\n', buf)
        .await?;
    if read == 0 {
        return Ok(Frame::Closed);
    }

    if buf.last() != Some(&b'\n') && buf.len() >= max_bytes {
        skip_line(reader).await?;
        return Ok(Frame::TooLong);
    }

    Ok(match std::str::from_utf8(buf) {
        Ok(line) => Frame::Line(line.to_string()),
        Err(_) => Frame::NotUtf8,
    })
}

async fn skip_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        match chunk.iter().position(|b| *b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = chunk.len();
                reader.consume(len);
            }
        }
    }
}

async fn process_request(request: Request, pool: &BlockPool) -> Response {
    match request {
        Request::Alloc => match pool.allocate().await {
            Ok(Some(id)) => Response::Allocated(id),
            Ok(None) => Response::Full,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::Read { id } => {
            let Some(id) = to_block_id(id) else {
                return Response::Invalid;
            };
            match pool.read(id).await {
                Ok(contents) => Response::Contents(String::from_utf8_lossy(&contents).into_owned()),
                Err(e) if e.is_invalid_block() => Response::Invalid,
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::Write { id, content } => {
            let Some(id) = to_block_id(id) else {
                return Response::Invalid;
            };
            match pool.write(id, content.as_bytes()).await {
                Ok(()) => Response::Written,
                Err(e) if e.is_invalid_block() => Response::Invalid,
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::Status => Response::Status(pool.stats()),
        Request::Quit => Response::Bye,
    }
}

fn to_block_id(raw: i64) -> Option<BlockId> {
    BlockId::try_from(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_process_request_maps_pool_results() {
        let temp_dir = TempDir::new().unwrap();
        let pool = BlockPool::new(1, temp_dir.path());

        assert_eq!(process_request(Request::Alloc, &pool).await, Response::Allocated(0));
        assert_eq!(process_request(Request::Alloc, &pool).await, Response::Full);

        let write = Request::Write {
            id: 0,
            content: "hello".to_string(),
        };
        assert_eq!(process_request(write, &pool).await, Response::Written);
        assert_eq!(
            process_request(Request::Read { id: 0 }, &pool).await,
            Response::Contents("hello".to_string())
        );

        assert_eq!(process_request(Request::Read { id: -3 }, &pool).await, Response::Invalid);
        assert_eq!(process_request(Request::Read { id: 5 }, &pool).await, Response::Invalid);
        let stray = Request::Write {
            id: 9,
            content: "x".to_string(),
        };
        assert_eq!(process_request(stray, &pool).await, Response::Invalid);
    }

    #[tokio::test]
    async fn test_read_of_missing_backing_file_is_invalid() {
        let temp_dir = TempDir::new().unwrap();
        let pool = BlockPool::new(2, temp_dir.path());
        pool.allocate().await.unwrap();

        std::fs::remove_file(pool.block_path(0)).unwrap();

        assert_eq!(process_request(Request::Read { id: 0 }, &pool).await, Response::Invalid);
        let write = Request::Write {
            id: 0,
            content: "x".to_string(),
        };
        assert_eq!(process_request(write, &pool).await, Response::Invalid);
        assert!(!pool.block_path(0).exists());
    }

    #[tokio::test]
    async fn test_read_frame_bounds_and_resyncs() {
        let input: &[u8] = b"ALLOC\nREAD 0123456789\n\xff\xfe\nSTATUS";
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();

        let mut frames = Vec::new();
        for _ in 0..5 {
            frames.push(read_frame(&mut reader, &mut buf, 8).await.unwrap());
        }

        assert!(matches!(&frames[0], Frame::Line(line) if line == "ALLOC\n"));
        assert!(matches!(frames[1], Frame::TooLong));
        assert!(matches!(frames[2], Frame::NotUtf8));
        assert!(matches!(&frames[3], Frame::Line(line) if line == "STATUS"));
        assert!(matches!(frames[4], Frame::Closed));
    }
}
