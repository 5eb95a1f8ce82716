//! Correlated JSON-RPC requests over one peer's byte stream.
//!
//! A single background reader task owns the read half and hands each
//! response to the waiter registered under its id. Writes go through a
//! mutex so frames never interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use toolmux_core::error::ProtocolError;
use toolmux_core::protocol::{FrameReader, FrameWriter, RpcError, RpcRequest, RpcResponse};
use tracing::{debug, trace, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("no response within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("peer returned an error: {0}")]
    Remote(RpcError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Default)]
struct Waiters {
    closed: bool,
    pending: HashMap<u64, oneshot::Sender<RpcResponse>>,
}

pub struct PeerChannel {
    peer: String,
    next_id: AtomicU64,
    waiters: Arc<Mutex<Waiters>>,
    writer: tokio::sync::Mutex<Option<FrameWriter<BoxedWriter>>>,
    reader: JoinHandle<()>,
}

impl PeerChannel {
    /// Wrap a peer's output (`reader`) and input (`writer`) streams.
    pub fn new<R, W>(peer: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let peer = peer.into();
        let waiters = Arc::new(Mutex::new(Waiters::default()));
        let frames = FrameReader::new(BufReader::new(reader));
        let reader = tokio::spawn(read_loop(peer.clone(), frames, Arc::clone(&waiters)));
        let writer: BoxedWriter = Box::new(writer);

        Self {
            peer,
            next_id: AtomicU64::new(1),
            waiters,
            writer: tokio::sync::Mutex::new(Some(FrameWriter::new(writer))),
            reader,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.waiters).closed
    }

    /// Requests still waiting for a response.
    pub fn pending(&self) -> usize {
        lock(&self.waiters).pending.len()
    }

    /// Send `method` and wait up to `timeout` for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = lock(&self.waiters);
            if waiters.closed {
                return Err(ChannelError::Closed);
            }
            waiters.pending.insert(id, tx);
        }

        trace!(peer = %self.peer, id, method, "Sending request");
        if let Err(e) = self.write(&RpcRequest::new(id, method, params)).await {
            self.forget(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response.into_result().map_err(ChannelError::Remote),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.forget(id);
                debug!(peer = %self.peer, id, method, "Request timed out");
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// Close our side: the peer sees EOF and every waiter resolves to
    /// [`ChannelError::Closed`]. Safe to call more than once.
    pub async fn close(&self) {
        close_waiters(&self.waiters);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            debug!(peer = %self.peer, "Closing channel");
            if let Err(e) = writer.shutdown().await {
                trace!(peer = %self.peer, "Writer shutdown: {e}");
            }
        }
    }

    async fn write(&self, request: &RpcRequest) -> Result<(), ChannelError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::Closed)?;
        writer.write(request).await.map_err(|e| match e {
            // A broken pipe means the peer is gone even if its output has
            // not hit EOF yet.
            ProtocolError::Io(_) => {
                close_waiters(&self.waiters);
                ChannelError::Closed
            }
            other => ChannelError::Protocol(other.to_string()),
        })
    }

    fn forget(&self, id: u64) {
        lock(&self.waiters).pending.remove(&id);
    }
}

impl Drop for PeerChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn lock(waiters: &Mutex<Waiters>) -> MutexGuard<'_, Waiters> {
    waiters.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mark closed and drop every sender so waiters observe `RecvError`.
fn close_waiters(waiters: &Mutex<Waiters>) {
    let mut waiters = lock(waiters);
    waiters.closed = true;
    waiters.pending.clear();
}

async fn read_loop<R>(peer: String, mut frames: FrameReader<BufReader<R>>, waiters: Arc<Mutex<Waiters>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match frames.read::<RpcResponse>().await {
            Ok(Some(response)) => {
                let Some(id) = response.id else {
                    warn!(peer = %peer, error = ?response.error, "Peer reported an uncorrelated error");
                    continue;
                };
                let waiter = lock(&waiters).pending.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(peer = %peer, id, "Discarding response with no waiter"),
                }
            }
            Ok(None) => {
                debug!(peer = %peer, "Peer closed its output");
                break;
            }
            Err(ProtocolError::Malformed(reason)) => {
                warn!(peer = %peer, "Skipping malformed frame: {reason}");
            }
            Err(e) => {
                warn!(peer = %peer, "Channel read failed: {e}");
                break;
            }
        }
    }

    close_waiters(&waiters);
}
