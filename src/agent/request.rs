//! Request side of the agent
//!
//! [`RequestHandle`] is what the agent needs from the HTTP request waiting
//! for a connection; [`PooledConnection`] is what it gets back.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

use crate::agent::pool::SlotId;
use crate::agent::AgentInner;
use crate::error::{AgentError, Result};
use crate::models::Destination;
use crate::proxy::transport::BoxedConnection;

/// An outgoing request waiting for a connection
pub trait RequestHandle: Send + Sync {
    /// Deliver the connection. Called at most once per admission.
    fn on_socket(&self, connection: PooledConnection);

    /// Request header lookup (used for the TLS server name)
    fn header(&self, name: &str) -> Option<String>;

    fn is_aborted(&self) -> bool;

    /// Report a failure that ends this request
    fn emit_error(&self, error: AgentError);
}

/// A connection on loan from the agent.
///
/// Ends in exactly one of: [`release`](Self::release) (free for reuse by a
/// waiting request to the same origin), drop (closed), or
/// [`ConnectionAgent::remove_socket`](crate::agent::ConnectionAgent::remove_socket).
pub struct PooledConnection {
    slot: SlotId,
    destination: Destination,
    stream: Option<BoxedConnection>,
    agent: Weak<AgentInner>,
}

impl PooledConnection {
    pub(crate) fn new(
        slot: SlotId,
        destination: Destination,
        stream: BoxedConnection,
        agent: Weak<AgentInner>,
    ) -> Self {
        Self {
            slot,
            destination,
            stream: Some(stream),
            agent,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Return the connection for reuse
    pub fn release(mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        if let Some(agent) = self.agent.upgrade() {
            agent.free_socket(self.slot, self.destination.clone(), stream);
        }
    }

    fn stream_mut(&mut self) -> io::Result<&mut BoxedConnection> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.stream.take().is_none() {
            return;
        }
        if let Some(agent) = self.agent.upgrade() {
            agent.release_slot(self.slot);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.slot)
            .field("destination", &self.destination)
            .field("attached", &self.stream.is_some())
            .finish()
    }
}

impl AsyncRead for PooledConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream_mut() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

/// Request handle that resolves a oneshot channel, for callers that just
/// want to await a connection
pub struct ConnectRequest {
    host_header: Option<String>,
    aborted: AtomicBool,
    reply: Mutex<Option<oneshot::Sender<Result<PooledConnection>>>>,
}

impl ConnectRequest {
    pub fn new(
        host_header: Option<String>,
    ) -> (Arc<Self>, oneshot::Receiver<Result<PooledConnection>>) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            host_header,
            aborted: AtomicBool::new(false),
            reply: Mutex::new(Some(tx)),
        });
        (request, rx)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn reply(&self, result: Result<PooledConnection>) {
        if let Some(tx) = self.reply.lock().take() {
            // A dropped receiver drops the connection, which closes it.
            let _ = tx.send(result);
        }
    }
}

impl RequestHandle for ConnectRequest {
    fn on_socket(&self, connection: PooledConnection) {
        self.reply(Ok(connection));
    }

    fn header(&self, name: &str) -> Option<String> {
        if name.eq_ignore_ascii_case("host") {
            self.host_header.clone()
        } else {
            None
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn emit_error(&self, error: AgentError) {
        self.reply(Err(error));
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("host_header", &self.host_header)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
