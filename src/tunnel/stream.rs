//! Logical connection stream
//!
//! [`TunnelStream`] is one multiplexed L4 flow. Reads drain a bounded
//! per-connection buffer fed by the tunnel's reader task; writes enqueue
//! addressed data frames onto the tunnel's shared outbound queue. When the
//! queue is full the write blocks, propagating flow control to the producing
//! socket instead of growing memory.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use super::protocol::{Frame, MAX_PAYLOAD_SIZE};

/// Depth of the per-connection inbound buffer
pub const INBOUND_BUFFER_DEPTH: usize = 64;

/// One logical connection multiplexed over the tunnel.
///
/// Implements `AsyncRead`/`AsyncWrite`, so a plain
/// `tokio::io::copy_bidirectional` pairs it with a TCP socket. Shutting the
/// write side down sends a close frame; the connection is fully closed on the
/// first close from either side.
pub struct TunnelStream {
    id: String,
    src_addr: String,
    dst_addr: String,
    inbound: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    outbound: PollSender<Frame>,
    /// Plain sender used for the best-effort close frame on drop
    close_tx: mpsc::Sender<Frame>,
    close_sent: bool,
}

impl TunnelStream {
    pub(crate) fn new(
        id: String,
        src_addr: String,
        dst_addr: String,
        inbound: mpsc::Receiver<Bytes>,
        outbound_tx: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            id,
            src_addr,
            dst_addr,
            inbound,
            leftover: Bytes::new(),
            outbound: PollSender::new(outbound_tx.clone()),
            close_tx: outbound_tx,
            close_sent: false,
        }
    }

    /// Connection id in canonical form
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Source address carried on every outgoing data frame
    #[must_use]
    pub fn src_addr(&self) -> &str {
        &self.src_addr
    }

    /// Destination address carried on every outgoing data frame
    #[must_use]
    pub fn dst_addr(&self) -> &str {
        &self.dst_addr
    }

    /// Suppress the close frame normally sent on shutdown or drop.
    ///
    /// Used when the caller reports the termination itself, e.g. a close
    /// frame carrying a dial error.
    pub(crate) fn disarm_close(&mut self) {
        self.close_sent = true;
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.remaining());
            buf.put_slice(&self.leftover[..n]);
            self.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }

        match self.inbound.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.leftover = data.slice(n..);
                }
                Poll::Ready(Ok(()))
            }
            // Sender dropped: remote close or tunnel teardown. EOF.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.close_sent {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        match self.outbound.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(MAX_PAYLOAD_SIZE);
                let frame = Frame::data(
                    self.id.clone(),
                    self.src_addr.clone(),
                    self.dst_addr.clone(),
                    Bytes::copy_from_slice(&buf[..n]),
                );
                if self.outbound.send_item(frame).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the tunnel's writer task.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.close_sent {
            return Poll::Ready(Ok(()));
        }
        match self.outbound.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let frame = Frame::close(self.id.clone());
                let _ = self.outbound.send_item(frame);
                self.close_sent = true;
                Poll::Ready(Ok(()))
            }
            // Tunnel gone; nothing left to close.
            Poll::Ready(Err(_)) => {
                self.close_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        if !self.close_sent {
            let _ = self.close_tx.try_send(Frame::close(self.id.clone()));
        }
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("id", &self.id)
            .field("close_sent", &self.close_sent)
            .finish_non_exhaustive()
    }
}
