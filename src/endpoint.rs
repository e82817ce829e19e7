//! Non-blocking endpoint over a connected TCP socket.
//!
//! An `EndPoint` is the byte-level primitive underneath a tunnel leg: it
//! supports a non-blocking read (`fill`), a logically-blocking write with a
//! bounded writability wait (`write_fully`), and an idempotent `close` that
//! propagates FIN and wakes any pending readiness wait.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BytesMut};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Spare capacity guaranteed before each non-blocking read.
pub const READ_CHUNK: usize = 4096;

/// Outcome of a non-blocking read.
#[derive(Debug)]
pub enum Fill {
    /// Read `n` bytes into the buffer.
    Data(usize),

    /// No data available right now; try again after the next readiness event.
    WouldBlock,

    /// The remote side closed its write direction.
    Eof,
}

/// A non-blocking, bidirectional byte stream bound to one socket.
///
/// The socket is split into owned halves so that one connection can read from
/// its own endpoint while the peer connection writes to it concurrently.
/// `close` drops the write half (sending FIN) exactly once.
pub struct EndPoint {
    peer_addr: Option<SocketAddr>,
    read: OwnedReadHalf,
    write: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl EndPoint {
    pub fn new(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        Self {
            peer_addr,
            read,
            write: Mutex::new(Some(write)),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Address of the remote side, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reads whatever is currently available into `buf` without blocking.
    ///
    /// Returns `Fill::WouldBlock` when the socket has no data right now and
    /// `Fill::Eof` when the remote side has closed.
    pub fn fill(&self, buf: &mut BytesMut) -> io::Result<Fill> {
        if self.is_closed() {
            return Err(closed_error());
        }

        buf.reserve(READ_CHUNK);
        match self.read.try_read_buf(buf) {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => Ok(Fill::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Fill::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Waits until the endpoint has data to read.
    ///
    /// Completes with an error once the endpoint is closed locally, so that a
    /// pump blocked here observes the teardown of its tunnel.
    pub async fn readable(&self) -> io::Result<()> {
        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        if self.is_closed() {
            return Err(closed_error());
        }

        tokio::select! {
            ready = self.read.readable() => ready,
            _ = shutdown => Err(closed_error()),
        }
    }

    /// Writes the whole buffer, blocking (with a per-wait timeout) whenever
    /// the socket is not writable.
    ///
    /// The write is logically blocking from the caller's perspective even
    /// though the socket is non-blocking: flush what fits, compact, and wait
    /// for writability before retrying. A wait that exceeds `write_timeout`
    /// fails with `TimedOut`.
    pub async fn write_fully(&self, buf: &mut BytesMut, write_timeout: Duration) -> io::Result<()> {
        let guard = self.write.lock().await;
        let write = guard.as_ref().ok_or_else(closed_error)?;

        while !buf.is_empty() {
            match write.try_write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match timeout(write_timeout, write.writable()).await {
                        Ok(ready) => ready?,
                        Err(_) => {
                            return Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                "timed out waiting for peer to become writable",
                            ))
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Closes the write direction exactly once and wakes pending waits.
    ///
    /// Dropping the write half sends FIN; the read half stays usable until
    /// the owning connection is dropped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.write.lock().await.take();
        self.shutdown.notify_waiters();
        debug!(peer = ?self.peer_addr, "endpoint closed");
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "endpoint closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn fill_reports_would_block_then_data() {
        let (client, mut server) = socket_pair().await;
        let endpoint = EndPoint::new(client);
        let mut buf = BytesMut::new();

        assert!(matches!(endpoint.fill(&mut buf).unwrap(), Fill::WouldBlock));

        server.write_all(b"hello").await.unwrap();
        endpoint.readable().await.unwrap();
        match endpoint.fill(&mut buf).unwrap() {
            Fill::Data(n) => assert_eq!(n, 5),
            other => panic!("expected data, got {:?}", other),
        }
        assert_eq!(&buf[..], b"hello");
    }

    #[tokio::test]
    async fn fill_reports_eof_after_remote_close() {
        let (client, server) = socket_pair().await;
        let endpoint = EndPoint::new(client);
        drop(server);

        endpoint.readable().await.unwrap();
        let mut buf = BytesMut::new();
        assert!(matches!(endpoint.fill(&mut buf).unwrap(), Fill::Eof));
    }

    #[tokio::test]
    async fn write_fully_drains_the_whole_buffer() {
        let (client, mut server) = socket_pair().await;
        let endpoint = EndPoint::new(client);

        let payload = vec![b'x'; 32 * 1024];
        let mut buf = BytesMut::from(&payload[..]);
        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            received
        });

        endpoint
            .write_fully(&mut buf, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(buf.is_empty());
        endpoint.close().await;

        let received = reader.await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_sends_fin() {
        let (client, mut server) = socket_pair().await;
        let endpoint = EndPoint::new(client);

        endpoint.close().await;
        endpoint.close().await;
        assert!(endpoint.is_closed());

        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_wakes_a_pending_readable_wait() {
        let (client, _server) = socket_pair().await;
        let endpoint = std::sync::Arc::new(EndPoint::new(client));

        let waiter = {
            let endpoint = std::sync::Arc::clone(&endpoint);
            tokio::spawn(async move { endpoint.readable().await })
        };
        tokio::task::yield_now().await;
        endpoint.close().await;

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap();
        assert!(result.unwrap().is_err());
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let (client, _server) = socket_pair().await;
        let endpoint = EndPoint::new(client);
        endpoint.close().await;

        let mut buf = BytesMut::from(&b"late"[..]);
        let err = endpoint
            .write_fully(&mut buf, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
