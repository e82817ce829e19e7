//! Tunnel legs: the two symmetric byte-pump connections.
//!
//! Each leg drains whatever its own endpoint has available and forwards it
//! to the peer endpoint with a logically-blocking write. A read of EOF
//! closes the peer endpoint and tears the tunnel down; a write timeout is an
//! I/O error that does the same. There is no framing here: the tunnel is a
//! raw byte relay that preserves ordering within each direction.

use std::io;
use std::sync::{Arc, OnceLock};

use bytes::BytesMut;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::dispatch::{Connection, Flow};
use crate::endpoint::{EndPoint, Fill};
use crate::latch::{LatchWait, ReadyLatch};
use crate::metrics;

/// Drains `own` into the buffer and relays to `peer` until the read would
/// block (Continue) or the remote closed (Closed, after closing the peer).
async fn pump(
    direction: &'static str,
    own: &EndPoint,
    peer: &EndPoint,
    buffer: &mut BytesMut,
    write_timeout: Duration,
) -> io::Result<Flow> {
    loop {
        match own.fill(buffer)? {
            Fill::Eof => {
                debug!(direction, "remote closed; propagating to peer leg");
                peer.close().await;
                return Ok(Flow::Closed);
            }
            Fill::WouldBlock => return Ok(Flow::Continue),
            Fill::Data(n) => {
                trace!(direction, bytes = n, "relaying");
                metrics::TUNNEL_BYTES.with_label_values(&[direction]).inc_by(n as u64);
                peer.write_fully(buffer, write_timeout).await?;
            }
        }
    }
}

/// Outbound leg: proxy to the remote server.
///
/// Its endpoint is bound by the dispatcher when the outbound channel is
/// registered; `ready` fires at the opened notification so the orchestrator
/// can wait for the connection to be confirmed open before letting inbound
/// traffic flow. The pre-upgrade preamble (bytes the client sent past its
/// request head, plus the request itself in transparent mode) is written to
/// the server on the first dispatch.
pub struct ProxyToServer {
    endpoint: OnceLock<Arc<EndPoint>>,
    to_client: Arc<EndPoint>,
    preamble: Mutex<Option<BytesMut>>,
    buffer: Mutex<BytesMut>,
    ready: ReadyLatch,
    secure: bool,
    write_timeout: Duration,
}

impl ProxyToServer {
    pub(crate) fn new(
        secure: bool,
        preamble: Option<BytesMut>,
        to_client: Arc<EndPoint>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            endpoint: OnceLock::new(),
            to_client,
            preamble: Mutex::new(preamble),
            buffer: Mutex::new(BytesMut::new()),
            ready: ReadyLatch::new(),
            secure,
            write_timeout,
        }
    }

    /// Whether the tunnel target was classified as a confidential channel.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub(crate) fn bind_endpoint(&self, endpoint: Arc<EndPoint>) {
        let _ = self.endpoint.set(endpoint);
    }

    pub(crate) fn endpoint(&self) -> Option<&Arc<EndPoint>> {
        self.endpoint.get()
    }

    pub(crate) fn signal_ready(&self) {
        self.ready.ready();
    }

    /// Bounded wait for the outbound endpoint to be confirmed open.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> LatchWait {
        self.ready.wait(timeout).await
    }

    /// Writes the pre-upgrade bytes upstream, once. The orchestrator calls
    /// this after the ready latch fires so the preamble is on the wire
    /// before the inbound pump can forward live client bytes; the dispatch
    /// path calls it again harmlessly.
    pub(crate) async fn flush_preamble(&self) -> io::Result<()> {
        let Some(endpoint) = self.endpoint.get() else {
            return Ok(());
        };
        if let Some(mut preamble) = self.preamble.lock().await.take() {
            debug!(bytes = preamble.len(), "writing pre-upgrade bytes upstream");
            endpoint.write_fully(&mut preamble, self.write_timeout).await?;
        }
        Ok(())
    }
}

impl Connection for ProxyToServer {
    async fn handle(&self) -> io::Result<Flow> {
        let endpoint = self
            .endpoint
            .get()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "outbound endpoint not bound"))?;

        self.flush_preamble().await?;

        let mut buffer = self.buffer.lock().await;
        pump(
            "server_to_client",
            endpoint,
            &self.to_client,
            &mut buffer,
            self.write_timeout,
        )
        .await
    }

    async fn readable(&self) -> io::Result<()> {
        match self.endpoint.get() {
            Some(endpoint) => endpoint.readable().await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "outbound endpoint not bound",
            )),
        }
    }

    async fn close(&self) {
        if let Some(endpoint) = self.endpoint.get() {
            endpoint.close().await;
        }
        self.to_client.close().await;
    }
}

/// Inbound leg: client to the proxy.
///
/// Owns the upgraded client endpoint from construction and relays into the
/// outbound leg's endpoint. The orchestrator only builds this leg after the
/// outbound ready latch fired, so the peer endpoint is always bound by the
/// time the first byte is pumped.
pub struct ClientToProxy {
    endpoint: Arc<EndPoint>,
    to_server: Arc<ProxyToServer>,
    buffer: Mutex<BytesMut>,
    write_timeout: Duration,
}

impl ClientToProxy {
    pub(crate) fn new(
        endpoint: Arc<EndPoint>,
        to_server: Arc<ProxyToServer>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            to_server,
            buffer: Mutex::new(BytesMut::new()),
            write_timeout,
        }
    }
}

impl Connection for ClientToProxy {
    async fn handle(&self) -> io::Result<Flow> {
        let server = self.to_server.endpoint().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "outbound endpoint not bound")
        })?;

        let mut buffer = self.buffer.lock().await;
        pump(
            "client_to_server",
            &self.endpoint,
            server,
            &mut buffer,
            self.write_timeout,
        )
        .await
    }

    async fn readable(&self) -> io::Result<()> {
        self.endpoint.readable().await
    }

    async fn close(&self) {
        self.endpoint.close().await;
        if let Some(server) = self.to_server.endpoint() {
            server.close().await;
        }
    }
}
