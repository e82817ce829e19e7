//! Readiness dispatch loop.
//!
//! The `Dispatcher` is the selector-manager analog of this crate: channels
//! are registered with an attachment, the loop turns each one into an
//! endpoint and a connection (via the `ConnectionFactory` capability), fires
//! the opened notification, and then drives the connection's handler once per
//! readiness event. Handler invocations for one channel never overlap;
//! different channels run in parallel on the shared tokio worker pool.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::endpoint::EndPoint;

/// What a handler invocation tells the dispatch loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// No more data right now; re-dispatch on the next readiness event.
    Continue,

    /// The connection is finished; stop driving it.
    Closed,
}

/// A registered connection driven by the dispatch loop.
///
/// `handle` must drain everything currently available and return; it is never
/// invoked concurrently for the same connection.
pub trait Connection: Send + Sync + 'static {
    fn handle(&self) -> impl Future<Output = io::Result<Flow>> + Send;

    /// Awaits readiness of the underlying endpoint.
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// Tears the connection down, propagating the close to its peer.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Capability interface invoked when a registered channel becomes active:
/// endpoint creation, then connection creation (binding the attachment),
/// then the opened notification.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Attachment: Send + 'static;
    type Conn: Connection;

    fn new_connection(
        &self,
        endpoint: Arc<EndPoint>,
        attachment: Self::Attachment,
    ) -> Arc<Self::Conn>;

    /// Called once the connection is installed, before the first dispatch.
    /// Releases any waiter blocked on connection establishment.
    fn connection_opened(&self, _conn: &Arc<Self::Conn>) {}
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is not running")]
    NotRunning,
}

struct Registration<A> {
    stream: TcpStream,
    attachment: A,
}

struct Inner<A> {
    register_tx: Option<mpsc::UnboundedSender<Registration<A>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

/// Dispatch loop over registered channels.
pub struct Dispatcher<F: ConnectionFactory> {
    factory: Arc<F>,
    active: Arc<AtomicUsize>,
    inner: Mutex<Inner<F::Attachment>>,
}

impl<F: ConnectionFactory> Dispatcher<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            active: Arc::new(AtomicUsize::new(0)),
            inner: Mutex::new(Inner {
                register_tx: None,
                shutdown_tx: None,
            }),
        }
    }

    /// Starts the dispatch loop on the current runtime. Idempotent.
    pub fn start(&self) {
        let mut inner = self.lock();
        if inner.register_tx.is_some() {
            return;
        }

        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run_loop(
            Arc::clone(&self.factory),
            Arc::clone(&self.active),
            register_rx,
            shutdown_rx,
        ));

        inner.register_tx = Some(register_tx);
        inner.shutdown_tx = Some(shutdown_tx);
        debug!("dispatch loop started");
    }

    /// Stops the loop and releases registrations. In-flight handler
    /// invocations are allowed to finish.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.register_tx = None;
        if let Some(shutdown_tx) = inner.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().register_tx.is_some()
    }

    /// Number of registered channels currently being driven.
    pub fn active_channels(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Submits a connected channel for readiness dispatch. The attachment is
    /// delivered back to the connection factory when the channel is
    /// installed.
    pub fn register(
        &self,
        stream: TcpStream,
        attachment: F::Attachment,
    ) -> Result<(), DispatchError> {
        let inner = self.lock();
        let register_tx = inner.register_tx.as_ref().ok_or(DispatchError::NotRunning)?;
        register_tx
            .send(Registration { stream, attachment })
            .map_err(|_| DispatchError::NotRunning)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<F::Attachment>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_loop<F: ConnectionFactory>(
    factory: Arc<F>,
    active: Arc<AtomicUsize>,
    mut register_rx: mpsc::UnboundedReceiver<Registration<F::Attachment>>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut drivers = JoinSet::new();
    let mut shutdown = shutdown_rx.clone();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            registration = register_rx.recv() => {
                let Some(Registration { stream, attachment }) = registration else { break };
                let endpoint = Arc::new(EndPoint::new(stream));
                let conn = factory.new_connection(endpoint, attachment);
                factory.connection_opened(&conn);

                active.fetch_add(1, Ordering::AcqRel);
                let active = Arc::clone(&active);
                let shutdown_rx = shutdown_rx.clone();
                drivers.spawn(async move {
                    drive(&*conn, shutdown_rx).await;
                    active.fetch_sub(1, Ordering::AcqRel);
                });
            }
        }
    }

    // Let per-channel drivers wind down before the loop task retires.
    while drivers.join_next().await.is_some() {}
    debug!("dispatch loop stopped");
}

/// Drives one connection: an initial dispatch, then one `handle` per
/// readiness event, until the connection closes, errors, or shutdown is
/// signalled. Errors are logged and end only this channel.
pub(crate) async fn drive<C: Connection>(conn: &C, mut shutdown: watch::Receiver<bool>) {
    loop {
        match conn.handle().await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Closed) => break,
            Err(e) => {
                warn!(error = %e, "connection handler failed");
                break;
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            ready = conn.readable() => {
                if let Err(e) = ready {
                    debug!(error = %e, "endpoint no longer readable");
                    break;
                }
            }
        }
    }

    conn.close().await;
}
