//! Tunnel orchestrator: CONNECT and transparent proxying.
//!
//! The proxy accepts inbound connections, classifies each request (CONNECT
//! carries its target in the authority; transparent mode uses the configured
//! server address), runs the authentication hook, opens the outbound socket
//! with a timeout, wires the two tunnel legs, and upgrades the inbound
//! connection into a raw byte relay. From that point the orchestrator is
//! inert: the dispatcher drives the outbound leg and the accept task hands
//! itself over to the inbound pump.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use bytes::BytesMut;
use http::StatusCode;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::auth::{AllowAll, AuthOutcome, Authenticator, PortSecurePolicy, SecurePolicy};
use crate::config::ProxyConfig;
use crate::dispatch::{drive, Connection, ConnectionFactory, Dispatcher};
use crate::endpoint::EndPoint;
use crate::http::{read_request_head, write_response, RequestHead, Response};
use crate::latch::LatchWait;
use crate::metrics;

use super::connection::{ClientToProxy, ProxyToServer};

/// The CONNECT handshake response, flushed before any tunnelled byte.
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Dispatcher factory for outbound legs. The attachment is the pre-wired
/// outbound connection; registration binds its endpoint and fires its ready
/// latch.
pub(crate) struct TunnelFactory;

impl ConnectionFactory for TunnelFactory {
    type Attachment = Arc<ProxyToServer>;
    type Conn = ProxyToServer;

    fn new_connection(
        &self,
        endpoint: Arc<EndPoint>,
        attachment: Arc<ProxyToServer>,
    ) -> Arc<ProxyToServer> {
        attachment.bind_endpoint(endpoint);
        attachment
    }

    fn connection_opened(&self, conn: &Arc<ProxyToServer>) {
        conn.signal_ready();
    }
}

struct ListenerState {
    shutdown_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// CONNECT/transparent tunnelling proxy.
///
/// Without a server address the proxy works via HTTP CONNECT, taking the
/// target from each request's authority. With a configured `host:port` it
/// works as a transparent proxy, tunnelling every request to that address.
pub struct TunnelProxy {
    server_address: Option<String>,
    connect_timeout: Duration,
    write_timeout: Duration,
    authenticator: Arc<dyn Authenticator>,
    secure_policy: Arc<dyn SecurePolicy>,
    dispatcher: Dispatcher<TunnelFactory>,
    state: Mutex<Option<ListenerState>>,
}

impl TunnelProxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            server_address: config.server_address,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            authenticator: Arc::new(AllowAll),
            secure_policy: Arc::new(PortSecurePolicy),
            dispatcher: Dispatcher::new(TunnelFactory),
            state: Mutex::new(None),
        }
    }

    /// Replaces the authentication hook.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Replaces the secure-tunnel predicate.
    pub fn with_secure_policy(mut self, secure_policy: Arc<dyn SecurePolicy>) -> Self {
        self.secure_policy = secure_policy;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Number of outbound legs currently registered with the dispatcher.
    pub fn active_tunnels(&self) -> usize {
        self.dispatcher.active_channels()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().map(|state| state.local_addr)
    }

    /// Binds the listener and starts accepting. Idempotent: a second call
    /// returns the already-bound address.
    pub async fn start(self: &Arc<Self>, addr: &str) -> Result<SocketAddr> {
        if let Some(state) = self.lock().as_ref() {
            return Ok(state.local_addr);
        }

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind tunnel proxy listener on {addr}"))?;
        let local_addr = listener.local_addr()?;

        let mut state = self.lock();
        if let Some(existing) = state.as_ref() {
            return Ok(existing.local_addr);
        }

        self.dispatcher.start();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(self).accept_loop(listener, shutdown_rx));
        *state = Some(ListenerState {
            shutdown_tx,
            local_addr,
        });

        info!(
            %local_addr,
            transparent = self.server_address.is_some(),
            "tunnel proxy started"
        );
        Ok(local_addr)
    }

    /// Stops accepting and releases all tunnel registrations. In-flight
    /// pump invocations finish before their channels close.
    pub fn stop(&self) {
        if let Some(state) = self.lock().take() {
            let _ = state.shutdown_tx.send(true);
            self.dispatcher.stop();
            info!("tunnel proxy stopped");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ListenerState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted proxy connection");
                        let proxy = Arc::clone(&self);
                        let shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            proxy.handle_connection(stream, shutdown).await;
                        });
                    }
                    // Accept errors never terminate the loop.
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        debug!("tunnel proxy accept loop stopped");
    }

    async fn handle_connection(&self, stream: TcpStream, shutdown: watch::Receiver<bool>) {
        stream.set_nodelay(true).ok();
        let client = Arc::new(EndPoint::new(stream));

        let (head, leftover) = match read_request_head(&client).await {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "failed to read request head");
                self.reject(
                    &client,
                    Response::new(StatusCode::BAD_REQUEST).with_body("malformed request"),
                )
                .await;
                return;
            }
        };

        // Received: classify the tunnel target.
        let target = if head.is_connect() {
            head.target.clone()
        } else if let Some(address) = &self.server_address {
            address.clone()
        } else {
            warn!(method = %head.method, "transparent request without a configured server address");
            metrics::TUNNELS_FAILED.with_label_values(&["configuration"]).inc();
            self.reject(
                &client,
                Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                    .with_body("proxy has no server address configured"),
            )
            .await;
            return;
        };
        debug!(method = %head.method, %target, "tunnel requested");

        // Authenticating.
        if let AuthOutcome::Deny(response) = self.authenticator.authenticate(&head, &target) {
            debug!(%target, status = response.status().as_u16(), "authentication rejected tunnel");
            metrics::TUNNELS_FAILED.with_label_values(&["auth"]).inc();
            self.reject(&client, response).await;
            return;
        }

        // Connecting.
        let (host, port) = match parse_authority(&target) {
            Ok(parsed) => parsed,
            Err(reason) => {
                debug!(%target, %reason, "invalid tunnel target");
                metrics::TUNNELS_FAILED.with_label_values(&["target"]).inc();
                self.reject(&client, Response::new(StatusCode::BAD_REQUEST).with_body(reason))
                    .await;
                return;
            }
        };
        let secure = self.secure_policy.is_secure(&host, port);
        let address = format!("{host}:{port}");

        let upstream = match timeout(self.connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(%address, error = %e, "upstream connection failed");
                metrics::TUNNELS_FAILED.with_label_values(&["connect"]).inc();
                self.reject(
                    &client,
                    Response::new(StatusCode::BAD_GATEWAY)
                        .with_body("failed to connect to upstream server"),
                )
                .await;
                return;
            }
            Err(_) => {
                warn!(
                    %address,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "upstream connection timed out"
                );
                metrics::TUNNELS_FAILED.with_label_values(&["connect"]).inc();
                self.reject(
                    &client,
                    Response::new(StatusCode::BAD_GATEWAY)
                        .with_body("timed out connecting to upstream server"),
                )
                .await;
                return;
            }
        };
        upstream.set_nodelay(true).ok();
        debug!(%address, secure, "established upstream connection");

        // Wiring: the outbound leg gets the pre-upgrade bytes and a handle
        // to the client endpoint before anything is registered.
        let preamble = preamble(&head, leftover);
        let proxy_to_server = Arc::new(ProxyToServer::new(
            secure,
            preamble,
            Arc::clone(&client),
            self.write_timeout,
        ));

        // Upgrading: CONNECT answers 200 OK, flushed before the outbound leg
        // is registered so the client sees it before any tunnelled byte.
        if head.is_connect() {
            let mut established = BytesMut::from(CONNECT_ESTABLISHED);
            if let Err(e) = client.write_fully(&mut established, self.write_timeout).await {
                debug!(error = %e, "failed to flush CONNECT response");
                proxy_to_server.close().await;
                return;
            }
        }

        if self
            .dispatcher
            .register(upstream, Arc::clone(&proxy_to_server))
            .is_err()
        {
            // Proxy is stopping; the unregistered socket is dropped.
            proxy_to_server.close().await;
            return;
        }

        // No byte may flow until the outbound endpoint is confirmed open.
        if let LatchWait::TimedOut = proxy_to_server.wait_ready(self.connect_timeout).await {
            warn!(%address, "outbound endpoint not confirmed open in time");
            metrics::TUNNELS_FAILED.with_label_values(&["ready"]).inc();
            proxy_to_server.close().await;
            return;
        }

        // The preamble must be on the wire before live client bytes can
        // overtake it.
        if let Err(e) = proxy_to_server.flush_preamble().await {
            warn!(%address, error = %e, "failed to forward pre-upgrade bytes");
            proxy_to_server.close().await;
            return;
        }

        metrics::TUNNELS_OPENED.inc();
        metrics::TUNNELS_ACTIVE.inc();
        info!(%address, secure, connect = head.is_connect(), "tunnel open");

        // Hand-off: this task stops HTTP processing and becomes the inbound
        // pump driver until either side closes.
        let client_leg =
            ClientToProxy::new(Arc::clone(&client), Arc::clone(&proxy_to_server), self.write_timeout);
        drive(&client_leg, shutdown).await;

        metrics::TUNNELS_ACTIVE.dec();
        metrics::TUNNELS_CLOSED.inc();
        debug!(%address, "tunnel closed");
    }

    async fn reject(&self, client: &EndPoint, response: Response) {
        if let Err(e) = write_response(client, &response, self.write_timeout).await {
            debug!(error = %e, "failed to write error response");
        }
        client.close().await;
    }
}

/// Assembles the bytes the upstream must see before live traffic: for
/// CONNECT, anything the client pipelined past its request head; for
/// transparent mode, the raw request head itself followed by the leftover.
fn preamble(head: &RequestHead, leftover: BytesMut) -> Option<BytesMut> {
    if head.is_connect() {
        if leftover.is_empty() {
            None
        } else {
            Some(leftover)
        }
    } else {
        let mut preamble = BytesMut::from(head.raw().as_ref());
        preamble.extend_from_slice(&leftover);
        Some(preamble)
    }
}

/// Splits a tunnel target into host and port. The port defaults to 80 when
/// the authority carries none; IPv6 literals keep their brackets so the
/// result can be passed straight to the connector.
fn parse_authority(authority: &str) -> std::result::Result<(String, u16), String> {
    if authority.is_empty() {
        return Err("authority cannot be empty".to_string());
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let Some((host, suffix)) = rest.split_once(']') else {
            return Err(format!("unterminated IPv6 literal in '{authority}'"));
        };
        if host.is_empty() {
            return Err("host cannot be empty".to_string());
        }
        return match suffix {
            "" => Ok((format!("[{host}]"), 80)),
            _ => match suffix.strip_prefix(':') {
                Some(port) => Ok((format!("[{host}]"), parse_port(port)?)),
                None => Err(format!("invalid authority '{authority}'")),
            },
        };
    }

    match authority.rsplit_once(':') {
        None => Ok((authority.to_string(), 80)),
        Some((host, port)) => {
            if host.is_empty() {
                return Err("host cannot be empty".to_string());
            }
            Ok((host.to_string(), parse_port(port)?))
        }
    }
}

fn parse_port(port: &str) -> std::result::Result<u16, String> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port '{port}': must be between 1 and 65535")),
        Ok(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_authority_valid() {
        assert_eq!(
            parse_authority("example.com:443"),
            Ok(("example.com".to_string(), 443))
        );
        assert_eq!(
            parse_authority("192.168.1.1:8080"),
            Ok(("192.168.1.1".to_string(), 8080))
        );
        assert_eq!(
            parse_authority("example.com:65535"),
            Ok(("example.com".to_string(), 65535))
        );
    }

    #[test]
    fn parse_authority_defaults_to_port_80() {
        assert_eq!(
            parse_authority("example.com"),
            Ok(("example.com".to_string(), 80))
        );
    }

    #[test]
    fn parse_authority_ipv6() {
        assert_eq!(parse_authority("[::1]:443"), Ok(("[::1]".to_string(), 443)));
        assert_eq!(parse_authority("[::1]"), Ok(("[::1]".to_string(), 80)));
        assert!(parse_authority("[::1").is_err());
    }

    #[test]
    fn parse_authority_invalid() {
        assert!(parse_authority("").is_err());
        assert!(parse_authority(":443").is_err());
        assert!(parse_authority("example.com:0").is_err());
        assert!(parse_authority("example.com:70000").is_err());
        assert!(parse_authority("example.com:abc").is_err());
    }

    #[test]
    fn connect_preamble_is_only_the_leftover() {
        let head = RequestHead::new("CONNECT", "example.com:443");
        assert!(preamble(&head, BytesMut::new()).is_none());

        let leftover = BytesMut::from(&b"early bytes"[..]);
        let assembled = preamble(&head, leftover).unwrap();
        assert_eq!(&assembled[..], b"early bytes");
    }

    #[test]
    fn transparent_preamble_replays_the_request_head() {
        let head = RequestHead::new("GET", "/index.html");
        let assembled = preamble(&head, BytesMut::from(&b"tail"[..])).unwrap();
        // A synthetic head has no raw bytes; only the leftover remains.
        assert_eq!(&assembled[..], b"tail");
    }
}
