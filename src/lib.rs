//! Culvert - Embeddable Tunnelling Proxy Core
//!
//! Culvert is the hard core of an embeddable HTTP server: a readiness
//! dispatch loop that multiplexes many sockets on a shared worker pool, an
//! HTTP CONNECT / transparent tunnelling proxy built on top of it, and a
//! size-bounded, mutation-aware resource content cache for static files.
//!
//! ## Features
//!
//! - **CONNECT tunnelling**: `CONNECT host:port` requests are answered with
//!   `200 OK` and upgraded into a raw bidirectional byte relay
//! - **Transparent mode**: a configured `host:port` receives every request,
//!   request head included, with no per-request target
//! - **Pluggable authentication**: an [`auth::Authenticator`] hook runs
//!   before any tunnel is set up; the default allows everything
//! - **Secure-tunnel detection**: an [`auth::SecurePolicy`] predicate marks
//!   confidential channels (default: port 443)
//! - **Bounded blocking**: writes wait for peer writability with a timeout;
//!   tunnel setup waits on a one-shot ready latch with a timeout
//! - **Resource cache**: LRU-by-lookup eviction under total-size, file-size
//!   and file-count budgets, with a freshness check on every lookup
//! - **Metrics**: Prometheus counters for tunnels and cache behaviour
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use culvert::config::ProxyConfig;
//! use culvert::tunnel::TunnelProxy;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = Arc::new(TunnelProxy::new(ProxyConfig::default()));
//!     let addr = proxy.start("127.0.0.1:3128").await?;
//!     println!("proxy listening on {addr}");
//!
//!     tokio::signal::ctrl_c().await?;
//!     proxy.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Culvert is a library meant to be embedded in a larger server:
//!
//! - `endpoint` - non-blocking socket endpoint (fill / write-fully / close)
//! - `latch` - one-shot readiness latch with bounded wait
//! - `dispatch` - readiness dispatch loop and connection factory
//! - `http` - request-head reader and pre-upgrade response writer
//! - `auth` - authentication and secure-tunnel hooks
//! - `tunnel` - the CONNECT/transparent proxy and its two pump legs
//! - `cache` - resource content cache
//! - `config` - proxy and cache configuration
//! - `metrics` - Prometheus metrics

pub mod auth;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod http;
pub mod latch;
pub mod metrics;
pub mod tunnel;

/// Tunnel proxy
pub use tunnel::TunnelProxy;

/// Resource cache
pub use cache::{CachedContent, DirectoryResourceFactory, Resource, ResourceCache, ResourceFactory};

/// Configuration
pub use config::{CacheConfig, ProxyConfig};

/// Hooks
pub use auth::{
    AllowAll, AuthOutcome, Authenticator, BearerTokenAuthenticator, PortSecurePolicy, SecurePolicy,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "culvert");
    }
}
