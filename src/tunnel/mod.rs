//! CONNECT/transparent tunnelling proxy.

mod connection;
mod proxy;

pub use connection::{ClientToProxy, ProxyToServer};
pub use proxy::TunnelProxy;
