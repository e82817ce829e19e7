//! Authentication and secure-tunnel hooks.
//!
//! Both hooks are extension points: the default authenticator allows every
//! request (embedders supply their own policy), and the default secure
//! policy treats port 443 as a confidential channel. A bearer-token
//! authenticator is provided for hosts that want `Proxy-Authorization`
//! enforcement out of the box.

use http::StatusCode;

use crate::http::{RequestHead, Response};

/// Decision returned by an [`Authenticator`].
#[derive(Debug)]
pub enum AuthOutcome {
    /// Proceed with tunnel setup.
    Allow,

    /// Stop; the carried response (error or challenge) is sent to the client
    /// and no tunnel is created.
    Deny(Response),
}

/// Hook invoked before a tunnel is set up, with the parsed request head and
/// the resolved `host:port` target.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &RequestHead, target: &str) -> AuthOutcome;
}

/// Default authenticator: every request may tunnel.
#[derive(Debug, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _request: &RequestHead, _target: &str) -> AuthOutcome {
        AuthOutcome::Allow
    }
}

/// Checks `Proxy-Authorization: Bearer <token>` against a fixed token.
///
/// Missing credentials produce a 407 challenge; wrong credentials produce
/// a 403.
pub struct BearerTokenAuthenticator {
    token: String,
}

impl BearerTokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authenticator for BearerTokenAuthenticator {
    fn authenticate(&self, request: &RequestHead, _target: &str) -> AuthOutcome {
        match request.header("proxy-authorization") {
            Some(value) => {
                let presented = value.strip_prefix("Bearer ").map(str::trim);
                if presented == Some(self.token.as_str()) {
                    AuthOutcome::Allow
                } else {
                    AuthOutcome::Deny(
                        Response::new(StatusCode::FORBIDDEN).with_body("invalid proxy credentials"),
                    )
                }
            }
            None => AuthOutcome::Deny(
                Response::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
                    .with_header("Proxy-Authenticate", "Bearer")
                    .with_body("proxy authentication required"),
            ),
        }
    }
}

/// Predicate deciding whether a tunnel target identifies a confidential
/// (SSL) channel.
pub trait SecurePolicy: Send + Sync {
    fn is_secure(&self, host: &str, port: u16) -> bool;
}

/// Default policy: port 443 is secure.
#[derive(Debug, Default)]
pub struct PortSecurePolicy;

impl SecurePolicy for PortSecurePolicy {
    fn is_secure(&self, _host: &str, port: u16) -> bool {
        port == 443
    }
}
