//! Minimal HTTP/1.1 request-head layer.
//!
//! The tunnel proxy only needs to read a request head (to classify CONNECT
//! vs transparent requests and run the authentication hook) and to write
//! small status responses before the connection is upgraded to a raw byte
//! relay. Bodies, chunked framing and pipelining edge cases are deliberately
//! not handled here.
//!
//! Bytes over-read past the head are returned to the caller: they are the
//! pre-upgrade leftover that must be forwarded upstream once the tunnel is
//! wired, before any new inbound data races in on the raw socket.

use std::collections::HashMap;
use std::io;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use thiserror::Error;
use tokio::time::Duration;

use crate::endpoint::{EndPoint, Fill};

/// Upper bound on a request head, including all headers.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("request head exceeds {MAX_HEAD_SIZE} bytes")]
    TooLarge,

    #[error("connection closed before a complete request head arrived")]
    UnexpectedEof,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed request head plus the raw bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    /// Header names lowercased; last value wins on duplicates.
    pub headers: HashMap<String, String>,
    raw: Bytes,
}

impl RequestHead {
    /// Builds a head without a socket, for hosts and tests exercising the
    /// authentication hook directly.
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            version: 1,
            headers: HashMap::new(),
            raw: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The raw head bytes exactly as received, including the final CRLF CRLF.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

/// Reads one request head from the endpoint.
///
/// Returns the parsed head and any leftover bytes that arrived after it.
pub async fn read_request_head(endpoint: &EndPoint) -> Result<(RequestHead, BytesMut), HttpError> {
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        if !buf.is_empty() {
            let parsed = {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut request = httparse::Request::new(&mut headers);
                match request.parse(&buf)? {
                    httparse::Status::Complete(head_len) => {
                        let method = request.method.unwrap_or_default().to_string();
                        let target = request.path.unwrap_or_default().to_string();
                        let version = request.version.unwrap_or(1);
                        let mut map = HashMap::with_capacity(request.headers.len());
                        for header in request.headers.iter() {
                            map.insert(
                                header.name.to_ascii_lowercase(),
                                String::from_utf8_lossy(header.value).trim().to_string(),
                            );
                        }
                        Some((head_len, method, target, version, map))
                    }
                    httparse::Status::Partial => {
                        if buf.len() >= MAX_HEAD_SIZE {
                            return Err(HttpError::TooLarge);
                        }
                        None
                    }
                }
            };

            if let Some((head_len, method, target, version, headers)) = parsed {
                let leftover = buf.split_off(head_len);
                let head = RequestHead {
                    method,
                    target,
                    version,
                    headers,
                    raw: buf.freeze(),
                };
                return Ok((head, leftover));
            }
        }

        endpoint.readable().await?;
        match endpoint.fill(&mut buf)? {
            Fill::Eof => return Err(HttpError::UnexpectedEof),
            Fill::WouldBlock | Fill::Data(_) => {}
        }
    }
}

/// A small status response written before any upgrade.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: String,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut out = String::with_capacity(128 + self.body.len());
        out.push_str(&format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("")
        ));
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        out.push_str("Connection: close\r\n\r\n");
        out.push_str(&self.body);
        BytesMut::from(out.as_bytes())
    }
}

/// Writes and flushes a response to the endpoint.
pub async fn write_response(
    endpoint: &EndPoint,
    response: &Response,
    write_timeout: Duration,
) -> io::Result<()> {
    let mut buf = response.to_bytes();
    endpoint.write_fully(&mut buf, write_timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn endpoint_with_input(input: &[u8]) -> (EndPoint, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut writer = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        writer.write_all(input).await.unwrap();
        (EndPoint::new(accepted), writer)
    }

    #[tokio::test]
    async fn parses_a_connect_head() {
        let (endpoint, _writer) =
            endpoint_with_input(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
                .await;

        let (head, leftover) = read_request_head(&endpoint).await.unwrap();
        assert!(head.is_connect());
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.version, 1);
        assert_eq!(head.header("host"), Some("example.com:443"));
        assert_eq!(head.header("HOST"), Some("example.com:443"));
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn captures_bytes_past_the_head_as_leftover() {
        let (endpoint, _writer) = endpoint_with_input(
            b"CONNECT example.com:443 HTTP/1.1\r\n\r\n\x16\x03\x01\x00\x05hello",
        )
        .await;

        let (head, leftover) = read_request_head(&endpoint).await.unwrap();
        assert!(head.is_connect());
        assert_eq!(&leftover[..], b"\x16\x03\x01\x00\x05hello");
        assert!(head.raw().ends_with(b"\r\n\r\n"));
    }

    #[tokio::test]
    async fn head_arriving_in_fragments_is_reassembled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut writer = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let endpoint = EndPoint::new(accepted);

        let feeder = tokio::spawn(async move {
            writer.write_all(b"GET /index.html HT").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.write_all(b"TP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
            writer
        });

        let (head, leftover) = read_request_head(&endpoint).await.unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/index.html");
        assert!(leftover.is_empty());
        drop(feeder.await.unwrap());
    }

    #[tokio::test]
    async fn eof_before_complete_head_is_reported() {
        let (endpoint, writer) = endpoint_with_input(b"CONNECT example.com:443 HT").await;
        drop(writer);

        let err = read_request_head(&endpoint).await.unwrap_err();
        assert!(matches!(err, HttpError::UnexpectedEof));
    }

    #[tokio::test]
    async fn garbage_is_rejected_as_malformed() {
        let (endpoint, _writer) = endpoint_with_input(b"\0\0\0garbage\r\n\r\n").await;
        let err = read_request_head(&endpoint).await.unwrap_err();
        assert!(matches!(err, HttpError::Malformed(_)));
    }

    #[test]
    fn response_serialization_includes_status_line_and_length() {
        let response = Response::new(StatusCode::BAD_GATEWAY)
            .with_header("Proxy-Agent", "culvert")
            .with_body("upstream unavailable");
        let bytes = response.to_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("Proxy-Agent: culvert\r\n"));
        assert!(text.contains("Content-Length: 20\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nupstream unavailable"));
    }
}
