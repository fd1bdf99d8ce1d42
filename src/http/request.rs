//! The request head a transport hands to the router, plus an HTTP/1.1 head
//! parser built on the [`httparse`] crate.

use std::net::SocketAddr;

use thiserror::Error;

use super::{Headers, Method};
use crate::url;

/// Errors that can occur while parsing an HTTP/1.1 request head.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),
}

/// Everything the router needs to know about a request before its body.
///
/// A transport builds one per request, either with [`RequestHead::new`] or,
/// for HTTP/1.1 byte streams, with [`RequestHead::parse`].
///
/// # Examples
///
/// ```
/// use fsrouter::http::{Method, RequestHead};
///
/// let head = RequestHead::new(Method::Get, "/strains?sort=name")
///     .header("Accept", "application/json");
/// assert_eq!(head.path(), "/strains");
/// assert_eq!(head.query(), Some("sort=name"));
/// ```
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    path: String,
    query: Option<String>,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    remote_addr: Option<SocketAddr>,
}

impl RequestHead {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Creates a head from a method and a raw `path?query` target.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = url::split_target(target);
        Self {
            method,
            path: path.to_owned(),
            query: query.map(str::to_owned),
            version: 1,
            headers: Headers::new(),
            remote_addr: None,
        }
    }

    /// Appends a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Records the peer address.
    #[must_use]
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Parse an HTTP/1.1 request head from a byte slice.
    ///
    /// Returns the parsed head and the byte offset at which the body begins
    /// in `buf` (immediately after the `\r\n\r\n` terminator).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: more data is needed to complete the head.
    /// - [`RequestError::Parse`]: the data is malformed.
    /// - [`RequestError::MissingField`]: method, path or version is absent.
    /// - [`RequestError::InvalidContentLength`]: the body length cannot be
    ///   determined, so the request cannot be framed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?;
        let method = Method::from_route_key(method)
            .unwrap_or_else(|| Method::Custom(method.to_owned()));

        let target = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.append(header.name, value);
            }
        }

        let mut head = Self::new(method, target);
        head.version = version;
        head.headers = header_map;
        if !head.is_chunked() {
            if let Some(raw) = head.headers.get("content-length") {
                if head.content_length().is_none() {
                    return Err(RequestError::InvalidContentLength(raw.to_owned()));
                }
            }
        }
        Ok((head, body_offset))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the raw request path (without the query string, not decoded).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the peer address, when the transport knows it.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }

    /// Returns `true` when the body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    }
}
