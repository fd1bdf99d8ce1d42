//! The committed head of a response: status line plus headers.
//!
//! A [`ResponseHead`] is what the lifecycle engine hands to a transport sink
//! at the moment headers become immutable. HTTP/1.1 transports serialize it
//! with [`ResponseHead::to_bytes`].

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode};

/// Status code, reason phrase and headers of a response, frozen at commit time.
///
/// # Examples
///
/// ```
/// use fsrouter::http::{Headers, ResponseHead, StatusCode};
///
/// let mut headers = Headers::new();
/// headers.append("Content-Length", "2");
/// let head = ResponseHead::new(StatusCode::OK, None, headers);
///
/// let bytes = head.to_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.ends_with("Content-Length: 2\r\n\r\n"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub status_message: Option<String>,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: StatusCode, status_message: Option<String>, headers: Headers) -> Self {
        Self {
            status,
            status_message,
            headers,
        }
    }

    /// The reason phrase to put on the status line: the explicit message if
    /// one was set, else the canonical phrase.
    pub fn reason(&self) -> &str {
        self.status_message
            .as_deref()
            .unwrap_or_else(|| self.status.canonical_reason())
    }

    /// Serializes the head into HTTP/1.1 wire format, terminated by the blank line.
    pub fn to_bytes(&self) -> BytesMut {
        let estimated_size = 64 + self.headers.len() * 64;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason()).as_bytes());
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put(&b"\r\n"[..]);

        buf
    }
}
