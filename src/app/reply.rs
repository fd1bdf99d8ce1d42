//! The value a handler returns.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::content::Body;
use crate::error::HandlerError;
use crate::http::{Headers, StatusCode};

/// A handler's result: optional status, status message and headers, plus a
/// body.
///
/// Anything that converts into a [`Body`] converts into a `Reply`, so
/// handlers can return `Ok(json!({..}).into())` or `Ok("text".into())`.
/// [`Reply::empty`] produces a 200 with no body unless something upstream
/// changed the status.
///
/// # Examples
///
/// ```
/// use fsrouter::app::Reply;
/// use fsrouter::http::StatusCode;
/// use serde_json::json;
///
/// let reply = Reply::new(json!({ "id": 7 }))
///     .status(StatusCode::CREATED)
///     .header("Location", "/strains/7");
/// assert_eq!(reply.status_code(), Some(StatusCode::CREATED));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    status: Option<StatusCode>,
    status_message: Option<String>,
    headers: Headers,
    body: Body,
}

impl Reply {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(body: impl Into<Body>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Serializes `value` into a structured body.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, HandlerError> {
        Ok(Self::new(serde_json::to_value(value)?))
    }

    #[must_use]
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn get_body(&self) -> &Body {
        &self.body
    }

    pub(crate) fn into_parts(self) -> (Option<StatusCode>, Option<String>, Headers, Body) {
        (self.status, self.status_message, self.headers, self.body)
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

impl From<Body> for Reply {
    fn from(body: Body) -> Self {
        Self::new(body)
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<Bytes> for Reply {
    fn from(bytes: Bytes) -> Self {
        Self::new(bytes)
    }
}

impl From<StatusCode> for Reply {
    fn from(status: StatusCode) -> Self {
        Self::empty().status(status)
    }
}
