//! Error types: fatal build errors, per-request handler errors, response
//! state errors, and the correlation id attached to unhandled failures.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::content::{Body, ContentError};
use crate::http::StatusCode;

/// Fatal startup errors raised while building the route table.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("route directory {} does not exist or is not a directory", .0.display())]
    MissingRouteDir(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "directory {} declares `{first}` and `{second}`; only one variable or catch-all is allowed per level",
        .dir.display()
    )]
    AmbiguousVariable {
        dir: PathBuf,
        first: String,
        second: String,
    },

    #[error("{file} exports invalid method `{method}`; method keys must be uppercase HTTP methods")]
    InvalidMethod { file: String, method: String },

    #[error("{file} is a handler file but no route module is registered for it")]
    MissingModule { file: String },

    #[error("{file} declares no handlers")]
    EmptyModule { file: String },

    #[error("{file} is a middleware file but no middleware module is registered for it")]
    MissingMiddlewareModule { file: String },

    #[error("route {pattern} is declared by both {first} and {second}")]
    DuplicateRoute {
        pattern: String,
        first: String,
        second: String,
    },

    #[error("invalid ignore pattern `{pattern}`: {source}")]
    InvalidIgnorePattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("configured {kind} route {path} does not match any route")]
    UnknownFallbackRoute { kind: &'static str, path: String },

    #[error("invalid content configuration: {0}")]
    Content(#[from] ContentError),
}

/// Errors from invalid operations on a [`ResponseContext`](crate::context::ResponseContext).
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("headers were already sent; they can no longer be changed")]
    HeadersSent,

    #[error("{0} contains characters not allowed in a response head")]
    InvalidHeadText(String),

    #[error("failed to serialize response body: {0}")]
    Content(#[from] ContentError),
}

/// Identifier generated once per unhandled request error.
///
/// Sent to the client in the `x-correlation-id` header and logged alongside
/// the failure so the two can be matched up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub const HEADER: &'static str = "x-correlation-id";

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An error raised by a middleware or handler.
///
/// Carries an optional HTTP status (500 when absent), an optional status
/// message and body for the error response, and the underlying cause.
/// Any [`std::error::Error`] converts into one with `?`, producing a 500.
///
/// # Examples
///
/// ```
/// use fsrouter::error::HandlerError;
/// use fsrouter::http::StatusCode;
///
/// let err = HandlerError::new(StatusCode::FORBIDDEN, "members only");
/// assert_eq!(err.status(), StatusCode::FORBIDDEN);
///
/// let err: HandlerError = "x".parse::<u32>().unwrap_err().into();
/// assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
/// ```
pub struct HandlerError {
    status: Option<StatusCode>,
    status_message: Option<String>,
    message: String,
    body: Option<Body>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    /// An error that responds with `status`.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::msg(message)
        }
    }

    /// An error without a status of its own; it responds with 500.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            status: None,
            status_message: None,
            message: message.into(),
            body: None,
            source: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Sets the reason phrase of the error response.
    #[must_use]
    pub fn with_status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    /// Sets the body of the error response.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// The status the error response will carry.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// The status explicitly attached to this error, if any.
    pub fn declared_status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub(crate) fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// The underlying cause, for errors converted with `?`.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Converts a caught panic payload into a 500 error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::msg(format!("panicked: {}", panic_detail(payload.as_ref())))
    }
}

/// The message carried by a caught panic payload.
pub(crate) fn panic_detail(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned())
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("status", &self.status)
            .field("message", &self.message)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self {
            status: None,
            status_message: None,
            message: "internal error".to_owned(),
            body: None,
            source: Some(Box::new(error)),
        }
    }
}
