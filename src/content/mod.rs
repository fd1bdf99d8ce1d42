//! Content negotiation: map a MIME type to serialize/deserialize behavior.
//!
//! The [`ContentNegotiator`] owns a registry of [`ContentHandler`]s keyed by
//! lower-cased MIME type. Lookups strip `;charset=…` style parameters first
//! and fall back to the configured default type when nothing matches.
//!
//! Built-in handlers:
//!
//! | MIME type                            | Deserializes to   | Serializes from            |
//! |--------------------------------------|-------------------|----------------------------|
//! | `application/json`                   | [`Body::Json`]    | any JSON value             |
//! | `text/plain`                         | [`Body::Text`]    | strings as-is, else JSON   |
//! | `application/octet-stream`           | [`Body::Bytes`]   | strings as-is, else JSON   |
//! | `application/x-www-form-urlencoded`  | [`Body::Json`]    | objects, dotted keys       |

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::error::panic_detail;

pub mod form;

pub use form::FormContent;

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_PLAIN: &str = "text/plain";
pub const OCTET_STREAM: &str = "application/octet-stream";
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Errors raised while converting between wire bytes and [`Body`] values.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid form data: {0}")]
    Form(String),

    #[error("no content handler registered for {0}")]
    UnknownType(String),

    #[error("content handler for {mime} panicked: {detail}")]
    Panicked { mime: String, detail: String },
}

/// A request or response payload.
///
/// Structured values (`Json`) go through the negotiator; `Text` and `Bytes`
/// are already wire-ready and bypass serialization.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Bytes(Bytes),
    Json(Value),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Text(s) => s.is_empty(),
            Body::Bytes(b) => b.is_empty(),
            Body::Json(_) => false,
        }
    }

    /// The JSON value, for bodies that were deserialized into one.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    /// The text, for text bodies.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Raw bytes for `Bytes` and `Text` bodies.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Bytes(bytes) => Some(bytes),
            Body::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    /// Deserializes a JSON body into `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ContentError> {
        match self {
            Body::Json(value) => Ok(T::deserialize(value)?),
            Body::Text(text) => Ok(serde_json::from_str(text)?),
            Body::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
            Body::Empty => Ok(T::deserialize(Value::Null)?),
        }
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::Empty
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_owned())
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(bytes))
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

/// Serialize/deserialize pair for one MIME type.
pub trait ContentHandler: Send + Sync {
    /// Converts a structured value into wire bytes.
    fn serialize(&self, value: &Value) -> Result<Bytes, ContentError>;

    /// Converts a complete request body into a [`Body`].
    fn deserialize(&self, raw: &[u8]) -> Result<Body, ContentError>;
}

/// `application/json`.
pub struct JsonContent;

impl ContentHandler for JsonContent {
    fn serialize(&self, value: &Value) -> Result<Bytes, ContentError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize(&self, raw: &[u8]) -> Result<Body, ContentError> {
        Ok(Body::Json(serde_json::from_slice(raw)?))
    }
}

/// `text/plain`.
pub struct TextContent;

impl ContentHandler for TextContent {
    fn serialize(&self, value: &Value) -> Result<Bytes, ContentError> {
        Ok(match value {
            Value::String(text) => Bytes::copy_from_slice(text.as_bytes()),
            Value::Null => Bytes::new(),
            other => Bytes::from(other.to_string()),
        })
    }

    fn deserialize(&self, raw: &[u8]) -> Result<Body, ContentError> {
        Ok(Body::Text(std::str::from_utf8(raw)?.to_owned()))
    }
}

/// `application/octet-stream`: bytes pass through untouched.
pub struct OctetStreamContent;

impl ContentHandler for OctetStreamContent {
    fn serialize(&self, value: &Value) -> Result<Bytes, ContentError> {
        match value {
            Value::String(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
            other => Ok(Bytes::from(serde_json::to_vec(other)?)),
        }
    }

    fn deserialize(&self, raw: &[u8]) -> Result<Body, ContentError> {
        Ok(Body::Bytes(Bytes::copy_from_slice(raw)))
    }
}

/// Lower-cases a MIME type and strips any `;param=value` suffix.
///
/// ```
/// use fsrouter::content::normalize_mime;
/// assert_eq!(normalize_mime(" Application/JSON; charset=utf-8"), "application/json");
/// ```
pub fn normalize_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

// A panicking handler becomes a content error.
fn contained<T>(mime: String, convert: impl FnOnce() -> Result<T, ContentError>) -> Result<T, ContentError> {
    catch_unwind(AssertUnwindSafe(convert)).unwrap_or_else(|payload| {
        Err(ContentError::Panicked {
            mime,
            detail: panic_detail(payload.as_ref()),
        })
    })
}

/// Registry of content handlers with a default fallback.
///
/// # Examples
///
/// ```
/// use fsrouter::content::{Body, ContentNegotiator};
/// use serde_json::json;
///
/// let negotiator = ContentNegotiator::new();
/// let value = json!({"strain": "gorillaGlue", "thc": 0.25});
/// let wire = negotiator.serialize(&value, Some("application/json; charset=utf-8")).unwrap();
/// let back = negotiator.deserialize(&wire, Some("application/json")).unwrap();
/// assert_eq!(back, Body::Json(value));
/// ```
#[derive(Clone)]
pub struct ContentNegotiator {
    handlers: HashMap<String, Arc<dyn ContentHandler>>,
    default_type: String,
}

impl Default for ContentNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentNegotiator {
    /// Creates a negotiator with the built-in handlers and `application/json`
    /// as the default type.
    pub fn new() -> Self {
        let mut handlers: HashMap<String, Arc<dyn ContentHandler>> = HashMap::new();
        handlers.insert(APPLICATION_JSON.to_owned(), Arc::new(JsonContent));
        handlers.insert(TEXT_PLAIN.to_owned(), Arc::new(TextContent));
        handlers.insert(OCTET_STREAM.to_owned(), Arc::new(OctetStreamContent));
        handlers.insert(FORM_URLENCODED.to_owned(), Arc::new(FormContent));
        Self {
            handlers,
            default_type: APPLICATION_JSON.to_owned(),
        }
    }

    /// Registers (or replaces) the handler for `mime`.
    pub fn register(&mut self, mime: &str, handler: Arc<dyn ContentHandler>) {
        self.handlers.insert(normalize_mime(mime), handler);
    }

    /// Sets the fallback type.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::UnknownType`] if no handler is registered for `mime`.
    pub fn set_default(&mut self, mime: &str) -> Result<(), ContentError> {
        let mime = normalize_mime(mime);
        if !self.handlers.contains_key(&mime) {
            return Err(ContentError::UnknownType(mime));
        }
        self.default_type = mime;
        Ok(())
    }

    /// The fallback MIME type.
    pub fn default_type(&self) -> &str {
        &self.default_type
    }

    /// Returns `true` if a handler is registered for `content_type`.
    pub fn supports(&self, content_type: &str) -> bool {
        self.handlers.contains_key(&normalize_mime(content_type))
    }

    /// Resolves the handler for `content_type`, falling back to the default.
    fn handler_for(&self, content_type: Option<&str>) -> Result<(String, &Arc<dyn ContentHandler>), ContentError> {
        if let Some(mime) = content_type.map(normalize_mime) {
            if let Some(handler) = self.handlers.get(&mime) {
                return Ok((mime, handler));
            }
        }
        self.handlers
            .get(&self.default_type)
            .map(|handler| (self.default_type.clone(), handler))
            .ok_or_else(|| ContentError::UnknownType(self.default_type.clone()))
    }

    /// Serializes `value` for `content_type` (or the default type).
    pub fn serialize(&self, value: &Value, content_type: Option<&str>) -> Result<Bytes, ContentError> {
        let (mime, handler) = self.handler_for(content_type)?;
        contained(mime, || handler.serialize(value))
    }

    /// Deserializes a complete body for `content_type` (or the default type).
    pub fn deserialize(&self, raw: &[u8], content_type: Option<&str>) -> Result<Body, ContentError> {
        let (mime, handler) = self.handler_for(content_type)?;
        contained(mime, || handler.deserialize(raw))
    }

    /// Picks the response content type from an `Accept` header.
    ///
    /// Media ranges are tried in descending `q` order (ties keep header
    /// order); the first one with a registered handler wins. Wildcards and
    /// absent headers resolve to `accepts_default` when it is registered, else
    /// to the default type.
    pub fn negotiate(&self, accept: Option<&str>, accepts_default: &str) -> String {
        let mut ranges: Vec<(f32, String)> = accept
            .unwrap_or_default()
            .split(',')
            .filter_map(|range| {
                let mut parts = range.split(';');
                let mime = parts.next()?.trim().to_ascii_lowercase();
                if mime.is_empty() {
                    return None;
                }
                let q = parts
                    .filter_map(|p| p.trim().strip_prefix("q="))
                    .find_map(|q| q.parse::<f32>().ok())
                    .unwrap_or(1.0);
                Some((q, mime))
            })
            .filter(|(q, _)| *q > 0.0)
            .collect();
        ranges.sort_by(|a, b| b.0.total_cmp(&a.0));

        if let Some((_, mime)) = ranges.iter().find(|(_, mime)| self.handlers.contains_key(mime)) {
            return mime.clone();
        }

        let fallback = normalize_mime(accepts_default);
        if self.handlers.contains_key(&fallback) {
            fallback
        } else {
            self.default_type.clone()
        }
    }
}
