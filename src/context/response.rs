//! The per-request response state machine.
//!
//! ```text
//! Init ──► HeadersPending ──► HeadersSent ──► Streaming* ──► Ended
//!   └──────────────┴──────────────┴───────────────┴──── abort ──┘
//! ```
//!
//! Headers and status are mutable until the head is committed (first write,
//! explicit [`flush_headers`](ResponseContext::flush_headers), or the final
//! send). After that, mutation returns [`ResponseError::HeadersSent`]. Once
//! `Ended` (by an explicit end, the final send, or a transport abort) every
//! further write or end is a silent no-op.

use bytes::Bytes;
use tracing::debug;

use crate::error::ResponseError;
use crate::http::{Headers, ResponseHead, StatusCode};
use crate::transport::{AbortSignal, ResponseSink};

/// Where a response is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    /// Constructed; the body acquisition mode is being fixed.
    Init,
    /// Status and headers may still change.
    HeadersPending,
    /// The head has been committed to the transport.
    HeadersSent,
    /// At least one body chunk has been written.
    Streaming,
    /// Finished or aborted; nothing more will be written.
    Ended,
}

/// Mutable response state for one request.
///
/// Handlers that return a [`Reply`](crate::app::Reply) rarely touch this
/// directly beyond headers. Handlers that stream call
/// [`start_streaming`](Self::start_streaming), [`write`](Self::write) and
/// [`end`](Self::end) themselves; the engine then never serializes a reply
/// for them.
pub struct ResponseContext {
    status: StatusCode,
    status_message: Option<String>,
    headers: Headers,
    state: ResponseState,
    streaming: bool,
    sink: Box<dyn ResponseSink>,
    abort: AbortSignal,
}

impl ResponseContext {
    pub fn new(sink: Box<dyn ResponseSink>, abort: AbortSignal) -> Self {
        Self {
            status: StatusCode::OK,
            status_message: None,
            headers: Headers::new(),
            state: ResponseState::Init,
            streaming: false,
            sink,
            abort,
        }
    }

    /// Current lifecycle state. A raised abort signal reads as `Ended`.
    pub fn state(&self) -> ResponseState {
        if self.abort.is_aborted() {
            ResponseState::Ended
        } else {
            self.state
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// `true` once the head has been committed (or the response ended).
    pub fn headers_sent(&self) -> bool {
        !matches!(
            self.state(),
            ResponseState::Init | ResponseState::HeadersPending
        )
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// `true` once the response is complete or the peer went away.
    pub fn is_ended(&self) -> bool {
        self.state() == ResponseState::Ended
    }

    /// `true` if the transport reported a disconnect.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    fn ensure_mutable(&self) -> Result<(), ResponseError> {
        if self.headers_sent() {
            Err(ResponseError::HeadersSent)
        } else {
            Ok(())
        }
    }

    pub(crate) fn mark_pending(&mut self) {
        if self.state == ResponseState::Init {
            self.state = ResponseState::HeadersPending;
        }
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), ResponseError> {
        self.ensure_mutable()?;
        self.status = status;
        Ok(())
    }

    /// Rejects messages containing CR, LF or other control characters.
    pub fn set_status_message(&mut self, message: impl Into<String>) -> Result<(), ResponseError> {
        self.ensure_mutable()?;
        let message = message.into();
        if !is_field_text(&message) {
            return Err(ResponseError::InvalidHeadText(format!("status message {message:?}")));
        }
        self.status_message = Some(message);
        Ok(())
    }

    /// Replaces every value of `name`.
    pub fn set_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ResponseError> {
        self.ensure_mutable()?;
        let (name, value) = checked_header(name.into(), value.into())?;
        self.headers.set(name, value);
        Ok(())
    }

    /// Adds a value for `name`, keeping existing ones.
    pub fn append_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ResponseError> {
        self.ensure_mutable()?;
        let (name, value) = checked_header(name.into(), value.into())?;
        self.headers.append(name, value);
        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> Result<bool, ResponseError> {
        self.ensure_mutable()?;
        Ok(self.headers.remove(name))
    }

    /// Switches the response to direct, handler-driven streaming.
    ///
    /// From here on the handler owns completion: the engine will not
    /// serialize its return value and waits for [`end`](Self::end).
    pub fn start_streaming(&mut self) {
        self.streaming = true;
        self.mark_pending();
    }

    // Observes an abort raised by the transport, or reports a failed sink call as one.
    fn note_abort(&mut self, error: Option<std::io::Error>) {
        if self.state != ResponseState::Ended {
            match error {
                Some(e) => debug!(error = %e, "transport write failed; treating as disconnect"),
                None => debug!("connection aborted; suppressing further writes"),
            }
            self.abort.abort();
            self.state = ResponseState::Ended;
        }
    }

    /// Commits status and headers. Idempotent.
    pub async fn flush_headers(&mut self) {
        if self.abort.is_aborted() {
            self.note_abort(None);
            return;
        }
        if self.headers_sent() {
            return;
        }
        let head = ResponseHead::new(
            self.status,
            self.status_message.clone(),
            self.headers.clone(),
        );
        match self.sink.send_head(head).await {
            Ok(()) => self.state = ResponseState::HeadersSent,
            Err(e) => self.note_abort(Some(e)),
        }
    }

    /// Writes one body chunk, committing the head first if needed.
    ///
    /// Writing implies streaming. Empty chunks are skipped. After the
    /// response has ended this is a no-op.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if self.is_ended() {
            self.note_abort(None);
            return;
        }
        self.streaming = true;
        self.flush_headers().await;
        if self.is_ended() || chunk.is_empty() {
            return;
        }
        match self.sink.send_chunk(chunk).await {
            Ok(()) => self.state = ResponseState::Streaming,
            Err(e) => self.note_abort(Some(e)),
        }
    }

    /// Ends the response. Only the first call has any effect.
    ///
    /// An unstreamed response that ends without a body gets
    /// `Content-Length: 0`, unless its status forbids a body.
    pub async fn end(&mut self) {
        if self.is_ended() {
            self.note_abort(None);
            return;
        }
        if !self.headers_sent()
            && !self.streaming
            && self.status.allows_body()
            && !self.headers.contains("content-length")
        {
            self.headers.set("Content-Length", "0");
        }
        self.flush_headers().await;
        if self.is_ended() {
            return;
        }
        match self.sink.finish().await {
            Ok(()) => self.state = ResponseState::Ended,
            Err(e) => self.note_abort(Some(e)),
        }
    }

    /// Sends a complete body and ends the response.
    ///
    /// Before commit this sets `Content-Length`; on an already-streaming
    /// response the bytes are written as a final chunk. Only the first
    /// completion takes effect.
    pub async fn send(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        if self.is_ended() {
            self.note_abort(None);
            return;
        }
        if !self.headers_sent() && !self.streaming {
            let allows_body = self.status.allows_body();
            if allows_body {
                self.headers.set("Content-Length", body.len().to_string());
            } else {
                self.headers.remove("content-length");
            }
            self.flush_headers().await;
            if allows_body && !body.is_empty() && !self.is_ended() {
                match self.sink.send_chunk(body).await {
                    Ok(()) => self.state = ResponseState::Streaming,
                    Err(e) => self.note_abort(Some(e)),
                }
            }
        } else {
            self.write(body).await;
        }
        self.end().await;
    }
}

// Header names are RFC 9110 tokens; values and reason phrases may hold tabs
// and visible text but no line breaks.
fn checked_header(name: String, value: String) -> Result<(String, String), ResponseError> {
    let token = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
    if !token {
        return Err(ResponseError::InvalidHeadText(format!("header name {name:?}")));
    }
    if !is_field_text(&value) {
        return Err(ResponseError::InvalidHeadText(format!("value of header {name}")));
    }
    Ok((name, value))
}

fn is_field_text(text: &str) -> bool {
    !text.chars().any(|c| c.is_control() && c != '\t')
}
