//! Async TCP server using Tokio.
//!
//! Accepts TCP connections, parses HTTP/1.1 request heads, and hands each
//! request to [`App::dispatch`] together with a streaming body channel and a
//! sink that writes the response back on the socket. Persistent connections
//! (keep-alive) and chunked request bodies are supported; responses without
//! a `Content-Length` are sent with chunked transfer coding.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::BoxFuture;
use crate::app::App;
use crate::http::request::{RequestError, RequestHead};
use crate::http::{Headers, ResponseHead, StatusCode};
use crate::transport::{AbortSignal, BodySender, ResponseSink, body_channel};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a request head we will buffer before rejecting it (64 KiB).
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest single chunk accepted in a chunked request body (8 MiB).
const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The fsrouter HTTP/1.1 server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use fsrouter::{App, ModuleRegistry, RouterConfig, Server};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let app = App::build(RouterConfig::new("www"), &ModuleRegistry::new())?;
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(Arc::new(app)).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections and serves them with `app` until the process ends.
    pub async fn run(self, app: Arc<App>) -> Result<(), ServerError> {
        self.run_until(app, std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn run_until(self, app: Arc<App>, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        info!(address = %self.local_addr, routes = app.routes().len(), "fsrouter listening");
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = &mut shutdown => {
                    info!(address = %self.local_addr, "shutting down listener");
                    return Ok(());
                }
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let app = Arc::clone(&app);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, app).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

// How the request body is delimited on the wire.
enum Framing {
    Empty,
    Length(usize),
    Chunked,
}

impl Framing {
    fn of(head: &RequestHead) -> Self {
        if head.is_chunked() {
            Framing::Chunked
        } else {
            match head.content_length() {
                Some(0) | None => Framing::Empty,
                Some(len) => Framing::Length(len),
            }
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, serving one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, or a response could not be completed.
async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, app: Arc<App>) -> io::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let Some(head) = read_head(&mut reader, &mut buf, peer_addr, &writer).await? else {
            break;
        };
        let head = head.remote_addr(peer_addr);
        let keep_alive = head.is_keep_alive();
        let framing = Framing::of(&head);

        debug!(
            peer = %peer_addr,
            method = %head.method(),
            path = %head.path(),
            "dispatching request"
        );

        let (sender, body) = body_channel(app.body_channel_capacity());
        let abort = AbortSignal::new();
        let completed = Arc::new(AtomicBool::new(false));
        let sink = HttpSink {
            writer: Arc::clone(&writer),
            keep_alive,
            chunked: false,
            completed: Arc::clone(&completed),
        };

        let ((), fed) = tokio::join!(
            app.dispatch(head, body, Box::new(sink), abort.clone()),
            feed_body(&mut reader, &mut buf, framing, sender, &abort),
        );
        fed?;

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
        if !completed.load(Ordering::Acquire) {
            debug!(peer = %peer_addr, "response was not completed, closing connection");
            break;
        }
    }

    Ok(())
}

/// Reads until a full request head is buffered, consuming it from `buf`.
///
/// Returns `None` when the connection should be closed: the peer hung up, or
/// the head was malformed or too large (an error response has been sent).
async fn read_head(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    peer_addr: SocketAddr,
    writer: &Mutex<OwnedWriteHalf>,
) -> io::Result<Option<RequestHead>> {
    loop {
        match RequestHead::parse(buf) {
            Ok((head, offset)) => {
                let _ = buf.split_to(offset);
                return Ok(Some(head));
            }
            Err(RequestError::Incomplete) => {}
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                write_plain(writer, StatusCode::BAD_REQUEST, &format!("Bad Request: {e}")).await?;
                return Ok(None);
            }
        }

        if buf.len() > MAX_HEAD_SIZE {
            warn!(peer = %peer_addr, "request head too large, sending 413");
            write_plain(writer, StatusCode::PAYLOAD_TOO_LARGE, "Request entity too large").await?;
            return Ok(None);
        }

        if reader.read_buf(buf).await? == 0 {
            if !buf.is_empty() {
                debug!(peer = %peer_addr, "peer closed mid-request");
            } else {
                debug!(peer = %peer_addr, "connection closed by peer");
            }
            return Ok(None);
        }
    }
}

async fn write_plain(writer: &Mutex<OwnedWriteHalf>, status: StatusCode, body: &str) -> io::Result<()> {
    let mut headers = Headers::new();
    headers.append("Content-Type", "text/plain; charset=utf-8");
    headers.append("Content-Length", body.len().to_string());
    headers.append("Connection", "close");
    let mut bytes = ResponseHead::new(status, None, headers).to_bytes();
    bytes.put(body.as_bytes());

    let mut writer = writer.lock().await;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Streams the request body from the socket into the body channel.
///
/// Bytes that arrive after the body (a pipelined request) stay in `buf`. A
/// read failure fails the body and raises `abort`.
async fn feed_body(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    framing: Framing,
    mut sender: BodySender,
    abort: &AbortSignal,
) -> io::Result<()> {
    let result = match framing {
        Framing::Empty => {
            sender.send(Bytes::new(), true).await;
            Ok(())
        }
        Framing::Length(len) => feed_fixed(reader, buf, len, &mut sender).await,
        Framing::Chunked => feed_chunked(reader, buf, &mut sender).await,
    };
    if let Err(e) = &result {
        sender.fail(io::Error::new(e.kind(), e.to_string())).await;
        abort.abort();
    }
    result
}

// Reads more bytes, treating EOF as an error: the body is not complete yet.
async fn fill(reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> io::Result<()> {
    if reader.read_buf(buf).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before the request body was complete",
        ));
    }
    Ok(())
}

async fn feed_fixed(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    len: usize,
    sender: &mut BodySender,
) -> io::Result<()> {
    let mut remaining = len;
    while remaining > 0 {
        if buf.is_empty() {
            fill(reader, buf).await?;
        }
        let take = remaining.min(buf.len());
        remaining -= take;
        // A `false` here means the handler dropped the body; keep draining.
        sender.send(buf.split_to(take).freeze(), remaining == 0).await;
    }
    Ok(())
}

async fn feed_chunked(reader: &mut OwnedReadHalf, buf: &mut BytesMut, sender: &mut BodySender) -> io::Result<()> {
    loop {
        let line = read_line(reader, buf).await?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| invalid_data(format!("invalid chunk size `{size_field}`")))?;
        if size > MAX_CHUNK_SIZE {
            return Err(invalid_data(format!("chunk of {size} bytes exceeds the limit")));
        }

        if size == 0 {
            // Trailer fields end with an empty line.
            while !read_line(reader, buf).await?.is_empty() {}
            sender.send(Bytes::new(), true).await;
            return Ok(());
        }

        while buf.len() < size + 2 {
            fill(reader, buf).await?;
        }
        let chunk = buf.split_to(size).freeze();
        if &buf[..2] != b"\r\n" {
            return Err(invalid_data("chunk not terminated by CRLF".to_owned()));
        }
        let _ = buf.split_to(2);
        sender.send(chunk, false).await;
    }
}

// Reads one CRLF-terminated line and consumes it, terminator included.
async fn read_line(reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> io::Result<String> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(pos + 2);
            return std::str::from_utf8(&line[..pos])
                .map(str::to_owned)
                .map_err(|_| invalid_data("chunk line is not valid UTF-8".to_owned()));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(invalid_data("chunk line too long".to_owned()));
        }
        fill(reader, buf).await?;
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Writes a response onto the connection's write half.
struct HttpSink {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    keep_alive: bool,
    chunked: bool,
    completed: Arc<AtomicBool>,
}

impl HttpSink {
    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        self.writer.lock().await.write_all(bytes).await
    }
}

impl ResponseSink for HttpSink {
    fn send_head(&mut self, mut head: ResponseHead) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if head.status.allows_body() && !head.headers.contains("content-length") {
                self.chunked = true;
                head.headers.set("Transfer-Encoding", "chunked");
            }
            if !self.keep_alive {
                head.headers.set("Connection", "close");
            }
            self.write(&head.to_bytes()).await
        })
    }

    fn send_chunk(&mut self, chunk: Bytes) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            if !self.chunked {
                return self.write(&chunk).await;
            }
            let mut framed = BytesMut::with_capacity(chunk.len() + 16);
            framed.put(format!("{:x}\r\n", chunk.len()).as_bytes());
            framed.put(chunk);
            framed.put(&b"\r\n"[..]);
            self.write(&framed).await
        })
    }

    fn finish(&mut self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let mut writer = self.writer.lock().await;
            if self.chunked {
                writer.write_all(b"0\r\n\r\n").await?;
            }
            writer.flush().await?;
            self.completed.store(true, Ordering::Release);
            Ok(())
        })
    }
}
