//! Static file entries: MIME lookup and chunked streaming from disk.

use std::io;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::app::Reply;
use crate::context::{RequestContext, ResponseContext};
use crate::error::HandlerError;
use crate::router::{Handler, HandlerFuture};

const MIME_TYPES: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("htm", "text/html; charset=utf-8"),
    ("css", "text/css; charset=utf-8"),
    ("js", "text/javascript; charset=utf-8"),
    ("mjs", "text/javascript; charset=utf-8"),
    ("json", "application/json"),
    ("map", "application/json"),
    ("txt", "text/plain; charset=utf-8"),
    ("md", "text/markdown; charset=utf-8"),
    ("csv", "text/csv; charset=utf-8"),
    ("xml", "application/xml"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("avif", "image/avif"),
    ("ico", "image/x-icon"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("otf", "font/otf"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("wasm", "application/wasm"),
    ("mp3", "audio/mpeg"),
    ("ogg", "audio/ogg"),
    ("wav", "audio/wav"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
];

/// MIME type for a file name, by extension (case-insensitive).
///
/// ```
/// use fsrouter::router::static_files::mime_for;
/// assert_eq!(mime_for("logo.PNG".as_ref()), "image/png");
/// assert_eq!(mime_for("LICENSE".as_ref()), "application/octet-stream");
/// ```
pub fn mime_for(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return crate::content::OCTET_STREAM;
    };
    MIME_TYPES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(ext))
        .map(|(_, mime)| *mime)
        .unwrap_or(crate::content::OCTET_STREAM)
}

/// Serves one file from disk, streaming it in `chunk_size` reads.
pub struct StaticFile {
    path: PathBuf,
    mime: &'static str,
    chunk_size: usize,
}

impl StaticFile {
    pub fn new(path: PathBuf, mime: &'static str, chunk_size: usize) -> Self {
        Self {
            path,
            mime,
            chunk_size: chunk_size.max(1),
        }
    }

    async fn serve(&self, res: &mut ResponseContext) -> Result<Reply, HandlerError> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(HandlerError::not_found("file not found"));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();

        if !res.headers().contains("content-type") {
            res.set_header("Content-Type", self.mime)?;
        }
        res.set_header("Content-Length", len.to_string())?;
        res.start_streaming();
        res.flush_headers().await;

        let mut buf = BytesMut::with_capacity(self.chunk_size);
        loop {
            if res.is_ended() {
                debug!(path = %self.path.display(), "client went away during static file transfer");
                break;
            }
            buf.reserve(self.chunk_size);
            let read = (&mut file).take(self.chunk_size as u64).read_buf(&mut buf).await?;
            if read == 0 {
                break;
            }
            res.write(buf.split().freeze()).await;
        }
        res.end().await;
        Ok(Reply::empty())
    }
}

impl Handler for StaticFile {
    fn call<'a>(&'a self, _req: &'a mut RequestContext, res: &'a mut ResponseContext) -> HandlerFuture<'a> {
        Box::pin(self.serve(res))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestBody;
    use crate::http::{Headers, Method};
    use crate::transport::{AbortSignal, BodyStream, MemorySink};

    fn contexts() -> (RequestContext, ResponseContext, MemorySink) {
        let req = RequestContext::new(
            Method::Get,
            "/notes.txt",
            Headers::new(),
            RequestBody::Stream(BodyStream::empty()),
        );
        let sink = MemorySink::new();
        let res = ResponseContext::new(Box::new(sink.clone()), AbortSignal::new());
        (req, res, sink)
    }

    #[tokio::test]
    async fn streams_file_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "abcdefghij").unwrap();

        let file = StaticFile::new(path, "text/plain; charset=utf-8", 4);
        let (mut req, mut res, sink) = contexts();
        file.call(&mut req, &mut res).await.unwrap();

        let head = sink.head().unwrap();
        assert_eq!(head.headers.get("content-length"), Some("10"));
        assert_eq!(head.headers.get("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(sink.chunk_count(), 3);
        assert_eq!(&sink.body()[..], b"abcdefghij");
        assert!(sink.is_finished());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let file = StaticFile::new(dir.path().join("gone.txt"), "text/plain", 4);
        let (mut req, mut res, sink) = contexts();
        let err = file.call(&mut req, &mut res).await.unwrap_err();
        assert_eq!(err.status(), crate::http::StatusCode::NOT_FOUND);
        assert!(sink.events().is_empty());
    }
}
