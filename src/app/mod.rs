//! The request lifecycle engine.
//!
//! [`App`] owns the immutable route table and the content negotiator. For
//! every request a transport hands it, [`App::dispatch`]:
//!
//! 1. splits the target into path and query and resolves the route, falling
//!    back to the configured default or not-found route, a plain 404, or a
//!    405 with `Allow` when only the method is wrong;
//! 2. builds the request and response contexts;
//! 3. runs the route's normal middleware chain;
//! 4. buffers and deserializes the body, unless the handler streams it;
//! 5. runs the handler and finalizes its [`Reply`];
//! 6. on any failure, runs the error chain and writes the error response
//!    with a fresh correlation id.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::config::{ErrorTransformer, RouterConfig};
use crate::content::{Body, ContentNegotiator, OCTET_STREAM};
use crate::context::{PathParams, RequestBody, RequestContext, ResponseContext};
use crate::error::{BuildError, CorrelationId, HandlerError, ResponseError, panic_detail};
use crate::http::{RequestHead, StatusCode};
use crate::middleware::guarded;
use crate::router::{MethodRoute, ModuleRegistry, RouteEntry, RouteTable, build_routes};
use crate::transport::{AbortSignal, BodyStream, ResponseSink};
use crate::url::{decode_path_segment, parse_query};

pub mod reply;

pub use reply::Reply;

const TEXT_UTF8: &str = "text/plain; charset=utf-8";

// A route served when nothing matches.
struct Fallback {
    entry: Arc<RouteEntry>,
    status: Option<StatusCode>,
}

// Where a request failed; body errors skip the error chain.
enum Failure {
    Chain(HandlerError),
    Body(HandlerError),
}

/// A built router, ready to serve requests.
///
/// # Examples
///
/// ```rust,no_run
/// use fsrouter::app::App;
/// use fsrouter::config::RouterConfig;
/// use fsrouter::router::{handler_fn, ModuleRegistry, RouteModule};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let modules = ModuleRegistry::new().route(
///     "strains/$name.rs",
///     RouteModule::new().handler(
///         "GET",
///         handler_fn(|req, _res| {
///             let name = req.param("name").unwrap_or_default().to_owned();
///             Box::pin(async move { Ok(format!("strain {name}").into()) })
///         }),
///     ),
/// );
/// let app = App::build(RouterConfig::new("www"), &modules)?;
/// for entry in app.routes().entries() {
///     println!("{} [{}]", entry.pattern(), entry.allow_header());
/// }
/// # Ok(())
/// # }
/// ```
pub struct App {
    routes: RouteTable,
    negotiator: ContentNegotiator,
    fallback: Option<Fallback>,
    accepts_default: String,
    decode_query: bool,
    decode_path: bool,
    body_channel_capacity: usize,
    error_transformer: Option<ErrorTransformer>,
}

impl App {
    /// Scans the route directory and prepares every pipeline.
    ///
    /// # Errors
    ///
    /// Any [`BuildError`] from the route walk, an unregistered default
    /// content type, or a fallback route that resolves to nothing.
    pub fn build(config: RouterConfig, modules: &ModuleRegistry) -> Result<Self, BuildError> {
        let negotiator = config.negotiator()?;
        let routes = build_routes(&config, modules)?;

        let fallback = match (&config.default_route, &config.not_found_route) {
            (Some(path), _) => Some(Fallback {
                entry: resolve_fallback(&routes, "default", path)?,
                status: None,
            }),
            (None, Some(path)) => Some(Fallback {
                entry: resolve_fallback(&routes, "not-found", path)?,
                status: Some(StatusCode::NOT_FOUND),
            }),
            (None, None) => None,
        };

        Ok(Self {
            routes,
            negotiator,
            fallback,
            accepts_default: config.accepts_default,
            decode_query: config.decode_query_parameters,
            decode_path: config.decode_path_parameters,
            body_channel_capacity: config.body_channel_capacity,
            error_transformer: config.error_transformer,
        })
    }

    /// The route table, for introspection.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn negotiator(&self) -> &ContentNegotiator {
        &self.negotiator
    }

    /// Capacity transports should use for [`body_channel`](crate::transport::body_channel).
    pub fn body_channel_capacity(&self) -> usize {
        self.body_channel_capacity
    }

    /// Serves one request to completion.
    ///
    /// Never fails: every error becomes a response, and a vanished client
    /// just stops the writes.
    pub async fn dispatch(
        &self,
        head: RequestHead,
        body: BodyStream,
        sink: Box<dyn ResponseSink>,
        abort: AbortSignal,
    ) {
        let started = Instant::now();
        let mut res = ResponseContext::new(sink, abort);
        let method = head.method().clone();
        let path = head.path().to_owned();

        let (entry, params, status) = match self.routes.lookup(&path) {
            Some(found) => (found.entry, found.params, None),
            None => match &self.fallback {
                Some(fallback) => (Arc::clone(&fallback.entry), PathParams::new(), fallback.status),
                None => {
                    respond_plain(&mut res, StatusCode::NOT_FOUND, None).await;
                    log_request(&method, &path, StatusCode::NOT_FOUND, started);
                    return;
                }
            },
        };

        let Some(route) = entry.method_route(&method) else {
            let allow = entry.allow_header();
            respond_plain(&mut res, StatusCode::METHOD_NOT_ALLOWED, Some(&allow)).await;
            log_request(&method, &path, StatusCode::METHOD_NOT_ALLOWED, started);
            return;
        };

        let mut params = params;
        if self.decode_path {
            params.map_values(|value| decode_path_segment(value).into_owned());
        }
        let query = head
            .query()
            .map(|q| parse_query(q, self.decode_query))
            .unwrap_or_default();
        let body = if route.streams_request_body() {
            RequestBody::Stream(body)
        } else {
            RequestBody::Unread(body)
        };
        let mut req = RequestContext::new(method, path, head.headers().clone(), body)
            .with_query(query)
            .with_params(params)
            .with_remote_addr(head.peer_addr())
            .with_route(entry.pattern().to_string());

        res.mark_pending();
        if let Some(status) = status {
            if let Err(e) = res.set_status(status) {
                debug!(error = %e, "could not apply fallback status");
            }
        }

        self.run(route, &mut req, &mut res).await;
        log_request(req.method(), req.path(), res.status(), started);
    }

    async fn run(&self, route: &MethodRoute, req: &mut RequestContext, res: &mut ResponseContext) {
        match self.run_handler(route, req, res).await {
            Ok(Some(reply)) => self.finalize(reply, req, res).await,
            Ok(None) => {}
            Err(Failure::Chain(err)) => {
                let err = route.pipeline().run_error(err, req, res).await;
                self.fail(err, req, res).await;
            }
            Err(Failure::Body(err)) => self.fail(err, req, res).await,
        }
    }

    // Returns `None` when middleware already ended the response.
    async fn run_handler(
        &self,
        route: &MethodRoute,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Result<Option<Reply>, Failure> {
        route.pipeline().run(req, res).await.map_err(Failure::Chain)?;
        if res.is_ended() {
            return Ok(None);
        }

        if let Some(stream) = req.take_unread_body() {
            let body = self.read_body(stream, req).await.map_err(Failure::Body)?;
            req.set_body(RequestBody::Buffered(body));
        }

        let handler = route.handler();
        let (r, s) = (&mut *req, &mut *res);
        let reply = guarded(move || handler.call(r, s)).await.map_err(Failure::Chain)?;
        Ok(Some(reply))
    }

    async fn read_body(&self, stream: BodyStream, req: &RequestContext) -> Result<Body, HandlerError> {
        let raw = stream
            .collect()
            .await
            .map_err(|e| HandlerError::bad_request(format!("failed to read request body: {e}")))?;
        if raw.is_empty() {
            return Ok(Body::Empty);
        }
        self.negotiator
            .deserialize(&raw, req.header("content-type"))
            .map_err(|e| HandlerError::bad_request(format!("invalid request body: {e}")))
    }

    async fn finalize(&self, reply: Reply, req: &RequestContext, res: &mut ResponseContext) {
        if res.is_ended() {
            return;
        }
        if res.is_streaming() {
            warn!(path = %req.path(), "handler returned without ending its stream; closing it");
            res.end().await;
            return;
        }
        if let Err(e) = self.apply_reply(reply, req, res).await {
            self.fail(e.into(), req, res).await;
        }
    }

    async fn apply_reply(&self, reply: Reply, req: &RequestContext, res: &mut ResponseContext) -> Result<(), ResponseError> {
        let (status, status_message, headers, body) = reply.into_parts();
        if let Some(status) = status {
            res.set_status(status)?;
        }
        if let Some(message) = status_message {
            res.set_status_message(message)?;
        }
        let mut replaced: Vec<&str> = Vec::new();
        for (name, value) in headers.iter() {
            if !replaced.iter().any(|seen| seen.eq_ignore_ascii_case(name)) {
                res.remove_header(name)?;
                replaced.push(name);
            }
            res.append_header(name, value)?;
        }
        let bytes = self.encode_body(body, req, res)?;
        res.send(bytes).await;
        Ok(())
    }

    // Structured bodies go through the negotiator; text and bytes are sent as is.
    fn encode_body(&self, body: Body, req: &RequestContext, res: &mut ResponseContext) -> Result<Bytes, ResponseError> {
        match body {
            Body::Empty => Ok(Bytes::new()),
            Body::Text(text) => {
                if !res.headers().contains("content-type") {
                    res.set_header("Content-Type", TEXT_UTF8)?;
                }
                Ok(Bytes::from(text))
            }
            Body::Bytes(bytes) => {
                if !res.headers().contains("content-type") {
                    res.set_header("Content-Type", OCTET_STREAM)?;
                }
                Ok(bytes)
            }
            Body::Json(value) => {
                let content_type = match res.headers().get("content-type") {
                    Some(explicit) => explicit.to_owned(),
                    None => {
                        let negotiated = self
                            .negotiator
                            .negotiate(req.header("accept"), &self.accepts_default);
                        res.set_header("Content-Type", negotiated.clone())?;
                        negotiated
                    }
                };
                Ok(self.negotiator.serialize(&value, Some(&content_type))?)
            }
        }
    }

    async fn fail(&self, err: HandlerError, req: &RequestContext, res: &mut ResponseContext) {
        let id = CorrelationId::new();
        let err = match &self.error_transformer {
            Some(transform) => transform_error(transform, err, &id),
            None => err,
        };

        let status = err.status();
        if status.is_server_error() {
            error!(
                correlation_id = %id,
                method = %req.method(),
                path = %req.path(),
                status = status.as_u16(),
                error = %err,
                "request failed"
            );
        } else {
            debug!(correlation_id = %id, path = %req.path(), status = status.as_u16(), error = %err, "request rejected");
        }

        if res.is_ended() {
            return;
        }
        if res.headers_sent() {
            res.end().await;
            return;
        }
        if let Err(e) = self.write_error(err, &id, req, res).await {
            debug!(error = %e, "could not write error response");
            res.end().await;
        }
    }

    async fn write_error(
        &self,
        mut err: HandlerError,
        id: &CorrelationId,
        req: &RequestContext,
        res: &mut ResponseContext,
    ) -> Result<(), ResponseError> {
        res.set_status(err.status())?;
        if let Some(message) = err.status_message() {
            res.set_status_message(message.to_owned())?;
        }
        res.set_header(CorrelationId::HEADER, id.to_string())?;

        let body = err
            .take_body()
            .unwrap_or_else(|| Body::Text(err.message().to_owned()));
        let bytes = match self.encode_body(body, req, res) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "error body could not be encoded; sending message");
                res.set_header("Content-Type", TEXT_UTF8)?;
                Bytes::from(err.message().to_owned())
            }
        };
        res.send(bytes).await;
        Ok(())
    }
}

// A panicking transformer leaves the error as it was, minus any custom body.
fn transform_error(transform: &ErrorTransformer, err: HandlerError, id: &CorrelationId) -> HandlerError {
    let status = err.declared_status();
    let status_message = err.status_message().map(str::to_owned);
    let message = err.to_string();
    match std::panic::catch_unwind(AssertUnwindSafe(|| transform(err, id))) {
        Ok(transformed) => transformed,
        Err(payload) => {
            warn!(correlation_id = %id, panic = %panic_detail(payload.as_ref()), "error transformer panicked");
            let mut fallback = match status {
                Some(status) => HandlerError::new(status, message),
                None => HandlerError::msg(message),
            };
            if let Some(status_message) = status_message {
                fallback = fallback.with_status_message(status_message);
            }
            fallback
        }
    }
}

fn resolve_fallback(routes: &RouteTable, kind: &'static str, path: &str) -> Result<Arc<RouteEntry>, BuildError> {
    routes
        .lookup(path)
        .map(|found| found.entry)
        .ok_or_else(|| BuildError::UnknownFallbackRoute {
            kind,
            path: path.to_owned(),
        })
}

async fn respond_plain(res: &mut ResponseContext, status: StatusCode, allow: Option<&str>) {
    res.mark_pending();
    let prepared = (|| -> Result<(), ResponseError> {
        res.set_status(status)?;
        res.set_header("Content-Type", TEXT_UTF8)?;
        if let Some(allow) = allow {
            res.set_header("Allow", allow)?;
        }
        Ok(())
    })();
    if let Err(e) = prepared {
        debug!(error = %e, "could not prepare response");
    }
    res.send(status.canonical_reason()).await;
}

fn log_request(method: &crate::http::Method, path: &str, status: StatusCode, started: Instant) {
    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request served"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::router::{RouteModule, handler_fn};
    use crate::transport::MemorySink;
    use serde_json::json;
    use std::path::Path;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "<h1>page</h1>").unwrap();
    }

    fn named(name: &'static str) -> RouteModule {
        RouteModule::new().handler(
            "GET",
            handler_fn(move |_req, _res| Box::pin(async move { Ok(name.into()) })),
        )
    }

    async fn get(app: &App, target: &str) -> MemorySink {
        let sink = MemorySink::new();
        app.dispatch(
            RequestHead::new(Method::Get, target),
            BodyStream::empty(),
            Box::new(sink.clone()),
            AbortSignal::new(),
        )
        .await;
        sink
    }

    #[tokio::test]
    async fn default_route_wins_over_not_found_route() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "spa.rs");
        touch(dir.path(), "missing.rs");
        let modules = ModuleRegistry::new()
            .route("spa.rs", named("spa"))
            .route("missing.rs", named("missing"));

        let config = RouterConfig::new(dir.path())
            .default_route("/spa")
            .not_found_route("/missing");
        let app = App::build(config, &modules).unwrap();
        let sink = get(&app, "/nowhere").await;
        assert_eq!(sink.head().unwrap().status, StatusCode::OK);
        assert_eq!(&sink.body()[..], b"spa");

        let config = RouterConfig::new(dir.path()).not_found_route("/missing");
        let app = App::build(config, &modules).unwrap();
        let sink = get(&app, "/nowhere").await;
        assert_eq!(sink.head().unwrap().status, StatusCode::NOT_FOUND);
        assert_eq!(&sink.body()[..], b"missing");
    }

    #[tokio::test]
    async fn unresolvable_fallback_fails_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let config = RouterConfig::new(dir.path()).default_route("/index.html");
        assert!(matches!(
            App::build(config, &ModuleRegistry::new()),
            Err(BuildError::UnknownFallbackRoute { kind: "default", .. })
        ));
    }

    #[tokio::test]
    async fn plain_not_found_and_method_not_allowed() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "page.html");
        let app = App::build(RouterConfig::new(dir.path()), &ModuleRegistry::new()).unwrap();

        let sink = get(&app, "/nope").await;
        assert_eq!(sink.head().unwrap().status, StatusCode::NOT_FOUND);
        assert_eq!(&sink.body()[..], b"Not Found");

        let sink = MemorySink::new();
        app.dispatch(
            RequestHead::new(Method::Delete, "/page.html"),
            BodyStream::empty(),
            Box::new(sink.clone()),
            AbortSignal::new(),
        )
        .await;
        let head = sink.head().unwrap();
        assert_eq!(head.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(head.headers.get("allow"), Some("GET"));
    }

    #[tokio::test]
    async fn static_files_are_served_with_their_mime_type() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "docs/index.html");
        let config = RouterConfig::new(dir.path()).resolve_without_extension(".html");
        let app = App::build(config, &ModuleRegistry::new()).unwrap();

        let sink = get(&app, "/docs/").await;
        let head = sink.head().unwrap();
        assert_eq!(head.headers.get("content-type"), Some("text/html; charset=utf-8"));
        assert_eq!(&sink.body()[..], b"<h1>page</h1>");
        assert!(sink.is_finished());
    }

    #[tokio::test]
    async fn json_replies_follow_the_accept_header() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "data.rs");
        let modules = ModuleRegistry::new().route(
            "data.rs",
            RouteModule::new().handler(
                "GET",
                handler_fn(|_req, _res| Box::pin(async { Ok(json!({ "a": "b" }).into()) })),
            ),
        );
        let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();

        let sink = MemorySink::new();
        app.dispatch(
            RequestHead::new(Method::Get, "/data").header("Accept", "text/plain;q=0.5, application/x-www-form-urlencoded"),
            BodyStream::empty(),
            Box::new(sink.clone()),
            AbortSignal::new(),
        )
        .await;
        let head = sink.head().unwrap();
        assert_eq!(head.headers.get("content-type"), Some("application/x-www-form-urlencoded"));
        assert_eq!(&sink.body()[..], b"a=b");

        let sink = get(&app, "/data").await;
        assert_eq!(sink.head().unwrap().headers.get("content-type"), Some("application/json"));
        assert_eq!(&sink.body()[..], br#"{"a":"b"}"#);
    }
}
