//! Middleware pipeline: ordered interceptors that run before the handler,
//! and a separate error chain that runs after a failure.
//!
//! ## Core types
//!
//! - [`Middleware`]: a normal interceptor. Its returned future is its
//!   continuation: resolving to `Ok(())` advances to the next middleware (or
//!   the handler), resolving to `Err(e)` switches the request into error mode.
//! - [`ErrorMiddleware`]: an interceptor on the error chain; it receives the
//!   failure alongside the request and response.
//! - [`MiddlewareSet`]: the declared shape: ALL-method chains plus
//!   per-method chains, each split into normal and error lists.
//! - [`Pipeline`]: the resolved, per-method chains for one route, built once
//!   at startup and shared by every request to it.
//!
//! ## Execution rules
//!
//! - Chains run strictly in sequence; ALL-scope entries run before
//!   method-scope entries, and outer scopes before inner ones.
//! - The first `Err` (or panic) skips the remaining normal middleware and
//!   starts the error chain.
//! - Once the response has ended, nothing further runs, in either chain.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::debug;

use crate::BoxFuture;
use crate::context::{RequestContext, ResponseContext};
use crate::error::{BuildError, HandlerError};
use crate::http::Method;

/// Future returned by middleware: `Ok(())` continues, `Err` fails the request.
pub type MiddlewareFuture<'a> = BoxFuture<'a, Result<(), HandlerError>>;

/// A normal interceptor.
///
/// Implementations may inspect or mutate the request (including its
/// extensions), set response headers, or finish the response outright by
/// calling [`ResponseContext::send`] / [`ResponseContext::end`], after which
/// the rest of the pipeline and the handler are skipped.
///
/// Plain functions and closures with the right shape implement this trait;
/// use [`from_fn`] to get closure signatures inferred.
pub trait Middleware: Send + Sync {
    fn handle<'a>(
        &'a self,
        req: &'a mut RequestContext,
        res: &'a mut ResponseContext,
    ) -> MiddlewareFuture<'a>;
}

/// An interceptor on the error chain.
///
/// Returning `Ok(())` passes the same error on to the next error middleware.
/// Returning `Err(other)` replaces the error and stops the chain. Ending the
/// response recovers from the error entirely.
pub trait ErrorMiddleware: Send + Sync {
    fn handle<'a>(
        &'a self,
        err: &'a HandlerError,
        req: &'a mut RequestContext,
        res: &'a mut ResponseContext,
    ) -> MiddlewareFuture<'a>;
}

impl<F> Middleware for F
where
    F: for<'a> Fn(&'a mut RequestContext, &'a mut ResponseContext) -> MiddlewareFuture<'a>
        + Send
        + Sync,
{
    fn handle<'a>(
        &'a self,
        req: &'a mut RequestContext,
        res: &'a mut ResponseContext,
    ) -> MiddlewareFuture<'a> {
        (self)(req, res)
    }
}

impl<F> ErrorMiddleware for F
where
    F: for<'a> Fn(&'a HandlerError, &'a mut RequestContext, &'a mut ResponseContext) -> MiddlewareFuture<'a>
        + Send
        + Sync,
{
    fn handle<'a>(
        &'a self,
        err: &'a HandlerError,
        req: &'a mut RequestContext,
        res: &'a mut ResponseContext,
    ) -> MiddlewareFuture<'a> {
        (self)(err, req, res)
    }
}

/// A type-erased, reference-counted normal middleware.
pub type MiddlewareHandler = Arc<dyn Middleware>;

/// A type-erased, reference-counted error middleware.
pub type ErrorMiddlewareHandler = Arc<dyn ErrorMiddleware>;

/// Wraps a closure as a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust
/// use fsrouter::middleware::from_fn;
///
/// let stamp = from_fn(|_req, res| {
///     Box::pin(async move {
///         res.set_header("X-Powered-By", "fsrouter")?;
///         Ok(())
///     })
/// });
/// ```
pub fn from_fn<F>(f: F) -> MiddlewareHandler
where
    F: for<'a> Fn(&'a mut RequestContext, &'a mut ResponseContext) -> MiddlewareFuture<'a>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Wraps a closure as an [`ErrorMiddlewareHandler`].
pub fn error_fn<F>(f: F) -> ErrorMiddlewareHandler
where
    F: for<'a> Fn(&'a HandlerError, &'a mut RequestContext, &'a mut ResponseContext) -> MiddlewareFuture<'a>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Normal and error lists for one scope.
#[derive(Clone, Default)]
pub struct Chains {
    pub normal: Vec<MiddlewareHandler>,
    pub error: Vec<ErrorMiddlewareHandler>,
}

impl Chains {
    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.error.is_empty()
    }

    fn extend_from(&mut self, inner: &Chains) {
        self.normal.extend(inner.normal.iter().cloned());
        self.error.extend(inner.error.iter().cloned());
    }
}

/// Middleware declared by one scope (app, directory, route module, or handler),
/// or the merged result of several scopes.
///
/// Method keys are kept as declared and validated when the route table is
/// built, so a typo such as `"get"` fails startup instead of silently never
/// matching.
///
/// # Examples
///
/// ```rust
/// use fsrouter::middleware::{error_fn, from_fn, MiddlewareSet};
///
/// let set = MiddlewareSet::new()
///     .with(from_fn(|_req, _res| Box::pin(async { Ok(()) })))
///     .with_for("POST", from_fn(|_req, _res| Box::pin(async { Ok(()) })))
///     .with_error(error_fn(|_err, _req, _res| Box::pin(async { Ok(()) })));
/// assert_eq!(set.all().normal.len(), 1);
/// assert!(set.for_method("POST").is_some());
/// ```
#[derive(Clone, Default)]
pub struct MiddlewareSet {
    all: Chains,
    by_method: Vec<(String, Chains)>,
}

impl MiddlewareSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a normal middleware that applies to every method.
    #[must_use]
    pub fn with(mut self, middleware: MiddlewareHandler) -> Self {
        self.all.normal.push(middleware);
        self
    }

    /// Appends an error middleware that applies to every method.
    #[must_use]
    pub fn with_error(mut self, middleware: ErrorMiddlewareHandler) -> Self {
        self.all.error.push(middleware);
        self
    }

    /// Appends a normal middleware for one method key, e.g. `"POST"`.
    #[must_use]
    pub fn with_for(mut self, method: &str, middleware: MiddlewareHandler) -> Self {
        self.method_chains(method).normal.push(middleware);
        self
    }

    /// Appends an error middleware for one method key.
    #[must_use]
    pub fn with_error_for(mut self, method: &str, middleware: ErrorMiddlewareHandler) -> Self {
        self.method_chains(method).error.push(middleware);
        self
    }

    fn method_chains(&mut self, method: &str) -> &mut Chains {
        let pos = match self.by_method.iter().position(|(k, _)| k == method) {
            Some(pos) => pos,
            None => {
                self.by_method.push((method.to_owned(), Chains::default()));
                self.by_method.len() - 1
            }
        };
        &mut self.by_method[pos].1
    }

    pub fn all(&self) -> &Chains {
        &self.all
    }

    pub fn for_method(&self, method: &str) -> Option<&Chains> {
        self.by_method
            .iter()
            .find(|(k, _)| k == method)
            .map(|(_, chains)| chains)
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.by_method.iter().all(|(_, c)| c.is_empty())
    }

    /// Rejects method keys that are not uppercase HTTP methods.
    pub fn validate(&self, origin: &str) -> Result<(), BuildError> {
        match self
            .by_method
            .iter()
            .find(|(k, _)| Method::from_route_key(k).is_none())
        {
            Some((key, _)) => Err(BuildError::InvalidMethod {
                file: origin.to_owned(),
                method: key.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Returns `self` followed by `inner`: outer entries stay ahead of inner
    /// ones in both the ALL and per-method lists.
    #[must_use]
    pub fn merged(&self, inner: &MiddlewareSet) -> MiddlewareSet {
        let mut merged = self.clone();
        merged.all.extend_from(&inner.all);
        for (method, chains) in &inner.by_method {
            merged.method_chains(method).extend_from(chains);
        }
        merged
    }

    /// Resolves the chains that apply to `method`: ALL-scope, then method-scope.
    pub fn pipeline_for(&self, method: &Method) -> Pipeline {
        let mut chains = self.all.clone();
        if let Some(scoped) = self.for_method(method.as_str()) {
            chains.extend_from(scoped);
        }
        Pipeline {
            normal: chains.normal.into(),
            error: chains.error.into(),
        }
    }
}

/// The resolved normal and error chains for one route and method.
#[derive(Clone, Default)]
pub struct Pipeline {
    normal: Arc<[MiddlewareHandler]>,
    error: Arc<[ErrorMiddlewareHandler]>,
}

impl Pipeline {
    pub fn normal_len(&self) -> usize {
        self.normal.len()
    }

    pub fn error_len(&self) -> usize {
        self.error.len()
    }

    /// Runs the normal chain.
    ///
    /// Returns `Ok(())` when the chain finished or a middleware ended the
    /// response (check [`ResponseContext::is_ended`]), and the first error
    /// otherwise.
    pub async fn run(
        &self,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Result<(), HandlerError> {
        for middleware in self.normal.iter() {
            if res.is_ended() {
                return Ok(());
            }
            let (r, s) = (&mut *req, &mut *res);
            guarded(move || middleware.handle(r, s)).await?;
        }
        Ok(())
    }

    /// Runs the error chain for `err` and returns the error that should
    /// surface if the response is still open afterwards.
    pub async fn run_error(
        &self,
        mut err: HandlerError,
        req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> HandlerError {
        for middleware in self.error.iter() {
            if res.is_ended() {
                break;
            }
            let (e, r, s) = (&err, &mut *req, &mut *res);
            let outcome = guarded(move || middleware.handle(e, r, s)).await;
            if let Err(replacement) = outcome {
                debug!(error = %replacement, "error middleware replaced the request error");
                err = replacement;
                break;
            }
        }
        err
    }
}

/// Polls a middleware or handler future, converting panics into errors,
/// whether raised while building the future or while polling it.
pub(crate) async fn guarded<'a, T>(
    make: impl FnOnce() -> BoxFuture<'a, Result<T, HandlerError>>,
) -> Result<T, HandlerError> {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(make)) {
        Ok(future) => future,
        Err(payload) => return Err(HandlerError::from_panic(payload)),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::from_panic(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, StatusCode};
    use crate::context::RequestBody;
    use crate::transport::{AbortSignal, BodyStream, MemorySink};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn contexts() -> (RequestContext, ResponseContext, MemorySink) {
        let req = RequestContext::new(
            Method::Get,
            "/",
            Headers::new(),
            RequestBody::Unread(BodyStream::empty()),
        );
        let sink = MemorySink::new();
        let res = ResponseContext::new(Box::new(sink.clone()), AbortSignal::new());
        (req, res, sink)
    }

    fn recorder(log: &Log, name: &'static str) -> MiddlewareHandler {
        let log = Arc::clone(log);
        from_fn(move |_req, _res| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(name.to_owned());
                Ok(())
            })
        })
    }

    fn failing(log: &Log, name: &'static str) -> MiddlewareHandler {
        let log = Arc::clone(log);
        from_fn(move |_req, _res| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(name.to_owned());
                Err(HandlerError::new(StatusCode::FORBIDDEN, name))
            })
        })
    }

    fn error_recorder(log: &Log, name: &'static str) -> ErrorMiddlewareHandler {
        let log = Arc::clone(log);
        error_fn(move |err, _req, _res| {
            let entry = format!("{name}:{}", err.message());
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(entry);
                Ok(())
            })
        })
    }

    #[test]
    fn merge_keeps_outer_before_inner() {
        let log: Log = Arc::default();
        let outer = MiddlewareSet::new()
            .with(recorder(&log, "outer"))
            .with_for("GET", recorder(&log, "outer-get"));
        let inner = MiddlewareSet::new()
            .with(recorder(&log, "inner"))
            .with_for("GET", recorder(&log, "inner-get"))
            .with_for("POST", recorder(&log, "inner-post"));

        let merged = outer.merged(&inner);
        assert_eq!(merged.all().normal.len(), 2);
        assert_eq!(merged.for_method("GET").unwrap().normal.len(), 2);
        assert_eq!(merged.for_method("POST").unwrap().normal.len(), 1);
        assert_eq!(merged.pipeline_for(&Method::Get).normal_len(), 4);
        assert_eq!(merged.pipeline_for(&Method::Delete).normal_len(), 2);
    }

    #[test]
    fn lowercase_method_keys_fail_validation() {
        let log: Log = Arc::default();
        let set = MiddlewareSet::new().with_for("get", recorder(&log, "x"));
        let err = set.validate("routes/auth.mw.rs").unwrap_err();
        assert!(matches!(
            err,
            BuildError::InvalidMethod { ref method, .. } if method == "get"
        ));
    }

    #[tokio::test]
    async fn all_scope_runs_before_method_scope() {
        let log: Log = Arc::default();
        let set = MiddlewareSet::new()
            .with_for("GET", recorder(&log, "get"))
            .with(recorder(&log, "all"));
        let (mut req, mut res, _) = contexts();
        set.pipeline_for(&Method::Get)
            .run(&mut req, &mut res)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), ["all", "get"]);
    }

    #[tokio::test]
    async fn error_skips_rest_of_normal_chain() {
        let log: Log = Arc::default();
        let set = MiddlewareSet::new()
            .with(recorder(&log, "one"))
            .with(failing(&log, "two"))
            .with(recorder(&log, "three"))
            .with_error(error_recorder(&log, "e1"))
            .with_error(error_recorder(&log, "e2"));
        let pipeline = set.pipeline_for(&Method::Get);
        let (mut req, mut res, _) = contexts();

        let err = pipeline.run(&mut req, &mut res).await.unwrap_err();
        let surfaced = pipeline.run_error(err, &mut req, &mut res).await;

        assert_eq!(*log.lock().unwrap(), ["one", "two", "e1:two", "e2:two"]);
        assert_eq!(surfaced.status(), StatusCode::FORBIDDEN);
        assert_eq!(surfaced.message(), "two");
    }

    #[tokio::test]
    async fn ended_response_stops_the_chain() {
        let log: Log = Arc::default();
        let set = MiddlewareSet::new()
            .with(from_fn(|_req, res| {
                Box::pin(async move {
                    res.send("short-circuit").await;
                    Ok(())
                })
            }))
            .with(recorder(&log, "never"));
        let (mut req, mut res, sink) = contexts();
        set.pipeline_for(&Method::Get)
            .run(&mut req, &mut res)
            .await
            .unwrap();
        assert!(res.is_ended());
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(&sink.body()[..], b"short-circuit");
    }

    #[tokio::test]
    async fn error_middleware_can_recover_by_ending() {
        let log: Log = Arc::default();
        let set = MiddlewareSet::new()
            .with(failing(&log, "boom"))
            .with_error(error_fn(|err, _req, res| {
                let status = err.status();
                Box::pin(async move {
                    res.set_status(status)?;
                    res.send("handled").await;
                    Ok(())
                })
            }))
            .with_error(error_recorder(&log, "late"));
        let pipeline = set.pipeline_for(&Method::Get);
        let (mut req, mut res, sink) = contexts();

        let err = pipeline.run(&mut req, &mut res).await.unwrap_err();
        pipeline.run_error(err, &mut req, &mut res).await;

        assert!(res.is_ended());
        assert_eq!(sink.head().unwrap().status, StatusCode::FORBIDDEN);
        assert_eq!(*log.lock().unwrap(), ["boom"]);
    }

    #[tokio::test]
    async fn error_middleware_may_replace_the_error() {
        let set = MiddlewareSet::new().with_error(error_fn(|_err, _req, _res| {
            Box::pin(async { Err(HandlerError::new(StatusCode::IM_A_TEAPOT, "replaced")) })
        }));
        let (mut req, mut res, _) = contexts();
        let surfaced = set
            .pipeline_for(&Method::Get)
            .run_error(HandlerError::msg("original"), &mut req, &mut res)
            .await;
        assert_eq!(surfaced.message(), "replaced");
    }

    async fn explode() -> Result<(), HandlerError> {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let polled = MiddlewareSet::new().with(from_fn(|_req, _res| Box::pin(explode())));
        let built = MiddlewareSet::new().with(from_fn(|_req, _res| panic!("kaboom early")));
        for (set, expected) in [(polled, "kaboom"), (built, "kaboom early")] {
            let (mut req, mut res, _) = contexts();
            let err = set
                .pipeline_for(&Method::Get)
                .run(&mut req, &mut res)
                .await
                .unwrap_err();
            assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert!(err.message().contains(expected));
        }
    }
}
