//! Filesystem routing: turn a directory tree into an immutable route table
//! and resolve request paths against it.
//!
//! Route patterns come from file and directory names:
//!
//! | Name on disk          | Pattern segment | Matches                         | Binds           |
//! |-----------------------|-----------------|---------------------------------|-----------------|
//! | `strains/`            | `strains`       | `strains`                       | *(none)*        |
//! | `$name/`, `$name.rs`  | `$name`         | any one segment                 | `name`          |
//! | `strains+.rs`         | `strains+`      | `strains`, `strains/a/b`, ...   | rest of path    |
//! | `$path+.rs`           | `$path+`        | one or more segments            | `path`          |
//! | `index.rs`            | *(directory)*   | the directory itself, or `index`| *(none)*        |
//!
//! Files with the handler extension bind to a [`RouteModule`] registered in a
//! [`ModuleRegistry`]; files ending in the middleware suffix contribute a
//! [`MiddlewareModule`] to their directory and its descendants; any other
//! file is served as a static file.
//!
//! Matching walks a segment trie, preferring literal segments, then the
//! level's variable, then catch-alls. Trailing slashes never matter.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::BoxFuture;
use crate::app::Reply;
use crate::context::{PathParams, RequestContext, ResponseContext};
use crate::error::HandlerError;
use crate::http::Method;
use crate::middleware::{MiddlewareSet, Pipeline};

pub mod builder;
pub mod matcher;
pub mod modules;
pub mod static_files;

pub use builder::build_routes;
pub use matcher::Matcher;
pub use modules::{MiddlewareModule, ModuleRegistry, RouteModule};

/// Future returned by a handler.
pub type HandlerFuture<'a> = BoxFuture<'a, Result<Reply, HandlerError>>;

/// A request handler.
///
/// The returned [`Reply`] is serialized and sent by the engine. Handlers that
/// take control of the response themselves (see
/// [`ResponseContext::start_streaming`]) can return [`Reply::empty`]; it is
/// ignored once the handler streams.
pub trait Handler: Send + Sync {
    fn call<'a>(&'a self, req: &'a mut RequestContext, res: &'a mut ResponseContext) -> HandlerFuture<'a>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut RequestContext, &'a mut ResponseContext) -> HandlerFuture<'a> + Send + Sync,
{
    fn call<'a>(&'a self, req: &'a mut RequestContext, res: &'a mut ResponseContext) -> HandlerFuture<'a> {
        (self)(req, res)
    }
}

/// A type-erased, shareable handler.
pub type HandlerFn = Arc<dyn Handler>;

/// Wraps a closure as a [`HandlerFn`].
///
/// # Examples
///
/// ```rust
/// use fsrouter::router::handler_fn;
/// use serde_json::json;
///
/// let info = handler_fn(|req, _res| {
///     let name = req.param("name").unwrap_or_default().to_owned();
///     Box::pin(async move { Ok(json!({ "strain": name }).into()) })
/// });
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn
where
    F: for<'a> Fn(&'a mut RequestContext, &'a mut ResponseContext) -> HandlerFuture<'a>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// One method's handler as declared by a route module.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub(crate) handler: HandlerFn,
    pub(crate) stream_request_body: Option<bool>,
    pub(crate) middleware: MiddlewareSet,
}

impl HandlerDescriptor {
    pub fn new(handler: HandlerFn) -> Self {
        Self {
            handler,
            stream_request_body: None,
            middleware: MiddlewareSet::new(),
        }
    }

    /// Leaves the request body unread so the handler can stream it.
    /// Overrides the module-wide default.
    #[must_use]
    pub fn stream_request_body(mut self, stream: bool) -> Self {
        self.stream_request_body = Some(stream);
        self
    }

    /// Middleware that runs only in front of this handler, after every
    /// directory- and module-level middleware.
    #[must_use]
    pub fn middleware(mut self, middleware: MiddlewareSet) -> Self {
        self.middleware = middleware;
        self
    }
}

impl From<HandlerFn> for HandlerDescriptor {
    fn from(handler: HandlerFn) -> Self {
        Self::new(handler)
    }
}

/// One segment of a [`RoutePattern`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Matches exactly this text.
    Literal(String),
    /// Matches any single segment and binds it.
    Variable(String),
    /// Matches this text followed by zero or more segments.
    LiteralCatchAll(String),
    /// Matches one or more segments and binds them, `/`-joined.
    VariableCatchAll(String),
}

impl Segment {
    /// Parses a single file or directory name (extension already removed).
    pub fn from_name(name: &str) -> Self {
        match (name.strip_prefix('$'), name.strip_suffix('+')) {
            (Some(var), Some(_)) => Segment::VariableCatchAll(var.trim_end_matches('+').to_owned()),
            (Some(var), None) => Segment::Variable(var.to_owned()),
            (None, Some(lit)) => Segment::LiteralCatchAll(lit.to_owned()),
            (None, None) => Segment::Literal(name.to_owned()),
        }
    }

    /// The parameter this segment binds, if any.
    pub fn param_name(&self) -> Option<&str> {
        match self {
            Segment::Variable(name) | Segment::VariableCatchAll(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(s) => f.write_str(s),
            Segment::Variable(s) => write!(f, "${s}"),
            Segment::LiteralCatchAll(s) => write!(f, "{s}+"),
            Segment::VariableCatchAll(s) => write!(f, "${s}+"),
        }
    }
}

/// A compiled route pattern, e.g. `/strains/$name/info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RoutePattern {
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Parses a pattern string in the notation file names use.
    ///
    /// ```
    /// use fsrouter::router::{RoutePattern, Segment};
    ///
    /// let p = RoutePattern::parse("/strains/$name/info/");
    /// assert_eq!(p.segments()[1], Segment::Variable("name".into()));
    /// assert_eq!(p.to_string(), "/strains/$name/info");
    /// ```
    pub fn parse(pattern: &str) -> Self {
        Self::new(
            pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(Segment::from_name)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Parameter names in pattern order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(Segment::param_name)
    }

    /// Returns a new pattern with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: Segment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// What a route entry serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKind {
    /// Handlers from a route module.
    Module,
    /// A file served from disk.
    Static { mime: &'static str },
}

/// A method bound on a route, with its resolved middleware pipeline.
#[derive(Clone)]
pub struct MethodRoute {
    pub(crate) method: Method,
    pub(crate) handler: HandlerFn,
    pub(crate) stream_request_body: bool,
    pub(crate) pipeline: Pipeline,
}

impl MethodRoute {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn streams_request_body(&self) -> bool {
        self.stream_request_body
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn handler(&self) -> &HandlerFn {
        &self.handler
    }
}

/// One routable file: its pattern, aliases, and per-method handlers.
pub struct RouteEntry {
    pub(crate) pattern: RoutePattern,
    pub(crate) aliases: Vec<RoutePattern>,
    pub(crate) source: PathBuf,
    pub(crate) kind: RouteKind,
    pub(crate) methods: Vec<MethodRoute>,
}

impl RouteEntry {
    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    /// Extra patterns that resolve to this entry (`/dir/index`, extensionless names).
    pub fn aliases(&self) -> &[RoutePattern] {
        &self.aliases
    }

    /// The file this entry was built from, relative to the route directory.
    pub fn source(&self) -> &std::path::Path {
        &self.source
    }

    pub fn kind(&self) -> &RouteKind {
        &self.kind
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.iter().map(|m| &m.method)
    }

    pub fn method_route(&self, method: &Method) -> Option<&MethodRoute> {
        self.methods.iter().find(|m| &m.method == method)
    }

    /// Value for an `Allow` header: the bound methods, comma-separated.
    pub fn allow_header(&self) -> String {
        self.methods
            .iter()
            .map(|m| m.method.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry")
            .field("pattern", &self.pattern.to_string())
            .field("aliases", &self.aliases)
            .field("source", &self.source)
            .field("kind", &self.kind)
            .field("methods", &self.allow_header())
            .finish()
    }
}

/// A resolved route and the parameters it bound.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub entry: Arc<RouteEntry>,
    pub params: PathParams,
}

/// The immutable table of every route, plus the matcher over it.
pub struct RouteTable {
    entries: Vec<Arc<RouteEntry>>,
    matcher: Matcher,
}

impl RouteTable {
    pub(crate) fn new(entries: Vec<Arc<RouteEntry>>, matcher: Matcher) -> Self {
        Self { entries, matcher }
    }

    /// Entries in traversal order.
    pub fn entries(&self) -> &[Arc<RouteEntry>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves a request path (without query string).
    pub fn lookup(&self, path: &str) -> Option<RouteMatch> {
        let found = self.matcher.lookup(path)?;
        let entry = self.entries.get(found.route)?;
        Some(RouteMatch {
            entry: Arc::clone(entry),
            params: found.params,
        })
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.entries).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names() {
        assert_eq!(Segment::from_name("strains"), Segment::Literal("strains".into()));
        assert_eq!(Segment::from_name("$name"), Segment::Variable("name".into()));
        assert_eq!(
            Segment::from_name("strains+"),
            Segment::LiteralCatchAll("strains".into())
        );
        assert_eq!(
            Segment::from_name("$rest+"),
            Segment::VariableCatchAll("rest".into())
        );
    }

    #[test]
    fn patterns_display_in_file_notation() {
        assert_eq!(RoutePattern::default().to_string(), "/");
        let pattern = RoutePattern::parse("/files/$path+");
        assert_eq!(pattern.to_string(), "/files/$path+");
        assert_eq!(pattern.param_names().collect::<Vec<_>>(), ["path"]);
    }

    #[test]
    fn child_appends_without_mutating() {
        let base = RoutePattern::parse("/strains");
        let child = base.child(Segment::Variable("name".into()));
        assert_eq!(base.to_string(), "/strains");
        assert_eq!(child.to_string(), "/strains/$name");
    }
}
