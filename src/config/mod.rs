//! Router configuration.
//!
//! Plain data settings derive [`Deserialize`] and can be loaded from TOML;
//! function-valued settings (error transformer, content handlers, app-level
//! middleware) are attached in code with the builder setters.
//!
//! ```toml
//! route_dir = "www"
//! ignore_files_matching = ['\.md$', '^drafts/']
//! resolve_without_extension = [".html"]
//! default_route = "/index.html"
//! decode_path_parameters = true
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::content::{APPLICATION_JSON, ContentHandler, ContentNegotiator};
use crate::error::{BuildError, CorrelationId, HandlerError};
use crate::middleware::MiddlewareSet;

/// Rewrites an unhandled error before it becomes the error response.
pub type ErrorTransformer = Arc<dyn Fn(HandlerError, &CorrelationId) -> HandlerError + Send + Sync>;

/// Errors from loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings for building and running an [`App`](crate::app::App).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Directory scanned for routes.
    pub route_dir: PathBuf,

    /// Regexes tested against each path relative to `route_dir`
    /// (`/`-separated); matches are skipped.
    pub ignore_files_matching: Vec<String>,

    /// Route `*.test.<ext>` files instead of skipping them.
    pub allow_test_file_routes: bool,

    /// Static file extensions (e.g. `".html"`) that also get a route without
    /// the extension.
    pub resolve_without_extension: Vec<String>,

    /// Path served with status 404 when nothing matches.
    pub not_found_route: Option<String>,

    /// Path served with its normal status when nothing matches. Takes
    /// precedence over `not_found_route`.
    pub default_route: Option<String>,

    /// Response type used when the request has no usable `Accept` header.
    pub accepts_default: String,

    /// Fallback type for serializing and deserializing bodies.
    pub default_content_type: String,

    pub decode_query_parameters: bool,
    pub decode_path_parameters: bool,

    /// Extension of route module files.
    pub handler_extension: String,

    /// Suffix of directory middleware files.
    pub middleware_suffix: String,

    /// Request body chunks buffered between transport and handler.
    pub body_channel_capacity: usize,

    /// Read size when streaming static files.
    pub static_chunk_size: usize,

    #[serde(skip)]
    pub error_transformer: Option<ErrorTransformer>,

    #[serde(skip)]
    pub content_handlers: Vec<(String, Arc<dyn ContentHandler>)>,

    /// Middleware applied to every route, ahead of directory middleware.
    #[serde(skip)]
    pub middleware: MiddlewareSet,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            route_dir: PathBuf::from("www"),
            ignore_files_matching: Vec::new(),
            allow_test_file_routes: false,
            resolve_without_extension: Vec::new(),
            not_found_route: None,
            default_route: None,
            accepts_default: APPLICATION_JSON.to_owned(),
            default_content_type: APPLICATION_JSON.to_owned(),
            decode_query_parameters: false,
            decode_path_parameters: false,
            handler_extension: ".rs".to_owned(),
            middleware_suffix: ".mw.rs".to_owned(),
            body_channel_capacity: 16,
            static_chunk_size: 64 * 1024,
            error_transformer: None,
            content_handlers: Vec::new(),
            middleware: MiddlewareSet::new(),
        }
    }
}

impl RouterConfig {
    pub fn new(route_dir: impl Into<PathBuf>) -> Self {
        Self {
            route_dir: route_dir.into(),
            ..Self::default()
        }
    }

    /// Parses settings from a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML file. A relative `route_dir` is resolved
    /// against the file's directory.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        if config.route_dir.is_relative() {
            if let Some(base) = path.parent() {
                config.route_dir = base.join(&config.route_dir);
            }
        }
        Ok(config)
    }

    #[must_use]
    pub fn route_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.route_dir = dir.into();
        self
    }

    #[must_use]
    pub fn ignore_files_matching(mut self, pattern: impl Into<String>) -> Self {
        self.ignore_files_matching.push(pattern.into());
        self
    }

    #[must_use]
    pub fn allow_test_file_routes(mut self, allow: bool) -> Self {
        self.allow_test_file_routes = allow;
        self
    }

    #[must_use]
    pub fn resolve_without_extension(mut self, extension: impl Into<String>) -> Self {
        self.resolve_without_extension.push(extension.into());
        self
    }

    #[must_use]
    pub fn not_found_route(mut self, path: impl Into<String>) -> Self {
        self.not_found_route = Some(path.into());
        self
    }

    #[must_use]
    pub fn default_route(mut self, path: impl Into<String>) -> Self {
        self.default_route = Some(path.into());
        self
    }

    #[must_use]
    pub fn accepts_default(mut self, mime: impl Into<String>) -> Self {
        self.accepts_default = mime.into();
        self
    }

    #[must_use]
    pub fn default_content_type(mut self, mime: impl Into<String>) -> Self {
        self.default_content_type = mime.into();
        self
    }

    #[must_use]
    pub fn decode_query_parameters(mut self, decode: bool) -> Self {
        self.decode_query_parameters = decode;
        self
    }

    #[must_use]
    pub fn decode_path_parameters(mut self, decode: bool) -> Self {
        self.decode_path_parameters = decode;
        self
    }

    #[must_use]
    pub fn handler_extension(mut self, extension: impl Into<String>) -> Self {
        self.handler_extension = extension.into();
        self
    }

    #[must_use]
    pub fn middleware_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.middleware_suffix = suffix.into();
        self
    }

    #[must_use]
    pub fn body_channel_capacity(mut self, capacity: usize) -> Self {
        self.body_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn static_chunk_size(mut self, size: usize) -> Self {
        self.static_chunk_size = size;
        self
    }

    #[must_use]
    pub fn error_transformer<F>(mut self, transformer: F) -> Self
    where
        F: Fn(HandlerError, &CorrelationId) -> HandlerError + Send + Sync + 'static,
    {
        self.error_transformer = Some(Arc::new(transformer));
        self
    }

    #[must_use]
    pub fn content_handler(mut self, mime: impl Into<String>, handler: Arc<dyn ContentHandler>) -> Self {
        self.content_handlers.push((mime.into(), handler));
        self
    }

    /// App-level middleware, outermost in every pipeline.
    #[must_use]
    pub fn middleware(mut self, middleware: MiddlewareSet) -> Self {
        self.middleware = middleware;
        self
    }

    /// Builds the content negotiator described by this config.
    pub fn negotiator(&self) -> Result<ContentNegotiator, BuildError> {
        let mut negotiator = ContentNegotiator::new();
        for (mime, handler) in &self.content_handlers {
            negotiator.register(mime, Arc::clone(handler));
        }
        negotiator.set_default(&self.default_content_type)?;
        Ok(negotiator)
    }
}

impl fmt::Debug for RouterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterConfig")
            .field("route_dir", &self.route_dir)
            .field("ignore_files_matching", &self.ignore_files_matching)
            .field("allow_test_file_routes", &self.allow_test_file_routes)
            .field("resolve_without_extension", &self.resolve_without_extension)
            .field("not_found_route", &self.not_found_route)
            .field("default_route", &self.default_route)
            .field("accepts_default", &self.accepts_default)
            .field("default_content_type", &self.default_content_type)
            .field("decode_query_parameters", &self.decode_query_parameters)
            .field("decode_path_parameters", &self.decode_path_parameters)
            .field("handler_extension", &self.handler_extension)
            .field("middleware_suffix", &self.middleware_suffix)
            .field("body_channel_capacity", &self.body_channel_capacity)
            .field("static_chunk_size", &self.static_chunk_size)
            .field("error_transformer", &self.error_transformer.is_some())
            .field("content_handlers", &self.content_handlers.len())
            .finish_non_exhaustive()
    }
}
