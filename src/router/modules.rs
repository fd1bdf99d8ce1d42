//! Code behind route files.
//!
//! Every handler file in the route directory (`strains/$name/info.rs`) and
//! every directory middleware file (`strains/auth.mw.rs`) is bound, by its
//! path relative to the route directory, to a module registered here. The
//! file's location decides the URL and the middleware scope; the registered
//! module supplies the code.
//!
//! ```rust
//! use fsrouter::middleware::{from_fn, MiddlewareSet};
//! use fsrouter::router::{handler_fn, MiddlewareModule, ModuleRegistry, RouteModule};
//!
//! let modules = ModuleRegistry::new()
//!     .route(
//!         "strains/$name/info.rs",
//!         RouteModule::new().handler(
//!             "GET",
//!             handler_fn(|req, _res| {
//!                 let name = req.param("name").unwrap_or_default().to_owned();
//!                 Box::pin(async move { Ok(name.into()) })
//!             }),
//!         ),
//!     )
//!     .middleware(
//!         "strains/auth.mw.rs",
//!         MiddlewareModule::new(
//!             MiddlewareSet::new().with(from_fn(|_req, _res| Box::pin(async { Ok(()) }))),
//!         ),
//!     );
//! assert_eq!(modules.route_count(), 1);
//! ```

use std::collections::HashMap;
use std::path::Path;

use crate::error::BuildError;
use crate::http::Method;
use crate::middleware::MiddlewareSet;
use crate::router::HandlerDescriptor;

/// The handlers, middleware and defaults behind one handler file.
#[derive(Clone, Default)]
pub struct RouteModule {
    handlers: Vec<(String, HandlerDescriptor)>,
    middleware: MiddlewareSet,
    stream_request_body: bool,
}

impl RouteModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a handler to an HTTP method key such as `"GET"`.
    ///
    /// Keys are checked when the route table is built; anything other than
    /// an uppercase HTTP method is a build error. Binding the same key twice
    /// keeps the last handler.
    #[must_use]
    pub fn handler(mut self, method: &str, descriptor: impl Into<HandlerDescriptor>) -> Self {
        let descriptor = descriptor.into();
        match self.handlers.iter_mut().find(|(key, _)| key == method) {
            Some(slot) => slot.1 = descriptor,
            None => self.handlers.push((method.to_owned(), descriptor)),
        }
        self
    }

    /// Middleware for every handler in this module, after directory middleware.
    #[must_use]
    pub fn middleware(mut self, middleware: MiddlewareSet) -> Self {
        self.middleware = middleware;
        self
    }

    /// Default body mode for handlers that do not set their own.
    #[must_use]
    pub fn stream_request_body(mut self, stream: bool) -> Self {
        self.stream_request_body = stream;
        self
    }

    pub fn module_middleware(&self) -> &MiddlewareSet {
        &self.middleware
    }

    pub fn streams_request_body(&self) -> bool {
        self.stream_request_body
    }

    /// Validates method keys and middleware, returning handlers in
    /// declaration order.
    pub(crate) fn resolve(&self, file: &str) -> Result<Vec<(Method, &HandlerDescriptor)>, BuildError> {
        self.middleware.validate(file)?;
        let mut resolved = Vec::with_capacity(self.handlers.len());
        for (key, descriptor) in &self.handlers {
            let method = Method::from_route_key(key).ok_or_else(|| BuildError::InvalidMethod {
                file: file.to_owned(),
                method: key.clone(),
            })?;
            descriptor.middleware.validate(file)?;
            resolved.push((method, descriptor));
        }
        if resolved.is_empty() {
            return Err(BuildError::EmptyModule {
                file: file.to_owned(),
            });
        }
        Ok(resolved)
    }
}

/// The middleware behind one directory middleware file.
#[derive(Clone, Default)]
pub struct MiddlewareModule {
    middleware: MiddlewareSet,
}

impl MiddlewareModule {
    pub fn new(middleware: MiddlewareSet) -> Self {
        Self { middleware }
    }

    pub fn middleware(&self) -> &MiddlewareSet {
        &self.middleware
    }
}

impl From<MiddlewareSet> for MiddlewareModule {
    fn from(middleware: MiddlewareSet) -> Self {
        Self::new(middleware)
    }
}

/// Modules keyed by file path relative to the route directory.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    routes: HashMap<String, RouteModule>,
    middleware: HashMap<String, MiddlewareModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the module for a handler file, e.g. `"strains/$name/info.rs"`.
    #[must_use]
    pub fn route(mut self, file: impl AsRef<str>, module: RouteModule) -> Self {
        self.routes.insert(normalize_key(file.as_ref()), module);
        self
    }

    /// Registers the module for a middleware file, e.g. `"strains/auth.mw.rs"`.
    #[must_use]
    pub fn middleware(mut self, file: impl AsRef<str>, module: impl Into<MiddlewareModule>) -> Self {
        self.middleware.insert(normalize_key(file.as_ref()), module.into());
        self
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware.len()
    }

    pub(crate) fn route_module(&self, key: &str) -> Option<&RouteModule> {
        self.routes.get(key)
    }

    pub(crate) fn middleware_module(&self, key: &str) -> Option<&MiddlewareModule> {
        self.middleware.get(key)
    }

    pub(crate) fn route_keys(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub(crate) fn middleware_keys(&self) -> impl Iterator<Item = &str> {
        self.middleware.keys().map(String::as_str)
    }
}

/// The registry key for a path relative to the route directory.
pub(crate) fn key_for(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn normalize_key(file: &str) -> String {
    file.split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}
