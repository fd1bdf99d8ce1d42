//! # fsrouter
//!
//! Filesystem-driven HTTP routing with an async middleware pipeline.
//!
//! The layout of a route directory decides the URL space: directories and
//! files become path segments, `$name` segments bind path parameters, `name+`
//! segments catch everything below them, handler files bind to code
//! registered in a [`ModuleRegistry`](router::ModuleRegistry), directory
//! middleware files scope middleware to a subtree, and every other file is
//! served as a static file.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fsrouter::app::App;
//! use fsrouter::config::RouterConfig;
//! use fsrouter::router::{handler_fn, ModuleRegistry, RouteModule};
//! use fsrouter::server::Server;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // www/strains/$name/info.rs
//!     let modules = ModuleRegistry::new().route(
//!         "strains/$name/info.rs",
//!         RouteModule::new().handler(
//!             "GET",
//!             handler_fn(|req, _res| {
//!                 let name = req.param("name").unwrap_or_default().to_owned();
//!                 Box::pin(async move { Ok(json!({ "strain": name }).into()) })
//!             }),
//!         ),
//!     );
//!     let app = App::build(RouterConfig::new("www"), &modules)?;
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(Arc::new(app)).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod app;
pub mod config;
pub mod content;
pub mod context;
pub mod error;
pub mod http;
pub mod middleware;
pub mod router;
pub mod server;
pub mod transport;
pub mod url;

/// A boxed, `Send` future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use app::{App, Reply};
pub use config::RouterConfig;
pub use content::Body;
pub use context::{RequestContext, ResponseContext};
pub use error::{BuildError, HandlerError};
pub use http::{Headers, Method, StatusCode};
pub use router::{ModuleRegistry, RouteModule, handler_fn};
pub use server::{Server, ServerError};
