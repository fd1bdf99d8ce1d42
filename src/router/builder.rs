//! Route table construction from a directory tree.
//!
//! The walk is depth-first and lexicographic, so the same tree always yields
//! the same table. Each directory first folds its middleware files into the
//! set inherited from its parent, then recurses into subdirectories, then
//! turns its own files into route entries.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::error::BuildError;
use crate::http::Method;
use crate::middleware::MiddlewareSet;
use crate::router::matcher::{InsertError, Matcher};
use crate::router::modules::{ModuleRegistry, key_for};
use crate::router::static_files::{StaticFile, mime_for};
use crate::router::{MethodRoute, RouteEntry, RouteKind, RoutePattern, RouteTable, Segment};

/// Scans `config.route_dir` and builds the route table.
///
/// # Errors
///
/// Any [`BuildError`]: a missing route directory, an unreadable entry, two
/// different variables in one directory, a handler or middleware file
/// without a registered module, an invalid method key, a duplicate pattern,
/// or an invalid ignore regex.
pub fn build_routes(config: &RouterConfig, modules: &ModuleRegistry) -> Result<RouteTable, BuildError> {
    if !config.route_dir.is_dir() {
        return Err(BuildError::MissingRouteDir(config.route_dir.clone()));
    }
    config.middleware.validate("app middleware")?;

    let ignore = config
        .ignore_files_matching
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| BuildError::InvalidIgnorePattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut walker = Walker {
        config,
        modules,
        ignore,
        entries: Vec::new(),
        used_routes: HashSet::new(),
        used_middleware: HashSet::new(),
    };
    walker.walk(Path::new(""), &RoutePattern::default(), &config.middleware)?;
    walker.warn_unused();

    let mut matcher = Matcher::new();
    let entries: Vec<Arc<RouteEntry>> = walker.entries.into_iter().map(Arc::new).collect();
    for (index, entry) in entries.iter().enumerate() {
        for pattern in std::iter::once(&entry.pattern).chain(&entry.aliases) {
            matcher
                .insert(pattern, index)
                .map_err(|e| insert_error(e, pattern, entry, &entries))?;
            debug!(pattern = %pattern, source = %entry.source.display(), "route registered");
        }
    }
    info!(
        routes = entries.len(),
        route_modules = modules.route_count(),
        middleware_modules = modules.middleware_count(),
        dir = %config.route_dir.display(),
        "route table built"
    );

    Ok(RouteTable::new(entries, matcher))
}

fn insert_error(err: InsertError, pattern: &RoutePattern, entry: &RouteEntry, entries: &[Arc<RouteEntry>]) -> BuildError {
    match err {
        InsertError::Duplicate { existing } => BuildError::DuplicateRoute {
            pattern: pattern.to_string(),
            first: entries
                .get(existing)
                .map(|e| key_for(&e.source))
                .unwrap_or_default(),
            second: key_for(&entry.source),
        },
        InsertError::VariableConflict { existing, new } => BuildError::AmbiguousVariable {
            dir: entry.source.parent().map(Path::to_path_buf).unwrap_or_default(),
            first: existing,
            second: new,
        },
    }
}

struct Walker<'a> {
    config: &'a RouterConfig,
    modules: &'a ModuleRegistry,
    ignore: Vec<Regex>,
    entries: Vec<RouteEntry>,
    used_routes: HashSet<String>,
    used_middleware: HashSet<String>,
}

#[derive(Default)]
struct Listing {
    dirs: Vec<String>,
    middleware_files: Vec<String>,
    handler_files: Vec<String>,
    static_files: Vec<String>,
}

impl Walker<'_> {
    fn walk(&mut self, rel: &Path, prefix: &RoutePattern, inherited: &MiddlewareSet) -> Result<(), BuildError> {
        let listing = self.list(rel)?;
        self.check_variables(rel, &listing)?;

        let mut middleware = inherited.clone();
        for name in &listing.middleware_files {
            let key = key_for(&rel.join(name));
            let modules = self.modules;
            let module = modules
                .middleware_module(&key)
                .ok_or_else(|| BuildError::MissingMiddlewareModule { file: key.clone() })?;
            module.middleware().validate(&key)?;
            middleware = middleware.merged(module.middleware());
            self.used_middleware.insert(key);
        }

        for name in &listing.dirs {
            let child = prefix.child(Segment::from_name(name));
            self.walk(&rel.join(name), &child, &middleware)?;
        }
        for name in &listing.handler_files {
            self.add_module_route(rel, name, prefix, &middleware)?;
        }
        for name in &listing.static_files {
            self.add_static_route(rel, name, prefix, &middleware);
        }
        Ok(())
    }

    fn list(&self, rel: &Path) -> Result<Listing, BuildError> {
        let dir = self.config.route_dir.join(rel);
        let io_err = |source| BuildError::Io {
            path: dir.clone(),
            source,
        };
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let file_type = entry.file_type().map_err(io_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            found.push((name, file_type.is_dir()));
        }
        found.sort();

        let mut listing = Listing::default();
        for (name, is_dir) in found {
            let key = key_for(&rel.join(&name));
            if self.ignore.iter().any(|re| re.is_match(&key)) {
                debug!(file = %key, "ignored by pattern");
                continue;
            }
            if is_dir {
                listing.dirs.push(name);
            } else if is_test_file(&name, &self.config.middleware_suffix) && !self.config.allow_test_file_routes {
                debug!(file = %key, "skipping test file");
            } else if name.ends_with(&self.config.middleware_suffix) {
                listing.middleware_files.push(name);
            } else if name.ends_with(&self.config.handler_extension) {
                listing.handler_files.push(name);
            } else {
                listing.static_files.push(name);
            }
        }
        Ok(listing)
    }

    // Directories and handler files share one variable per level. A literal
    // catch-all cannot sit beside a variable either.
    fn check_variables(&self, rel: &Path, listing: &Listing) -> Result<(), BuildError> {
        let ext = &self.config.handler_extension;
        let dynamic = listing
            .dirs
            .iter()
            .map(String::as_str)
            .chain(listing.handler_files.iter().map(|f| strip_suffix(f, ext)))
            .filter_map(|name| match Segment::from_name(name) {
                Segment::Variable(var) | Segment::VariableCatchAll(var) => Some((Some(var.clone()), var)),
                Segment::LiteralCatchAll(lit) => Some((None, format!("{lit}+"))),
                Segment::Literal(_) => None,
            });

        let mut variable: Option<String> = None;
        let mut catch_all: Option<String> = None;
        for (var, label) in dynamic {
            let conflict = match var {
                Some(var) => match (&variable, &catch_all) {
                    (Some(seen), _) if *seen != var => Some(seen.clone()),
                    (_, Some(lit)) => Some(lit.clone()),
                    _ => {
                        variable = Some(var);
                        None
                    }
                },
                None => match &variable {
                    Some(seen) => Some(seen.clone()),
                    None => {
                        catch_all.get_or_insert(label.clone());
                        None
                    }
                },
            };
            if let Some(first) = conflict {
                return Err(BuildError::AmbiguousVariable {
                    dir: rel.to_path_buf(),
                    first,
                    second: label,
                });
            }
        }
        Ok(())
    }

    fn add_module_route(
        &mut self,
        rel: &Path,
        name: &str,
        prefix: &RoutePattern,
        middleware: &MiddlewareSet,
    ) -> Result<(), BuildError> {
        let source = rel.join(name);
        let key = key_for(&source);
        let modules = self.modules;
        let module = modules
            .route_module(&key)
            .ok_or_else(|| BuildError::MissingModule { file: key.clone() })?;
        let resolved = module.resolve(&key)?;

        let stem = strip_suffix(name, &self.config.handler_extension);
        let (pattern, aliases) = if stem == "index" {
            (prefix.clone(), vec![prefix.child(Segment::Literal("index".to_owned()))])
        } else {
            (prefix.child(Segment::from_name(stem)), Vec::new())
        };

        let scoped = middleware.merged(module.module_middleware());
        let methods = resolved
            .into_iter()
            .map(|(method, descriptor)| MethodRoute {
                pipeline: scoped.merged(&descriptor.middleware).pipeline_for(&method),
                handler: Arc::clone(&descriptor.handler),
                stream_request_body: descriptor
                    .stream_request_body
                    .unwrap_or(module.streams_request_body()),
                method,
            })
            .collect();

        self.used_routes.insert(key);
        self.entries.push(RouteEntry {
            pattern,
            aliases,
            source,
            kind: RouteKind::Module,
            methods,
        });
        Ok(())
    }

    fn add_static_route(&mut self, rel: &Path, name: &str, prefix: &RoutePattern, middleware: &MiddlewareSet) {
        let source = rel.join(name);
        let mime = mime_for(&source);
        let pattern = prefix.child(Segment::Literal(name.to_owned()));

        let mut aliases = Vec::new();
        if let Some(stem) = self.extensionless(name) {
            if stem == "index" {
                aliases.push(prefix.clone());
            }
            aliases.push(prefix.child(Segment::Literal(stem.to_owned())));
        }

        let file = StaticFile::new(
            self.config.route_dir.join(&source),
            mime,
            self.config.static_chunk_size,
        );
        self.entries.push(RouteEntry {
            pattern,
            aliases,
            source,
            kind: RouteKind::Static { mime },
            methods: vec![MethodRoute {
                method: Method::Get,
                handler: Arc::new(file),
                stream_request_body: true,
                pipeline: middleware.pipeline_for(&Method::Get),
            }],
        });
    }

    // The name without its extension, when that extension is configured to
    // resolve without it.
    fn extensionless<'n>(&self, name: &'n str) -> Option<&'n str> {
        self.config.resolve_without_extension.iter().find_map(|ext| {
            let ext = if ext.starts_with('.') {
                ext.clone()
            } else {
                format!(".{ext}")
            };
            name.strip_suffix(ext.as_str()).filter(|stem| !stem.is_empty())
        })
    }

    fn warn_unused(&self) {
        for key in self.modules.route_keys() {
            if !self.used_routes.contains(key) {
                warn!(file = %key, "route module registered but no such file in the route directory");
            }
        }
        for key in self.modules.middleware_keys() {
            if !self.used_middleware.contains(key) {
                warn!(file = %key, "middleware module registered but no such file in the route directory");
            }
        }
    }
}

/// `name.test.ext` files, `name.test.mw.rs` included, hold tests, not routes.
fn is_test_file(name: &str, middleware_suffix: &str) -> bool {
    name.strip_suffix(middleware_suffix)
        .or_else(|| Path::new(name).file_stem().and_then(|stem| stem.to_str()))
        .is_some_and(|stem| stem.ends_with(".test"))
}

fn strip_suffix<'n>(name: &'n str, suffix: &str) -> &'n str {
    name.strip_suffix(suffix).unwrap_or(name)
}
