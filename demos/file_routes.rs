//! Serves `demos/www` with a handful of registered route modules.
//!
//! ```text
//! cargo run --example file_routes
//! curl localhost:8080/strains/gorillaGlue/info
//! curl -X POST -H 'content-type: application/json' -d '{"name":"sourDiesel"}' localhost:8080/strains
//! curl -H 'accept: application/x-www-form-urlencoded' localhost:8080/strains
//! ```
//!
//! Set `RUST_LOG=fsrouter=debug` to see the route table being built.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use fsrouter::middleware::{MiddlewareSet, error_fn, from_fn};
use fsrouter::router::{ModuleRegistry, RouteModule, handler_fn};
use fsrouter::{App, HandlerError, Reply, RouterConfig, Server, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Strains = Arc<RwLock<Vec<String>>>;

#[derive(Deserialize)]
struct NewStrain {
    name: String,
}

struct Started(Instant);

fn modules(strains: Strains) -> ModuleRegistry {
    let listed = Arc::clone(&strains);
    let index = RouteModule::new()
        .handler(
            "GET",
            handler_fn(move |_req, _res| {
                let names = listed.read().map(|names| names.clone()).unwrap_or_default();
                Box::pin(async move { Ok(json!({ "strains": names }).into()) })
            }),
        )
        .handler(
            "POST",
            handler_fn(move |req, _res| {
                let created = req.json::<NewStrain>().map(|strain| {
                    if let Ok(mut names) = strains.write() {
                        names.push(strain.name.clone());
                    }
                    strain.name
                });
                Box::pin(async move {
                    let name = created.map_err(|e| HandlerError::bad_request(e.to_string()))?;
                    Ok(Reply::new(json!({ "created": name }))
                        .status(StatusCode::CREATED)
                        .header("Location", format!("/strains/{name}/info")))
                })
            }),
        );

    let info = RouteModule::new().handler(
        "GET",
        handler_fn(|req, _res| {
            let name = req.param("name").unwrap_or_default().to_owned();
            Box::pin(async move {
                if name.eq_ignore_ascii_case("unknown") {
                    return Err(HandlerError::not_found(format!("no strain called {name}")));
                }
                Ok(json!({ "strain": name, "type": "hybrid" }).into())
            })
        }),
    );

    let timing = MiddlewareSet::new()
        .with(from_fn(|req, _res| {
            req.extensions_mut().insert(Started(Instant::now()));
            Box::pin(async { Ok(()) })
        }))
        .with_error(error_fn(|err, req, _res| {
            if let Some(Started(at)) = req.extensions().get::<Started>() {
                info!(path = %req.path(), error = %err, elapsed_us = at.elapsed().as_micros() as u64, "strain request failed");
            }
            Box::pin(async { Ok(()) })
        }));

    ModuleRegistry::new()
        .route("strains/index.rs", index)
        .route("strains/$name/info.rs", info)
        .middleware("strains/timing.mw.rs", timing)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "file_routes=info,fsrouter=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let powered_by = MiddlewareSet::new().with(from_fn(|_req, res| {
        Box::pin(async move {
            res.set_header("X-Powered-By", "fsrouter")?;
            Ok(())
        })
    }));

    let config = RouterConfig::new(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/www"))
        .resolve_without_extension(".html")
        .not_found_route("/404")
        .decode_path_parameters(true)
        .middleware(powered_by);

    let strains: Strains = Arc::new(RwLock::new(vec!["gorillaGlue".to_owned()]));
    let app = App::build(config, &modules(strains))?;
    for entry in app.routes().entries() {
        info!(pattern = %entry.pattern(), methods = %entry.allow_header(), "route");
    }

    let addr = std::env::var("FSROUTER_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_owned());
    let server = Server::bind(&addr).await?;
    server.run(Arc::new(app)).await?;
    Ok(())
}
