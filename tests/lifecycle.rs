//! End-to-end request handling over route directories built in temp dirs.

use std::path::Path;
use std::sync::{Arc, Mutex};

use fsrouter::app::{App, Reply};
use fsrouter::config::RouterConfig;
use fsrouter::content::{Body, ContentError, ContentHandler};
use fsrouter::error::{CorrelationId, HandlerError};
use fsrouter::http::{Method, RequestHead, StatusCode};
use fsrouter::middleware::{MiddlewareHandler, MiddlewareSet, error_fn, from_fn};
use fsrouter::router::{HandlerDescriptor, HandlerFn, ModuleRegistry, RouteModule, handler_fn};
use fsrouter::transport::{AbortSignal, BodyStream, MemorySink, SinkEvent};
use bytes::Bytes;
use serde_json::{Value, json};

fn touch(root: &Path, rel: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, "").unwrap();
}

async fn dispatch(app: &App, head: RequestHead, body: &'static [u8]) -> MemorySink {
    let sink = MemorySink::new();
    app.dispatch(
        head,
        BodyStream::from_bytes(body),
        Box::new(sink.clone()),
        AbortSignal::new(),
    )
    .await;
    sink
}

async fn get(app: &App, target: &str) -> MemorySink {
    dispatch(app, RequestHead::new(Method::Get, target), b"").await
}

fn status_of(sink: &MemorySink) -> StatusCode {
    sink.head().expect("response head").status
}

fn param_echo(name: &'static str) -> RouteModule {
    RouteModule::new().handler(
        "GET",
        handler_fn(move |req, _res| {
            let value = req.param(name).unwrap_or_default().to_owned();
            Box::pin(async move { Ok(json!({ name: value }).into()) })
        }),
    )
}

#[tokio::test]
async fn variable_directory_binds_a_single_segment() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "strains/$name/info.rs");
    let modules = ModuleRegistry::new().route("strains/$name/info.rs", param_echo("name"));
    let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();

    let sink = get(&app, "/strains/gorillaGlue/info").await;
    assert_eq!(status_of(&sink), StatusCode::OK);
    let body: Value = serde_json::from_slice(&sink.body()).unwrap();
    assert_eq!(body, json!({ "name": "gorillaGlue" }));

    assert_eq!(status_of(&get(&app, "/strains/x/y/info").await), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn catch_all_covers_the_subtree_but_not_siblings() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "strains+.rs");
    let modules = ModuleRegistry::new().route(
        "strains+.rs",
        RouteModule::new().handler("GET", handler_fn(|_req, _res| Box::pin(async { Ok("catch".into()) }))),
    );
    let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();

    for target in ["/strains", "/strains/a", "/strains/a/b/c"] {
        let sink = get(&app, target).await;
        assert_eq!(status_of(&sink), StatusCode::OK, "{target}");
        assert_eq!(&sink.body()[..], b"catch");
    }
    assert_eq!(status_of(&get(&app, "/strainsX").await), StatusCode::NOT_FOUND);
}

#[derive(Default)]
struct Trail(Vec<&'static str>);

fn mark(label: &'static str) -> MiddlewareHandler {
    from_fn(move |req, _res| {
        if req.extensions().get::<Trail>().is_none() {
            req.extensions_mut().insert(Trail::default());
        }
        if let Some(trail) = req.extensions_mut().get_mut::<Trail>() {
            trail.0.push(label);
        }
        Box::pin(async { Ok(()) })
    })
}

fn trail_reply() -> HandlerFn {
    handler_fn(|req, _res| {
        let trail = req
            .extensions()
            .get::<Trail>()
            .map(|trail| trail.0.join(">"))
            .unwrap_or_default();
        Box::pin(async move { Ok(trail.into()) })
    })
}

#[tokio::test]
async fn middleware_runs_from_app_to_handler() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "api/scope.mw.rs");
    touch(dir.path(), "api/items.rs");
    let handler = trail_reply();
    let modules = ModuleRegistry::new()
        .middleware("api/scope.mw.rs", MiddlewareSet::new().with(mark("dir")))
        .route(
            "api/items.rs",
            RouteModule::new()
                .middleware(MiddlewareSet::new().with(mark("route")))
                .handler(
                    "GET",
                    HandlerDescriptor::new(handler).middleware(MiddlewareSet::new().with(mark("handler"))),
                ),
        );
    let config = RouterConfig::new(dir.path()).middleware(MiddlewareSet::new().with(mark("app")));
    let app = App::build(config, &modules).unwrap();

    let sink = get(&app, "/api/items").await;
    assert_eq!(&sink.body()[..], b"app>dir>route>handler");
}

#[tokio::test]
async fn nested_directory_middleware_runs_outer_first() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "api/outer.mw.rs");
    touch(dir.path(), "api/v1/inner.mw.rs");
    touch(dir.path(), "api/v1/items.rs");
    let modules = ModuleRegistry::new()
        .middleware("api/outer.mw.rs", MiddlewareSet::new().with(mark("outer")))
        .middleware("api/v1/inner.mw.rs", MiddlewareSet::new().with(mark("inner")))
        .route(
            "api/v1/items.rs",
            RouteModule::new()
                .middleware(MiddlewareSet::new().with(mark("route")))
                .handler("GET", trail_reply()),
        );
    let config = RouterConfig::new(dir.path()).middleware(MiddlewareSet::new().with(mark("app")));
    let app = App::build(config, &modules).unwrap();

    let sink = get(&app, "/api/v1/items").await;
    assert_eq!(&sink.body()[..], b"app>outer>inner>route");
}

#[tokio::test]
async fn failing_middleware_skips_the_rest_and_surfaces_through_the_error_chain() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "guarded.rs");
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let step = |name: &'static str, fail: bool| {
        let log = Arc::clone(&log);
        from_fn(move |_req, _res| {
            log.lock().unwrap().push(name.to_owned());
            Box::pin(async move {
                if fail {
                    Err(HandlerError::new(StatusCode::FORBIDDEN, "denied"))
                } else {
                    Ok(())
                }
            })
        })
    };
    let observe = |name: &'static str| {
        let log = Arc::clone(&log);
        error_fn(move |err, _req, _res| {
            log.lock().unwrap().push(format!("{name}:{}", err.message()));
            Box::pin(async { Ok(()) })
        })
    };
    let handler_log = Arc::clone(&log);
    let modules = ModuleRegistry::new().route(
        "guarded.rs",
        RouteModule::new()
            .middleware(
                MiddlewareSet::new()
                    .with(step("m1", false))
                    .with(step("m2", true))
                    .with(step("m3", false))
                    .with_error(observe("e1"))
                    .with_error(observe("e2")),
            )
            .handler(
                "GET",
                handler_fn(move |_req, _res| {
                    handler_log.lock().unwrap().push("handler".to_owned());
                    Box::pin(async { Ok(Reply::empty()) })
                }),
            ),
    );
    let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();

    let sink = get(&app, "/guarded").await;
    assert_eq!(*log.lock().unwrap(), ["m1", "m2", "e1:denied", "e2:denied"]);
    let head = sink.head().unwrap();
    assert_eq!(head.status, StatusCode::FORBIDDEN);
    assert!(head.headers.contains(CorrelationId::HEADER));
    assert_eq!(&sink.body()[..], b"denied");
}

fn echo_body() -> RouteModule {
    RouteModule::new().handler(
        "POST",
        handler_fn(|req, _res| {
            let body = req.body().cloned().unwrap_or_default();
            Box::pin(async move { Ok(Reply::new(body)) })
        }),
    )
}

#[tokio::test]
async fn json_bodies_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "echo.rs");
    let modules = ModuleRegistry::new().route("echo.rs", echo_body());
    let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();

    let sent = json!({ "strain": "gorillaGlue", "thc": 26.5, "tags": ["hybrid", "earthy"] });
    let raw = serde_json::to_vec(&sent).unwrap();
    let sink = MemorySink::new();
    app.dispatch(
        RequestHead::new(Method::Post, "/echo").header("Content-Type", "application/json"),
        BodyStream::from_bytes(raw),
        Box::new(sink.clone()),
        AbortSignal::new(),
    )
    .await;

    assert_eq!(status_of(&sink), StatusCode::OK);
    let received: Value = serde_json::from_slice(&sink.body()).unwrap();
    assert_eq!(received, sent);
}

#[tokio::test]
async fn malformed_body_is_a_400_that_skips_the_error_chain() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "echo.rs");
    let modules = ModuleRegistry::new().route(
        "echo.rs",
        echo_body().middleware(MiddlewareSet::new().with_error(error_fn(|_err, _req, res| {
            Box::pin(async move {
                res.set_header("X-Error-Chain", "ran")?;
                Ok(())
            })
        }))),
    );
    let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();

    let sink = dispatch(
        &app,
        RequestHead::new(Method::Post, "/echo").header("Content-Type", "application/json"),
        b"{not json",
    )
    .await;
    let head = sink.head().unwrap();
    assert_eq!(head.status, StatusCode::BAD_REQUEST);
    assert!(head.headers.contains(CorrelationId::HEADER));
    assert!(!head.headers.contains("x-error-chain"));
}

#[tokio::test]
async fn error_transformer_rewrites_unhandled_errors() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "flaky.rs");
    let modules = ModuleRegistry::new().route(
        "flaky.rs",
        RouteModule::new().handler(
            "GET",
            handler_fn(|_req, _res| Box::pin(async { Err(HandlerError::msg("database down")) })),
        ),
    );
    let config = RouterConfig::new(dir.path()).error_transformer(|err, id| {
        HandlerError::new(StatusCode::SERVICE_UNAVAILABLE, format!("try later ({id})"))
            .with_body(json!({ "error": err.message(), "id": id.to_string() }))
    });
    let app = App::build(config, &modules).unwrap();

    let sink = get(&app, "/flaky").await;
    let head = sink.head().unwrap();
    assert_eq!(head.status, StatusCode::SERVICE_UNAVAILABLE);
    let id = head.headers.get(CorrelationId::HEADER).unwrap().to_owned();
    let body: Value = serde_json::from_slice(&sink.body()).unwrap();
    assert_eq!(body, json!({ "error": "database down", "id": id }));
}

#[tokio::test]
async fn panicking_error_transformer_keeps_the_original_error() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "flaky.rs");
    let modules = ModuleRegistry::new().route(
        "flaky.rs",
        RouteModule::new().handler(
            "GET",
            handler_fn(|_req, _res| Box::pin(async { Err(HandlerError::msg("database down")) })),
        ),
    );
    let config = RouterConfig::new(dir.path()).error_transformer(|_err, _id| panic!("boom"));
    let app = App::build(config, &modules).unwrap();

    let sink = get(&app, "/flaky").await;
    let head = sink.head().unwrap();
    assert_eq!(head.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(head.headers.contains(CorrelationId::HEADER));
    assert_eq!(&sink.body()[..], b"database down");
    assert_eq!(sink.events().last(), Some(&SinkEvent::Finish));
}

struct Volatile;

impl ContentHandler for Volatile {
    fn serialize(&self, _value: &Value) -> Result<Bytes, ContentError> {
        panic!("cannot serialize")
    }

    fn deserialize(&self, _raw: &[u8]) -> Result<Body, ContentError> {
        panic!("cannot deserialize")
    }
}

#[tokio::test]
async fn panicking_content_handlers_become_error_responses() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "volatile.rs");
    let modules = ModuleRegistry::new().route(
        "volatile.rs",
        RouteModule::new()
            .handler(
                "GET",
                handler_fn(|_req, _res| {
                    Box::pin(async {
                        Ok(Reply::new(json!({ "strain": "gorillaGlue" }))
                            .header("Content-Type", "application/x-volatile"))
                    })
                }),
            )
            .handler("POST", handler_fn(|_req, _res| Box::pin(async { Ok(Reply::empty()) }))),
    );
    let config = RouterConfig::new(dir.path()).content_handler("application/x-volatile", Arc::new(Volatile));
    let app = App::build(config, &modules).unwrap();

    let sink = dispatch(
        &app,
        RequestHead::new(Method::Post, "/volatile").header("Content-Type", "application/x-volatile"),
        b"payload",
    )
    .await;
    assert_eq!(status_of(&sink), StatusCode::BAD_REQUEST);

    let sink = get(&app, "/volatile").await;
    let head = sink.head().unwrap();
    assert_eq!(head.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(head.headers.contains(CorrelationId::HEADER));
}

async fn explode() -> Result<Reply, HandlerError> {
    panic!("kaboom")
}

#[tokio::test]
async fn unhandled_errors_and_panics_become_500s() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "boom.rs");
    let modules = ModuleRegistry::new().route(
        "boom.rs",
        RouteModule::new()
            .handler("GET", handler_fn(|_req, _res| Box::pin(async { Err(HandlerError::msg("exploded")) })))
            .handler("POST", handler_fn(|_req, _res| Box::pin(explode()))),
    );
    let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();

    let sink = get(&app, "/boom").await;
    assert_eq!(status_of(&sink), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(&sink.body()[..], b"exploded");

    let sink = dispatch(&app, RequestHead::new(Method::Post, "/boom"), b"").await;
    let head = sink.head().unwrap();
    assert_eq!(head.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(head.headers.contains(CorrelationId::HEADER));
}

#[tokio::test]
async fn streaming_handler_writes_one_head_three_chunks_one_finish() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "feed.rs");
    let modules = ModuleRegistry::new().route(
        "feed.rs",
        RouteModule::new().handler(
            "GET",
            handler_fn(|_req, res| {
                Box::pin(async move {
                    res.start_streaming();
                    for part in ["one ", "two ", "three"] {
                        res.write(part).await;
                    }
                    res.end().await;
                    Ok(Reply::empty())
                })
            }),
        ),
    );
    let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();

    let sink = get(&app, "/feed").await;
    let events = sink.events();
    assert_eq!(events.iter().filter(|e| matches!(e, SinkEvent::Head(_))).count(), 1);
    assert_eq!(sink.chunk_count(), 3);
    assert_eq!(events.iter().filter(|e| matches!(e, SinkEvent::Finish)).count(), 1);
    assert_eq!(events.last(), Some(&SinkEvent::Finish));
    assert_eq!(&sink.body()[..], b"one two three");
}

#[tokio::test]
async fn completing_twice_keeps_the_first_response() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "twice.rs");
    let modules = ModuleRegistry::new().route(
        "twice.rs",
        RouteModule::new().handler(
            "GET",
            handler_fn(|_req, res| {
                Box::pin(async move {
                    res.send("first").await;
                    res.end().await;
                    Ok("second".into())
                })
            }),
        ),
    );
    let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();

    let sink = get(&app, "/twice").await;
    assert_eq!(&sink.body()[..], b"first");
    assert_eq!(sink.events().iter().filter(|e| matches!(e, SinkEvent::Finish)).count(), 1);
}

#[tokio::test]
async fn streamed_request_bodies_reach_the_handler_raw() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "upload.rs");
    let handler = handler_fn(|req, _res| {
        let stream = req.take_body_stream();
        Box::pin(async move {
            let Some(stream) = stream else {
                return Err(HandlerError::msg("no body stream"));
            };
            let raw = stream.collect().await?;
            Ok(format!("{} bytes", raw.len()).into())
        })
    });
    let modules = ModuleRegistry::new().route(
        "upload.rs",
        RouteModule::new().handler("PUT", HandlerDescriptor::new(handler).stream_request_body(true)),
    );
    let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();

    let sink = dispatch(
        &app,
        RequestHead::new(Method::Put, "/upload").header("Content-Type", "application/json"),
        b"{not json either",
    )
    .await;
    assert_eq!(status_of(&sink), StatusCode::OK);
    assert_eq!(&sink.body()[..], b"16 bytes");
}

#[tokio::test]
async fn parameters_are_decoded_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "$name.rs");
    let modules = ModuleRegistry::new().route(
        "$name.rs",
        RouteModule::new().handler(
            "GET",
            handler_fn(|req, _res| {
                let name = req.param("name").unwrap_or_default().to_owned();
                let q = req.query().get("q").unwrap_or_default().to_owned();
                Box::pin(async move { Ok(format!("{name}|{q}").into()) })
            }),
        ),
    );

    let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();
    let sink = get(&app, "/caf%C3%A9?q=a%20b").await;
    assert_eq!(&sink.body()[..], "caf%C3%A9|a%20b".as_bytes());

    let config = RouterConfig::new(dir.path())
        .decode_path_parameters(true)
        .decode_query_parameters(true);
    let app = App::build(config, &modules).unwrap();
    let sink = get(&app, "/caf%C3%A9?q=a%20b").await;
    assert_eq!(&sink.body()[..], "café|a b".as_bytes());
}

#[tokio::test]
async fn aborted_connections_get_no_further_writes() {
    let dir = tempfile::tempdir().unwrap();
    touch(dir.path(), "slow.rs");
    let modules = ModuleRegistry::new().route(
        "slow.rs",
        RouteModule::new().handler(
            "GET",
            handler_fn(|_req, res| {
                Box::pin(async move {
                    res.write("partial").await;
                    res.write("more").await;
                    Ok(Reply::new(Body::Empty))
                })
            }),
        ),
    );
    let app = App::build(RouterConfig::new(dir.path()), &modules).unwrap();

    let sink = MemorySink::new();
    sink.break_pipe();
    app.dispatch(
        RequestHead::new(Method::Get, "/slow"),
        BodyStream::empty(),
        Box::new(sink.clone()),
        AbortSignal::new(),
    )
    .await;
    assert!(sink.events().is_empty());
}
