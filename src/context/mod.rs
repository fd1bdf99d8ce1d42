//! Per-request state handed to middleware and handlers.
//!
//! [`RequestContext`] carries the parsed request (method, path, query, path
//! parameters, headers, body) plus a typed [`Extensions`] map middleware can
//! use to pass values down to the handler. [`ResponseContext`] lives in
//! [`response`] and owns the response state machine.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    net::SocketAddr,
};

use crate::content::{Body, ContentError};
use crate::http::{Headers, Method};
use crate::transport::BodyStream;
use crate::url::QueryMap;

pub mod response;

pub use response::{ResponseContext, ResponseState};

/// Type-erased request extensions map, used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Path parameters bound by the matched route, in pattern order.
///
/// For catch-all routes, [`rest`](Self::rest) holds the part of the path the
/// catch-all absorbed (without a leading slash).
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PathParams {
    values: Vec<(String, String)>,
    rest: Option<String>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn rest(&self) -> Option<&str> {
        self.rest.as_deref()
    }

    pub(crate) fn set_rest(&mut self, rest: String) {
        self.rest = Some(rest);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn map_values(&mut self, mut f: impl FnMut(&str) -> String) {
        for (_, value) in &mut self.values {
            *value = f(value);
        }
        if let Some(rest) = &mut self.rest {
            *rest = f(rest);
        }
    }
}

/// How the request body is held.
///
/// The mode is fixed by the handler's `stream_request_body` flag before any
/// middleware runs: buffered handlers see `Buffered` once the engine has read
/// and deserialized the body; streaming handlers take the `Stream`.
#[derive(Debug)]
pub enum RequestBody {
    /// Not read yet; the engine will buffer it before the handler runs.
    Unread(BodyStream),
    /// Read in full and deserialized by the content negotiator.
    Buffered(Body),
    /// Left for the handler to consume chunk by chunk.
    Stream(BodyStream),
    /// A streamed body the handler already took.
    Taken,
}

/// Per-request view of the incoming request.
pub struct RequestContext {
    method: Method,
    path: String,
    query: QueryMap,
    params: PathParams,
    headers: Headers,
    remote_addr: Option<SocketAddr>,
    route: String,
    body: RequestBody,
    extensions: Extensions,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>, headers: Headers, body: RequestBody) -> Self {
        Self {
            method,
            path: path.into(),
            query: QueryMap::new(),
            params: PathParams::new(),
            headers,
            remote_addr: None,
            route: String::new(),
            body,
            extensions: Extensions::new(),
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: QueryMap) -> Self {
        self.query = query;
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: PathParams) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path as received (not percent-decoded).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The pattern of the route that matched, e.g. `/strains/$name/info`.
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn query(&self) -> &QueryMap {
        &self.query
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// Shorthand for `params().get(name)`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The deserialized body, for handlers that buffer their body.
    pub fn body(&self) -> Option<&Body> {
        match &self.body {
            RequestBody::Buffered(body) => Some(body),
            _ => None,
        }
    }

    /// Takes the body stream, for handlers declared with `stream_request_body`.
    ///
    /// Returns `None` for buffered handlers or when already taken.
    pub fn take_body_stream(&mut self) -> Option<BodyStream> {
        match std::mem::replace(&mut self.body, RequestBody::Taken) {
            RequestBody::Stream(stream) => Some(stream),
            other => {
                self.body = other;
                None
            }
        }
    }

    /// Deserializes the buffered body into `T`.
    pub fn json<T>(&self) -> Result<T, ContentError>
    where
        T: serde::de::DeserializeOwned,
    {
        match self.body() {
            Some(body) => body.json(),
            None => Body::Empty.json(),
        }
    }

    pub(crate) fn take_unread_body(&mut self) -> Option<BodyStream> {
        match std::mem::replace(&mut self.body, RequestBody::Taken) {
            RequestBody::Unread(stream) => Some(stream),
            other => {
                self.body = other;
                None
            }
        }
    }

    pub(crate) fn set_body(&mut self, body: RequestBody) {
        self.body = body;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn extensions_are_keyed_by_type() {
        #[derive(Debug, PartialEq)]
        struct UserId(u64);

        let mut ext = Extensions::new();
        assert!(ext.insert(UserId(7)).is_none());
        ext.insert("tenant");
        assert_eq!(ext.get::<UserId>(), Some(&UserId(7)));
        assert_eq!(ext.insert(UserId(8)), Some(UserId(7)));
        assert_eq!(ext.remove::<&str>(), Some("tenant"));
        assert!(ext.get::<&str>().is_none());
    }

    #[test]
    fn params_keep_pattern_order() {
        let mut params = PathParams::new();
        params.insert("org", "acme");
        params.insert("repo", "tools");
        let names: Vec<_> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(names, ["org", "repo"]);
        assert_eq!(params.get("repo"), Some("tools"));
    }

    #[test]
    fn buffered_body_deserializes() {
        #[derive(Deserialize)]
        struct Strain {
            name: String,
        }

        let req = RequestContext::new(
            Method::Post,
            "/strains",
            Headers::new(),
            RequestBody::Buffered(Body::Json(json!({"name": "gorillaGlue"}))),
        );
        let strain: Strain = req.json().unwrap();
        assert_eq!(strain.name, "gorillaGlue");
        let mut req = req;
        assert!(req.take_body_stream().is_none());
        assert!(req.body().is_some());
    }

    #[test]
    fn stream_can_be_taken_once() {
        let mut req = RequestContext::new(
            Method::Put,
            "/upload",
            Headers::new(),
            RequestBody::Stream(BodyStream::empty()),
        );
        assert!(req.body().is_none());
        assert!(req.take_body_stream().is_some());
        assert!(req.take_body_stream().is_none());
    }
}
