//! The route table.
//!
//! Routes are declared on a [`RouterBuilder`], optionally inside nested [`Group`]s, and checked
//! once by [`RouterBuilder::build`]. The built [`Router`] is immutable apart from per-route enable
//! flags and a revision counter bumped on every mutation.

mod pattern;

pub use pattern::{Param, ParamKind, PatternError, RoutePattern};

use crate::handler::{HandlerContract, RequestHandler};
use crate::middleware::Middleware;
use crate::openapi::{Schema, SchemaRegistry, SecurityRequirement, ToSchema};
use crate::tag::{Source, TagError};
use http::Method;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

type InnerRouter<T> = matchit::Router<T>;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("route {method} {pattern} is registered twice")]
    Duplicate { method: Method, pattern: String },

    #[error("route {pattern} conflicts with another route: {reason}")]
    Conflict { pattern: String, reason: String },

    #[error("route {method} {pattern}: {source}")]
    Input {
        method: Method,
        pattern: String,
        #[source]
        source: TagError,
    },

    #[error("route {method} {pattern}: path-only input field `{field}` is not bound from the path")]
    NotPathOnly { method: Method, pattern: String, field: String },

    #[error("route {method} {pattern}: input field `{field}` reads path parameter `{param}` the pattern does not declare")]
    UnknownPathParam { method: Method, pattern: String, field: String, param: String },

    #[error("no route {method} {pattern}")]
    UnknownRoute { method: Method, pattern: String },
}

/// An extra documented response.
#[derive(Debug, Clone)]
pub struct ResponseDoc {
    pub status: u16,
    pub description: String,
    pub schema: Option<fn(&mut SchemaRegistry) -> Schema>,
}

/// Documentation metadata of one route.
#[derive(Debug, Clone, Default)]
pub struct RouteDoc {
    pub operation_id: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub deprecated: bool,
    pub hidden: bool,
    pub responses: Vec<ResponseDoc>,
    pub security: Vec<SecurityRequirement>,
}

/// A registered route.
pub struct Route {
    method: Method,
    pattern: RoutePattern,
    pattern_str: Arc<str>,
    handler: Box<dyn RequestHandler>,
    chain: Vec<Arc<dyn Middleware>>,
    doc: RouteDoc,
    enabled: AtomicBool,
}

impl Route {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The fully qualified pattern, group prefixes included.
    pub fn pattern(&self) -> &RoutePattern {
        &self.pattern
    }

    pub(crate) fn pattern_arc(&self) -> Arc<str> {
        self.pattern_str.clone()
    }

    pub fn doc(&self) -> &RouteDoc {
        &self.doc
    }

    pub fn contract(&self) -> HandlerContract {
        self.handler.contract()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn handler(&self) -> &dyn RequestHandler {
        self.handler.as_ref()
    }

    pub(crate) fn chain(&self) -> &[Arc<dyn Middleware>] {
        &self.chain
    }
}

/// Outcome of a route lookup.
pub enum RouteMatch<'r> {
    Found { route: &'r Route, params: Vec<(String, String)> },
    MethodNotAllowed { allowed: Vec<Method> },
    NotFound,
}

pub struct Router {
    inner_router: InnerRouter<Vec<usize>>,
    routes: Vec<Route>,
    revision: AtomicU64,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Looks up `path` for `method`. Disabled routes are invisible; a `HEAD` request falls back to
    /// the `GET` route.
    pub fn at(&self, method: &Method, path: &str) -> RouteMatch<'_> {
        let Ok(matched) = self.inner_router.at(path) else {
            return RouteMatch::NotFound;
        };
        let params: Vec<(String, String)> =
            matched.params.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();

        let candidates: Vec<&Route> = matched
            .value
            .iter()
            .map(|&i| &self.routes[i])
            .filter(|route| route.is_enabled() && route.pattern.accepts(&params))
            .collect();
        if candidates.is_empty() {
            return RouteMatch::NotFound;
        }

        let found = candidates
            .iter()
            .find(|route| route.method == method)
            .or_else(|| if *method == Method::HEAD { candidates.iter().find(|r| r.method == Method::GET) } else { None });
        match found {
            Some(route) => RouteMatch::Found { route: *route, params },
            None => RouteMatch::MethodNotAllowed { allowed: candidates.iter().map(|r| r.method.clone()).collect() },
        }
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Monotonic counter of route table mutations.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Hides a route from lookups; it keeps answering 404 until re-enabled.
    pub fn disable(&self, method: Method, pattern: &str) -> Result<(), RouteError> {
        self.set_enabled(method, pattern, false)
    }

    pub fn enable(&self, method: Method, pattern: &str) -> Result<(), RouteError> {
        self.set_enabled(method, pattern, true)
    }

    fn set_enabled(&self, method: Method, pattern: &str, enabled: bool) -> Result<(), RouteError> {
        let route = self
            .routes
            .iter()
            .find(|r| r.method == method && (r.pattern.as_str() == pattern || r.pattern.openapi_path() == pattern))
            .ok_or_else(|| RouteError::UnknownRoute { method: method.clone(), pattern: pattern.to_owned() })?;
        if route.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            self.revision.fetch_add(1, Ordering::AcqRel);
            debug!(method = %method, pattern, enabled, "route toggled");
        }
        Ok(())
    }
}

/// A route under construction: method, handler, middleware and documentation.
pub struct RouteItem {
    method: Method,
    handler: Box<dyn RequestHandler>,
    middleware: Vec<Arc<dyn Middleware>>,
    doc: RouteDoc,
}

macro_rules! method_router_item {
    ($method:ident, $method_const:ident) => {
        pub fn $method<H: RequestHandler>(handler: H) -> RouteItem {
            RouteItem::new(Method::$method_const, handler)
        }
    };
}

method_router_item!(get, GET);
method_router_item!(post, POST);
method_router_item!(put, PUT);
method_router_item!(delete, DELETE);
method_router_item!(head, HEAD);
method_router_item!(options, OPTIONS);
method_router_item!(patch, PATCH);
method_router_item!(trace, TRACE);

impl RouteItem {
    pub fn new<H: RequestHandler>(method: Method, handler: H) -> Self {
        Self { method, handler: Box::new(handler), middleware: Vec::new(), doc: RouteDoc::default() }
    }

    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn operation_id(mut self, id: impl Into<String>) -> Self {
        self.doc.operation_id = Some(id.into());
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.doc.summary = Some(summary.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.doc.description = Some(description.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.doc.tags.push(tag.into());
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.doc.deprecated = true;
        self
    }

    /// Keeps the route out of the OpenAPI document.
    pub fn hidden(mut self) -> Self {
        self.doc.hidden = true;
        self
    }

    pub fn security(mut self, scheme: impl Into<String>, scopes: &[&str]) -> Self {
        self.doc.security.push(requirement(scheme, scopes));
        self
    }

    pub fn response(mut self, status: u16, description: impl Into<String>) -> Self {
        self.doc.responses.push(ResponseDoc { status, description: description.into(), schema: None });
        self
    }

    /// Documents an extra response whose body is a `T`.
    pub fn response_with<T: ToSchema>(mut self, status: u16, description: impl Into<String>) -> Self {
        self.doc.responses.push(ResponseDoc {
            status,
            description: description.into(),
            schema: Some(SchemaRegistry::resolve::<T>),
        });
        self
    }
}

fn requirement(scheme: impl Into<String>, scopes: &[&str]) -> SecurityRequirement {
    SecurityRequirement::from([(scheme.into(), scopes.iter().map(|s| (*s).to_owned()).collect())])
}

/// A prefix with shared tags, middleware and security for the routes and groups it contains.
pub struct Group {
    prefix: String,
    tags: Vec<String>,
    middleware: Vec<Arc<dyn Middleware>>,
    security: Vec<SecurityRequirement>,
    routes: Vec<(String, RouteItem)>,
    groups: Vec<Group>,
}

impl Group {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            tags: Vec::new(),
            middleware: Vec::new(),
            security: Vec::new(),
            routes: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn security(mut self, scheme: impl Into<String>, scopes: &[&str]) -> Self {
        self.security.push(requirement(scheme, scopes));
        self
    }

    pub fn route(mut self, path: impl Into<String>, item: RouteItem) -> Self {
        self.routes.push((path.into(), item));
        self
    }

    pub fn routes(mut self, path: impl Into<String>, items: impl IntoIterator<Item = RouteItem>) -> Self {
        let path = path.into();
        self.routes.extend(items.into_iter().map(|item| (path.clone(), item)));
        self
    }

    pub fn group(mut self, group: Group) -> Self {
        self.groups.push(group);
        self
    }
}

/// Inherited group settings while flattening.
#[derive(Clone, Default)]
struct Scope {
    prefix: String,
    tags: Vec<String>,
    middleware: Vec<Arc<dyn Middleware>>,
    security: Vec<SecurityRequirement>,
}

impl Scope {
    fn enter(&self, group: &Group) -> Scope {
        let mut scope = self.clone();
        scope.prefix = pattern::join(&self.prefix, &group.prefix);
        scope.tags.extend(group.tags.iter().cloned());
        scope.middleware.extend(group.middleware.iter().cloned());
        scope.security.extend(group.security.iter().cloned());
        scope
    }
}

struct PendingRoute {
    path: String,
    item: RouteItem,
    scope: Scope,
}

pub struct RouterBuilder {
    middleware: Vec<Arc<dyn Middleware>>,
    routes: Vec<(String, RouteItem)>,
    groups: Vec<Group>,
}

impl RouterBuilder {
    fn new() -> Self {
        Self { middleware: Vec::new(), routes: Vec::new(), groups: Vec::new() }
    }

    /// Adds middleware that runs first on every route.
    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn route(mut self, path: impl Into<String>, item: RouteItem) -> Self {
        self.routes.push((path.into(), item));
        self
    }

    pub fn routes(mut self, path: impl Into<String>, items: impl IntoIterator<Item = RouteItem>) -> Self {
        let path = path.into();
        self.routes.extend(items.into_iter().map(|item| (path.clone(), item)));
        self
    }

    pub fn group(mut self, group: Group) -> Self {
        self.groups.push(group);
        self
    }

    /// Checks and freezes the route table.
    pub fn build(self) -> Result<Router, RouteError> {
        let root = Scope::default();
        let mut pending: Vec<PendingRoute> = self
            .routes
            .into_iter()
            .map(|(path, item)| PendingRoute { path, item, scope: root.clone() })
            .collect();
        for group in self.groups {
            flatten(group, &root, &mut pending);
        }

        let mut inner_router: InnerRouter<Vec<usize>> = InnerRouter::new();
        let mut slots: HashMap<String, Vec<usize>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut routes: Vec<Route> = Vec::with_capacity(pending.len());

        for PendingRoute { path, item, scope } in pending {
            let full = pattern::join(&scope.prefix, &path);
            let pattern = RoutePattern::parse(&full)?;
            if routes.iter().any(|r| r.method == item.method && r.pattern.matcher() == pattern.matcher()) {
                return Err(RouteError::Duplicate { method: item.method, pattern: full });
            }
            check_contract(&item.method, &pattern, item.handler.contract())?;

            let mut chain = self.middleware.clone();
            chain.extend(scope.middleware.iter().cloned());
            chain.extend(item.middleware);

            let mut doc = item.doc;
            let mut tags = scope.tags.clone();
            tags.extend(doc.tags);
            doc.tags = dedup(tags);
            let mut security = scope.security.clone();
            security.extend(doc.security);
            doc.security = security;

            let matcher = pattern.matcher().to_owned();
            match slots.get_mut(&matcher) {
                Some(slot) => slot.push(routes.len()),
                None => {
                    slots.insert(matcher.clone(), vec![routes.len()]);
                    order.push(matcher);
                }
            }
            debug!(method = %item.method, pattern = %full, middleware = chain.len(), "route registered");
            routes.push(Route {
                method: item.method,
                pattern_str: Arc::from(pattern.as_str()),
                pattern,
                handler: item.handler,
                chain,
                doc,
                enabled: AtomicBool::new(true),
            });
        }

        for matcher in order {
            let indices = slots.remove(&matcher).unwrap_or_default();
            inner_router
                .insert(matcher.clone(), indices)
                .map_err(|e| RouteError::Conflict { pattern: matcher, reason: e.to_string() })?;
        }

        Ok(Router { inner_router, routes, revision: AtomicU64::new(0) })
    }
}

fn flatten(group: Group, parent: &Scope, out: &mut Vec<PendingRoute>) {
    let scope = parent.enter(&group);
    for (path, item) in group.routes {
        out.push(PendingRoute { path, item, scope: scope.clone() });
    }
    for child in group.groups {
        flatten(child, &scope, out);
    }
}

fn dedup(values: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(values.len());
    for value in values {
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}

/// Validates the handler's input record against the pattern.
fn check_contract(method: &Method, pattern: &RoutePattern, contract: HandlerContract) -> Result<(), RouteError> {
    let Some(input) = contract.input else {
        return Ok(());
    };
    let plan = input().map_err(|source| RouteError::Input {
        method: method.clone(),
        pattern: pattern.as_str().to_owned(),
        source,
    })?;

    for field in plan.fields() {
        let path_name = field.tags.source_name(Source::Path);
        if contract.path_only && (path_name.is_none() || field.tags.sources().len() != 1) {
            return Err(RouteError::NotPathOnly {
                method: method.clone(),
                pattern: pattern.as_str().to_owned(),
                field: field.ident.to_owned(),
            });
        }
        if let Some(param) = path_name
            && !pattern.has_param(param)
        {
            return Err(RouteError::UnknownPathParam {
                method: method.clone(),
                pattern: pattern.as_str().to_owned(),
                field: field.ident.to_owned(),
                param: param.to_owned(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::error::WebError;
    use crate::handler::{handler_fn, handler_in, handler_path};
    use crate::middleware::{Next, middleware_fn};
    use crate::{Bind, body::RequestBody};
    use http::{Request, StatusCode};

    async fn ok(ctx: &mut Context) -> Result<(), WebError> {
        ctx.text(StatusCode::OK, "ok")
    }

    #[derive(Debug, Default, Bind)]
    struct ItemId {
        #[bind(path = "id")]
        id: i64,
    }

    #[derive(Debug, Default, Bind)]
    struct ItemQuery {
        #[bind(path = "id")]
        id: i64,
        #[bind(query = "verbose")]
        verbose: bool,
    }

    #[derive(Debug, Default, Bind)]
    struct Broken {
        #[bind(body)]
        a: String,
        #[bind(body)]
        b: String,
    }

    async fn by_id(_ctx: &mut Context, _id: ItemId) -> Result<(), WebError> {
        Ok(())
    }

    async fn by_query(_ctx: &mut Context, _q: ItemQuery) -> Result<(), WebError> {
        Ok(())
    }

    async fn broken(_ctx: &mut Context, _b: Broken) -> Result<(), WebError> {
        Ok(())
    }

    async fn pass(ctx: &mut Context, next: Next<'_>) -> Result<(), WebError> {
        next.run(ctx).await
    }

    fn router() -> Router {
        Router::builder()
            .route("/", get(handler_fn(ok)))
            .routes("/items/{id:int}", [get(handler_fn(ok)), delete(handler_fn(ok))])
            .route("/files/*path", get(handler_fn(ok)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_route_lookup() {
        let router = router();
        match router.at(&Method::GET, "/items/7") {
            RouteMatch::Found { route, params } => {
                assert_eq!(route.pattern().as_str(), "/items/{id:int}");
                assert_eq!(params, [("id".to_owned(), "7".to_owned())]);
            }
            _ => panic!("expected a match"),
        }
        assert!(matches!(router.at(&Method::GET, "/items/seven"), RouteMatch::NotFound));
        assert!(matches!(router.at(&Method::GET, "/nope"), RouteMatch::NotFound));
        assert!(matches!(router.at(&Method::HEAD, "/"), RouteMatch::Found { .. }));
        match router.at(&Method::POST, "/items/7") {
            RouteMatch::MethodNotAllowed { allowed } => assert_eq!(allowed, [Method::GET, Method::DELETE]),
            _ => panic!("expected 405"),
        }
        match router.at(&Method::GET, "/files/a/b.txt") {
            RouteMatch::Found { params, .. } => assert_eq!(params[0].1, "a/b.txt"),
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn test_disable_enable_bumps_revision() {
        let router = router();
        let start = router.revision();
        router.disable(Method::GET, "/items/{id:int}").unwrap();
        assert!(matches!(router.at(&Method::GET, "/items/7"), RouteMatch::MethodNotAllowed { .. }));
        router.disable(Method::DELETE, "/items/{id}").unwrap();
        assert!(matches!(router.at(&Method::GET, "/items/7"), RouteMatch::NotFound));
        assert_eq!(router.revision(), start + 2);

        router.disable(Method::DELETE, "/items/{id}").unwrap();
        assert_eq!(router.revision(), start + 2);

        router.enable(Method::GET, "/items/{id:int}").unwrap();
        assert!(matches!(router.at(&Method::GET, "/items/7"), RouteMatch::Found { .. }));
        assert!(matches!(router.disable(Method::PUT, "/items/{id}"), Err(RouteError::UnknownRoute { .. })));
    }

    #[test]
    fn test_group_cascade() {
        let router = Router::builder()
            .middleware(middleware_fn(pass))
            .group(
                Group::new("/api")
                    .tag("api")
                    .middleware(middleware_fn(pass))
                    .security("bearer", &[])
                    .group(
                        Group::new("/v1")
                            .tag("v1")
                            .middleware(middleware_fn(pass))
                            .route("/books", get(handler_fn(ok)).tag("books").middleware(middleware_fn(pass))),
                    ),
            )
            .build()
            .unwrap();

        let route = router.routes().next().unwrap();
        assert_eq!(route.pattern().as_str(), "/api/v1/books");
        assert_eq!(route.doc().tags, ["api", "v1", "books"]);
        assert_eq!(route.doc().security.len(), 1);
        assert_eq!(route.chain().len(), 4);
    }

    #[test]
    fn test_build_errors() {
        let duplicate = Router::builder().route("/a", get(handler_fn(ok))).route("/a", get(handler_fn(ok))).build();
        assert!(matches!(duplicate, Err(RouteError::Duplicate { .. })));

        let mixed = Router::builder().route("/a/:x/{y}", get(handler_fn(ok))).build();
        assert!(matches!(mixed, Err(RouteError::Pattern(PatternError::MixedStyles(_)))));

        let conflict = Router::builder()
            .route("/a/{x}", get(handler_fn(ok)))
            .route("/a/{y}", post(handler_fn(ok)))
            .build();
        assert!(matches!(conflict, Err(RouteError::Conflict { .. })));

        let tags = Router::builder().route("/b", post(handler_in(broken))).build();
        assert!(matches!(tags, Err(RouteError::Input { source: TagError::MultipleBodies { .. }, .. })));

        let path_only = Router::builder().route("/items/{id}", get(handler_path(by_query))).build();
        assert!(matches!(path_only, Err(RouteError::NotPathOnly { ref field, .. }) if field == "verbose"));

        let unknown = Router::builder().route("/items/{key}", get(handler_path(by_id))).build();
        assert!(matches!(unknown, Err(RouteError::UnknownPathParam { .. })));

        assert!(Router::builder().route("/items/{id}", get(handler_path(by_id))).build().is_ok());
    }

    #[tokio::test]
    async fn test_found_route_runs_chain() {
        let router = router();
        let RouteMatch::Found { route, params } = router.at(&Method::GET, "/") else {
            panic!("expected a match");
        };
        let mut ctx = Context::new(Request::get("/").body(RequestBody::empty()).unwrap());
        ctx.set_params(params);
        Next::new(route.chain(), route.handler()).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.status(), StatusCode::OK);
    }
}
