//! The per-request context: request accessors, typed attributes and response writers.
//!
//! A [`Context`] is owned by the task serving one request. Response headers may change until the
//! first body write commits the response; afterwards every header mutation fails with
//! [`WebError::HeadersCommitted`].

use crate::bind::{self, Bind};
use crate::body::{BoxError, RequestBody, ResponseBody};
use crate::codec::{self, CodecError, PayloadFormat};
use crate::error::{ErrorPipeline, WebError, error_statuses};
use crate::render::Renderer;
use crate::sse::{self, SseWriter};
use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version, request};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

/// Body size limits applied while reading request bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_body_size: usize,
    /// Multipart parts larger than this are spilled to a temporary file.
    pub max_multipart_memory: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_body_size: 32 * MIB, max_multipart_memory: 32 * MIB }
    }
}

/// Server-wide collaborators every context can reach.
#[derive(Default)]
pub(crate) struct Shared {
    pub(crate) errors: ErrorPipeline,
    pub(crate) limits: Limits,
    pub(crate) renderer: Option<Arc<dyn Renderer>>,
    pub(crate) state: http::Extensions,
}

/// Path parameters captured by the matched route, percent-decoded.
#[derive(Debug, Clone, Default)]
pub struct PathParams {
    params: Vec<(String, String)>,
}

impl PathParams {
    pub fn new(params: Vec<(String, String)>) -> Self {
        let params = params
            .into_iter()
            .map(|(k, v)| {
                let decoded = urlencoding::decode(&v).map(|d| d.into_owned()).unwrap_or(v);
                (k, decoded)
            })
            .collect();
        Self { params }
    }

    #[inline]
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// A typed key into the per-request attribute store.
///
/// ```
/// use micro_api::AttrKey;
/// const USER_ID: AttrKey<u64> = AttrKey::new("user_id");
/// ```
pub struct AttrKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AttrKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttrKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttrKey<T> {}

impl<T> fmt::Debug for AttrKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AttrKey").field(&self.name).finish()
    }
}

#[derive(Default)]
struct Attributes {
    values: HashMap<(&'static str, TypeId), Box<dyn Any + Send>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        })
    }
}

/// A `Set-Cookie` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    path: Option<String>,
    domain: Option<String>,
    max_age: Option<Duration>,
    secure: bool,
    http_only: bool,
    same_site: Option<SameSite>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(path) = &self.path {
            write!(f, "; Path={path}")?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={domain}")?;
        }
        if let Some(max_age) = self.max_age {
            write!(f, "; Max-Age={}", max_age.as_secs())?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if let Some(same_site) = self.same_site {
            write!(f, "; SameSite={same_site}")?;
        }
        Ok(())
    }
}

struct ResponseState {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
    committed: bool,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self { status: StatusCode::OK, headers: HeaderMap::new(), body: ResponseBody::empty(), committed: false }
    }
}

pub struct Context {
    head: request::Parts,
    body: Option<RequestBody>,
    params: PathParams,
    route: Option<Arc<str>>,
    attributes: Attributes,
    shared: Arc<Shared>,
    response: ResponseState,
}

fn invalid_header(e: impl std::error::Error + Send + Sync + 'static) -> WebError {
    WebError::internal_server_error("invalid response header").with_source(e)
}

impl Context {
    /// A context with default server settings, mostly useful in tests.
    pub fn new(request: Request<RequestBody>) -> Self {
        Self::with_shared(request, Arc::new(Shared::default()))
    }

    pub(crate) fn with_shared(request: Request<RequestBody>, shared: Arc<Shared>) -> Self {
        let (head, body) = request.into_parts();
        Self {
            head,
            body: Some(body),
            params: PathParams::default(),
            route: None,
            attributes: Attributes::default(),
            shared,
            response: ResponseState::default(),
        }
    }

    pub fn set_params(&mut self, params: Vec<(String, String)>) {
        self.params = PathParams::new(params);
    }

    pub(crate) fn set_route(&mut self, pattern: Arc<str>) {
        self.route = Some(pattern);
    }

    // request

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    pub fn path(&self) -> &str {
        self.head.uri.path()
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// The first value of header `name`, when it is valid text.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The registered pattern of the matched route, or an empty string before routing.
    pub fn route_pattern(&self) -> &str {
        self.route.as_deref().unwrap_or_default()
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// Parses path parameter `name`; a missing or malformed value is a 400.
    pub fn param_as<T>(&self, name: &str) -> Result<T, WebError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.param(name).ok_or_else(|| WebError::bad_request(format!("missing path parameter `{name}`")))?;
        raw.parse()
            .map_err(|e| WebError::bad_request(format!("invalid path parameter `{name}`: {e}")))
    }

    /// The first value of query parameter `name`.
    pub fn query(&self, name: &str) -> Option<String> {
        self.query_pairs().into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.head
            .uri
            .query()
            .and_then(|q| serde_urlencoded::from_str::<Vec<(String, String)>>(q).ok())
            .unwrap_or_default()
    }

    /// Deserializes the whole query string.
    pub fn query_as<T: DeserializeOwned>(&self) -> Result<T, WebError> {
        serde_urlencoded::from_str(self.head.uri.query().unwrap_or_default())
            .map_err(|e| WebError::bad_request(format!("invalid query string: {e}")))
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.cookie_pairs().into_iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn cookie_pairs(&self) -> Vec<(String, String)> {
        self.head
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some((name.trim().to_owned(), value.trim().trim_matches('"').to_owned()))
            })
            .collect()
    }

    /// Takes the request body. Only the first call gets it.
    pub fn take_body(&mut self) -> Option<RequestBody> {
        self.body.take()
    }

    /// Reads the whole body, capped at the configured `max_body_size`.
    pub async fn body_bytes(&mut self) -> Result<Bytes, WebError> {
        let limit = self.shared.limits.max_body_size;
        match self.body.take() {
            Some(body) => Ok(body.collect_limited(limit).await?),
            None => Ok(Bytes::new()),
        }
    }

    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T, WebError> {
        let bytes = self.body_bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CodecError::malformed(codec::MediaType::Json, e).into())
    }

    pub async fn read_form<T: DeserializeOwned>(&mut self) -> Result<T, WebError> {
        let bytes = self.body_bytes().await?;
        serde_urlencoded::from_bytes(&bytes)
            .map_err(|e| CodecError::malformed(codec::MediaType::FormUrlEncoded, e).into())
    }

    /// Binds and validates a record from the request.
    pub async fn bind<T: Bind>(&mut self) -> Result<T, WebError> {
        bind::bind(self).await
    }

    pub fn limits(&self) -> Limits {
        self.shared.limits
    }

    pub(crate) fn errors(&self) -> &ErrorPipeline {
        &self.shared.errors
    }

    // attributes and state

    pub fn set<T: Send + 'static>(&mut self, key: AttrKey<T>, value: T) -> Option<T> {
        self.attributes
            .values
            .insert((key.name, TypeId::of::<T>()), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Send + 'static>(&self, key: AttrKey<T>) -> Option<&T> {
        self.attributes.values.get(&(key.name, TypeId::of::<T>())).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Send + 'static>(&mut self, key: AttrKey<T>) -> Option<&mut T> {
        self.attributes.values.get_mut(&(key.name, TypeId::of::<T>())).and_then(|v| v.downcast_mut::<T>())
    }

    pub fn remove<T: Send + 'static>(&mut self, key: AttrKey<T>) -> Option<T> {
        self.attributes
            .values
            .remove(&(key.name, TypeId::of::<T>()))
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    /// Application state registered with `ServerBuilder::state`.
    pub fn state<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
        self.shared.state.get::<T>()
    }

    // response head

    pub fn is_committed(&self) -> bool {
        self.response.committed
    }

    pub fn status(&self) -> StatusCode {
        self.response.status
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response.headers
    }

    fn ensure_open(&self) -> Result<(), WebError> {
        if self.response.committed { Err(WebError::HeadersCommitted) } else { Ok(()) }
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), WebError> {
        self.ensure_open()?;
        self.response.status = status;
        Ok(())
    }

    pub fn set_header<K, V>(&mut self, name: K, value: V) -> Result<(), WebError>
    where
        K: TryInto<HeaderName>,
        K::Error: std::error::Error + Send + Sync + 'static,
        V: TryInto<HeaderValue>,
        V::Error: std::error::Error + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let name = name.try_into().map_err(invalid_header)?;
        let value = value.try_into().map_err(invalid_header)?;
        self.response.headers.insert(name, value);
        Ok(())
    }

    pub fn append_header<K, V>(&mut self, name: K, value: V) -> Result<(), WebError>
    where
        K: TryInto<HeaderName>,
        K::Error: std::error::Error + Send + Sync + 'static,
        V: TryInto<HeaderValue>,
        V::Error: std::error::Error + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let name = name.try_into().map_err(invalid_header)?;
        let value = value.try_into().map_err(invalid_header)?;
        self.response.headers.append(name, value);
        Ok(())
    }

    pub fn set_cookie(&mut self, cookie: Cookie) -> Result<(), WebError> {
        self.append_header(header::SET_COOKIE, cookie.to_string())
    }

    // response body

    fn commit(&mut self, status: StatusCode, content_type: Option<&str>, body: ResponseBody) -> Result<(), WebError> {
        self.ensure_open()?;
        if let Some(content_type) = content_type {
            let value = HeaderValue::from_str(content_type).map_err(invalid_header)?;
            self.response.headers.insert(header::CONTENT_TYPE, value);
        }
        self.response.status = status;
        self.response.body = body;
        self.response.committed = true;
        Ok(())
    }

    pub(crate) fn write_serialized<T: Serialize + ?Sized>(
        &mut self,
        status: StatusCode,
        content_type: &str,
        payload: &T,
    ) -> Result<(), WebError> {
        let bytes = PayloadFormat::Json.encode(payload)?;
        self.commit(status, Some(content_type), ResponseBody::once(bytes))
    }

    fn write_format<T: Serialize + ?Sized>(
        &mut self,
        status: StatusCode,
        format: PayloadFormat,
        payload: &T,
    ) -> Result<(), WebError> {
        let bytes = format.encode(payload)?;
        self.commit(status, Some(format.content_type()), ResponseBody::once(bytes))
    }

    pub fn json<T: Serialize + ?Sized>(&mut self, status: StatusCode, payload: &T) -> Result<(), WebError> {
        self.write_format(status, PayloadFormat::Json, payload)
    }

    pub fn xml<T: Serialize + ?Sized>(&mut self, status: StatusCode, payload: &T) -> Result<(), WebError> {
        self.write_format(status, PayloadFormat::Xml, payload)
    }

    pub fn yaml<T: Serialize + ?Sized>(&mut self, status: StatusCode, payload: &T) -> Result<(), WebError> {
        self.write_format(status, PayloadFormat::Yaml, payload)
    }

    /// Serializes `payload` in the format the client's `Accept` header prefers.
    pub fn negotiate<T: Serialize + ?Sized>(&mut self, status: StatusCode, payload: &T) -> Result<(), WebError> {
        let format = PayloadFormat::negotiate(self.header(header::ACCEPT));
        self.write_format(status, format, payload)
    }

    /// Whether the client accepts `media_type`. A missing `Accept` header accepts everything.
    pub fn accepts(&self, media_type: &str) -> bool {
        let Some(accept) = self.header(header::ACCEPT) else {
            return true;
        };
        let (kind, _) = media_type.split_once('/').unwrap_or((media_type, ""));
        accept.split(',').filter_map(|item| item.split(';').next()).map(str::trim).any(|range| {
            range == "*/*"
                || range.eq_ignore_ascii_case(media_type)
                || range.strip_suffix("/*").is_some_and(|prefix| prefix.eq_ignore_ascii_case(kind))
        })
    }

    pub fn text(&mut self, status: StatusCode, text: impl Into<String>) -> Result<(), WebError> {
        self.commit(status, Some("text/plain; charset=utf-8"), ResponseBody::from(text.into()))
    }

    pub fn html(&mut self, status: StatusCode, html: impl Into<String>) -> Result<(), WebError> {
        self.commit(status, Some("text/html; charset=utf-8"), ResponseBody::from(html.into()))
    }

    pub fn bytes(&mut self, status: StatusCode, content_type: &str, bytes: impl Into<Bytes>) -> Result<(), WebError> {
        self.commit(status, Some(content_type), ResponseBody::once(bytes.into()))
    }

    /// Streams `body` as the response.
    pub fn stream<B>(&mut self, status: StatusCode, content_type: &str, body: B) -> Result<(), WebError>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        self.commit(status, Some(content_type), ResponseBody::stream(body))
    }

    /// Sends a file, guessing its content type from the extension.
    pub async fn file(&mut self, path: impl AsRef<Path>) -> Result<(), WebError> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WebError::not_found(format!("file `{}` not found", path.display())));
            }
            Err(e) => return Err(WebError::internal_server_error("failed to read file").with_source(e)),
        };
        self.commit(StatusCode::OK, Some(guess_content_type(path)), ResponseBody::once(Bytes::from(bytes)))
    }

    pub fn redirect(&mut self, status: StatusCode, location: &str) -> Result<(), WebError> {
        if !status.is_redirection() {
            return Err(WebError::internal_server_error(format!("{status} is not a redirect status")));
        }
        self.set_header(header::LOCATION, location)?;
        self.commit(status, None, ResponseBody::empty())
    }

    pub fn no_content(&mut self) -> Result<(), WebError> {
        self.empty(StatusCode::NO_CONTENT)
    }

    /// Commits `status` with an empty body.
    pub fn empty(&mut self, status: StatusCode) -> Result<(), WebError> {
        self.commit(status, None, ResponseBody::empty())
    }

    /// Renders `template` with the configured [`Renderer`].
    pub fn render<T: Serialize + ?Sized>(&mut self, status: StatusCode, template: &str, data: &T) -> Result<(), WebError> {
        let renderer = self
            .shared
            .renderer
            .clone()
            .ok_or_else(|| WebError::internal_server_error("no template renderer configured"))?;
        let data = serde_json::to_value(data)
            .map_err(|e| CodecError::Encode { format: PayloadFormat::Json, reason: e.to_string() })?;
        let html = renderer
            .render(template, &data)
            .map_err(|e| WebError::internal_server_error("template rendering failed").with_source(e))?;
        self.html(status, html)
    }

    /// Commits a `text/event-stream` response and returns its writer.
    pub fn sse(&mut self) -> Result<SseWriter, WebError> {
        self.ensure_open()?;
        self.set_header(header::CACHE_CONTROL, "no-cache")?;
        self.set_header(header::CONNECTION, "keep-alive")?;
        let (writer, body) = sse::channel(sse::SSE_BUFFER);
        self.commit(StatusCode::OK, Some("text/event-stream"), body)?;
        Ok(writer)
    }

    pub(crate) fn into_response(self) -> Response<ResponseBody> {
        let ResponseState { status, headers, body, .. } = self.response;
        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

macro_rules! context_error_helpers {
    ($($name:ident, $abort:ident, $error:ident => $status:ident),* $(,)?) => {
        impl Context {
            $(
                #[doc = concat!("Writes a `", stringify!($status), "` response in the configured error shape.")]
                pub fn $abort(&mut self, details: impl Into<String>) -> Result<(), WebError> {
                    let details = details.into();
                    let pipeline = self.shared.clone();
                    pipeline.errors.respond(self, StatusCode::$status, Some(&details), None)
                }

                #[doc = concat!("Writes a `", stringify!($status), "` response with `payload` as JSON.")]
                pub fn $error<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<(), WebError> {
                    self.json(StatusCode::$status, payload)
                }
            )*
        }
    };
}

error_statuses!(context_error_helpers);

fn guess_content_type(path: &Path) -> &'static str {
    let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("yaml" | "yml") => "application/x-yaml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("csv") => "text/csv",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        Some("woff2") => "font/woff2",
        _ => mime::APPLICATION_OCTET_STREAM.as_ref(),
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.head.method)
            .field("uri", &self.head.uri)
            .field("route", &self.route)
            .field("params", &self.params)
            .field("status", &self.response.status)
            .field("committed", &self.response.committed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{MockRenderer, RenderError};
    use http_body_util::BodyExt;
    use serde_json::json;

    fn ctx(request: http::request::Builder) -> Context {
        Context::new(request.body(RequestBody::empty()).unwrap())
    }

    async fn body_text(ctx: Context) -> String {
        let bytes = ctx.into_response().into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_params_are_decoded() {
        let mut ctx = ctx(Request::get("/users/a%20b/7"));
        ctx.set_params(vec![("name".into(), "a%20b".into()), ("id".into(), "7".into())]);
        assert_eq!(ctx.param("name"), Some("a b"));
        assert_eq!(ctx.param_as::<u32>("id").unwrap(), 7);
        assert!(matches!(ctx.param_as::<u32>("name"), Err(WebError::Client { .. })));
        assert!(ctx.param("missing").is_none());
    }

    #[test]
    fn test_query_and_cookies() {
        let ctx = ctx(Request::get("/search?q=rust&tag=a&tag=b").header("cookie", "session=abc; theme=\"dark\""));
        assert_eq!(ctx.query("q").as_deref(), Some("rust"));
        assert_eq!(ctx.query_pairs().len(), 3);
        assert_eq!(ctx.cookie("session").as_deref(), Some("abc"));
        assert_eq!(ctx.cookie("theme").as_deref(), Some("dark"));
    }

    #[test]
    fn test_typed_attributes() {
        const USER: AttrKey<u64> = AttrKey::new("user");
        const ROLE: AttrKey<String> = AttrKey::new("user");

        let mut ctx = ctx(Request::get("/"));
        assert!(ctx.set(USER, 42).is_none());
        ctx.set(ROLE, "admin".to_owned());
        assert_eq!(ctx.get(USER), Some(&42));
        assert_eq!(ctx.get(ROLE).map(String::as_str), Some("admin"));
        *ctx.get_mut(USER).unwrap() += 1;
        assert_eq!(ctx.remove(USER), Some(43));
        assert!(ctx.get(USER).is_none());
    }

    #[test]
    fn test_headers_latch_after_commit() {
        let mut ctx = ctx(Request::get("/"));
        ctx.set_header("x-request-id", "1").unwrap();
        ctx.json(StatusCode::OK, &json!({"ok": true})).unwrap();

        assert!(matches!(ctx.set_header("x-late", "1"), Err(WebError::HeadersCommitted)));
        assert!(matches!(ctx.set_status(StatusCode::CREATED), Err(WebError::HeadersCommitted)));
        assert!(matches!(ctx.text(StatusCode::OK, "again"), Err(WebError::HeadersCommitted)));

        let response = ctx.into_response();
        assert_eq!(response.headers()["x-request-id"], "1");
        assert_eq!(response.headers()["content-type"], "application/json");
    }

    #[test]
    fn test_cookie_header() {
        let cookie = Cookie::new("session", "abc")
            .path("/")
            .max_age(Duration::from_secs(3600))
            .http_only(true)
            .same_site(SameSite::Strict);
        assert_eq!(cookie.to_string(), "session=abc; Path=/; Max-Age=3600; HttpOnly; SameSite=Strict");
    }

    #[tokio::test]
    async fn test_negotiate_yaml() {
        let mut ctx = ctx(Request::get("/").header("accept", "application/x-yaml"));
        ctx.negotiate(StatusCode::OK, &json!({"name": "Dune"})).unwrap();
        assert_eq!(ctx.response_headers()["content-type"], "application/x-yaml");
        assert_eq!(body_text(ctx).await, "name: Dune\n");
    }

    #[test]
    fn test_accepts() {
        let ctx = ctx(Request::get("/").header("accept", "text/html, application/*;q=0.5"));
        assert!(ctx.accepts("text/html"));
        assert!(ctx.accepts("application/json"));
        assert!(!ctx.accepts("image/png"));
    }

    #[tokio::test]
    async fn test_abort_uses_standard_shape() {
        let mut ctx = ctx(Request::get("/"));
        ctx.abort_forbidden("no entry").unwrap();
        assert_eq!(ctx.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = serde_json::from_str(&body_text(ctx).await).unwrap();
        assert_eq!(body["code"], 403);
        assert_eq!(body["details"], "no entry");
    }

    #[tokio::test]
    async fn test_error_writes_opaque_payload() {
        let mut ctx = ctx(Request::get("/"));
        ctx.error_conflict(&json!({"reason": "taken"})).unwrap();
        assert_eq!(ctx.status(), StatusCode::CONFLICT);
        assert_eq!(body_text(ctx).await, r#"{"reason":"taken"}"#);
    }

    #[tokio::test]
    async fn test_render_with_renderer() {
        let mut renderer = MockRenderer::new();
        renderer
            .expect_render()
            .withf(|template, data| template == "hello" && data["name"] == "Ada")
            .returning(|_, data| Ok(format!("<p>{}</p>", data["name"].as_str().unwrap_or_default())));
        renderer.expect_render().returning(|t, _| Err(RenderError::new(t, "unknown template")));

        let shared = Shared { renderer: Some(Arc::new(renderer)), ..Shared::default() };
        let mut ctx = Context::with_shared(Request::get("/").body(RequestBody::empty()).unwrap(), Arc::new(shared));
        ctx.render(StatusCode::OK, "hello", &json!({"name": "Ada"})).unwrap();
        assert_eq!(ctx.response_headers()["content-type"], "text/html; charset=utf-8");
        assert_eq!(body_text(ctx).await, "<p>Ada</p>");
    }

    #[test]
    fn test_render_without_renderer() {
        let mut ctx = ctx(Request::get("/"));
        let err = ctx.render(StatusCode::OK, "hello", &json!({})).unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_sse_headers() {
        let mut ctx = ctx(Request::get("/events"));
        let mut writer = ctx.sse().unwrap();
        writer.event("tick", "1").await.unwrap();
        drop(writer);

        let response = ctx.into_response();
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(response.headers()["cache-control"], "no-cache");
        assert_eq!(response.headers()["connection"], "keep-alive");
    }

    #[tokio::test]
    async fn test_file_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        std::fs::write(&path, "<h1>hi</h1>").unwrap();

        let mut ctx = ctx(Request::get("/"));
        ctx.file(&path).await.unwrap();
        assert_eq!(ctx.response_headers()["content-type"], "text/html; charset=utf-8");
        assert_eq!(body_text(ctx).await, "<h1>hi</h1>");

        let mut missing = Context::new(Request::get("/").body(RequestBody::empty()).unwrap());
        let err = missing.file(dir.path().join("nope.txt")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_redirect() {
        let mut ctx = ctx(Request::get("/old"));
        ctx.redirect(StatusCode::MOVED_PERMANENTLY, "/new").unwrap();
        let response = ctx.into_response();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()["location"], "/new");
    }

    #[test]
    fn test_redirect_rejects_bad_location() {
        let mut ctx = ctx(Request::get("/old"));
        let err = ctx.redirect(StatusCode::MOVED_PERMANENTLY, "/new\r\nx: y").unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(ctx.into_response().headers().get("location").is_none());
    }
}
