//! Projection of handler results onto the response.
//!
//! `#[derive(Output)]` reads `#[output(status)]`, `#[output(header = "..")]`,
//! `#[output(cookie = "..")]` and `#[output(body)]` field annotations. The body field, or the whole
//! value when there is none, is serialized in the format negotiated from `Accept`.

use crate::codec::{PayloadFormat, Protobuf};
use crate::context::{Context, Cookie};
use crate::error::WebError;
use crate::openapi::{Schema, SchemaRegistry, ToSchema};
use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;

/// A handler result that knows how to write itself.
pub trait Output: Send + 'static {
    /// Writes the response. `status` is the route default: 201 for POST, 200 otherwise.
    fn write_to(self, ctx: &mut Context, status: StatusCode) -> Result<(), WebError>;

    fn describe(registry: &mut SchemaRegistry) -> OutputDoc;
}

/// What an [`Output`] contributes to the OpenAPI response object.
#[derive(Debug, Clone, Default)]
pub struct OutputDoc {
    pub content_types: Vec<&'static str>,
    pub body: Option<Schema>,
    pub headers: Vec<(String, Schema)>,
}

const NEGOTIATED: [&str; 3] = ["application/json", "application/xml", "application/x-yaml"];

impl OutputDoc {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A body served in every negotiable format.
    pub fn negotiated(body: Schema) -> Self {
        Self { content_types: NEGOTIATED.to_vec(), body: Some(body), headers: Vec::new() }
    }

    pub fn single(content_type: &'static str, body: Schema) -> Self {
        Self { content_types: vec![content_type], body: Some(body), headers: Vec::new() }
    }

    pub fn header(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.headers.push((name.into(), schema));
        self
    }
}

/// Serializes the inner value as JSON regardless of `Accept`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Json<T>(pub T);

impl<T> Output for Json<T>
where
    T: Serialize + ToSchema + Send + 'static,
{
    fn write_to(self, ctx: &mut Context, status: StatusCode) -> Result<(), WebError> {
        ctx.json(status, &self.0)
    }

    fn describe(registry: &mut SchemaRegistry) -> OutputDoc {
        OutputDoc::single(PayloadFormat::Json.content_type(), registry.resolve::<T>())
    }
}

/// Serializes the inner value in the negotiated format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Negotiated<T>(pub T);

impl<T> Output for Negotiated<T>
where
    T: Serialize + ToSchema + Send + 'static,
{
    fn write_to(self, ctx: &mut Context, status: StatusCode) -> Result<(), WebError> {
        ctx.negotiate(status, &self.0)
    }

    fn describe(registry: &mut SchemaRegistry) -> OutputDoc {
        OutputDoc::negotiated(registry.resolve::<T>())
    }
}

impl Output for String {
    fn write_to(self, ctx: &mut Context, status: StatusCode) -> Result<(), WebError> {
        ctx.text(status, self)
    }

    fn describe(registry: &mut SchemaRegistry) -> OutputDoc {
        OutputDoc::single("text/plain", registry.resolve::<String>())
    }
}

impl Output for &'static str {
    fn write_to(self, ctx: &mut Context, status: StatusCode) -> Result<(), WebError> {
        ctx.text(status, self)
    }

    fn describe(registry: &mut SchemaRegistry) -> OutputDoc {
        OutputDoc::single("text/plain", registry.resolve::<String>())
    }
}

impl Output for () {
    fn write_to(self, ctx: &mut Context, status: StatusCode) -> Result<(), WebError> {
        ctx.empty(status)
    }

    fn describe(_registry: &mut SchemaRegistry) -> OutputDoc {
        OutputDoc::empty()
    }
}

impl Output for Bytes {
    fn write_to(self, ctx: &mut Context, status: StatusCode) -> Result<(), WebError> {
        ctx.bytes(status, mime::APPLICATION_OCTET_STREAM.as_ref(), self)
    }

    fn describe(_registry: &mut SchemaRegistry) -> OutputDoc {
        OutputDoc::single("application/octet-stream", Schema::of_type("string").with_format("binary"))
    }
}

impl<M> Output for Protobuf<M>
where
    M: prost::Message + Send + 'static,
{
    fn write_to(self, ctx: &mut Context, status: StatusCode) -> Result<(), WebError> {
        ctx.bytes(status, "application/x-protobuf", self.0.encode_to_vec())
    }

    fn describe(registry: &mut SchemaRegistry) -> OutputDoc {
        OutputDoc::single("application/x-protobuf", registry.resolve::<Protobuf<M>>())
    }
}

/// A field that may override the response status. Zero keeps the default.
pub trait StatusField {
    fn status_code(&self) -> Result<Option<StatusCode>, WebError>;
}

impl StatusField for StatusCode {
    fn status_code(&self) -> Result<Option<StatusCode>, WebError> {
        Ok(Some(*self))
    }
}

impl<T: StatusField> StatusField for Option<T> {
    fn status_code(&self) -> Result<Option<StatusCode>, WebError> {
        match self {
            Some(inner) => inner.status_code(),
            None => Ok(None),
        }
    }
}

macro_rules! impl_status_field {
    ($($ty:ty),*) => {
        $(
            impl StatusField for $ty {
                #[allow(clippy::unnecessary_cast)]
                fn status_code(&self) -> Result<Option<StatusCode>, WebError> {
                    if *self == 0 {
                        return Ok(None);
                    }
                    u16::try_from(*self as i64)
                        .ok()
                        .and_then(|code| StatusCode::from_u16(code).ok())
                        .map(Some)
                        .ok_or_else(|| WebError::internal_server_error(format!("invalid response status {self}")))
                }
            }
        )*
    };
}

impl_status_field!(u16, u32, u64, usize, i16, i32, i64, isize);

/// A field emitted as a response header. Empty values are skipped.
pub trait HeaderField {
    fn header_value(&self) -> Option<String>;
}

impl<T: HeaderField> HeaderField for Option<T> {
    fn header_value(&self) -> Option<String> {
        self.as_ref().and_then(HeaderField::header_value)
    }
}

impl HeaderField for &'static str {
    fn header_value(&self) -> Option<String> {
        (!self.is_empty()).then(|| (*self).to_owned())
    }
}

macro_rules! impl_header_field {
    ($($ty:ty),*) => {
        $(
            impl HeaderField for $ty {
                fn header_value(&self) -> Option<String> {
                    let value = self.to_string();
                    (!value.is_empty()).then_some(value)
                }
            }
        )*
    };
}

impl_header_field!(String, bool, char, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64);

/// A field emitted as a `Set-Cookie` header. Empty values are skipped.
pub trait CookieField {
    fn cookie(&self, name: &str) -> Option<Cookie>;
}

impl CookieField for Cookie {
    fn cookie(&self, _name: &str) -> Option<Cookie> {
        Some(self.clone())
    }
}

impl CookieField for String {
    fn cookie(&self, name: &str) -> Option<Cookie> {
        (!self.is_empty()).then(|| Cookie::new(name, self.as_str()))
    }
}

impl<T: CookieField> CookieField for Option<T> {
    fn cookie(&self, name: &str) -> Option<Cookie> {
        self.as_ref().and_then(|inner| inner.cookie(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::RequestBody;
    use crate::{Bind, Output};
    use http::Request;
    use http_body_util::BodyExt;
    use serde::Serialize;

    #[derive(Debug, Default, Serialize, Bind)]
    struct Book {
        #[bind(json = "Name")]
        #[serde(rename = "Name")]
        name: String,
    }

    #[derive(Output)]
    struct Created {
        #[output(status)]
        status: u16,
        #[output(header = "Location")]
        location: String,
        #[output(header = "X-Trace")]
        trace: Option<String>,
        #[output(cookie = "session")]
        session: String,
        #[output(body)]
        book: Book,
    }

    fn ctx(accept: &str) -> Context {
        Context::new(Request::post("/books").header("accept", accept).body(RequestBody::empty()).unwrap())
    }

    #[tokio::test]
    async fn test_derived_output() {
        let output = Created {
            status: 0,
            location: "/books/1".into(),
            trace: None,
            session: "s1".into(),
            book: Book { name: "Dune".into() },
        };
        let mut ctx = ctx("application/json");
        output.write_to(&mut ctx, StatusCode::CREATED).unwrap();

        let response = ctx.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["location"], "/books/1");
        assert!(response.headers().get("x-trace").is_none());
        assert_eq!(response.headers()["set-cookie"], "session=s1");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, r#"{"Name":"Dune"}"#);
    }

    #[tokio::test]
    async fn test_status_field_overrides_default() {
        let output = Created {
            status: 202,
            location: String::new(),
            trace: Some("t-1".into()),
            session: String::new(),
            book: Book::default(),
        };
        let mut ctx = ctx("application/x-yaml");
        output.write_to(&mut ctx, StatusCode::CREATED).unwrap();

        let response = ctx.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(response.headers().get("location").is_none());
        assert_eq!(response.headers()["x-trace"], "t-1");
        assert_eq!(response.headers()["content-type"], "application/x-yaml");
    }

    #[test]
    fn test_describe_derived_output() {
        let mut registry = SchemaRegistry::new();
        let doc = Created::describe(&mut registry);
        assert_eq!(doc.content_types.len(), 3);
        assert_eq!(doc.body.unwrap().referenced_name(), Some("Book"));
        let names: Vec<&str> = doc.headers.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["Location", "X-Trace"]);
        assert!(registry.get("Book").is_some());
    }

    #[test]
    fn test_invalid_status_field() {
        assert!(1000u16.status_code().is_err());
        assert!(42u16.status_code().is_err());
        assert_eq!(0i32.status_code().unwrap(), None);
        assert_eq!(Some(404u16).status_code().unwrap(), Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_unit_output() {
        let mut ctx = ctx("*/*");
        ().write_to(&mut ctx, StatusCode::OK).unwrap();
        assert!(ctx.is_committed());
        assert_eq!(ctx.into_response().status(), StatusCode::OK);
    }
}
