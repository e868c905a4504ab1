//! Typed handler adapters.
//!
//! Every route ends in one [`RequestHandler`]. The constructors below wrap plain async functions
//! of four shapes:
//!
//! | constructor      | user function                                              |
//! |------------------|------------------------------------------------------------|
//! | [`handler_fn`]     | `async fn(&mut Context) -> Result<(), WebError>`           |
//! | [`handler_in`]     | `async fn(&mut Context, In) -> Result<(), WebError>`       |
//! | [`handler_in_out`] | `async fn(&mut Context, In) -> Result<Out, WebError>`      |
//! | [`handler_out`]    | `async fn(&mut Context) -> Result<Out, WebError>`          |
//!
//! [`handler_path`] is [`handler_in`] for inputs bound from path parameters only; the router
//! rejects it at build time when the input declares any other source.

use crate::bind::{self, Bind, PlanInfo, plan_info};
use crate::context::Context;
use crate::error::WebError;
use crate::openapi::SchemaRegistry;
use crate::output::{Output, OutputDoc};
use crate::tag::TagError;
use async_trait::async_trait;
use futures::FutureExt;
use http::{Method, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use tracing::debug;

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn invoke(&self, ctx: &mut Context) -> Result<(), WebError>;

    /// The input and output types, for route checks and documentation.
    fn contract(&self) -> HandlerContract {
        HandlerContract::default()
    }
}

#[async_trait]
impl RequestHandler for Box<dyn RequestHandler> {
    async fn invoke(&self, ctx: &mut Context) -> Result<(), WebError> {
        self.as_ref().invoke(ctx).await
    }

    fn contract(&self) -> HandlerContract {
        self.as_ref().contract()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerContract {
    pub input: Option<fn() -> Result<&'static dyn PlanInfo, TagError>>,
    pub output: Option<fn(&mut SchemaRegistry) -> OutputDoc>,
    pub path_only: bool,
}

/// An async function taking the context.
pub trait CtxFn<'a, Ret>: Send + Sync + 'static {
    type Fut: Future<Output = Result<Ret, WebError>> + Send + 'a;

    fn call(&self, ctx: &'a mut Context) -> Self::Fut;
}

impl<'a, F, Fut, Ret> CtxFn<'a, Ret> for F
where
    F: Fn(&'a mut Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Ret, WebError>> + Send + 'a,
{
    type Fut = Fut;

    #[inline]
    fn call(&self, ctx: &'a mut Context) -> Fut {
        (self)(ctx)
    }
}

/// An async function taking the context and a bound input.
pub trait CtxInFn<'a, In, Ret>: Send + Sync + 'static {
    type Fut: Future<Output = Result<Ret, WebError>> + Send + 'a;

    fn call(&self, ctx: &'a mut Context, input: In) -> Self::Fut;
}

impl<'a, F, Fut, In, Ret> CtxInFn<'a, In, Ret> for F
where
    F: Fn(&'a mut Context, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Ret, WebError>> + Send + 'a,
{
    type Fut = Fut;

    #[inline]
    fn call(&self, ctx: &'a mut Context, input: In) -> Fut {
        (self)(ctx, input)
    }
}

/// Runs binding, the user function and output writing, turning a panic in any of them into
/// [`WebError::Panic`].
async fn guard<T>(fut: impl Future<Output = Result<T, WebError>>) -> Result<T, WebError> {
    AssertUnwindSafe(fut).catch_unwind().await.unwrap_or_else(|payload| Err(WebError::panic(payload)))
}

fn default_status(method: &Method) -> StatusCode {
    if method == Method::POST { StatusCode::CREATED } else { StatusCode::OK }
}

fn write_output<Out: Output>(ctx: &mut Context, output: Out, status: StatusCode) -> Result<(), WebError> {
    if ctx.is_committed() {
        debug!(path = ctx.path(), "handler wrote the response itself, output dropped");
        return Ok(());
    }
    output.write_to(ctx, status)
}

pub struct FnHandler<F> {
    f: F,
}

pub struct InHandler<F, In> {
    f: F,
    path_only: bool,
    _phantom: PhantomData<fn(In)>,
}

pub struct InOutHandler<F, In, Out> {
    f: F,
    _phantom: PhantomData<fn(In) -> Out>,
}

pub struct OutHandler<F, Out> {
    f: F,
    _phantom: PhantomData<fn() -> Out>,
}

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: for<'a> CtxFn<'a, ()>,
{
    FnHandler { f }
}

pub fn handler_in<F, In>(f: F) -> InHandler<F, In>
where
    F: for<'a> CtxInFn<'a, In, ()>,
    In: Bind,
{
    InHandler { f, path_only: false, _phantom: PhantomData }
}

pub fn handler_path<F, In>(f: F) -> InHandler<F, In>
where
    F: for<'a> CtxInFn<'a, In, ()>,
    In: Bind,
{
    InHandler { f, path_only: true, _phantom: PhantomData }
}

pub fn handler_in_out<F, In, Out>(f: F) -> InOutHandler<F, In, Out>
where
    F: for<'a> CtxInFn<'a, In, Out>,
    In: Bind,
    Out: Output,
{
    InOutHandler { f, _phantom: PhantomData }
}

pub fn handler_out<F, Out>(f: F) -> OutHandler<F, Out>
where
    F: for<'a> CtxFn<'a, Out>,
    Out: Output,
{
    OutHandler { f, _phantom: PhantomData }
}

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where
    F: for<'a> CtxFn<'a, ()>,
{
    async fn invoke(&self, ctx: &mut Context) -> Result<(), WebError> {
        guard(self.f.call(ctx)).await
    }
}

#[async_trait]
impl<F, In> RequestHandler for InHandler<F, In>
where
    F: for<'a> CtxInFn<'a, In, ()>,
    In: Bind,
{
    async fn invoke(&self, ctx: &mut Context) -> Result<(), WebError> {
        guard(async move {
            let input = bind::bind::<In>(ctx).await?;
            self.f.call(ctx, input).await
        })
        .await
    }

    fn contract(&self) -> HandlerContract {
        HandlerContract { input: Some(plan_info::<In>), output: None, path_only: self.path_only }
    }
}

#[async_trait]
impl<F, In, Out> RequestHandler for InOutHandler<F, In, Out>
where
    F: for<'a> CtxInFn<'a, In, Out>,
    In: Bind,
    Out: Output,
{
    async fn invoke(&self, ctx: &mut Context) -> Result<(), WebError> {
        guard(async move {
            let input = bind::bind::<In>(ctx).await?;
            let status = default_status(ctx.method());
            let output = self.f.call(ctx, input).await?;
            write_output(ctx, output, status)
        })
        .await
    }

    fn contract(&self) -> HandlerContract {
        HandlerContract { input: Some(plan_info::<In>), output: Some(Out::describe), path_only: false }
    }
}

#[async_trait]
impl<F, Out> RequestHandler for OutHandler<F, Out>
where
    F: for<'a> CtxFn<'a, Out>,
    Out: Output,
{
    async fn invoke(&self, ctx: &mut Context) -> Result<(), WebError> {
        guard(async move {
            let status = default_status(ctx.method());
            let output = self.f.call(ctx).await?;
            write_output(ctx, output, status)
        })
        .await
    }

    fn contract(&self) -> HandlerContract {
        HandlerContract { input: None, output: Some(Out::describe), path_only: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::RequestBody;
    use crate::decode::{DecodeError, FieldValue, FieldView};
    use crate::openapi::{Schema, ToSchema};
    use crate::output::Json;
    use crate::tag::TagSet;
    use http::Request;
    use http_body_util::BodyExt;
    use serde::Serialize;
    use serde_json::Value;

    #[derive(Debug, Default, Serialize, crate::Bind)]
    struct Greeting {
        #[bind(query = "name", required)]
        #[serde(rename = "Name")]
        name: String,
    }

    fn ctx(method: Method, uri: &str) -> Context {
        Context::new(Request::builder().method(method).uri(uri).body(RequestBody::empty()).unwrap())
    }

    async fn plain(ctx: &mut Context) -> Result<(), WebError> {
        ctx.text(StatusCode::OK, "plain")
    }

    async fn greet(_ctx: &mut Context, input: Greeting) -> Result<Json<Greeting>, WebError> {
        Ok(Json(input))
    }

    async fn touch(ctx: &mut Context, input: Greeting) -> Result<(), WebError> {
        ctx.text(StatusCode::ACCEPTED, input.name)
    }

    async fn version(_ctx: &mut Context) -> Result<String, WebError> {
        Ok("1.0".to_owned())
    }

    async fn boom(_ctx: &mut Context) -> Result<(), WebError> {
        panic!("database handle poisoned")
    }

    fn assert_is_handler<T: RequestHandler>(_handler: &T) {
        // no op
    }

    #[test]
    fn assert_adapters_are_handlers() {
        assert_is_handler(&handler_fn(plain));
        assert_is_handler(&handler_in(touch));
        assert_is_handler(&handler_path(touch));
        assert_is_handler(&handler_in_out(greet));
        assert_is_handler(&handler_out(version));
    }

    #[tokio::test]
    async fn test_in_out_default_status() {
        let handler = handler_in_out(greet);

        let mut get = ctx(Method::GET, "/greet?name=Ada");
        handler.invoke(&mut get).await.unwrap();
        let response = get.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.into_body().collect().await.unwrap().to_bytes(), r#"{"Name":"Ada"}"#);

        let mut post = ctx(Method::POST, "/greet?name=Ada");
        handler.invoke(&mut post).await.unwrap();
        assert_eq!(post.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_bind_failure_skips_handler() {
        let mut ctx = ctx(Method::GET, "/greet");
        let err = handler_in(touch).invoke(&mut ctx).await.unwrap_err();
        assert!(matches!(err, WebError::Bind(ref e) if e.field() == "name" && e.reason() == "required"));
        assert!(!ctx.is_committed());
    }

    #[tokio::test]
    async fn test_output_ignored_after_handler_wrote() {
        let mut ctx = ctx(Method::GET, "/greet?name=Bo");
        handler_in(touch).invoke(&mut ctx).await.unwrap();
        assert_eq!(ctx.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_panic_is_caught() {
        let mut ctx = ctx(Method::GET, "/");
        let err = handler_fn(boom).invoke(&mut ctx).await.unwrap_err();
        assert!(matches!(err, WebError::Panic { ref message } if message == "database handle poisoned"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[derive(Debug, Default)]
    struct Fragile(String);

    impl ToSchema for Fragile {
        fn schema(_: &mut SchemaRegistry) -> Schema {
            Schema::of_type("string")
        }
    }

    impl FieldValue for Fragile {
        fn from_text(_values: &[String], _tags: &TagSet) -> Result<Self, DecodeError> {
            panic!("decoder bug")
        }

        fn from_json(_value: Value, _tags: &TagSet) -> Result<Self, DecodeError> {
            panic!("decoder bug")
        }

        fn view(&self) -> FieldView<'_> {
            FieldView::Str(&self.0)
        }
    }

    #[derive(Debug, Default, crate::Bind)]
    struct FragileInput {
        #[bind(query = "v")]
        value: Fragile,
    }

    async fn accept_fragile(_ctx: &mut Context, _input: FragileInput) -> Result<(), WebError> {
        Ok(())
    }

    #[tokio::test]
    async fn test_panic_while_binding_is_caught() {
        let mut ctx = ctx(Method::GET, "/fragile?v=1");
        let err = handler_in(accept_fragile).invoke(&mut ctx).await.unwrap_err();
        assert!(matches!(err, WebError::Panic { ref message } if message == "decoder bug"));
        assert!(!ctx.is_committed());
    }

    #[test]
    fn test_contracts() {
        assert!(handler_fn(plain).contract().input.is_none());
        assert!(handler_path(touch).contract().path_only);

        let contract = handler_in_out(greet).contract();
        let plan = (contract.input.unwrap())().unwrap();
        assert_eq!(plan.type_name(), "Greeting");
        let mut registry = SchemaRegistry::new();
        let doc = (contract.output.unwrap())(&mut registry);
        assert_eq!(doc.content_types, ["application/json"]);

        let doc = (handler_out(version).contract().output.unwrap())(&mut registry);
        assert_eq!(doc.content_types, ["text/plain"]);
    }
}
