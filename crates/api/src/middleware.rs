//! Middleware chains.
//!
//! A route's chain is composed once, at build time, in `global → group ancestors → group → route`
//! order. Each middleware runs its entry phase, calls [`Next::run`], then its exit phase; returning
//! early without calling `next` short-circuits the rest of the chain.

use crate::context::Context;
use crate::error::WebError;
use crate::handler::RequestHandler;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), WebError>;
}

/// The rest of the chain, ending in the route handler.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a dyn RequestHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], handler: &'a dyn RequestHandler) -> Self {
        Self { chain, handler }
    }

    pub async fn run(self, ctx: &mut Context) -> Result<(), WebError> {
        match self.chain.split_first() {
            Some((first, rest)) => first.handle(ctx, Next { chain: rest, handler: self.handler }).await,
            None => self.handler.invoke(ctx).await,
        }
    }
}

/// An async function usable as middleware.
pub trait MiddlewareFn<'a>: Send + Sync + 'static {
    type Fut: Future<Output = Result<(), WebError>> + Send + 'a;

    fn call(&self, ctx: &'a mut Context, next: Next<'a>) -> Self::Fut;
}

impl<'a, F, Fut> MiddlewareFn<'a> for F
where
    F: Fn(&'a mut Context, Next<'a>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WebError>> + Send + 'a,
{
    type Fut = Fut;

    #[inline]
    fn call(&self, ctx: &'a mut Context, next: Next<'a>) -> Fut {
        (self)(ctx, next)
    }
}

pub struct FnMiddleware<F> {
    f: F,
}

/// Wraps `async fn(&mut Context, Next<'_>) -> Result<(), WebError>` as middleware.
pub fn middleware_fn<F>(f: F) -> FnMiddleware<F>
where
    F: for<'a> MiddlewareFn<'a>,
{
    FnMiddleware { f }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> MiddlewareFn<'a>,
{
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), WebError> {
        self.f.call(ctx, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::RequestBody;
    use crate::context::AttrKey;
    use crate::handler::handler_fn;
    use http::{Request, StatusCode};

    const TRAIL: AttrKey<Vec<String>> = AttrKey::new("trail");

    struct Mark(&'static str);

    #[async_trait]
    impl Middleware for Mark {
        async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<(), WebError> {
            push(ctx, format!("{}>", self.0));
            let result = next.run(ctx).await;
            push(ctx, format!("<{}", self.0));
            result
        }
    }

    struct Deny;

    #[async_trait]
    impl Middleware for Deny {
        async fn handle(&self, _ctx: &mut Context, _next: Next<'_>) -> Result<(), WebError> {
            Err(WebError::unauthorized("missing token"))
        }
    }

    fn push(ctx: &mut Context, step: String) {
        match ctx.get_mut(TRAIL) {
            Some(trail) => trail.push(step),
            None => {
                ctx.set(TRAIL, vec![step]);
            }
        }
    }

    async fn endpoint(ctx: &mut Context) -> Result<(), WebError> {
        push(ctx, "handler".to_owned());
        ctx.text(StatusCode::OK, "ok")
    }

    async fn tag(ctx: &mut Context, next: Next<'_>) -> Result<(), WebError> {
        ctx.set_header("x-tagged", "1")?;
        next.run(ctx).await
    }

    fn ctx() -> Context {
        Context::new(Request::get("/").body(RequestBody::empty()).unwrap())
    }

    #[tokio::test]
    async fn test_entry_in_order_exit_reversed() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Mark("a")), Arc::new(Mark("b")), Arc::new(Mark("c"))];
        let handler = handler_fn(endpoint);
        let mut ctx = ctx();
        Next::new(&chain, &handler).run(&mut ctx).await.unwrap();

        assert_eq!(ctx.get(TRAIL).unwrap(), &["a>", "b>", "c>", "handler", "<c", "<b", "<a"]);
    }

    #[tokio::test]
    async fn test_short_circuit_keeps_outer_exits() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Mark("a")), Arc::new(Deny), Arc::new(Mark("c"))];
        let handler = handler_fn(endpoint);
        let mut ctx = ctx();
        let err = Next::new(&chain, &handler).run(&mut ctx).await.unwrap_err();

        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ctx.get(TRAIL).unwrap(), &["a>", "<a"]);
    }

    #[tokio::test]
    async fn test_fn_middleware() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(middleware_fn(tag))];
        let handler = handler_fn(endpoint);
        let mut ctx = ctx();
        Next::new(&chain, &handler).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.response_headers()["x-tagged"], "1");
    }
}
