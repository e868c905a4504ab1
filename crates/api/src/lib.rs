//! A small typed HTTP framework.
//!
//! Routes are declared once and carry typed handlers. Handler inputs are plain structs whose
//! `#[bind(..)]` annotations say where each field comes from (path, query, header, cookie, form,
//! uploaded file or body document) and what it must satisfy. The same annotations drive
//! validation and the generated OpenAPI document.
//!
//! ```ignore
//! #[derive(Debug, Default, Serialize, Bind)]
//! struct CreateBook {
//!     #[bind(json = "Name", required, min_length = 4)]
//!     name: String,
//! }
//!
//! async fn create(_ctx: &mut Context, input: CreateBook) -> Result<Json<CreateBook>, WebError> {
//!     Ok(Json(input))
//! }
//!
//! let router = Router::builder().route("/books", post(handler_in_out(create))).build()?;
//! Server::builder().router(router).port(8080).build()?.start().await?;
//! ```

extern crate self as micro_api;

mod body;
mod constraint;
mod decode;
mod format;
mod handler;
mod middleware;
mod render;
mod validate;

pub mod bind;
pub mod codec;
pub mod config;
pub mod context;
pub mod cors;
pub mod error;
pub mod openapi;
pub mod output;
pub mod router;
pub mod server;
pub mod sse;
pub mod tag;

pub use bind::{Bind, UploadedFile};
pub use body::{BoxError, RequestBody, ResponseBody};
pub use codec::{MediaType, PayloadFormat, Protobuf};
pub use config::Config;
pub use context::{AttrKey, Context, Cookie, Limits, PathParams, SameSite};
pub use decode::{DecodeError, FieldValue, FieldView};
pub use error::{BindError, ErrorHandler, ProblemConfig, WebError};
pub use format::Format;
pub use handler::{
    CtxFn, CtxInFn, FnHandler, HandlerContract, InHandler, InOutHandler, OutHandler, RequestHandler, handler_fn,
    handler_in, handler_in_out, handler_out, handler_path,
};
pub use middleware::{FnMiddleware, Middleware, MiddlewareFn, Next, middleware_fn};
pub use output::{Json, Negotiated, Output, OutputDoc};
pub use render::{RenderError, Renderer};
pub use router::{Group, RouteError, RouteItem, Router, RouterBuilder};
pub use server::{Server, ServerBuilder, ServerError};
pub use sse::{Event, SseWriter};
pub use validate::{Validate, ValidationError, ValidationErrors, validate};

pub use micro_api_macros::{Bind, Output};

pub use http;
pub use http::{Method, StatusCode};

/// Items referenced by the derive macros.
#[doc(hidden)]
pub mod __private {
    pub use crate::bind::{BindPlan, FieldSpec, Sources, bind_nested, plan_info, record_from_json};
    pub use crate::codec::{CodecError, MediaType};
    pub use crate::decode::{DecodeError, FieldValue, FieldView};
    pub use crate::openapi::{Schema, SchemaRegistry, ToSchema, record_schema};
    pub use crate::tag::{TagError, TagSet};
    pub use bytes::Bytes;
    pub use serde_json::Value;
}
