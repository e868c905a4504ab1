//! Error taxonomy and the pipeline turning errors into responses.

use crate::body::BoxError;
use crate::codec::CodecError;
use crate::context::Context;
use crate::tag::TagError;
use crate::validate::ValidationErrors;
use chrono::{SecondsFormat, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// A field could not be bound: missing, malformed, or violating one constraint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("field `{field}`: {reason}")]
pub struct BindError {
    field: String,
    reason: String,
}

impl BindError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { field: field.into(), reason: reason.into() }
    }

    pub fn required(field: impl Into<String>) -> Self {
        Self::new(field, "required")
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error("{message}")]
    Client {
        status: StatusCode,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{message}")]
    Server {
        status: StatusCode,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("handler panicked: {message}")]
    Panic { message: String },

    #[error("handler did not finish within {0:?}")]
    Timeout(Duration),

    #[error("response already committed, headers can no longer change")]
    HeadersCommitted,
}

impl WebError {
    /// An error carrying `status` verbatim. Statuses below 500 are client errors.
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        if status.is_server_error() {
            WebError::Server { status, message, source: None }
        } else {
            WebError::Client { status, message, source: None }
        }
    }

    /// Attaches the underlying cause to a client or server error.
    pub fn with_source(self, cause: impl Into<BoxError>) -> Self {
        match self {
            WebError::Client { status, message, .. } => WebError::Client { status, message, source: Some(cause.into()) },
            WebError::Server { status, message, .. } => WebError::Server { status, message, source: Some(cause.into()) },
            other => other,
        }
    }

    pub(crate) fn panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        WebError::Panic { message }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            WebError::Bind(_) => StatusCode::BAD_REQUEST,
            WebError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WebError::Codec(e) => e.status(),
            WebError::Client { status, .. } | WebError::Server { status, .. } => *status,
            WebError::Tag(_) | WebError::Panic { .. } | WebError::HeadersCommitted => StatusCode::INTERNAL_SERVER_ERROR,
            WebError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// The detail text safe to show to clients.
    pub fn details(&self) -> String {
        match self {
            WebError::Panic { .. } | WebError::Tag(_) | WebError::HeadersCommitted => {
                "internal server error".to_owned()
            }
            WebError::Timeout(_) => "request timed out".to_owned(),
            other => other.to_string(),
        }
    }
}

/// Expands `$callback! { (name, abort_name, error_name) => STATUS, ... }` for every standard 4xx and
/// 5xx status.
macro_rules! error_statuses {
    ($callback:ident) => {
        $callback! {
            bad_request, abort_bad_request, error_bad_request => BAD_REQUEST,
            unauthorized, abort_unauthorized, error_unauthorized => UNAUTHORIZED,
            payment_required, abort_payment_required, error_payment_required => PAYMENT_REQUIRED,
            forbidden, abort_forbidden, error_forbidden => FORBIDDEN,
            not_found, abort_not_found, error_not_found => NOT_FOUND,
            method_not_allowed, abort_method_not_allowed, error_method_not_allowed => METHOD_NOT_ALLOWED,
            not_acceptable, abort_not_acceptable, error_not_acceptable => NOT_ACCEPTABLE,
            proxy_authentication_required, abort_proxy_authentication_required, error_proxy_authentication_required => PROXY_AUTHENTICATION_REQUIRED,
            request_timeout, abort_request_timeout, error_request_timeout => REQUEST_TIMEOUT,
            conflict, abort_conflict, error_conflict => CONFLICT,
            gone, abort_gone, error_gone => GONE,
            length_required, abort_length_required, error_length_required => LENGTH_REQUIRED,
            precondition_failed, abort_precondition_failed, error_precondition_failed => PRECONDITION_FAILED,
            payload_too_large, abort_payload_too_large, error_payload_too_large => PAYLOAD_TOO_LARGE,
            uri_too_long, abort_uri_too_long, error_uri_too_long => URI_TOO_LONG,
            unsupported_media_type, abort_unsupported_media_type, error_unsupported_media_type => UNSUPPORTED_MEDIA_TYPE,
            range_not_satisfiable, abort_range_not_satisfiable, error_range_not_satisfiable => RANGE_NOT_SATISFIABLE,
            expectation_failed, abort_expectation_failed, error_expectation_failed => EXPECTATION_FAILED,
            im_a_teapot, abort_im_a_teapot, error_im_a_teapot => IM_A_TEAPOT,
            misdirected_request, abort_misdirected_request, error_misdirected_request => MISDIRECTED_REQUEST,
            unprocessable_entity, abort_unprocessable_entity, error_unprocessable_entity => UNPROCESSABLE_ENTITY,
            locked, abort_locked, error_locked => LOCKED,
            failed_dependency, abort_failed_dependency, error_failed_dependency => FAILED_DEPENDENCY,
            upgrade_required, abort_upgrade_required, error_upgrade_required => UPGRADE_REQUIRED,
            precondition_required, abort_precondition_required, error_precondition_required => PRECONDITION_REQUIRED,
            too_many_requests, abort_too_many_requests, error_too_many_requests => TOO_MANY_REQUESTS,
            request_header_fields_too_large, abort_request_header_fields_too_large, error_request_header_fields_too_large => REQUEST_HEADER_FIELDS_TOO_LARGE,
            unavailable_for_legal_reasons, abort_unavailable_for_legal_reasons, error_unavailable_for_legal_reasons => UNAVAILABLE_FOR_LEGAL_REASONS,
            internal_server_error, abort_internal_server_error, error_internal_server_error => INTERNAL_SERVER_ERROR,
            not_implemented, abort_not_implemented, error_not_implemented => NOT_IMPLEMENTED,
            bad_gateway, abort_bad_gateway, error_bad_gateway => BAD_GATEWAY,
            service_unavailable, abort_service_unavailable, error_service_unavailable => SERVICE_UNAVAILABLE,
            gateway_timeout, abort_gateway_timeout, error_gateway_timeout => GATEWAY_TIMEOUT,
            http_version_not_supported, abort_http_version_not_supported, error_http_version_not_supported => HTTP_VERSION_NOT_SUPPORTED,
            variant_also_negotiates, abort_variant_also_negotiates, error_variant_also_negotiates => VARIANT_ALSO_NEGOTIATES,
            insufficient_storage, abort_insufficient_storage, error_insufficient_storage => INSUFFICIENT_STORAGE,
            loop_detected, abort_loop_detected, error_loop_detected => LOOP_DETECTED,
            not_extended, abort_not_extended, error_not_extended => NOT_EXTENDED,
            network_authentication_required, abort_network_authentication_required, error_network_authentication_required => NETWORK_AUTHENTICATION_REQUIRED,
        }
    };
}

pub(crate) use error_statuses;

macro_rules! web_error_constructors {
    ($($name:ident, $abort:ident, $error:ident => $status:ident),* $(,)?) => {
        impl WebError {
            $(
                #[doc = concat!("A `", stringify!($status), "` error with the given details.")]
                pub fn $name(details: impl Into<String>) -> Self {
                    Self::from_status(StatusCode::$status, details)
                }
            )*
        }
    };
}

error_statuses!(web_error_constructors);

/// Standard error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: String,
}

/// RFC 7807 problem details body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProblemConfig {
    /// Prefix of the `type` URI; the status code is appended.
    pub type_prefix: String,
    pub include_instance: bool,
    pub include_timestamp: bool,
    pub custom_fields: Map<String, Value>,
}

impl ProblemConfig {
    pub fn new(type_prefix: impl Into<String>) -> Self {
        Self { type_prefix: type_prefix.into(), ..Default::default() }
    }

    pub fn include_instance(mut self, include: bool) -> Self {
        self.include_instance = include;
        self
    }

    pub fn include_timestamp(mut self, include: bool) -> Self {
        self.include_timestamp = include;
        self
    }

    pub fn custom_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom_fields.insert(key.into(), value.into());
        self
    }

    fn problem_type(&self, status: StatusCode) -> String {
        if self.type_prefix.is_empty() {
            return "about:blank".to_owned();
        }
        format!("{}{}", self.type_prefix, status.as_u16())
    }
}

/// User-supplied error rendering, replacing the built-in shapes.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle(
        &self,
        ctx: &mut Context,
        status: StatusCode,
        message: &str,
        err: Option<&WebError>,
    ) -> Result<(), WebError>;
}

impl<F> ErrorHandler for F
where
    F: Fn(&mut Context, StatusCode, &str, Option<&WebError>) -> Result<(), WebError> + Send + Sync + 'static,
{
    fn handle(
        &self,
        ctx: &mut Context,
        status: StatusCode,
        message: &str,
        err: Option<&WebError>,
    ) -> Result<(), WebError> {
        (self)(ctx, status, message, err)
    }
}

#[derive(Clone, Default)]
pub enum ErrorMode {
    #[default]
    Standard,
    ProblemDetails(ProblemConfig),
    Custom(Arc<dyn ErrorHandler>),
}

impl fmt::Debug for ErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorMode::Standard => f.write_str("Standard"),
            ErrorMode::ProblemDetails(config) => f.debug_tuple("ProblemDetails").field(config).finish(),
            ErrorMode::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Renders errors with the configured shape.
#[derive(Debug, Clone, Default)]
pub struct ErrorPipeline {
    mode: ErrorMode,
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl ErrorPipeline {
    pub fn new(mode: ErrorMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> &ErrorMode {
        &self.mode
    }

    /// Logs `err` and writes its response, unless the response is already on its way.
    pub(crate) fn handle_error(&self, ctx: &mut Context, err: WebError) {
        let status = err.status();
        match &err {
            WebError::Panic { message } => {
                error!(method = %ctx.method(), path = ctx.path(), route = ctx.route_pattern(), panic = %message, "handler panicked")
            }
            e if status.is_server_error() => {
                error!(method = %ctx.method(), path = ctx.path(), status = status.as_u16(), cause = %e, "request failed")
            }
            e => debug!(method = %ctx.method(), path = ctx.path(), status = status.as_u16(), cause = %e, "request rejected"),
        }

        if ctx.is_committed() {
            warn!(path = ctx.path(), cause = %err, "error raised after the response was committed");
            return;
        }
        let details = err.details();
        if let Err(e) = self.respond(ctx, status, Some(&details), Some(&err)) {
            error!(path = ctx.path(), cause = %e, "failed to write error response");
        }
    }

    /// Writes an error response with `status` and optional details.
    pub fn respond(
        &self,
        ctx: &mut Context,
        status: StatusCode,
        details: Option<&str>,
        err: Option<&WebError>,
    ) -> Result<(), WebError> {
        let message = status.canonical_reason().unwrap_or("Unknown Status").to_owned();
        match &self.mode {
            ErrorMode::Custom(handler) => {
                let handler = handler.clone();
                let text = details.unwrap_or(&message);
                match handler.handle(ctx, status, text, err) {
                    Ok(()) if ctx.is_committed() => Ok(()),
                    Ok(()) => Self::standard(ctx, status, message, details),
                    Err(e) => {
                        warn!(cause = %e, "custom error handler failed, falling back to the standard shape");
                        if ctx.is_committed() { Ok(()) } else { Self::standard(ctx, status, message, details) }
                    }
                }
            }
            ErrorMode::Standard => Self::standard(ctx, status, message, details),
            ErrorMode::ProblemDetails(config) => {
                let mut extensions = config.custom_fields.clone();
                if let Some(WebError::Validation(errors)) = err {
                    extensions.insert("errors".to_owned(), serde_json::to_value(errors).unwrap_or(Value::Null));
                }
                let problem = ProblemDetails {
                    problem_type: config.problem_type(status),
                    title: message.clone(),
                    status: status.as_u16(),
                    detail: details.map(str::to_owned).unwrap_or(message),
                    instance: config.include_instance.then(|| ctx.path().to_owned()),
                    timestamp: config.include_timestamp.then(timestamp),
                    extensions,
                };
                ctx.write_serialized(status, "application/problem+json", &problem)
            }
        }
    }

    fn standard(ctx: &mut Context, status: StatusCode, message: String, details: Option<&str>) -> Result<(), WebError> {
        let body = ErrorResponse {
            code: status.as_u16(),
            message,
            details: details.map(str::to_owned),
            timestamp: timestamp(),
        };
        ctx.write_serialized(status, "application/json", &body)
    }
}
