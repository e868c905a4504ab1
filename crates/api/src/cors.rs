//! Cross-origin resource sharing, applied by the server around routing.

use crate::body::ResponseBody;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Exact origins, or `*` for any.
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
    /// Preflight cache duration in seconds.
    pub max_age: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"]
                .map(str::to_owned)
                .to_vec(),
            allowed_headers: vec!["Content-Type".to_owned(), "Authorization".to_owned()],
            exposed_headers: Vec::new(),
            allow_credentials: false,
            max_age: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorsError {
    #[error("invalid CORS method `{0}`")]
    InvalidMethod(String),

    #[error("CORS credentials cannot be combined with a wildcard origin")]
    WildcardWithCredentials,
}

#[derive(Debug, Clone)]
pub struct Cors {
    config: CorsConfig,
    methods: Vec<Method>,
    wildcard: bool,
}

impl Cors {
    pub fn new(config: CorsConfig) -> Result<Self, CorsError> {
        let methods = config
            .allowed_methods
            .iter()
            .map(|m| m.parse::<Method>().map_err(|_| CorsError::InvalidMethod(m.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let wildcard = config.allowed_origins.iter().any(|o| o == "*");
        if wildcard && config.allow_credentials {
            return Err(CorsError::WildcardWithCredentials);
        }
        Ok(Self { config, methods, wildcard })
    }

    fn allow_origin(&self, origin: &str) -> Option<String> {
        if self.wildcard {
            return Some("*".to_owned());
        }
        self.config.allowed_origins.iter().any(|o| o == origin).then(|| origin.to_owned())
    }

    fn allows_headers(&self, requested: &str) -> bool {
        if self.config.allowed_headers.iter().any(|h| h == "*") {
            return true;
        }
        requested
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .all(|h| self.config.allowed_headers.iter().any(|allowed| allowed.eq_ignore_ascii_case(h)))
    }

    /// Answers a preflight request; `None` when `method`/`headers` are not a preflight.
    pub fn preflight(&self, method: &Method, headers: &HeaderMap) -> Option<Response<ResponseBody>> {
        if method != Method::OPTIONS {
            return None;
        }
        let origin = headers.get(header::ORIGIN)?.to_str().ok()?;
        let requested = headers.get(header::ACCESS_CONTROL_REQUEST_METHOD)?.to_str().ok()?;

        let Some(allowed_origin) = self.allow_origin(origin) else {
            warn!(origin, "CORS preflight from a disallowed origin");
            return Some(forbidden());
        };
        if !requested.parse::<Method>().is_ok_and(|m| self.methods.contains(&m)) {
            warn!(origin, method = requested, "CORS preflight for a disallowed method");
            return Some(forbidden());
        }
        if let Some(requested_headers) = headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS).and_then(|v| v.to_str().ok())
            && !self.allows_headers(requested_headers)
        {
            warn!(origin, headers = requested_headers, "CORS preflight for disallowed headers");
            return Some(forbidden());
        }

        let mut response = Response::new(ResponseBody::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        let out = response.headers_mut();
        insert(out, header::ACCESS_CONTROL_ALLOW_ORIGIN, &allowed_origin);
        let methods = self.methods.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
        insert(out, header::ACCESS_CONTROL_ALLOW_METHODS, &methods);
        insert(out, header::ACCESS_CONTROL_ALLOW_HEADERS, &self.config.allowed_headers.join(", "));
        if self.config.allow_credentials {
            insert(out, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        }
        if let Some(max_age) = self.config.max_age {
            insert(out, header::ACCESS_CONTROL_MAX_AGE, &max_age.to_string());
        }
        out.append(header::VARY, HeaderValue::from_static("Origin"));
        debug!(origin, method = requested, "CORS preflight accepted");
        Some(response)
    }

    /// Adds the CORS headers for a simple or actual request.
    pub fn decorate(&self, request_headers: &HeaderMap, response: &mut Response<ResponseBody>) {
        let Some(origin) = request_headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
            return;
        };
        let Some(allowed_origin) = self.allow_origin(origin) else {
            debug!(origin, "CORS headers withheld for a disallowed origin");
            return;
        };
        let out = response.headers_mut();
        insert(out, header::ACCESS_CONTROL_ALLOW_ORIGIN, &allowed_origin);
        if self.config.allow_credentials {
            insert(out, header::ACCESS_CONTROL_ALLOW_CREDENTIALS, "true");
        }
        if !self.config.exposed_headers.is_empty() {
            insert(out, header::ACCESS_CONTROL_EXPOSE_HEADERS, &self.config.exposed_headers.join(", "));
        }
        out.append(header::VARY, HeaderValue::from_static("Origin"));
    }
}

fn insert(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn forbidden() -> Response<ResponseBody> {
    let mut response = Response::new(ResponseBody::empty());
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}
