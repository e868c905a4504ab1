//! OpenAPI 3.0.3 generation, kept in sync with the live route table.
//!
//! The document is a projection of the [`Router`]: it is synthesized on first request and
//! rebuilt whenever the router's revision counter moves (a route was enabled or disabled).

mod schema;
mod spec;
mod synth;

pub use schema::{SchemaRegistry, ToSchema, field_schema, record_schema};
pub use spec::{
    ApiServer, Components, Content, Document, Header, Info, OPENAPI_VERSION, Operation, Parameter,
    ParameterLocation, PathItem, RequestBody, Response, Schema, SecurityRequirement, SecurityScheme, Tag,
};

use crate::router::Router;
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OpenApiConfig {
    pub enabled: bool,
    pub title: String,
    pub version: String,
    pub description: Option<String>,
    pub servers: Vec<ApiServer>,
    /// Path of the JSON document; `None` disables every documentation endpoint.
    pub json_path: Option<String>,
    /// Path of the Swagger UI page; `None` disables it.
    pub docs_path: Option<String>,
    /// Path of the ReDoc page; `None` disables it.
    pub redoc_path: Option<String>,
    pub security_schemes: BTreeMap<String, SecurityScheme>,
}

impl Default for OpenApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            title: "micro-api".to_owned(),
            version: "1.0.0".to_owned(),
            description: None,
            servers: Vec::new(),
            json_path: Some("/openapi.json".to_owned()),
            docs_path: Some("/docs".to_owned()),
            redoc_path: Some("/redoc".to_owned()),
            security_schemes: BTreeMap::new(),
        }
    }
}

impl OpenApiConfig {
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn server(mut self, url: impl Into<String>) -> Self {
        self.servers.push(ApiServer { url: url.into(), description: None });
        self
    }

    pub fn security_scheme(mut self, name: impl Into<String>, scheme: SecurityScheme) -> Self {
        self.security_schemes.insert(name.into(), scheme);
        self
    }
}

/// One of the documentation endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DocEndpoint {
    Json,
    SwaggerUi,
    Redoc,
}

/// A synthesized document and its serialized form.
#[derive(Debug)]
pub struct Snapshot {
    revision: u64,
    document: Document,
    json: Bytes,
}

impl Snapshot {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn json(&self) -> &Bytes {
        &self.json
    }
}

/// Copy-on-write cache of the document, keyed by router revision.
pub struct OpenApi {
    config: OpenApiConfig,
    current: ArcSwapOption<Snapshot>,
    rebuild: Mutex<()>,
}

impl OpenApi {
    pub fn new(config: OpenApiConfig) -> Self {
        Self { config, current: ArcSwapOption::empty(), rebuild: Mutex::new(()) }
    }

    pub fn config(&self) -> &OpenApiConfig {
        &self.config
    }

    pub(crate) fn endpoint(&self, path: &str) -> Option<DocEndpoint> {
        if !self.config.enabled {
            return None;
        }
        let json_path = self.config.json_path.as_deref()?;
        if path == json_path {
            Some(DocEndpoint::Json)
        } else if self.config.docs_path.as_deref() == Some(path) {
            Some(DocEndpoint::SwaggerUi)
        } else if self.config.redoc_path.as_deref() == Some(path) {
            Some(DocEndpoint::Redoc)
        } else {
            None
        }
    }

    /// The document for the router's current revision.
    pub fn snapshot(&self, router: &Router) -> Arc<Snapshot> {
        let revision = router.revision();
        if let Some(snapshot) = self.current.load_full()
            && snapshot.revision == revision
        {
            return snapshot;
        }

        let _guard = self.rebuild.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(snapshot) = self.current.load_full()
            && snapshot.revision == revision
        {
            return snapshot;
        }

        let document = synth::synthesize(router, &self.config);
        let json = match serde_json::to_vec(&document) {
            Ok(json) => Bytes::from(json),
            Err(e) => {
                error!(cause = %e, "failed to serialize the OpenAPI document");
                Bytes::from_static(b"{}")
            }
        };
        debug!(revision, paths = document.paths.len(), "OpenAPI document rebuilt");
        let snapshot = Arc::new(Snapshot { revision, document, json });
        self.current.store(Some(snapshot.clone()));
        snapshot
    }

    pub(crate) fn swagger_ui(&self) -> String {
        let spec_url = self.config.json_path.as_deref().unwrap_or_default();
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>{title}</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js" crossorigin></script>
  <script>
    window.onload = () => {{
      window.ui = SwaggerUIBundle({{ url: '{spec_url}', dom_id: '#swagger-ui' }});
    }};
  </script>
</body>
</html>
"#,
            title = html_escape(&self.config.title),
        )
    }

    pub(crate) fn redoc(&self) -> String {
        let spec_url = self.config.json_path.as_deref().unwrap_or_default();
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>{title}</title>
</head>
<body>
  <redoc spec-url="{spec_url}"></redoc>
  <script src="https://cdn.redoc.ly/redoc/latest/bundles/redoc.standalone.js"></script>
</body>
</html>
"#,
            title = html_escape(&self.config.title),
        )
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}
