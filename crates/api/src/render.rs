use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to render template `{template}`: {reason}")]
pub struct RenderError {
    pub template: String,
    pub reason: String,
}

impl RenderError {
    pub fn new(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { template: template.into(), reason: reason.into() }
    }
}

/// An HTML template engine plugged into [`Context::render`](crate::Context::render).
#[cfg_attr(test, mockall::automock)]
pub trait Renderer: Send + Sync + 'static {
    fn render(&self, template: &str, data: &Value) -> Result<String, RenderError>;
}
