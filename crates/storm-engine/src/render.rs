use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("template rendering failed: {0}")]
pub struct RenderError(pub String);

/// The template collaborator seam.
///
/// The coordinator never interprets procedure content: it hands the raw
/// string, the serialized target resource and the merged params to the
/// renderer and stores whatever comes back on the job. The real renderer
/// lives outside the coordinator; [`PlainRenderer`] is the identity
/// implementation used when no collaborator is wired in.
pub trait TemplateRenderer: Send + Sync + 'static {
    fn render(&self, content: &str, target: &Value, params: &Value) -> Result<String, RenderError>;
}

/// Stores procedure content on the job untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainRenderer;

impl TemplateRenderer for PlainRenderer {
    fn render(&self, content: &str, _target: &Value, _params: &Value) -> Result<String, RenderError> {
        Ok(content.to_string())
    }
}
