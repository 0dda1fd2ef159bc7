//! Template engine seam. Rendering itself lives outside the engine; this
//! module defines the contract and a small in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;

use courier_common::error::AppError;
use courier_common::types::Channel;

/// Output of rendering a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplate {
    pub subject: Option<String>,
    pub body: String,
    pub channel: Channel,
}

#[async_trait]
pub trait TemplateEngine: Send + Sync {
    /// Render `name` with `vars`. Fails with `NotFound` for unknown templates.
    async fn render(
        &self,
        name: &str,
        vars: &HashMap<String, String>,
    ) -> Result<RenderedTemplate, AppError>;
}

/// A stored template: `{{var}}` placeholders in subject and body.
#[derive(Debug, Clone, Deserialize)]
pub struct Template {
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
}

/// Templates registered in memory with plain `{{var}}` substitution.
/// Unknown placeholders are left as written.
#[derive(Default)]
pub struct MemoryTemplateEngine {
    templates: RwLock<HashMap<String, Template>>,
}

impl MemoryTemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON object of `name -> {channel, subject, body}`.
    pub fn from_json(json: &str) -> Result<Self, AppError> {
        let templates: HashMap<String, Template> = serde_json::from_str(json)?;
        Ok(Self {
            templates: RwLock::new(templates),
        })
    }

    /// Load templates from a JSON file; see [`Self::from_json`].
    pub async fn load(path: &str) -> Result<Self, AppError> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::Config(format!("Cannot read templates from {}: {}", path, e)))?;
        let engine = Self::from_json(&json)?;
        tracing::info!(path, count = engine.len(), "Templates loaded");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }

    pub fn register(&self, name: impl Into<String>, template: Template) {
        self.templates.write().insert(name.into(), template);
    }

    /// One left-to-right pass: substituted values are never rescanned, so
    /// the output does not depend on variable order.
    fn substitute(text: &str, vars: &HashMap<String, String>) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                break;
            };
            match vars.get(&after[..end]) {
                Some(value) => {
                    out.push_str(&rest[..start]);
                    out.push_str(value);
                    rest = &after[end + 2..];
                }
                None => {
                    // Step past one brace so `{{{{name}}` still finds `{{name}}`.
                    out.push_str(&rest[..start + 1]);
                    rest = &rest[start + 1..];
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[async_trait]
impl TemplateEngine for MemoryTemplateEngine {
    async fn render(
        &self,
        name: &str,
        vars: &HashMap<String, String>,
    ) -> Result<RenderedTemplate, AppError> {
        let template = self
            .templates
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Template '{}' not found", name)))?;

        Ok(RenderedTemplate {
            subject: template
                .subject
                .as_deref()
                .map(|s| Self::substitute(s, vars)),
            body: Self::substitute(&template.body, vars),
            channel: template.channel,
        })
    }
}
