//! Prompt rendering: Jinja2-style templates over a unit's namespace.

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;

/// Render a template against a unit's fields. The whole unit object is
/// the template context, so `{{ npc.name }}` and `{{ unit_id }}` both
/// resolve.
pub fn render_prompt(template_src: &str, unit: &JsonValue) -> Result<String> {
    let context = tera::Context::from_serialize(unit)
        .context("Unit is not usable as a template context")?;
    tera::Tera::one_off(template_src, &context, false).context("Template rendering failed")
}
