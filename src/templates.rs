//! Named prompt templates with `{{ key }}` placeholders.

use std::collections::HashMap;
use std::path::Path;
use tracing::info;

pub const PLAN: &str = "plan";
pub const OBSERVE: &str = "observe";

const PLAN_TEMPLATE: &str = "\
You are {{ name }}, a resident of a small town.
Personality: {{ traits }}
Today's goal: {{ daily_goal }}

Write a short plan for your day in three or four sentences. Mention the places \
in town you intend to visit (plaza, stage, cafe, park, library, market).";

const OBSERVE_TEMPLATE: &str = "\
You are {{ name }}. Personality: {{ traits }}
It is {{ time_label }}. You are at the {{ current_zone }}.
Happening in town right now: {{ current_event }}

Your most recent memories:
{{ recent_memories }}

Reply with exactly one line: a single emoji in square brackets describing your \
action, followed by one sentence of what you think and do next. \
Example: [☕] I'll grab a coffee at the cafe before the crowd arrives.";

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown template '{0}'")]
    Unknown(String),
    #[error("failed to read template: {0}")]
    Io(#[from] std::io::Error),
}

/// Prompt template registry
#[derive(Debug, Clone)]
pub struct Templates {
    templates: HashMap<String, String>,
}

impl Templates {
    /// Built-in plan and observe prompts
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        templates.insert(PLAN.to_string(), PLAN_TEMPLATE.to_string());
        templates.insert(OBSERVE.to_string(), OBSERVE_TEMPLATE.to_string());
        Self { templates }
    }

    /// Built-ins, overridden by any `<name>.txt` found in `dir`
    pub fn load_dir(dir: &Path) -> Result<Self, TemplateError> {
        let mut templates = Self::builtin();
        for name in [PLAN, OBSERVE] {
            let path = dir.join(format!("{}.txt", name));
            if path.exists() {
                let body = std::fs::read_to_string(&path)?;
                info!(template = name, path = %path.display(), "loaded prompt template");
                templates.insert(name, body);
            }
        }
        Ok(templates)
    }

    pub fn insert(&mut self, name: &str, body: impl Into<String>) {
        self.templates.insert(name.to_string(), body.into());
    }

    /// Render a named template. Placeholders without a binding render empty.
    pub fn render(&self, name: &str, bindings: &[(&str, &str)]) -> Result<String, TemplateError> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| TemplateError::Unknown(name.to_string()))?;
        Ok(substitute(template, bindings))
    }
}

#[cfg(test)]
impl Templates {
    pub(crate) fn without(mut self, name: &str) -> Self {
        self.templates.remove(name);
        self
    }
}

impl Default for Templates {
    fn default() -> Self {
        Self::builtin()
    }
}

fn substitute(template: &str, bindings: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some((_, value)) = bindings.iter().find(|(k, _)| *k == key) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated placeholder, keep it verbatim
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
