//! Reply templates — YAML-defined canned responses.
//!
//! Loaded once at startup from `templates.yml`. The `default_reply`
//! template is the fallback used when LLM generation fails; a built-in
//! copy is used when the file itself is missing or malformed, so the
//! daemon can always produce a reply.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

/// How much of the original message the `{message_preview}` placeholder gets.
const PREVIEW_CHARS: usize = 100;

/// A single reply template.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyTemplate {
    pub subject: String,
    pub body: String,
}

/// Named reply templates.
#[derive(Debug, Clone)]
pub struct Templates {
    templates: HashMap<String, ReplyTemplate>,
}

impl Templates {
    /// Load templates from a YAML file, falling back to the built-in set on
    /// any error.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::try_load(path) {
            Ok(templates) => templates,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to load templates, using built-in defaults"
                );
                Self::builtin()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let templates: HashMap<String, ReplyTemplate> =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(Self { templates })
    }

    /// The built-in template set.
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            "default_reply".to_string(),
            ReplyTemplate {
                subject: "Re: {subject}".to_string(),
                body: "Thank you for your email. We have received your message \
                       and will respond shortly.\n\nYour message:\n{message_preview}..."
                    .to_string(),
            },
        );
        Self { templates }
    }

    pub fn get(&self, name: &str) -> Option<&ReplyTemplate> {
        self.templates.get(name)
    }

    /// Render the `default_reply` body for the given email.
    pub fn render_default(&self, subject: &str, message: &str) -> String {
        let template = match self.get("default_reply") {
            Some(t) => t.clone(),
            None => {
                // A loaded file may omit default_reply entirely.
                Self::builtin()
                    .get("default_reply")
                    .cloned()
                    .unwrap_or(ReplyTemplate {
                        subject: String::new(),
                        body: String::new(),
                    })
            }
        };

        let preview: String = message.chars().take(PREVIEW_CHARS).collect();
        template
            .body
            .replace("{subject}", subject)
            .replace("{message_preview}", &preview)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_has_default_reply() {
        let templates = Templates::builtin();
        assert!(templates.get("default_reply").is_some());
    }

    #[test]
    fn render_substitutes_placeholders() {
        let templates = Templates::builtin();
        let body = templates.render_default("Order issue", "My order never arrived");
        assert!(body.contains("My order never arrived"));
        assert!(!body.contains("{message_preview}"));
    }

    #[test]
    fn render_truncates_preview() {
        let templates = Templates::builtin();
        let long_message = "x".repeat(500);
        let body = templates.render_default("Hi", &long_message);
        assert!(body.contains(&"x".repeat(100)));
        assert!(!body.contains(&"x".repeat(101)));
    }

    #[test]
    fn load_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "default_reply:\n  subject: \"Re: {{subject}}\"\n  body: \"Custom reply for {{subject}}\"\nescalation:\n  subject: \"Escalated\"\n  body: \"A human will follow up.\""
        )
        .unwrap();

        let templates = Templates::load(file.path());
        assert!(templates.get("escalation").is_some());
        let body = templates.render_default("Refund", "please refund me");
        assert_eq!(body, "Custom reply for Refund");
    }

    #[test]
    fn missing_file_falls_back_to_builtin() {
        let templates = Templates::load("/nonexistent/templates.yml");
        assert!(templates.get("default_reply").is_some());
    }

    #[test]
    fn malformed_yaml_falls_back_to_builtin() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, ": not valid yaml [").unwrap();

        let templates = Templates::load(file.path());
        assert!(templates.get("default_reply").is_some());
    }
}
