//! Template engine for systemd units and drop-in files
//!
//! Uses minijinja with the default `{{ ... }}` / `{% ... %}` syntax, which
//! does not collide with the `$private_ipv4` style substitutions the boot
//! agent performs itself. Undefined variables are errors.

use minijinja::{Environment, UndefinedBehavior, Value};

use super::error::TemplateError;

/// Renders unit and file templates against a context
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create an engine with strict undefined handling
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        Self { env }
    }

    /// Render a template string with the given context
    ///
    /// # Errors
    ///
    /// Returns `TemplateError::Render` if the syntax is invalid or a
    /// referenced variable is undefined.
    pub fn render(&self, template: &str, ctx: &Value) -> Result<String, TemplateError> {
        self.env.render_str(template, ctx).map_err(TemplateError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    #[test]
    fn test_renders_variables() {
        let engine = TemplateEngine::new();
        let out = engine
            .render(
                "ExecStart=/bin/echo {{ hostname }}\n",
                &context! { hostname => "master-0.example.com" },
            )
            .unwrap();
        assert_eq!(out, "ExecStart=/bin/echo master-0.example.com\n");
    }

    #[test]
    fn test_undefined_variable_is_error() {
        let engine = TemplateEngine::new();
        let err = engine.render("{{ missing }}", &context! {}).unwrap_err();
        assert!(matches!(err, TemplateError::Render(_)));
    }

    #[test]
    fn test_agent_substitutions_pass_through() {
        let engine = TemplateEngine::new();
        let out = engine
            .render("--advertise $private_ipv4:{{ port }}", &context! { port => 2379 })
            .unwrap();
        assert_eq!(out, "--advertise $private_ipv4:2379");
    }

    #[test]
    fn test_block_lines_are_trimmed() {
        let engine = TemplateEngine::new();
        let out = engine
            .render(
                "a\n{% if edge %}\nb\n{% endif %}\nc\n",
                &context! { edge => false },
            )
            .unwrap();
        assert_eq!(out, "a\nc\n");
    }
}
