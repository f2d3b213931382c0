//! Named prompt templates.
//!
//! Built-in templates are compiled into the binary. A prompt directory, taken
//! from configuration or `DATAAGENT_PROMPT_DIR`, may override any of them with
//! a `<name>.tera` file. Templates are loaded on first use and cached until
//! [`PromptRegistry::reload`] or [`PromptRegistry::clear_cache`].

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use dataagent_core::config::AgentConfig;
use tera::{Context, Tera};
use thiserror::Error;
use tracing::{debug, info};

pub const PROMPT_DIR_ENV: &str = "DATAAGENT_PROMPT_DIR";

pub const PLANNER: &str = "planner";
pub const SQL_GENERATE: &str = "sql-generate";
pub const SEMANTIC_CHECK: &str = "semantic-check";
pub const PYTHON_GENERATE: &str = "python-generate";
pub const REPORT_GENERATE: &str = "report-generate";
pub const JSON_FIX: &str = "json-fix";

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (PLANNER, include_str!("../prompts/planner.tera")),
    (SQL_GENERATE, include_str!("../prompts/sql-generate.tera")),
    (SEMANTIC_CHECK, include_str!("../prompts/semantic-check.tera")),
    (PYTHON_GENERATE, include_str!("../prompts/python-generate.tera")),
    (REPORT_GENERATE, include_str!("../prompts/report-generate.tera")),
    (JSON_FIX, include_str!("../prompts/json-fix.tera")),
];

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unknown prompt template `{0}`")]
    Unknown(String),
    #[error("failed to read prompt template {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("prompt template `{name}` is invalid: {source}")]
    Template { name: String, source: tera::Error },
    #[error("prompt cache lock poisoned")]
    Poisoned,
}

pub struct PromptRegistry {
    directory: Option<PathBuf>,
    templates: RwLock<Tera>,
}

impl PromptRegistry {
    /// Registry that only serves the compiled-in templates.
    pub fn builtin() -> Self {
        Self { directory: None, templates: RwLock::new(Tera::default()) }
    }

    /// Explicit directory first, then `DATAAGENT_PROMPT_DIR`, then built-ins only.
    pub fn new(explicit_dir: Option<PathBuf>) -> Self {
        let directory = explicit_dir.or_else(|| {
            env::var(PROMPT_DIR_ENV)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from)
        });
        if let Some(directory) = &directory {
            info!(
                event_name = "prompts.directory",
                directory = %directory.display(),
                "prompt overrides enabled"
            );
        }
        Self { directory, templates: RwLock::new(Tera::default()) }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.prompt_dir.clone())
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn render(&self, name: &str, context: &Context) -> Result<String, PromptError> {
        {
            let templates = self.templates.read().map_err(|_| PromptError::Poisoned)?;
            if has_template(&templates, name) {
                return render_loaded(&templates, name, context);
            }
        }

        let mut templates = self.templates.write().map_err(|_| PromptError::Poisoned)?;
        if !has_template(&templates, name) {
            let source = self.load_source(name)?;
            templates
                .add_raw_template(name, &source)
                .map_err(|source| PromptError::Template { name: name.to_string(), source })?;
            debug!(event_name = "prompts.loaded", template = name, "prompt template cached");
        }
        render_loaded(&templates, name, context)
    }

    /// Drops the cache and eagerly loads every known template again.
    pub fn reload(&self) -> Result<usize, PromptError> {
        let mut fresh = Tera::default();
        for (name, _) in BUILTIN_TEMPLATES {
            let source = self.load_source(name)?;
            fresh
                .add_raw_template(name, &source)
                .map_err(|source| PromptError::Template { name: name.to_string(), source })?;
        }
        let count = BUILTIN_TEMPLATES.len();

        let mut templates = self.templates.write().map_err(|_| PromptError::Poisoned)?;
        *templates = fresh;
        info!(event_name = "prompts.reloaded", count, "prompt templates reloaded");
        Ok(count)
    }

    pub fn clear_cache(&self) {
        match self.templates.write() {
            Ok(mut templates) => *templates = Tera::default(),
            Err(poisoned) => *poisoned.into_inner() = Tera::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.templates
            .read()
            .map(|templates| templates.get_template_names().count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load_source(&self, name: &str) -> Result<String, PromptError> {
        if let Some(directory) = &self.directory {
            let path = directory.join(format!("{name}.tera"));
            if path.is_file() {
                return fs::read_to_string(&path).map_err(|source| PromptError::Read { path, source });
            }
        }

        BUILTIN_TEMPLATES
            .iter()
            .find(|(builtin, _)| *builtin == name)
            .map(|(_, source)| source.to_string())
            .ok_or_else(|| PromptError::Unknown(name.to_string()))
    }
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn has_template(templates: &Tera, name: &str) -> bool {
    templates.get_template_names().any(|loaded| loaded == name)
}

fn render_loaded(templates: &Tera, name: &str, context: &Context) -> Result<String, PromptError> {
    templates
        .render(name, context)
        .map_err(|source| PromptError::Template { name: name.to_string(), source })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;
    use tera::Context;

    use super::{PromptError, PromptRegistry, JSON_FIX, PLANNER};

    fn planner_context() -> Context {
        let mut context = Context::new();
        context.insert("schema", "orders(id, total)");
        context.insert("history", "(none)");
        context.insert("feedback", "");
        context.insert("question", "how many orders?");
        context
    }

    #[test]
    fn builtin_templates_render_and_are_cached() {
        let registry = PromptRegistry::builtin();
        assert!(registry.is_empty());

        let prompt = registry.render(PLANNER, &planner_context()).expect("planner renders");

        assert!(prompt.contains("how many orders?"));
        assert!(prompt.contains("orders(id, total)"));
        assert!(!prompt.contains("previous plan was rejected"));
        assert_eq!(registry.len(), 1);

        registry.clear_cache();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn directory_overrides_builtin_and_reload_picks_up_edits() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("json-fix.tera");
        fs::write(&path, "fix {{ content }}").expect("write override");
        let registry = PromptRegistry::new(Some(dir.path().to_path_buf()));

        let mut context = Context::new();
        context.insert("content", "{");
        context.insert("error", "EOF");
        assert_eq!(registry.render(JSON_FIX, &context).expect("render"), "fix {");

        fs::write(&path, "repair {{ content }} ({{ error }})").expect("rewrite override");
        assert_eq!(registry.render(JSON_FIX, &context).expect("cached render"), "fix {");

        assert_eq!(registry.reload().expect("reload"), 6);
        assert_eq!(registry.render(JSON_FIX, &context).expect("render"), "repair { (EOF)");
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn unknown_template_is_an_error() {
        let registry = PromptRegistry::builtin();
        let error = registry.render("does-not-exist", &Context::new()).expect_err("unknown");
        assert!(matches!(error, PromptError::Unknown(name) if name == "does-not-exist"));
    }

    #[test]
    fn planner_includes_feedback_when_present() {
        let registry = PromptRegistry::builtin();
        let mut context = planner_context();
        context.insert("feedback", "step 2 uses an unknown tool");

        let prompt = registry.render(PLANNER, &context).expect("render");
        assert!(prompt.contains("previous plan was rejected"));
        assert!(prompt.contains("step 2 uses an unknown tool"));
    }
}
