use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use dataagent_core::domain::schema::SchemaDto;
use dataagent_core::schema_prompt::{render_schema_prompt, SchemaCompressionOptions};

use crate::commands::CommandResult;
use crate::PromptMode;

/// Prints the schema section the SQL generation prompt would carry.
pub fn run(schema_path: &Path, instruction: Option<&str>, mode: PromptMode) -> CommandResult {
    let schema = match load_schema(schema_path) {
        Ok(schema) => schema,
        Err(error) => {
            return CommandResult::failure("schema-prompt", "schema_input", format!("{error:#}"), 2)
        }
    };

    let options = match options_for(mode, instruction) {
        Some(options) => options,
        None => {
            return CommandResult::failure(
                "schema-prompt",
                "invalid_argument",
                "--instruction is required for smart and full modes",
                2,
            )
        }
    };

    CommandResult { exit_code: 0, output: render_schema_prompt(&schema, &options) }
}

fn load_schema(path: &Path) -> Result<SchemaDto> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("could not read schema file `{}`", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("could not parse schema file `{}`", path.display()))
}

fn options_for(mode: PromptMode, instruction: Option<&str>) -> Option<SchemaCompressionOptions> {
    let instruction = instruction.map(str::trim).filter(|value| !value.is_empty());
    match mode {
        PromptMode::Auto => Some(SchemaCompressionOptions::for_instruction(instruction)),
        PromptMode::None => Some(SchemaCompressionOptions::none()),
        PromptMode::Smart => instruction.map(SchemaCompressionOptions::smart),
        PromptMode::Full => instruction.map(SchemaCompressionOptions::full),
    }
}

#[cfg(test)]
mod tests {
    use super::options_for;
    use crate::PromptMode;

    #[test]
    fn smart_modes_need_an_instruction() {
        assert!(options_for(PromptMode::Smart, None).is_none());
        assert!(options_for(PromptMode::Full, Some("   ")).is_none());

        let smart = options_for(PromptMode::Smart, Some("orders per customer")).expect("smart");
        assert!(smart.enable_smart_filter);
        assert_eq!(smart.execution_description.as_deref(), Some("orders per customer"));

        let auto = options_for(PromptMode::Auto, None).expect("auto");
        assert!(!auto.enable_smart_filter);
    }
}
