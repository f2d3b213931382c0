use thiserror::Error;

use crate::domain::plan::{Plan, ToolName};
use crate::workflow::states::PlanCandidate;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlanValidationError {
    #[error("Validation failed: The plan is not a valid JSON structure. Error: {0}")]
    NotStructured(String),
    #[error("Validation failed: The generated plan is empty or has no execution steps.")]
    Empty,
    #[error("Validation failed: Plan contains an invalid tool name: '{tool}' in step {step}")]
    InvalidTool { step: u32, tool: String },
    #[error("Validation failed: Tool parameters are missing for step {step}")]
    MissingParameters { step: u32 },
    #[error("Validation failed: {tool} step is missing `{field}` in step {step}")]
    MissingField { step: u32, tool: ToolName, field: &'static str },
}

pub fn validate_candidate(candidate: &PlanCandidate) -> Result<(), PlanValidationError> {
    match candidate {
        PlanCandidate::Parsed(plan) => validate_plan(plan),
        PlanCandidate::Unreadable { error } => Err(PlanValidationError::NotStructured(error.clone())),
    }
}

/// Checks that a plan has steps, every step names a supported tool, and the
/// parameters each tool needs are present and non-blank.
pub fn validate_plan(plan: &Plan) -> Result<(), PlanValidationError> {
    if plan.is_empty() {
        return Err(PlanValidationError::Empty);
    }

    for step in &plan.execution_plan {
        let Some(tool) = step.tool() else {
            return Err(PlanValidationError::InvalidTool {
                step: step.step,
                tool: step.tool_to_use.clone(),
            });
        };
        let Some(parameters) = &step.tool_parameters else {
            return Err(PlanValidationError::MissingParameters { step: step.step });
        };

        let (present, field) = match tool {
            ToolName::SqlGenerate | ToolName::PythonGenerate => {
                (parameters.instruction().is_some(), "instruction")
            }
            ToolName::ReportGenerate => {
                (parameters.summary().is_some(), "summary_and_recommendations")
            }
        };
        if !present {
            return Err(PlanValidationError::MissingField { step: step.step, tool, field });
        }
    }

    Ok(())
}
