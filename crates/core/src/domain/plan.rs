use std::fmt;

use serde::{Deserialize, Serialize};

/// Tool names a plan step may route to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    SqlGenerate,
    PythonGenerate,
    ReportGenerate,
}

impl ToolName {
    pub const ALL: [ToolName; 3] =
        [ToolName::SqlGenerate, ToolName::PythonGenerate, ToolName::ReportGenerate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SqlGenerate => "sql_generate",
            Self::PythonGenerate => "python_generate",
            Self::ReportGenerate => "report_generate",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == value.trim())
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_and_recommendations: Option<String>,
}

impl ToolParameters {
    pub fn instruction(&self) -> Option<&str> {
        non_blank(self.instruction.as_deref())
    }

    pub fn summary(&self) -> Option<&str> {
        non_blank(self.summary_and_recommendations.as_deref())
    }
}

/// One unit of work in a plan.
///
/// `tool_to_use` stays a raw string so that a plan naming an unknown tool can
/// still be decoded and then rejected by validation with a precise message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step: u32,
    pub tool_to_use: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_parameters: Option<ToolParameters>,
}

impl ExecutionStep {
    pub fn tool(&self) -> Option<ToolName> {
        ToolName::parse(&self.tool_to_use)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub thought_process: String,
    #[serde(default)]
    pub execution_plan: Vec<ExecutionStep>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.execution_plan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.execution_plan.is_empty()
    }

    /// Returns the step at a one-based position.
    pub fn step(&self, position: usize) -> Option<&ExecutionStep> {
        position.checked_sub(1).and_then(|index| self.execution_plan.get(index))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|text| !text.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::{Plan, ToolName};

    #[test]
    fn plan_decodes_wire_shape_and_keeps_unknown_tools() {
        let plan: Plan = serde_json::from_str(
            r#"{
                "thought_process": "count orders then summarize",
                "execution_plan": [
                    {"step": 1, "tool_to_use": "sql_generate", "tool_parameters": {"instruction": "count orders"}},
                    {"step": 2, "tool_to_use": "unknown_tool"}
                ]
            }"#,
        )
        .expect("plan should decode");

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.step(1).and_then(|step| step.tool()), Some(ToolName::SqlGenerate));
        assert_eq!(plan.step(2).and_then(|step| step.tool()), None);
        assert!(plan.step(0).is_none());
        assert!(plan.step(3).is_none());
    }

    #[test]
    fn blank_parameters_are_treated_as_missing() {
        let plan: Plan = serde_json::from_str(
            r#"{"execution_plan": [{"step": 1, "tool_to_use": "report_generate",
                "tool_parameters": {"summary_and_recommendations": "   "}}]}"#,
        )
        .expect("plan should decode");

        let parameters = plan.execution_plan[0].tool_parameters.clone().unwrap_or_default();
        assert_eq!(parameters.summary(), None);
    }
}
