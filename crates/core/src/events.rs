//! Progress and result events emitted for one resolution run.
//!
//! Events for a run are delivered in order. Every started run ends with
//! exactly one `Complete`, `AwaitingReview`, or `Error`, unless it is cancelled.

use serde::{Deserialize, Serialize};

use crate::domain::plan::Plan;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Planner,
    Sql,
    SemanticCheck,
    Execution,
    Python,
    Report,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    Started { thread_id: String, correlation_id: String },
    TextChunk { stage: RunStage, text: String },
    StepStarted { step: usize, tool: String },
    SqlGenerated { step: usize, sql: String },
    SqlResult { step: usize, columns: Vec<String>, rows: Vec<Vec<serde_json::Value>> },
    PythonGenerated { step: usize, code: String },
    AwaitingReview { thread_id: String, plan: Plan },
    Complete { summary: Option<String> },
    Error { message: String },
}

impl StreamEvent {
    /// Name used for the server-push `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::TextChunk { .. } => "text-chunk",
            Self::StepStarted { .. } => "step-started",
            Self::SqlGenerated { .. } => "sql-generated",
            Self::SqlResult { .. } => "sql-result",
            Self::PythonGenerated { .. } => "python-generated",
            Self::AwaitingReview { .. } => "awaiting-review",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AwaitingReview { .. } | Self::Complete { .. } | Self::Error { .. })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::{RunStage, StreamEvent};

    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let chunk = StreamEvent::TextChunk { stage: RunStage::SemanticCheck, text: "ok".into() };
        let json = serde_json::to_value(&chunk).expect("serialize");

        assert_eq!(json["type"], "text-chunk");
        assert_eq!(json["stage"], "semantic_check");
        assert_eq!(chunk.name(), "text-chunk");
        assert!(!chunk.is_terminal());
    }

    #[test]
    fn terminal_events_are_flagged() {
        assert!(StreamEvent::error("boom").is_terminal());
        assert!(StreamEvent::Complete { summary: None }.is_terminal());
        assert!(!StreamEvent::Started {
            thread_id: "t".into(),
            correlation_id: "c".into()
        }
        .is_terminal());
    }
}
