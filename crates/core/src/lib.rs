//! Query-resolution core: plan workflow, classified SQL retries, schema
//! prompt compression, resilient structured-output parsing, and the
//! configuration and error types shared by the other crates.

pub mod backoff;
pub mod config;
pub mod domain;
pub mod errors;
pub mod events;
pub mod schema_prompt;
pub mod semantic_check;
pub mod sql_retry;
pub mod structured_output;
pub mod text;
pub mod workflow;

pub use backoff::BackoffPolicy;
pub use domain::plan::{ExecutionStep, Plan, ToolName, ToolParameters};
pub use domain::retry::{RetryContext, SqlErrorType};
pub use domain::schema::{ColumnDto, ForeignKeyRef, SchemaDto, TableDto};
pub use domain::turn::{ConversationTurn, ThreadId};
pub use errors::{DomainError, InterfaceError};
pub use events::{RunStage, StreamEvent};
pub use schema_prompt::{render_schema_prompt, SchemaCompressionOptions};
pub use semantic_check::{detect_semantic_verdict, SemanticVerdict};
pub use sql_retry::{BudgetExhausted, RetryBudget, RetryDecision, SqlRetryClassifier};
pub use structured_output::{
    FixerError, OutputFixer, StructuredOutputError, StructuredOutputParser,
};
pub use workflow::{
    PlanWorkflow, RunState, TerminationReason, WorkflowAction, WorkflowEvent, WorkflowLimits,
    WorkflowState,
};
