//! Query resolution runtime.
//!
//! This crate drives one natural-language question through the plan workflow
//! defined in `dataagent-core`:
//! 1. **Planning** (`runtime`) - stream a plan from the model and parse it
//! 2. **Validation and repair** - handled by the core `PlanWorkflow`
//! 3. **Step execution** (`tools`) - generate, check, and run SQL against the data source
//! 4. **Reporting** - stream a summary of the collected results
//!
//! # Key Types
//!
//! - `AgentRuntime` - spawns a task per run and streams `StreamEvent`s back
//! - `TextGenerator` - pluggable trait for the model backend
//! - `MultiTurnContextManager` - bounded per-thread history backed by the turn store
//! - `PromptRegistry` - named prompt templates with an override directory
//!
//! The model only writes text. Whether a plan is valid, whether SQL is
//! retried, and when a run ends are decided by the core state machine.

pub mod conversation;
pub mod llm;
pub mod prompts;
pub mod retry;
pub mod runtime;
pub mod tools;

pub use conversation::{ContextError, ContextSettings, MultiTurnContextManager, NO_HISTORY};
pub use llm::{LlmOutputFixer, TextGenerator, TextStream};
pub use prompts::{PromptError, PromptRegistry};
pub use runtime::{
    AgentRuntime, HumanFeedback, RunEvents, RunHandle, RunRequest, RuntimeComponents, RuntimeSettings,
};
pub use tools::{QueryError, QueryRows, SchemaSource, SqlExecutor, StaticSchemaSource};
