pub mod engine;
pub mod states;
pub mod validator;

pub use engine::{PlanWorkflow, WorkflowTransitionError};
pub use states::{
    PlanCandidate, RunState, TerminationReason, TransitionOutcome, WorkflowAction, WorkflowEvent,
    WorkflowLimits, WorkflowState,
};
pub use validator::{validate_candidate, validate_plan, PlanValidationError};
