use serde::{Deserialize, Serialize};

use crate::domain::plan::{Plan, ToolName};
use crate::domain::retry::RetryContext;
use crate::sql_retry::{BudgetExhausted, RetryBudget, SqlRetryClassifier};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Planning,
    Validating,
    Repairing,
    HumanFeedback,
    StepDispatch,
    SqlGenerate,
    SemanticCheck,
    SqlExecute,
    PythonGenerate,
    ReportGenerate,
    Terminated(TerminationReason),
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    Completed,
    PlanRepairLimit { attempts: u32, max_attempts: u32, last_error: String },
    SqlRetryBudget(BudgetExhausted),
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowEvent {
    PlanProduced(PlanCandidate),
    ValidationPassed,
    ValidationFailed { reason: String },
    ReviewApproved,
    ReviewRejected { feedback: String },
    DispatchStep,
    SqlGenerated { sql: String },
    SqlGenerationFailed(RetryContext),
    SemanticPassed,
    SemanticFailed(RetryContext),
    SqlExecuted,
    SqlExecutionFailed(RetryContext),
    PythonGenerated,
    ReportGenerated,
    CancelRequested,
}

/// Planner output as handed to validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanCandidate {
    Parsed(Plan),
    Unreadable { error: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowAction {
    GeneratePlan { feedback: Option<String> },
    ValidatePlan,
    RequestHumanReview,
    GenerateSql { step: usize, retry: Option<RetryContext> },
    CheckSemanticConsistency,
    ExecuteSql,
    GeneratePython { step: usize },
    GenerateReport,
    Finish,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: WorkflowState,
    pub to: WorkflowState,
    pub event: WorkflowEvent,
    pub actions: Vec<WorkflowAction>,
}

/// Per-run limits. Taken from configuration when a run starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowLimits {
    pub max_plan_repair_attempts: u32,
    pub retry_budget: RetryBudget,
    pub human_review_enabled: bool,
}

impl Default for WorkflowLimits {
    fn default() -> Self {
        Self {
            max_plan_repair_attempts: 2,
            retry_budget: RetryBudget::default(),
            human_review_enabled: false,
        }
    }
}

/// Mutable state of one resolution run. Counters start at zero for every
/// new question and never decrease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub state: WorkflowState,
    pub candidate: Option<PlanCandidate>,
    pub current_step: usize,
    pub validation_passed: bool,
    pub repair_count: u32,
    pub nl2sql_only: bool,
    pub retry_context: Option<RetryContext>,
    pub generated_sql: Option<String>,
    pub classifier: SqlRetryClassifier,
}

impl RunState {
    pub fn new(limits: &WorkflowLimits, nl2sql_only: bool) -> Self {
        Self {
            state: WorkflowState::Planning,
            candidate: None,
            current_step: 1,
            validation_passed: false,
            repair_count: 0,
            nl2sql_only,
            retry_context: None,
            generated_sql: None,
            classifier: SqlRetryClassifier::new(limits.retry_budget),
        }
    }

    pub fn plan(&self) -> Option<&Plan> {
        match &self.candidate {
            Some(PlanCandidate::Parsed(plan)) => Some(plan),
            _ => None,
        }
    }

    pub fn current_tool(&self) -> Option<ToolName> {
        self.plan().and_then(|plan| plan.step(self.current_step)).and_then(|step| step.tool())
    }
}
