use thiserror::Error;
use tracing::{info, warn};

use crate::domain::plan::ToolName;
use crate::sql_retry::RetryDecision;
use crate::workflow::states::{
    PlanCandidate, RunState, TerminationReason, TransitionOutcome, WorkflowAction, WorkflowEvent,
    WorkflowLimits, WorkflowState,
};
use crate::workflow::validator::validate_candidate;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowTransitionError {
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: WorkflowState, event: WorkflowEvent },
    #[error("Plan validation failed before execution: {reason}")]
    ExecutionRefused { reason: String },
}

/// Deterministic plan execution state machine.
///
/// `apply` is the only place a run's state changes. It mutates the run's
/// counters and step pointer and reports which stage runs next.
#[derive(Clone, Debug, Default)]
pub struct PlanWorkflow {
    limits: WorkflowLimits,
}

impl PlanWorkflow {
    pub fn new(limits: WorkflowLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &WorkflowLimits {
        &self.limits
    }

    pub fn start_run(&self, nl2sql_only: bool) -> RunState {
        RunState::new(&self.limits, nl2sql_only)
    }

    /// Validates the candidate held by a run in `Validating` and applies the verdict.
    pub fn validate(&self, run: &mut RunState) -> Result<TransitionOutcome, WorkflowTransitionError> {
        let verdict = match &run.candidate {
            Some(candidate) => validate_candidate(candidate),
            None => validate_candidate(&PlanCandidate::Unreadable {
                error: "planner produced no output".to_string(),
            }),
        };

        let event = match verdict {
            Ok(()) => WorkflowEvent::ValidationPassed,
            Err(error) => WorkflowEvent::ValidationFailed { reason: error.to_string() },
        };
        self.apply(run, event)
    }

    pub fn apply(
        &self,
        run: &mut RunState,
        event: WorkflowEvent,
    ) -> Result<TransitionOutcome, WorkflowTransitionError> {
        let from = run.state.clone();
        let (to, actions) = self.transition(run, &event)?;

        info!(
            event_name = "workflow.transition",
            from = ?from,
            to = ?to,
            step = run.current_step,
            repair_count = run.repair_count,
            "workflow transition applied"
        );

        run.state = to.clone();
        Ok(TransitionOutcome { from, to, event, actions })
    }

    fn transition(
        &self,
        run: &mut RunState,
        event: &WorkflowEvent,
    ) -> Result<(WorkflowState, Vec<WorkflowAction>), WorkflowTransitionError> {
        use WorkflowAction::{
            CheckSemanticConsistency, ExecuteSql, Finish, GeneratePlan, GenerateSql,
            RequestHumanReview, ValidatePlan,
        };
        use WorkflowEvent::{
            CancelRequested, DispatchStep, PlanProduced, PythonGenerated, ReportGenerated,
            ReviewApproved, ReviewRejected, SemanticFailed, SemanticPassed, SqlExecuted,
            SqlExecutionFailed, SqlGenerated, SqlGenerationFailed, ValidationFailed,
            ValidationPassed,
        };
        use WorkflowState::{
            HumanFeedback, Planning, PythonGenerate, ReportGenerate, Repairing, SemanticCheck,
            SqlExecute, SqlGenerate, StepDispatch, Terminated, Validating,
        };

        let current = run.state.clone();
        let next = match (&current, event) {
            (Terminated(_), _) => return Err(self.invalid(run, event)),
            (_, CancelRequested) => (Terminated(TerminationReason::Cancelled), Vec::new()),

            (Planning, PlanProduced(candidate)) | (Repairing, PlanProduced(candidate)) => {
                run.candidate = Some(candidate.clone());
                run.validation_passed = false;
                (Validating, vec![ValidatePlan])
            }
            (Validating, ValidationPassed) => {
                run.validation_passed = true;
                run.current_step = 1;
                if self.limits.human_review_enabled {
                    (HumanFeedback, vec![RequestHumanReview])
                } else {
                    (StepDispatch, Vec::new())
                }
            }
            (Validating, ValidationFailed { reason }) => {
                run.validation_passed = false;
                run.repair_count += 1;
                if run.repair_count > self.limits.max_plan_repair_attempts {
                    warn!(
                        event_name = "workflow.plan_repair.exhausted",
                        repair_count = run.repair_count,
                        max_attempts = self.limits.max_plan_repair_attempts,
                        "plan repair limit reached"
                    );
                    (
                        Terminated(TerminationReason::PlanRepairLimit {
                            attempts: run.repair_count,
                            max_attempts: self.limits.max_plan_repair_attempts,
                            last_error: reason.clone(),
                        }),
                        vec![Finish],
                    )
                } else {
                    (Repairing, vec![GeneratePlan { feedback: Some(reason.clone()) }])
                }
            }
            (HumanFeedback, ReviewApproved) => (StepDispatch, Vec::new()),
            (HumanFeedback, ReviewRejected { feedback }) => {
                run.validation_passed = false;
                run.candidate = None;
                (Planning, vec![GeneratePlan { feedback: Some(feedback.clone()) }])
            }

            (StepDispatch, DispatchStep) => self.dispatch(run)?,

            (SqlGenerate, SqlGenerated { sql }) => {
                run.generated_sql = Some(sql.clone());
                (SemanticCheck, vec![CheckSemanticConsistency])
            }
            (SqlGenerate, SqlGenerationFailed(context))
            | (SemanticCheck, SemanticFailed(context))
            | (SqlExecute, SqlExecutionFailed(context)) => {
                match run.classifier.record_failure(context.clone()) {
                    RetryDecision::Retry(retry) => {
                        run.retry_context = Some(retry.clone());
                        (
                            SqlGenerate,
                            vec![GenerateSql { step: run.current_step, retry: Some(retry) }],
                        )
                    }
                    RetryDecision::EndRun(exhausted) => {
                        (Terminated(TerminationReason::SqlRetryBudget(exhausted)), vec![Finish])
                    }
                }
            }
            (SemanticCheck, SemanticPassed) => (SqlExecute, vec![ExecuteSql]),
            (SqlExecute, SqlExecuted) | (PythonGenerate, PythonGenerated) => {
                run.current_step += 1;
                run.retry_context = None;
                (StepDispatch, Vec::new())
            }
            (ReportGenerate, ReportGenerated) => {
                (Terminated(TerminationReason::Completed), vec![Finish])
            }

            _ => return Err(self.invalid(run, event)),
        };

        Ok(next)
    }

    fn dispatch(
        &self,
        run: &mut RunState,
    ) -> Result<(WorkflowState, Vec<WorkflowAction>), WorkflowTransitionError> {
        if !run.validation_passed {
            return Err(WorkflowTransitionError::ExecutionRefused {
                reason: "plan has not passed validation".to_string(),
            });
        }
        let Some(plan) = run.plan() else {
            return Err(WorkflowTransitionError::ExecutionRefused {
                reason: "no validated plan is available".to_string(),
            });
        };

        if run.current_step > plan.len() {
            run.current_step = 1;
            return Ok(if run.nl2sql_only {
                (WorkflowState::Terminated(TerminationReason::Completed), vec![WorkflowAction::Finish])
            } else {
                (WorkflowState::ReportGenerate, vec![WorkflowAction::GenerateReport])
            });
        }

        let step = run.current_step;
        match run.current_tool() {
            Some(ToolName::SqlGenerate) => {
                run.retry_context = None;
                run.generated_sql = None;
                Ok((
                    WorkflowState::SqlGenerate,
                    vec![WorkflowAction::GenerateSql { step, retry: None }],
                ))
            }
            Some(ToolName::PythonGenerate) => Ok((
                WorkflowState::PythonGenerate,
                vec![WorkflowAction::GeneratePython { step }],
            )),
            Some(ToolName::ReportGenerate) => {
                Ok((WorkflowState::ReportGenerate, vec![WorkflowAction::GenerateReport]))
            }
            None => Err(WorkflowTransitionError::ExecutionRefused {
                reason: format!("step {step} names an unsupported tool"),
            }),
        }
    }

    fn invalid(&self, run: &RunState, event: &WorkflowEvent) -> WorkflowTransitionError {
        WorkflowTransitionError::InvalidTransition { state: run.state.clone(), event: event.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::{PlanWorkflow, WorkflowTransitionError};
    use crate::domain::plan::{ExecutionStep, Plan, ToolParameters};
    use crate::domain::retry::{RetryContext, SqlErrorType};
    use crate::workflow::states::{
        PlanCandidate, TerminationReason, WorkflowAction, WorkflowEvent, WorkflowLimits,
        WorkflowState,
    };

    fn sql_step(number: u32, instruction: &str) -> ExecutionStep {
        ExecutionStep {
            step: number,
            tool_to_use: "sql_generate".to_string(),
            tool_parameters: Some(ToolParameters {
                instruction: Some(instruction.to_string()),
                ..ToolParameters::default()
            }),
        }
    }

    fn report_step(number: u32) -> ExecutionStep {
        ExecutionStep {
            step: number,
            tool_to_use: "report_generate".to_string(),
            tool_parameters: Some(ToolParameters {
                summary_and_recommendations: Some("summarize".to_string()),
                ..ToolParameters::default()
            }),
        }
    }

    fn plan(steps: Vec<ExecutionStep>) -> PlanCandidate {
        PlanCandidate::Parsed(Plan { thought_process: String::new(), execution_plan: steps })
    }

    fn bad_plan() -> PlanCandidate {
        plan(vec![ExecutionStep {
            step: 1,
            tool_to_use: "unknown_tool".to_string(),
            tool_parameters: None,
        }])
    }

    #[test]
    fn sql_then_report_happy_path() {
        let workflow = PlanWorkflow::default();
        let mut run = workflow.start_run(false);

        workflow
            .apply(&mut run, WorkflowEvent::PlanProduced(plan(vec![sql_step(1, "count"), report_step(2)])))
            .expect("planning -> validating");
        let validated = workflow.validate(&mut run).expect("validating -> dispatch");
        assert_eq!(validated.to, WorkflowState::StepDispatch);

        let dispatched = workflow.apply(&mut run, WorkflowEvent::DispatchStep).expect("dispatch sql");
        assert_eq!(dispatched.to, WorkflowState::SqlGenerate);
        assert_eq!(dispatched.actions, vec![WorkflowAction::GenerateSql { step: 1, retry: None }]);

        workflow
            .apply(&mut run, WorkflowEvent::SqlGenerated { sql: "SELECT COUNT(*) FROM orders".into() })
            .expect("sql -> semantic");
        workflow.apply(&mut run, WorkflowEvent::SemanticPassed).expect("semantic -> execute");
        workflow.apply(&mut run, WorkflowEvent::SqlExecuted).expect("execute -> dispatch");
        assert_eq!(run.current_step, 2);

        let report = workflow.apply(&mut run, WorkflowEvent::DispatchStep).expect("dispatch report");
        assert_eq!(report.to, WorkflowState::ReportGenerate);
        let done = workflow.apply(&mut run, WorkflowEvent::ReportGenerated).expect("report -> done");
        assert_eq!(done.to, WorkflowState::Terminated(TerminationReason::Completed));
        assert!(run.state.is_terminal());
    }

    #[test]
    fn unknown_tool_counts_one_repair() {
        let workflow = PlanWorkflow::default();
        let mut run = workflow.start_run(false);

        workflow.apply(&mut run, WorkflowEvent::PlanProduced(bad_plan())).expect("produce");
        let outcome = workflow.validate(&mut run).expect("validation failure routes to repair");

        assert_eq!(run.repair_count, 1);
        assert_eq!(outcome.to, WorkflowState::Repairing);
        let [WorkflowAction::GeneratePlan { feedback: Some(feedback) }] = outcome.actions.as_slice()
        else {
            panic!("repair must regenerate the plan with feedback");
        };
        assert!(feedback.contains("'unknown_tool'"));
    }

    #[test]
    fn repair_limit_terminates_on_third_failure() {
        let workflow = PlanWorkflow::default();
        let mut run = workflow.start_run(false);

        for attempt in 1..=3 {
            workflow.apply(&mut run, WorkflowEvent::PlanProduced(bad_plan())).expect("produce");
            let outcome = workflow.validate(&mut run).expect("validate");
            if attempt < 3 {
                assert_eq!(outcome.to, WorkflowState::Repairing);
            } else {
                assert!(matches!(
                    outcome.to,
                    WorkflowState::Terminated(TerminationReason::PlanRepairLimit {
                        attempts: 3,
                        max_attempts: 2,
                        ..
                    })
                ));
            }
        }
    }

    #[test]
    fn three_execution_failures_end_the_run() {
        let workflow = PlanWorkflow::default();
        let mut run = workflow.start_run(true);
        workflow
            .apply(&mut run, WorkflowEvent::PlanProduced(plan(vec![sql_step(1, "count")])))
            .expect("produce");
        workflow.validate(&mut run).expect("validate");
        workflow.apply(&mut run, WorkflowEvent::DispatchStep).expect("dispatch");

        let mut last = None;
        for _ in 0..3 {
            workflow
                .apply(&mut run, WorkflowEvent::SqlGenerated { sql: "SELECT bogus FROM t".into() })
                .expect("generated");
            workflow.apply(&mut run, WorkflowEvent::SemanticPassed).expect("semantic");
            last = Some(
                workflow
                    .apply(
                        &mut run,
                        WorkflowEvent::SqlExecutionFailed(RetryContext::execution("no such column")),
                    )
                    .expect("execution failure"),
            );
            if run.state.is_terminal() {
                break;
            }
            assert_eq!(
                run.retry_context.as_ref().map(|context| context.error_type),
                Some(SqlErrorType::Execution)
            );
        }

        let WorkflowState::Terminated(TerminationReason::SqlRetryBudget(exhausted)) =
            last.expect("outcome").to
        else {
            panic!("run must end on the retry budget");
        };
        assert_eq!(exhausted.category, SqlErrorType::Execution);
        assert_eq!(exhausted.counters.count(SqlErrorType::Execution), 3);
    }

    #[test]
    fn dispatch_is_refused_without_validation() {
        let workflow = PlanWorkflow::default();
        let mut run = workflow.start_run(false);
        run.candidate = Some(plan(vec![sql_step(1, "count")]));
        run.state = WorkflowState::StepDispatch;

        let error = workflow.apply(&mut run, WorkflowEvent::DispatchStep).expect_err("refused");
        assert!(matches!(error, WorkflowTransitionError::ExecutionRefused { .. }));
        assert!(error.to_string().starts_with("Plan validation failed before execution"));
    }

    #[test]
    fn nl2sql_only_completes_after_last_sql_step() {
        let workflow = PlanWorkflow::default();
        let mut run = workflow.start_run(true);
        workflow
            .apply(&mut run, WorkflowEvent::PlanProduced(plan(vec![sql_step(1, "count")])))
            .expect("produce");
        workflow.validate(&mut run).expect("validate");
        workflow.apply(&mut run, WorkflowEvent::DispatchStep).expect("dispatch");
        workflow.apply(&mut run, WorkflowEvent::SqlGenerated { sql: "SELECT 1".into() }).expect("sql");
        workflow.apply(&mut run, WorkflowEvent::SemanticPassed).expect("semantic");
        workflow.apply(&mut run, WorkflowEvent::SqlExecuted).expect("executed");

        let finished = workflow.apply(&mut run, WorkflowEvent::DispatchStep).expect("finish");
        assert_eq!(finished.to, WorkflowState::Terminated(TerminationReason::Completed));
        assert_eq!(finished.actions, vec![WorkflowAction::Finish]);
    }

    #[test]
    fn human_review_approval_and_rejection() {
        let workflow = PlanWorkflow::new(WorkflowLimits {
            human_review_enabled: true,
            ..WorkflowLimits::default()
        });
        let mut run = workflow.start_run(false);
        workflow
            .apply(&mut run, WorkflowEvent::PlanProduced(plan(vec![report_step(1)])))
            .expect("produce");
        let review = workflow.validate(&mut run).expect("validate");
        assert_eq!(review.to, WorkflowState::HumanFeedback);
        assert_eq!(review.actions, vec![WorkflowAction::RequestHumanReview]);

        let rejected = workflow
            .apply(&mut run, WorkflowEvent::ReviewRejected { feedback: "split by region".into() })
            .expect("rejection replans");
        assert_eq!(rejected.to, WorkflowState::Planning);
        assert!(!run.validation_passed);

        workflow
            .apply(&mut run, WorkflowEvent::PlanProduced(plan(vec![report_step(1)])))
            .expect("produce again");
        workflow.validate(&mut run).expect("validate again");
        let approved = workflow.apply(&mut run, WorkflowEvent::ReviewApproved).expect("approve");
        assert_eq!(approved.to, WorkflowState::StepDispatch);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let workflow = PlanWorkflow::default();
        let mut run = workflow.start_run(false);

        let error = workflow
            .apply(&mut run, WorkflowEvent::SqlExecuted)
            .expect_err("planning cannot accept execution results");
        assert!(matches!(
            error,
            WorkflowTransitionError::InvalidTransition { state: WorkflowState::Planning, .. }
        ));

        workflow.apply(&mut run, WorkflowEvent::CancelRequested).expect("cancel");
        assert!(workflow.apply(&mut run, WorkflowEvent::DispatchStep).is_err());
    }

    #[test]
    fn replay_is_deterministic() {
        let workflow = PlanWorkflow::default();
        let events = vec![
            WorkflowEvent::PlanProduced(bad_plan()),
            WorkflowEvent::ValidationFailed { reason: "bad".into() },
            WorkflowEvent::PlanProduced(plan(vec![sql_step(1, "count")])),
            WorkflowEvent::ValidationPassed,
            WorkflowEvent::DispatchStep,
            WorkflowEvent::SqlGenerationFailed(RetryContext::syntax("unbalanced")),
        ];

        let replay = |events: &[WorkflowEvent]| {
            let mut run = workflow.start_run(false);
            for event in events {
                workflow.apply(&mut run, event.clone()).expect("replay step");
            }
            run
        };

        assert_eq!(replay(&events), replay(&events));
    }
}
