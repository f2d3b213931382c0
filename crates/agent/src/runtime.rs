use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{anyhow, bail, Context as _, Result};
use dataagent_core::config::AppConfig;
use dataagent_core::domain::plan::{Plan, ToolName};
use dataagent_core::domain::retry::RetryContext;
use dataagent_core::domain::schema::SchemaDto;
use dataagent_core::domain::turn::ThreadId;
use dataagent_core::errors::DomainError;
use dataagent_core::events::{RunStage, StreamEvent};
use dataagent_core::schema_prompt::{render_schema_prompt, SchemaCompressionOptions};
use dataagent_core::semantic_check::{detect_semantic_verdict, SemanticVerdict};
use dataagent_core::structured_output::StructuredOutputParser;
use dataagent_core::text::{extract_code_block, extract_code_line, strip_think_tags};
use dataagent_core::workflow::{
    PlanCandidate, PlanWorkflow, RunState, TerminationReason, WorkflowAction, WorkflowEvent,
    WorkflowLimits, WorkflowState,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tera::Context;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::conversation::MultiTurnContextManager;
use crate::llm::{LlmOutputFixer, TextGenerator};
use crate::prompts::{self, PromptRegistry};
use crate::tools::{QueryRows, SchemaSource, SqlExecutor};

const EVENT_BUFFER: usize = 64;
const SQL_DIALECT: &str = "SQLite";
const RESULT_PREVIEW_ROWS: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HumanFeedback {
    Approved,
    Rejected { feedback: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub thread_id: ThreadId,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub nl2sql_only: bool,
    #[serde(default)]
    pub human_feedback: Option<HumanFeedback>,
}

impl RunRequest {
    pub fn new(thread_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            thread_id: ThreadId::new(thread_id),
            question: question.into(),
            nl2sql_only: false,
            human_feedback: None,
        }
    }

    pub fn nl2sql_only(mut self) -> Self {
        self.nl2sql_only = true;
        self
    }

    pub fn with_feedback(mut self, feedback: HumanFeedback) -> Self {
        self.human_feedback = Some(feedback);
        self
    }
}

/// Collaborators a runtime drives.
#[derive(Clone)]
pub struct RuntimeComponents {
    pub generator: Arc<dyn TextGenerator>,
    pub prompts: Arc<PromptRegistry>,
    pub context: Arc<MultiTurnContextManager>,
    pub schema_source: Arc<dyn SchemaSource>,
    pub executor: Arc<dyn SqlExecutor>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RuntimeSettings {
    pub limits: WorkflowLimits,
    pub structured_output_repairs: u32,
    pub temperature: f32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            limits: config.agent.workflow_limits(),
            structured_output_repairs: config.agent.structured_output_repairs,
            temperature: config.llm.temperature,
        }
    }
}

struct ParkedRun {
    run: RunState,
    question: String,
}

struct RuntimeInner {
    components: RuntimeComponents,
    workflow: PlanWorkflow,
    settings: RuntimeSettings,
    parked: Mutex<HashMap<ThreadId, ParkedRun>>,
}

/// Starts query resolution runs. Each run is its own task and streams its
/// progress over a bounded channel.
#[derive(Clone)]
pub struct AgentRuntime {
    inner: Arc<RuntimeInner>,
}

impl AgentRuntime {
    pub fn new(components: RuntimeComponents, settings: RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                components,
                workflow: PlanWorkflow::new(settings.limits),
                settings,
                parked: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn context(&self) -> &Arc<MultiTurnContextManager> {
        &self.inner.components.context
    }

    pub async fn awaiting_review(&self, thread_id: &ThreadId) -> bool {
        self.inner.parked.lock().await.contains_key(thread_id)
    }

    pub fn start(&self, request: RunRequest) -> RunHandle {
        let correlation_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let span = info_span!(
            "run",
            thread_id = %request.thread_id,
            correlation_id = %correlation_id
        );
        let pipeline = Pipeline {
            inner: Arc::clone(&self.inner),
            request,
            correlation_id: correlation_id.clone(),
            events: sender,
            cancel: cancel.clone(),
        };
        tokio::spawn(pipeline.run().instrument(span));

        RunHandle { correlation_id, events: receiver, cancel }
    }
}

pub struct RunHandle {
    correlation_id: String,
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Stops the run at its next suspension point. No further events are sent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Waits for the run to end and returns every event it sent.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }

    /// Event stream that cancels the run when dropped.
    pub fn into_stream(self) -> RunEvents {
        RunEvents {
            events: ReceiverStream::new(self.events),
            _cancel_on_drop: self.cancel.drop_guard(),
        }
    }
}

pub struct RunEvents {
    events: ReceiverStream<StreamEvent>,
    _cancel_on_drop: DropGuard,
}

impl Stream for RunEvents {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_next_unpin(cx)
    }
}

#[derive(Debug, Serialize)]
struct StepOutput {
    step: usize,
    tool: ToolName,
    instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sql: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    columns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    rows: Vec<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

/// Per-run values that are not part of the workflow state.
struct Scratch {
    question: String,
    schema: SchemaDto,
    history: String,
    results: Vec<StepOutput>,
    report: Option<String>,
}

impl Scratch {
    fn results_json(&self) -> String {
        serde_json::to_string_pretty(&self.results).unwrap_or_else(|_| "[]".to_string())
    }

    fn last_sql(&self) -> Option<String> {
        self.results.iter().rev().find_map(|output| output.sql.clone())
    }
}

struct Pipeline {
    inner: Arc<RuntimeInner>,
    request: RunRequest,
    correlation_id: String,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn run(self) {
        let thread_id = self.request.thread_id.clone();
        info!(event_name = "pipeline.run.started", "run started");
        let started = StreamEvent::Started {
            thread_id: thread_id.to_string(),
            correlation_id: self.correlation_id.clone(),
        };
        if self.emit(started).await.is_err() {
            return;
        }

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.drive() => Some(result),
        };

        match outcome {
            Some(Ok(())) => info!(event_name = "pipeline.run.finished", "run finished"),
            Some(Err(error)) if !self.cancel.is_cancelled() => {
                warn!(event_name = "pipeline.run.failed", error = %format!("{error:#}"), "run failed");
                self.context().discard_pending(&thread_id).await;
                let _ = self.emit(StreamEvent::error(format!("{error:#}"))).await;
            }
            _ => {
                info!(event_name = "pipeline.run.cancelled", "run cancelled");
                self.context().discard_pending(&thread_id).await;
            }
        }
    }

    async fn drive(&self) -> Result<()> {
        let Some((mut run, mut actions, question)) = self.prepare().await? else {
            return Ok(());
        };

        let schema = self
            .inner
            .components
            .schema_source
            .load_schema(&question)
            .await
            .context("failed to load the data source schema")?;
        let history = self
            .context()
            .build_context(self.thread_id())
            .await
            .context("failed to load conversation history")?;
        let mut scratch = Scratch { question, schema, history, results: Vec::new(), report: None };

        loop {
            if let WorkflowState::Terminated(reason) = &run.state {
                return self.terminate(reason.clone(), &scratch).await;
            }

            let action = match actions.pop_front() {
                Some(action) => action,
                None if run.state == WorkflowState::StepDispatch => {
                    let outcome = self.workflow().apply(&mut run, WorkflowEvent::DispatchStep)?;
                    actions.extend(outcome.actions);
                    continue;
                }
                None => {
                    return Err(DomainError::InvariantViolation(format!(
                        "workflow has nothing to do in state {:?}",
                        run.state
                    ))
                    .into());
                }
            };

            let event = match action {
                WorkflowAction::GeneratePlan { feedback } => {
                    self.generate_plan(&scratch, feedback.as_deref()).await?
                }
                WorkflowAction::ValidatePlan => {
                    let outcome = self.workflow().validate(&mut run)?;
                    match &outcome.event {
                        WorkflowEvent::ValidationPassed => {
                            info!(event_name = "pipeline.plan.validated", "plan passed validation");
                            self.commit_turn().await;
                        }
                        WorkflowEvent::ValidationFailed { reason } => {
                            warn!(
                                event_name = "pipeline.plan.rejected",
                                repair_count = run.repair_count,
                                reason = %reason,
                                "plan failed validation"
                            );
                        }
                        _ => {}
                    }
                    actions.extend(outcome.actions);
                    continue;
                }
                WorkflowAction::RequestHumanReview => return self.park(run, scratch.question).await,
                WorkflowAction::GenerateSql { step, retry } => {
                    self.generate_sql(&run, step, retry, &scratch).await?
                }
                WorkflowAction::CheckSemanticConsistency => {
                    self.check_semantics(&run, &scratch).await?
                }
                WorkflowAction::ExecuteSql => self.execute_sql(&run, &mut scratch).await?,
                WorkflowAction::GeneratePython { step } => {
                    self.generate_python(&run, step, &mut scratch).await?
                }
                WorkflowAction::GenerateReport => self.generate_report(&run, &mut scratch).await?,
                WorkflowAction::Finish => continue,
            };

            let outcome = self.workflow().apply(&mut run, event)?;
            actions.extend(outcome.actions);
        }
    }

    /// Builds the starting run state, either fresh or resumed from review.
    async fn prepare(&self) -> Result<Option<(RunState, VecDeque<WorkflowAction>, String)>> {
        let thread_id = self.thread_id();
        if thread_id.is_blank() {
            self.emit(StreamEvent::error("thread id must not be empty")).await?;
            return Ok(None);
        }

        let Some(feedback) = &self.request.human_feedback else {
            let question = self.request.question.trim();
            if question.is_empty() {
                self.emit(StreamEvent::error("question must not be empty")).await?;
                return Ok(None);
            }
            let superseded = self.inner.parked.lock().await.remove(thread_id);
            if superseded.is_some() {
                info!(event_name = "pipeline.review.superseded", "new question replaces parked plan");
            }

            self.context().begin_turn(thread_id, question).await;
            let run = self.workflow().start_run(self.request.nl2sql_only);
            let actions = VecDeque::from([WorkflowAction::GeneratePlan { feedback: None }]);
            return Ok(Some((run, actions, question.to_string())));
        };

        let parked = self.inner.parked.lock().await.remove(thread_id);
        let Some(ParkedRun { mut run, question }) = parked else {
            self.emit(StreamEvent::error(format!("no plan is awaiting review on thread {thread_id}")))
                .await?;
            return Ok(None);
        };

        let event = match feedback {
            HumanFeedback::Approved => {
                info!(event_name = "pipeline.review.approved", "reviewer approved plan");
                WorkflowEvent::ReviewApproved
            }
            HumanFeedback::Rejected { feedback } => {
                info!(event_name = "pipeline.review.rejected", "reviewer rejected plan");
                let reopened = match self.context().restart_last_turn(thread_id).await {
                    Ok(reopened) => reopened,
                    Err(error) => {
                        // Keep the plan reviewable so the same feedback can be resent.
                        self.inner
                            .parked
                            .lock()
                            .await
                            .entry(thread_id.clone())
                            .or_insert(ParkedRun { run, question });
                        return Err(error.into());
                    }
                };
                if reopened.is_none() {
                    self.context().begin_turn(thread_id, &question).await;
                }
                WorkflowEvent::ReviewRejected { feedback: feedback.clone() }
            }
        };
        let outcome = self.workflow().apply(&mut run, event)?;
        Ok(Some((run, outcome.actions.into(), question)))
    }

    async fn generate_plan(&self, scratch: &Scratch, feedback: Option<&str>) -> Result<WorkflowEvent> {
        self.context().reset_pending_output(self.thread_id()).await;

        let mut context = Context::new();
        context.insert(
            "schema",
            &render_schema_prompt(&scratch.schema, &SchemaCompressionOptions::none()),
        );
        context.insert("history", &scratch.history);
        context.insert("feedback", feedback.unwrap_or_default());
        context.insert("question", &scratch.question);
        let prompt = self.prompts().render(prompts::PLANNER, &context)?;

        let text = self.stream_stage(RunStage::Planner, &prompt, true).await?;
        let candidate = match self.parser().parse::<Plan>(extract_code_block(strip_think_tags(&text))).await
        {
            Ok(plan) => PlanCandidate::Parsed(plan),
            Err(error) => PlanCandidate::Unreadable { error: error.to_string() },
        };
        Ok(WorkflowEvent::PlanProduced(candidate))
    }

    async fn generate_sql(
        &self,
        run: &RunState,
        step: usize,
        retry: Option<RetryContext>,
        scratch: &Scratch,
    ) -> Result<WorkflowEvent> {
        let instruction = step_instruction(run, step)?;
        if retry.is_none() {
            self.emit_step_started(step, ToolName::SqlGenerate).await?;
        }

        let options = SchemaCompressionOptions::for_instruction(Some(&instruction));
        let mut context = Context::new();
        context.insert("dialect", SQL_DIALECT);
        context.insert("schema", &render_schema_prompt(&scratch.schema, &options));
        context.insert("history", &scratch.history);
        context.insert("instruction", &instruction);
        context.insert(
            "retry_reason",
            retry.as_ref().map(|retry| retry.reason.as_str()).unwrap_or_default(),
        );
        context.insert(
            "retry_type",
            &retry.as_ref().map(|retry| retry.error_type.to_string()).unwrap_or_default(),
        );
        context.insert("previous_sql", run.generated_sql.as_deref().unwrap_or_default());
        let prompt = self.prompts().render(prompts::SQL_GENERATE, &context)?;

        let text = self.stream_stage(RunStage::Sql, &prompt, false).await?;
        let sql = extract_code_line(strip_think_tags(&text)).trim().to_string();
        if sql.is_empty() {
            warn!(event_name = "pipeline.sql.empty", step, "sql generation returned nothing");
            return Ok(WorkflowEvent::SqlGenerationFailed(RetryContext::unknown(
                "sql generation returned no sql",
            )));
        }

        self.emit(StreamEvent::SqlGenerated { step, sql: sql.clone() }).await?;
        Ok(WorkflowEvent::SqlGenerated { sql })
    }

    async fn check_semantics(&self, run: &RunState, scratch: &Scratch) -> Result<WorkflowEvent> {
        let instruction = step_instruction(run, run.current_step)?;
        let sql = generated_sql(run)?;

        let options = SchemaCompressionOptions::for_instruction(Some(&instruction));
        let mut context = Context::new();
        context.insert("schema", &render_schema_prompt(&scratch.schema, &options));
        context.insert("instruction", &instruction);
        context.insert("sql", sql);
        let prompt = self.prompts().render(prompts::SEMANTIC_CHECK, &context)?;

        let answer = self
            .inner
            .components
            .generator
            .complete(&prompt, self.inner.settings.temperature)
            .await?;
        self.emit(StreamEvent::TextChunk { stage: RunStage::SemanticCheck, text: answer.clone() })
            .await?;

        Ok(match detect_semantic_verdict(&answer) {
            SemanticVerdict::Passed => WorkflowEvent::SemanticPassed,
            SemanticVerdict::Failed { reason } => {
                WorkflowEvent::SemanticFailed(RetryContext::semantic(reason))
            }
        })
    }

    async fn execute_sql(&self, run: &RunState, scratch: &mut Scratch) -> Result<WorkflowEvent> {
        let step = run.current_step;
        let sql = generated_sql(run)?.to_string();

        match self.inner.components.executor.execute(&sql).await {
            Ok(QueryRows { columns, rows }) => {
                info!(event_name = "pipeline.sql.executed", step, rows = rows.len(), "sql executed");
                self.emit(StreamEvent::SqlResult { step, columns: columns.clone(), rows: rows.clone() })
                    .await?;
                scratch.results.push(StepOutput {
                    step,
                    tool: ToolName::SqlGenerate,
                    instruction: step_instruction(run, step)?,
                    sql: Some(sql),
                    columns,
                    rows: rows.into_iter().take(RESULT_PREVIEW_ROWS).collect(),
                    code: None,
                });
                Ok(WorkflowEvent::SqlExecuted)
            }
            Err(error) => {
                warn!(
                    event_name = "pipeline.sql.failed",
                    step,
                    kind = %error.kind,
                    error = %error.message,
                    "sql execution failed"
                );
                Ok(WorkflowEvent::SqlExecutionFailed(error.into_retry_context()))
            }
        }
    }

    async fn generate_python(
        &self,
        run: &RunState,
        step: usize,
        scratch: &mut Scratch,
    ) -> Result<WorkflowEvent> {
        let instruction = step_instruction(run, step)?;
        self.emit_step_started(step, ToolName::PythonGenerate).await?;

        let mut context = Context::new();
        context.insert("instruction", &instruction);
        context.insert("results", &scratch.results_json());
        let prompt = self.prompts().render(prompts::PYTHON_GENERATE, &context)?;

        let text = self.stream_stage(RunStage::Python, &prompt, false).await?;
        let code = extract_code_block(strip_think_tags(&text)).trim().to_string();
        self.emit(StreamEvent::PythonGenerated { step, code: code.clone() }).await?;
        scratch.results.push(StepOutput {
            step,
            tool: ToolName::PythonGenerate,
            instruction,
            sql: None,
            columns: Vec::new(),
            rows: Vec::new(),
            code: Some(code),
        });
        Ok(WorkflowEvent::PythonGenerated)
    }

    async fn generate_report(&self, run: &RunState, scratch: &mut Scratch) -> Result<WorkflowEvent> {
        let plan = run.plan().ok_or_else(|| anyhow!("report requested without a plan"))?;
        let report_step = plan
            .step(run.current_step)
            .filter(|step| step.tool() == Some(ToolName::ReportGenerate));
        if report_step.is_some() {
            self.emit_step_started(run.current_step, ToolName::ReportGenerate).await?;
        }

        let goal = report_step
            .or_else(|| {
                plan.execution_plan
                    .iter()
                    .rev()
                    .find(|step| step.tool() == Some(ToolName::ReportGenerate))
            })
            .and_then(|step| step.tool_parameters.as_ref())
            .and_then(|parameters| parameters.summary())
            .map(str::to_string)
            .unwrap_or_else(|| plan.thought_process.clone());

        let mut context = Context::new();
        context.insert("question", &scratch.question);
        context.insert("summary", &goal);
        context.insert("results", &scratch.results_json());
        let prompt = self.prompts().render(prompts::REPORT_GENERATE, &context)?;

        let text = self.stream_stage(RunStage::Report, &prompt, false).await?;
        scratch.report = Some(strip_think_tags(&text).to_string());
        Ok(WorkflowEvent::ReportGenerated)
    }

    async fn park(&self, run: RunState, question: String) -> Result<()> {
        let plan = run.plan().cloned().unwrap_or_default();
        let thread_id = self.thread_id().clone();
        self.inner.parked.lock().await.insert(thread_id.clone(), ParkedRun { run, question });
        info!(event_name = "pipeline.review.parked", "plan parked for human review");
        self.emit(StreamEvent::AwaitingReview { thread_id: thread_id.to_string(), plan }).await
    }

    async fn terminate(&self, reason: TerminationReason, scratch: &Scratch) -> Result<()> {
        match reason {
            TerminationReason::Completed => {
                let summary = scratch.report.clone().or_else(|| scratch.last_sql());
                self.emit(StreamEvent::Complete { summary }).await
            }
            TerminationReason::PlanRepairLimit { attempts, max_attempts, last_error } => {
                self.context().discard_pending(self.thread_id()).await;
                self.emit(StreamEvent::error(format!(
                    "Plan could not be repaired: {attempts} failed validations exceed the limit of \
                     {max_attempts} repairs. Last error: {last_error}"
                )))
                .await
            }
            TerminationReason::SqlRetryBudget(exhausted) => {
                self.emit(StreamEvent::error(exhausted.to_string())).await
            }
            TerminationReason::Cancelled => {
                self.context().discard_pending(self.thread_id()).await;
                Ok(())
            }
        }
    }

    /// Streams one generation, forwarding every fragment as a text chunk.
    async fn stream_stage(&self, stage: RunStage, prompt: &str, record_turn: bool) -> Result<String> {
        let mut stream = self.inner.components.generator.generate_stream(None, prompt).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            if record_turn {
                self.context().append_chunk(self.thread_id(), &chunk).await;
            }
            text.push_str(&chunk);
            self.emit(StreamEvent::TextChunk { stage, text: chunk }).await?;
        }
        Ok(text)
    }

    async fn commit_turn(&self) {
        if let Err(error) = self.context().finish_turn(self.thread_id()).await {
            warn!(
                event_name = "pipeline.turn.commit_failed",
                error = %error,
                "validated plan was not saved to history"
            );
        }
    }

    async fn emit_step_started(&self, step: usize, tool: ToolName) -> Result<()> {
        self.emit(StreamEvent::StepStarted { step, tool: tool.to_string() }).await
    }

    async fn emit(&self, event: StreamEvent) -> Result<()> {
        if self.events.send(event).await.is_err() {
            self.cancel.cancel();
            bail!("event receiver dropped");
        }
        Ok(())
    }

    fn parser(&self) -> StructuredOutputParser<LlmOutputFixer> {
        let fixer = LlmOutputFixer::new(
            Arc::clone(&self.inner.components.generator),
            Arc::clone(&self.inner.components.prompts),
        );
        StructuredOutputParser::new(fixer)
            .with_max_repairs(self.inner.settings.structured_output_repairs)
    }

    fn thread_id(&self) -> &ThreadId {
        &self.request.thread_id
    }

    fn context(&self) -> &MultiTurnContextManager {
        &self.inner.components.context
    }

    fn prompts(&self) -> &PromptRegistry {
        &self.inner.components.prompts
    }

    fn workflow(&self) -> &PlanWorkflow {
        &self.inner.workflow
    }
}

fn step_instruction(run: &RunState, step: usize) -> Result<String> {
    run.plan()
        .and_then(|plan| plan.step(step))
        .and_then(|step| step.tool_parameters.as_ref())
        .and_then(|parameters| parameters.instruction())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("step {step} has no instruction"))
}

fn generated_sql(run: &RunState) -> Result<&str> {
    run.generated_sql.as_deref().ok_or_else(|| anyhow!("no generated sql for step {}", run.current_step))
}
