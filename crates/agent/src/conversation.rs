//! Bounded multi-turn history per conversation thread.
//!
//! Each thread keeps an in-memory window of its most recent committed turns.
//! The window is filled from the turn store on first access and afterwards
//! kept in step with it, so the store is not read on every turn. A thread
//! whose history could not be read stays unloaded and is read again on the
//! next access; no sequence number is handed out before that succeeds. All
//! structural changes to a thread happen under that thread's own lock; other
//! threads never wait on it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dataagent_core::config::AgentConfig;
use dataagent_core::domain::turn::{ConversationTurn, ThreadId};
use dataagent_core::text::abbreviate;
use dataagent_core::BackoffPolicy;
use dataagent_db::{ConversationTurnRepository, RepositoryError};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::retry::with_backoff;

/// Rendered in place of a transcript when a thread has no history.
pub const NO_HISTORY: &str = "(none)";

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("conversation store failed: {0}")]
    Store(#[from] RepositoryError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextSettings {
    pub max_turn_history: usize,
    pub max_plan_summary_length: usize,
    pub store_backoff: BackoffPolicy,
    pub flush_concurrency: usize,
    pub flush_timeout: Duration,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

impl ContextSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_turn_history: config.max_turn_history,
            max_plan_summary_length: config.max_plan_summary_length,
            store_backoff: config.store_backoff(),
            flush_concurrency: config.flush_concurrency,
            flush_timeout: Duration::from_millis(config.flush_timeout_ms),
        }
    }
}

#[derive(Debug)]
struct PendingTurn {
    question: String,
    output: String,
}

#[derive(Debug, Default)]
struct ThreadState {
    loaded: bool,
    window: VecDeque<ConversationTurn>,
    pending: Option<PendingTurn>,
    last_sequence: i64,
}

impl ThreadState {
    fn next_sequence(&self) -> i64 {
        let window_last = self.window.back().map_or(0, |turn| turn.sequence_number);
        self.last_sequence.max(window_last) + 1
    }
}

type ThreadSlot = Arc<Mutex<ThreadState>>;

pub struct MultiTurnContextManager {
    store: Arc<dyn ConversationTurnRepository>,
    settings: ContextSettings,
    threads: RwLock<HashMap<ThreadId, ThreadSlot>>,
    flush_gate: Arc<Semaphore>,
}

impl MultiTurnContextManager {
    pub fn new(store: Arc<dyn ConversationTurnRepository>, settings: ContextSettings) -> Self {
        let flush_gate = Arc::new(Semaphore::new(settings.flush_concurrency));
        Self { store, settings, threads: RwLock::new(HashMap::new()), flush_gate }
    }

    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// Opens a pending turn. Blank threads and questions are ignored.
    pub async fn begin_turn(&self, thread_id: &ThreadId, question: &str) {
        let question = question.trim();
        if thread_id.is_blank() || question.is_empty() {
            debug!(event_name = "context.turn.begin_ignored", "blank thread or question");
            return;
        }

        let slot = self.slot(thread_id).await;
        let mut state = slot.lock().await;
        state.pending = Some(PendingTurn { question: question.to_string(), output: String::new() });
        debug!(event_name = "context.turn.begun", thread_id = %thread_id, "pending turn opened");
    }

    /// Appends streamed planner output. Without a pending turn this does nothing.
    pub async fn append_chunk(&self, thread_id: &ThreadId, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let Some(slot) = self.existing_slot(thread_id).await else {
            return;
        };
        let mut state = slot.lock().await;
        if let Some(pending) = state.pending.as_mut() {
            pending.output.push_str(chunk);
        }
    }

    /// Empties the pending output but keeps the question, so a regenerated
    /// plan replaces the previous attempt.
    pub async fn reset_pending_output(&self, thread_id: &ThreadId) {
        let Some(slot) = self.existing_slot(thread_id).await else {
            return;
        };
        let mut state = slot.lock().await;
        if let Some(pending) = state.pending.as_mut() {
            pending.output.clear();
        }
    }

    pub async fn has_pending(&self, thread_id: &ThreadId) -> bool {
        match self.existing_slot(thread_id).await {
            Some(slot) => slot.lock().await.pending.is_some(),
            None => false,
        }
    }

    /// Commits the pending turn.
    ///
    /// A pending turn with no output is dropped. Otherwise the output is
    /// truncated, persisted with the thread's next sequence number, appended
    /// to the window, and the oldest turns beyond the window size are
    /// evicted from memory and the store. When the flush gate cannot be
    /// acquired in time the store write is skipped and the turn is kept in
    /// memory only. If the thread's history cannot be loaded the pending turn
    /// is left in place and the error is returned.
    pub async fn finish_turn(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ConversationTurn>, ContextError> {
        let Some(slot) = self.existing_slot(thread_id).await else {
            return Ok(None);
        };
        let mut state = slot.lock().await;
        let has_output = match state.pending.as_ref() {
            Some(pending) => !pending.output.trim().is_empty(),
            None => return Ok(None),
        };
        if !has_output {
            state.pending = None;
            debug!(
                event_name = "context.turn.dropped",
                thread_id = %thread_id,
                "pending turn had no plan output"
            );
            return Ok(None);
        }

        // The pending turn stays in place until a sequence number can be assigned.
        self.ensure_loaded(thread_id, &mut state).await?;
        let Some(pending) = state.pending.take() else {
            return Ok(None);
        };
        let output = pending.output.trim();
        let summary = abbreviate(output, self.settings.max_plan_summary_length);
        let turn = ConversationTurn::new(
            thread_id.clone(),
            state.next_sequence(),
            pending.question,
            summary,
        );

        match self.acquire_flush_permit(thread_id).await {
            Some(_permit) => {
                with_backoff(self.settings.store_backoff, "conversation_turn.insert", || {
                    self.insert_turn(&turn)
                })
                .await?;

                let keep = self.settings.max_turn_history;
                if let Err(error) = self.store.prune_older_than(thread_id, keep).await {
                    warn!(
                        event_name = "context.turn.prune_failed",
                        thread_id = %thread_id,
                        error = %error,
                        "failed to prune old turns from the store"
                    );
                }
            }
            None => {
                warn!(
                    event_name = "context.turn.flush_skipped",
                    thread_id = %thread_id,
                    sequence = turn.sequence_number,
                    "flush gate busy, turn kept in memory only"
                );
            }
        }

        while state.window.len() >= self.settings.max_turn_history.max(1) {
            state.window.pop_front();
        }
        state.last_sequence = turn.sequence_number;
        state.window.push_back(turn.clone());

        info!(
            event_name = "context.turn.persisted",
            thread_id = %thread_id,
            sequence = turn.sequence_number,
            window = state.window.len(),
            "conversation turn committed"
        );
        Ok(Some(turn))
    }

    /// Drops the pending turn without touching committed history.
    pub async fn discard_pending(&self, thread_id: &ThreadId) -> bool {
        let Some(slot) = self.existing_slot(thread_id).await else {
            return false;
        };
        let discarded = slot.lock().await.pending.take().is_some();
        if discarded {
            debug!(event_name = "context.turn.discarded", thread_id = %thread_id, "pending turn discarded");
        }
        discarded
    }

    /// Removes the newest committed turn and reopens it as pending.
    ///
    /// Returns the reopened question, or `None` when the thread has no history.
    pub async fn restart_last_turn(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<String>, ContextError> {
        let slot = self.slot(thread_id).await;
        let mut state = slot.lock().await;
        self.ensure_loaded(thread_id, &mut state).await?;

        let Some(turn) = state.window.pop_back() else {
            return Ok(None);
        };

        let durable_last = match self.store.max_sequence(thread_id).await {
            Ok(sequence) => sequence,
            Err(error) => {
                state.window.push_back(turn);
                return Err(error.into());
            }
        };
        if durable_last == turn.sequence_number {
            if let Err(error) = self.store.delete_last(thread_id).await {
                state.window.push_back(turn);
                return Err(error.into());
            }
        }

        state.last_sequence = turn.sequence_number - 1;
        state.pending =
            Some(PendingTurn { question: turn.user_question.clone(), output: String::new() });
        info!(
            event_name = "context.turn.restarted",
            thread_id = %thread_id,
            sequence = turn.sequence_number,
            "last turn reopened for a new plan"
        );
        Ok(Some(turn.user_question))
    }

    /// Chronological transcript of the window, or [`NO_HISTORY`].
    pub async fn build_context(&self, thread_id: &ThreadId) -> Result<String, ContextError> {
        let turns = self.history(thread_id).await?;
        if turns.is_empty() {
            return Ok(NO_HISTORY.to_string());
        }
        Ok(turns
            .iter()
            .map(|turn| format!("User: {}\nPlan: {}", turn.user_question, turn.plan_summary))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    pub async fn history(&self, thread_id: &ThreadId) -> Result<Vec<ConversationTurn>, ContextError> {
        if thread_id.is_blank() {
            return Ok(Vec::new());
        }
        let slot = self.slot(thread_id).await;
        let mut state = slot.lock().await;
        self.ensure_loaded(thread_id, &mut state).await?;
        Ok(state.window.iter().cloned().collect())
    }

    pub async fn history_size(&self, thread_id: &ThreadId) -> Result<usize, ContextError> {
        Ok(self.history(thread_id).await?.len())
    }

    /// Forgets the thread in memory and in the store. Returns removed store rows.
    pub async fn clear_history(&self, thread_id: &ThreadId) -> Result<u64, ContextError> {
        let slot = self.slot(thread_id).await;
        let mut state = slot.lock().await;

        let store = &self.store;
        let removed =
            with_backoff(self.settings.store_backoff, "conversation_turn.delete_all", || {
                store.delete_all(thread_id)
            })
            .await?;

        *state = ThreadState { loaded: true, ..ThreadState::default() };
        info!(
            event_name = "context.history.cleared",
            thread_id = %thread_id,
            removed,
            "conversation history cleared"
        );
        Ok(removed)
    }

    async fn ensure_loaded(
        &self,
        thread_id: &ThreadId,
        state: &mut ThreadState,
    ) -> Result<(), ContextError> {
        if state.loaded {
            return Ok(());
        }

        let store = &self.store;
        let turns = with_backoff(
            self.settings.store_backoff,
            "conversation_turn.select_by_thread",
            || store.select_by_thread(thread_id),
        )
        .await
        .map_err(|error| {
            warn!(
                event_name = "context.history.load_failed",
                thread_id = %thread_id,
                error = %error,
                "thread history unavailable, will reload on next access"
            );
            ContextError::from(error)
        })?;

        state.last_sequence =
            state.last_sequence.max(turns.last().map_or(0, |turn| turn.sequence_number));
        let skip = turns.len().saturating_sub(self.settings.max_turn_history);
        let mut window: VecDeque<ConversationTurn> = turns.into_iter().skip(skip).collect();
        window.extend(state.window.drain(..));
        state.window = window;
        state.loaded = true;
        debug!(
            event_name = "context.history.loaded",
            thread_id = %thread_id,
            turns = state.window.len(),
            "thread history loaded"
        );
        Ok(())
    }

    /// Inserts a turn. A row already stored under the same sequence with the
    /// same content counts as written, so a retry after a lost acknowledgement
    /// does not fail the commit.
    async fn insert_turn(&self, turn: &ConversationTurn) -> Result<(), RepositoryError> {
        let error = match self.store.insert(turn.clone()).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        match self.store.select_by_thread(&turn.thread_id).await {
            Ok(stored)
                if stored.iter().any(|existing| {
                    existing.sequence_number == turn.sequence_number
                        && existing.user_question == turn.user_question
                        && existing.plan_summary == turn.plan_summary
                }) =>
            {
                debug!(
                    event_name = "context.turn.already_stored",
                    thread_id = %turn.thread_id,
                    sequence = turn.sequence_number,
                    "insert reported an error but the turn is stored"
                );
                Ok(())
            }
            _ => Err(error),
        }
    }

    async fn acquire_flush_permit(&self, thread_id: &ThreadId) -> Option<OwnedSemaphorePermit> {
        let gate = Arc::clone(&self.flush_gate);
        match tokio::time::timeout(self.settings.flush_timeout, gate.acquire_owned()).await {
            Ok(Ok(permit)) => Some(permit),
            Ok(Err(_closed)) => None,
            Err(_elapsed) => {
                debug!(
                    event_name = "context.flush.timeout",
                    thread_id = %thread_id,
                    timeout_ms = self.settings.flush_timeout.as_millis() as u64,
                    "timed out waiting for flush gate"
                );
                None
            }
        }
    }

    async fn existing_slot(&self, thread_id: &ThreadId) -> Option<ThreadSlot> {
        self.threads.read().await.get(thread_id).cloned()
    }

    async fn slot(&self, thread_id: &ThreadId) -> ThreadSlot {
        if let Some(slot) = self.existing_slot(thread_id).await {
            return slot;
        }
        let mut threads = self.threads.write().await;
        Arc::clone(threads.entry(thread_id.clone()).or_default())
    }
}
