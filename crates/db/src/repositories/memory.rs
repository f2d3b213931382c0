use std::collections::HashMap;

use tokio::sync::RwLock;

use dataagent_core::domain::turn::{ConversationTurn, ThreadId};

use super::{ConversationTurnRepository, RepositoryError};

/// Turn store kept in process memory. Used by tests and by runs without a database.
#[derive(Default)]
pub struct InMemoryConversationTurnRepository {
    turns: RwLock<HashMap<ThreadId, Vec<ConversationTurn>>>,
}

#[async_trait::async_trait]
impl ConversationTurnRepository for InMemoryConversationTurnRepository {
    async fn insert(&self, turn: ConversationTurn) -> Result<(), RepositoryError> {
        let mut turns = self.turns.write().await;
        let thread = turns.entry(turn.thread_id.clone()).or_default();
        if thread.iter().any(|existing| existing.sequence_number == turn.sequence_number) {
            return Err(RepositoryError::Decode(format!(
                "turn {} already exists for thread {}",
                turn.sequence_number, turn.thread_id
            )));
        }
        thread.push(turn);
        thread.sort_by_key(|turn| turn.sequence_number);
        Ok(())
    }

    async fn select_by_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let turns = self.turns.read().await;
        Ok(turns.get(thread_id).cloned().unwrap_or_default())
    }

    async fn delete_last(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ConversationTurn>, RepositoryError> {
        let mut turns = self.turns.write().await;
        Ok(turns.get_mut(thread_id).and_then(Vec::pop))
    }

    async fn delete_all(&self, thread_id: &ThreadId) -> Result<u64, RepositoryError> {
        let mut turns = self.turns.write().await;
        Ok(turns.remove(thread_id).map(|removed| removed.len() as u64).unwrap_or(0))
    }

    async fn max_sequence(&self, thread_id: &ThreadId) -> Result<i64, RepositoryError> {
        let turns = self.turns.read().await;
        Ok(turns
            .get(thread_id)
            .and_then(|thread| thread.last())
            .map(|turn| turn.sequence_number)
            .unwrap_or(0))
    }

    async fn prune_older_than(
        &self,
        thread_id: &ThreadId,
        keep_count: usize,
    ) -> Result<u64, RepositoryError> {
        let mut turns = self.turns.write().await;
        let Some(thread) = turns.get_mut(thread_id) else {
            return Ok(0);
        };
        let excess = thread.len().saturating_sub(keep_count);
        thread.drain(..excess);
        Ok(excess as u64)
    }
}
