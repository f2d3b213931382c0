use async_trait::async_trait;
use thiserror::Error;

use dataagent_core::domain::turn::{ConversationTurn, ThreadId};

pub mod conversation_turn;
pub mod memory;

pub use conversation_turn::SqlConversationTurnRepository;
pub use memory::InMemoryConversationTurnRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Durable store for committed conversation turns.
///
/// Turns of a thread are always returned in ascending `sequence_number`.
/// Deleting from a thread that has no turns succeeds.
#[async_trait]
pub trait ConversationTurnRepository: Send + Sync {
    async fn insert(&self, turn: ConversationTurn) -> Result<(), RepositoryError>;

    async fn select_by_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<ConversationTurn>, RepositoryError>;

    /// Removes the newest turn of the thread and returns it.
    async fn delete_last(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ConversationTurn>, RepositoryError>;

    /// Returns the number of removed turns.
    async fn delete_all(&self, thread_id: &ThreadId) -> Result<u64, RepositoryError>;

    /// Highest committed sequence number, `0` for an empty thread.
    async fn max_sequence(&self, thread_id: &ThreadId) -> Result<i64, RepositoryError>;

    /// Keeps the newest `keep_count` turns and removes the rest.
    async fn prune_older_than(
        &self,
        thread_id: &ThreadId,
        keep_count: usize,
    ) -> Result<u64, RepositoryError>;
}
