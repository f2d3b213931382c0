use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use dataagent_core::domain::turn::{ConversationTurn, ThreadId};

use super::{ConversationTurnRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationTurnRepository {
    pool: DbPool,
}

impl SqlConversationTurnRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationTurnRepository for SqlConversationTurnRepository {
    async fn insert(&self, turn: ConversationTurn) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO conversation_turn (
                thread_id, sequence_number, user_question, plan_summary, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(turn.thread_id.as_str())
        .bind(turn.sequence_number)
        .bind(&turn.user_question)
        .bind(&turn.plan_summary)
        .bind(turn.created_at.to_rfc3339())
        .bind(turn.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn select_by_thread(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Vec<ConversationTurn>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT thread_id, sequence_number, user_question, plan_summary, created_at, updated_at
            FROM conversation_turn
            WHERE thread_id = ?
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(thread_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(turn_from_row).collect()
    }

    async fn delete_last(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ConversationTurn>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT thread_id, sequence_number, user_question, plan_summary, created_at, updated_at
            FROM conversation_turn
            WHERE thread_id = ?
            ORDER BY sequence_number DESC
            LIMIT 1
            "#,
        )
        .bind(thread_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let turn = turn_from_row(&row)?;

        sqlx::query("DELETE FROM conversation_turn WHERE thread_id = ? AND sequence_number = ?")
            .bind(thread_id.as_str())
            .bind(turn.sequence_number)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(turn))
    }

    async fn delete_all(&self, thread_id: &ThreadId) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM conversation_turn WHERE thread_id = ?")
            .bind(thread_id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn max_sequence(&self, thread_id: &ThreadId) -> Result<i64, RepositoryError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence_number), 0) AS max_sequence
             FROM conversation_turn WHERE thread_id = ?",
        )
        .bind(thread_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("max_sequence")?)
    }

    async fn prune_older_than(
        &self,
        thread_id: &ThreadId,
        keep_count: usize,
    ) -> Result<u64, RepositoryError> {
        let keep = i64::try_from(keep_count)
            .map_err(|_| RepositoryError::Decode(format!("keep_count {keep_count} is too large")))?;

        let result = sqlx::query(
            r#"
            DELETE FROM conversation_turn
            WHERE thread_id = ?
              AND sequence_number NOT IN (
                  SELECT sequence_number
                  FROM conversation_turn
                  WHERE thread_id = ?
                  ORDER BY sequence_number DESC
                  LIMIT ?
              )
            "#,
        )
        .bind(thread_id.as_str())
        .bind(thread_id.as_str())
        .bind(keep)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

fn turn_from_row(row: &SqliteRow) -> Result<ConversationTurn, RepositoryError> {
    let thread_id: String = row.try_get("thread_id")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(ConversationTurn {
        thread_id: ThreadId(thread_id),
        sequence_number: row.try_get("sequence_number")?,
        user_question: row.try_get("user_question")?,
        plan_summary: row.try_get("plan_summary")?,
        created_at: parse_timestamp("created_at", created_at)?,
        updated_at: parse_timestamp("updated_at", updated_at)?,
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("invalid timestamp in `{column}`: {e}")))
}
