use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One committed (question, plan summary) pair in a thread's history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub thread_id: ThreadId,
    pub sequence_number: i64,
    pub user_question: String,
    pub plan_summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(
        thread_id: ThreadId,
        sequence_number: i64,
        user_question: impl Into<String>,
        plan_summary: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            thread_id,
            sequence_number,
            user_question: user_question.into(),
            plan_summary: plan_summary.into(),
            created_at: now,
            updated_at: now,
        }
    }
}
