use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure category of a SQL generation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SqlErrorType {
    Syntax,
    Semantic,
    Execution,
    Unknown,
}

impl SqlErrorType {
    pub const ALL: [SqlErrorType; 4] =
        [SqlErrorType::Syntax, SqlErrorType::Semantic, SqlErrorType::Execution, SqlErrorType::Unknown];

    /// Human label used when a budget for this category runs out.
    pub fn limit_label(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax error",
            Self::Semantic => "semantic error",
            Self::Execution => "execution error",
            Self::Unknown => "total retry count",
        }
    }
}

impl fmt::Display for SqlErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Syntax => "SYNTAX",
            Self::Semantic => "SEMANTIC",
            Self::Execution => "EXECUTION",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// Why the previous SQL attempt failed. Fed back into the next generation prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryContext {
    pub reason: String,
    pub error_type: SqlErrorType,
}

impl RetryContext {
    pub fn new(error_type: SqlErrorType, reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), error_type }
    }

    pub fn syntax(reason: impl Into<String>) -> Self {
        Self::new(SqlErrorType::Syntax, reason)
    }

    pub fn semantic(reason: impl Into<String>) -> Self {
        Self::new(SqlErrorType::Semantic, reason)
    }

    pub fn execution(reason: impl Into<String>) -> Self {
        Self::new(SqlErrorType::Execution, reason)
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        Self::new(SqlErrorType::Unknown, reason)
    }
}
