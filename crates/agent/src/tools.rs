use anyhow::Result;
use async_trait::async_trait;
use dataagent_core::domain::retry::{RetryContext, SqlErrorType};
use dataagent_core::domain::schema::SchemaDto;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Provides the logical schema a question is resolved against.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn load_schema(&self, question: &str) -> Result<SchemaDto>;
}

/// Serves one fixed schema regardless of the question.
#[derive(Clone, Debug, Default)]
pub struct StaticSchemaSource {
    schema: SchemaDto,
}

impl StaticSchemaSource {
    pub fn new(schema: SchemaDto) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn load_schema(&self, _question: &str) -> Result<SchemaDto> {
        Ok(self.schema.clone())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind} error while running sql: {message}")]
pub struct QueryError {
    pub kind: SqlErrorType,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: SqlErrorType, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(SqlErrorType::Execution, message)
    }

    pub fn into_retry_context(self) -> RetryContext {
        RetryContext::new(self.kind, self.message)
    }
}

/// Runs generated SQL against the business data source.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<QueryRows, QueryError>;
}

#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{QueryError, QueryRows, SqlExecutor};

    /// Returns canned results in order and records the SQL it was given.
    #[derive(Default)]
    pub(crate) struct ScriptedExecutor {
        results: Mutex<VecDeque<Result<QueryRows, QueryError>>>,
        statements: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        pub(crate) fn new(results: Vec<Result<QueryRows, QueryError>>) -> Self {
            Self { results: Mutex::new(results.into()), statements: Mutex::new(Vec::new()) }
        }

        pub(crate) fn statements(&self) -> Vec<String> {
            self.statements.lock().expect("statement lock").clone()
        }
    }

    #[async_trait]
    impl SqlExecutor for ScriptedExecutor {
        async fn execute(&self, sql: &str) -> Result<QueryRows, QueryError> {
            self.statements.lock().expect("statement lock").push(sql.to_string());
            self.results
                .lock()
                .expect("result lock")
                .pop_front()
                .unwrap_or_else(|| Ok(QueryRows::default()))
        }
    }
}

#[cfg(test)]
mod tests {
    use dataagent_core::domain::retry::SqlErrorType;
    use dataagent_core::domain::schema::{SchemaDto, TableDto};

    use super::{QueryError, SchemaSource, StaticSchemaSource};

    #[tokio::test]
    async fn static_source_returns_its_schema() {
        let schema = SchemaDto {
            tables: vec![TableDto { name: "orders".to_string(), ..TableDto::default() }],
            ..SchemaDto::default()
        };
        let source = StaticSchemaSource::new(schema.clone());
        assert_eq!(source.load_schema("anything").await.expect("schema"), schema);
    }

    #[test]
    fn query_errors_become_retry_contexts() {
        let error = QueryError::execution("no such table: order");
        assert_eq!(error.to_string(), "EXECUTION error while running sql: no such table: order");

        let context = error.into_retry_context();
        assert_eq!(context.error_type, SqlErrorType::Execution);
        assert_eq!(context.reason, "no such table: order");
    }
}
