//! SQLite business database: schema introspection and generated-SQL execution.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use dataagent_agent::{QueryError, QueryRows, SchemaSource, SqlExecutor};
use dataagent_core::domain::retry::SqlErrorType;
use dataagent_core::domain::schema::{ColumnDto, SchemaDto, TableDto};
use dataagent_db::DbPool;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::{debug, info};

const EXAMPLE_VALUES: i64 = 3;

#[derive(Clone)]
pub struct SqliteDataSource {
    pool: DbPool,
    name: String,
    max_rows: usize,
}

impl SqliteDataSource {
    pub fn new(pool: DbPool, name: impl Into<String>, max_rows: u32) -> Self {
        Self { pool, name: name.into(), max_rows: max_rows.max(1) as usize }
    }

    /// Opens the data source read-only.
    pub async fn connect(url: &str, max_rows: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid datasource url `{url}`"))?
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open datasource `{url}`"))?;

        info!(event_name = "datasource.connected", url, "datasource opened read-only");
        Ok(Self::new(pool, database_name(url), max_rows))
    }

    pub async fn introspect(&self) -> Result<SchemaDto> {
        let table_names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx_%'
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list datasource tables")?;

        let mut schema = SchemaDto::new(self.name.clone());
        for table_name in table_names {
            let columns: Vec<(String, String, i64)> = sqlx::query_as(
                "SELECT name, type, pk FROM pragma_table_info(?) ORDER BY cid",
            )
            .bind(&table_name)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to read columns of `{table_name}`"))?;

            let mut table = TableDto::new(table_name.clone());
            for (column_name, data_type, primary_key) in columns {
                if primary_key > 0 {
                    table = table.with_primary_key(column_name.clone());
                }
                let examples = self.example_values(&table_name, &column_name).await;
                let mut column = ColumnDto::new(column_name).with_examples(examples);
                if !data_type.trim().is_empty() {
                    column = column.with_type(data_type);
                }
                table = table.with_column(column);
            }

            let foreign_keys: Vec<(String, String, Option<String>)> = sqlx::query_as(
                r#"SELECT "table", "from", "to" FROM pragma_foreign_key_list(?) ORDER BY id, seq"#,
            )
            .bind(&table_name)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to read foreign keys of `{table_name}`"))?;
            for (target_table, from_column, to_column) in foreign_keys {
                let to_column = to_column.unwrap_or_else(|| "id".to_string());
                schema = schema.with_foreign_key(format!(
                    "{table_name}.{from_column}={target_table}.{to_column}"
                ));
            }

            schema = schema.with_table(table);
        }

        debug!(
            event_name = "datasource.introspected",
            tables = schema.tables.len(),
            foreign_keys = schema.foreign_keys.len(),
            "datasource schema loaded"
        );
        Ok(schema)
    }

    async fn example_values(&self, table: &str, column: &str) -> Vec<String> {
        let statement = format!(
            "SELECT DISTINCT CAST({column} AS TEXT) FROM {table} WHERE {column} IS NOT NULL LIMIT {EXAMPLE_VALUES}",
            column = quote_identifier(column),
            table = quote_identifier(table),
        );
        match sqlx::query_scalar::<_, String>(&statement).fetch_all(&self.pool).await {
            Ok(values) => values,
            Err(error) => {
                debug!(
                    event_name = "datasource.examples.skipped",
                    table,
                    column,
                    error = %error,
                    "could not sample column values"
                );
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl SchemaSource for SqliteDataSource {
    async fn load_schema(&self, _question: &str) -> Result<SchemaDto> {
        self.introspect().await
    }
}

#[async_trait]
impl SqlExecutor for SqliteDataSource {
    async fn execute(&self, sql: &str) -> Result<QueryRows, QueryError> {
        let statement = sql.trim().trim_end_matches(';').trim();
        if !is_read_only(statement) {
            return Err(QueryError::execution("only SELECT statements may be executed"));
        }

        let mut rows = sqlx::query(statement).fetch(&self.pool);
        let mut result = QueryRows::default();
        while let Some(row) = rows.try_next().await.map_err(classify_error)? {
            if result.columns.is_empty() {
                result.columns = row.columns().iter().map(|column| column.name().to_string()).collect();
            }
            result.rows.push(row_values(&row));
            if result.rows.len() >= self.max_rows {
                break;
            }
        }

        Ok(result)
    }
}

fn is_read_only(statement: &str) -> bool {
    let keyword = statement
        .split(|c: char| c.is_whitespace() || c == '(')
        .find(|word| !word.is_empty())
        .unwrap_or_default();
    keyword.eq_ignore_ascii_case("select") || keyword.eq_ignore_ascii_case("with")
}

fn classify_error(error: sqlx::Error) -> QueryError {
    let message = match &error {
        sqlx::Error::Database(database) => database.message().to_string(),
        other => other.to_string(),
    };
    let kind = if message.contains("syntax error") || message.contains("incomplete input") {
        SqlErrorType::Syntax
    } else {
        SqlErrorType::Execution
    };
    QueryError::new(kind, message)
}

fn row_values(row: &SqliteRow) -> Vec<Value> {
    (0..row.len()).map(|index| column_value(row, index)).collect()
}

fn column_value(row: &SqliteRow, index: usize) -> Value {
    let Ok(raw) = row.try_get_raw(index) else {
        return Value::Null;
    };
    if raw.is_null() {
        return Value::Null;
    }
    let type_name = raw.type_info().name().to_string();

    match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => {
            row.try_get_unchecked::<i64, _>(index).map(Value::from).unwrap_or(Value::Null)
        }
        "REAL" | "NUMERIC" => {
            row.try_get_unchecked::<f64, _>(index).map(Value::from).unwrap_or(Value::Null)
        }
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(index)
            .map(|bytes| Value::from(format!("<{} bytes>", bytes.len())))
            .unwrap_or(Value::Null),
        _ => row.try_get_unchecked::<String, _>(index).map(Value::from).unwrap_or(Value::Null),
    }
}

fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn database_name(url: &str) -> String {
    let path = url.trim_start_matches("sqlite://").trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or_default();
    std::path::Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty() && !stem.starts_with(':'))
        .unwrap_or("main")
        .to_string()
}
