//! Self-healing parser for model output.
//!
//! Raw text goes through three stages: the reasoning preamble is dropped,
//! common natural-language answer shapes are rewritten into JSON, and the
//! result is decoded into the target type. A decode failure hands the text
//! and the decoder error to an [`OutputFixer`] and tries again, a bounded
//! number of times.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::text::{abbreviate, extract_code_block, strip_think_tags};

pub const DEFAULT_MAX_REPAIRS: u32 = 3;

const MALFORMED_KEYWORDS: &[&str] = &[
    "select", "from", "where", "and", "or", "join", "on", "group", "by", "order", "having",
    "limit", "offset", "insert", "update", "delete", "sum", "count", "avg", "max", "min",
    "between", "in", "like", "as", "left", "right", "inner", "outer", "full", "cross",
];

const SYSTEM_TABLE_NAMES: &[&str] = &[
    "agents",
    "agent_datasources",
    "agent_datasource_tables",
    "databases",
    "schemas",
    "chat_messages",
    "chat_sessions",
    "model_configs",
    "preset_questions",
    "user_prompt_configs",
    "semantic_models",
    "logical_relations",
    "business_terms",
];

static ANSWER_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[answer\]\s*").expect("answer marker pattern is valid"));

static EXPLANATION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[【\[]?(?:说明|explanation)").expect("explanation marker pattern is valid")
});

static QUOTED_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]+)""#).expect("quoted value pattern is valid"));

static TABLES_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:表：|tables?:|table\s*:)").expect("tables prefix pattern is valid")
});

static CONDITIONS_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:条件：|条件:|conditions?:)").expect("conditions marker pattern is valid")
});

static LIST_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,，\s]+").expect("list separator pattern is valid"));

static BARE_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("bare identifier pattern is valid")
});

static UPPER_TABLE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([A-Z][A-Z0-9_]*)""#).expect("upper table token pattern is valid")
});

static LOWER_TABLE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""([a-z][a-z0-9_]*)""#).expect("lower table token pattern is valid")
});

static OBJECT_KEY_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^"[^"]+"\s*:"#).expect("object key pattern is valid"));

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("output fixer failed: {0}")]
pub struct FixerError(pub String);

/// Strategy that asks something (usually the model) to correct malformed output.
#[async_trait]
pub trait OutputFixer: Send + Sync {
    async fn fix(&self, content: &str, error_message: &str) -> Result<String, FixerError>;
}

#[async_trait]
impl<F> OutputFixer for Arc<F>
where
    F: OutputFixer + ?Sized,
{
    async fn fix(&self, content: &str, error_message: &str) -> Result<String, FixerError> {
        (**self).fix(content, error_message).await
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StructuredOutputError {
    #[error(
        "failed to parse structured output after {repairs} repair attempts: {last_error} (last content: {})",
        abbreviate(.last_content, 200)
    )]
    RepairsExhausted { repairs: u32, last_error: String, last_content: String },
}

pub struct StructuredOutputParser<F> {
    fixer: F,
    max_repairs: u32,
}

impl<F> StructuredOutputParser<F>
where
    F: OutputFixer,
{
    pub fn new(fixer: F) -> Self {
        Self { fixer, max_repairs: DEFAULT_MAX_REPAIRS }
    }

    pub fn with_max_repairs(mut self, max_repairs: u32) -> Self {
        self.max_repairs = max_repairs;
        self
    }

    pub fn max_repairs(&self) -> u32 {
        self.max_repairs
    }

    pub async fn parse<T>(&self, raw: &str) -> Result<T, StructuredOutputError>
    where
        T: DeserializeOwned,
    {
        let mut current = preprocess_natural_language(strip_think_tags(raw));
        let mut last_error = match serde_json::from_str::<T>(&current) {
            Ok(value) => return Ok(value),
            Err(error) => error.to_string(),
        };

        for attempt in 1..=self.max_repairs {
            debug!(
                event_name = "structured_output.repair.attempt",
                attempt,
                max_repairs = self.max_repairs,
                error = %last_error,
                "asking fixer to repair malformed output"
            );

            match self.fixer.fix(&current, &last_error).await {
                Ok(fixed) => {
                    current = extract_code_block(strip_think_tags(&fixed)).to_string();
                }
                Err(error) => {
                    warn!(
                        event_name = "structured_output.repair.fixer_failed",
                        attempt,
                        error = %error,
                        "fixer failed, retrying with previous content"
                    );
                }
            }

            match serde_json::from_str::<T>(&current) {
                Ok(value) => return Ok(value),
                Err(error) => last_error = error.to_string(),
            }
        }

        warn!(
            event_name = "structured_output.repair.exhausted",
            repairs = self.max_repairs,
            error = %last_error,
            "structured output could not be repaired"
        );
        Err(StructuredOutputError::RepairsExhausted {
            repairs: self.max_repairs,
            last_error,
            last_content: current,
        })
    }
}

/// Rewrites common natural-language answer shapes into JSON arrays.
///
/// Text that already looks like JSON passes through unchanged, except a
/// malformed `[{...` list from which table-like tokens are salvaged.
pub fn preprocess_natural_language(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return trimmed.to_string();
    }

    let starts_with_answer =
        trimmed.get(..8).is_some_and(|head| head.eq_ignore_ascii_case("[answer]"));
    if trimmed.starts_with('[') && !starts_with_answer {
        if trimmed.starts_with("[{") && !looks_like_object_array(trimmed) {
            if let Some(tables) = salvage_table_names(trimmed) {
                debug!(
                    event_name = "structured_output.preprocess.salvaged",
                    table_count = tables.len(),
                    "recovered table names from malformed object list"
                );
                return json_array(&tables);
            }
        }
        return trimmed.to_string();
    }
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(marker) = ANSWER_MARKER.find(trimmed) {
        let answer = &trimmed[marker.end()..];
        let answer = match EXPLANATION_MARKER.find(answer) {
            Some(explanation) => &answer[..explanation.start()],
            None => answer,
        };
        let items: Vec<String> =
            QUOTED_VALUE.captures_iter(answer).map(|captures| captures[1].to_string()).collect();
        if !items.is_empty() {
            return json_array(&items);
        }
    }

    if let Some(prefix) = TABLES_PREFIX.find(trimmed) {
        let tables = &trimmed[prefix.end()..];
        let tables = match CONDITIONS_MARKER.find(tables) {
            Some(conditions) => &tables[..conditions.start()],
            None => tables,
        };
        let items: Vec<String> = LIST_SEPARATOR
            .split(tables.trim())
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect();
        return json_array(&items);
    }

    if trimmed.contains(',') && !trimmed.contains(':') && !trimmed.contains('{') {
        let mut items: Vec<String> = Vec::new();
        for part in trimmed.split(',') {
            let mut cleaned = part.trim();
            if cleaned.len() >= 2 && cleaned.starts_with('[') && cleaned.ends_with(']') {
                cleaned = cleaned[1..cleaned.len() - 1].trim();
            }

            if cleaned.contains('.') && cleaned.contains('(') {
                let table = cleaned.split('.').next().unwrap_or_default().trim();
                if !table.is_empty() && !items.iter().any(|item| item == table) {
                    items.push(table.to_string());
                }
            } else if !cleaned.is_empty() {
                items.push(cleaned.to_string());
            }
        }
        if !items.is_empty() {
            return json_array(&items);
        }
    }

    if BARE_IDENTIFIER.is_match(trimmed) {
        return json_array(&[trimmed.to_string()]);
    }

    trimmed.to_string()
}

fn looks_like_object_array(text: &str) -> bool {
    match text.find('{') {
        Some(brace) => OBJECT_KEY_START.is_match(text[brace + 1..].trim_start()),
        None => false,
    }
}

fn salvage_table_names(text: &str) -> Option<Vec<String>> {
    let upper = table_tokens(text, &UPPER_TABLE_TOKEN, |candidate| {
        candidate.len() > 1
            && candidate != "QUERY_BUILDER"
            && candidate != "STUDIES"
            && !candidate.starts_with("INTER")
    });
    if !upper.is_empty() {
        return Some(upper);
    }

    let lower = table_tokens(text, &LOWER_TABLE_TOKEN, |candidate| candidate.len() > 2);
    (!lower.is_empty()).then_some(lower)
}

fn table_tokens(text: &str, pattern: &Regex, accept: impl Fn(&str) -> bool) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for captures in pattern.captures_iter(text) {
        let Some(whole) = captures.get(0) else { continue };
        if text[whole.end()..].trim_start().starts_with(':') {
            continue;
        }

        let candidate = &captures[1];
        let lowered = candidate.to_lowercase();
        if MALFORMED_KEYWORDS.contains(&lowered.as_str())
            || SYSTEM_TABLE_NAMES.contains(&lowered.as_str())
            || !accept(candidate)
            || tokens.iter().any(|token| token == candidate)
        {
            continue;
        }
        tokens.push(candidate.to_string());
    }
    tokens
}

fn json_array(items: &[String]) -> String {
    serde_json::Value::from(items.to_vec()).to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{
        preprocess_natural_language, FixerError, OutputFixer, StructuredOutputError,
        StructuredOutputParser,
    };

    #[derive(Default)]
    struct CountingFixer {
        calls: AtomicU32,
        reply: Option<String>,
    }

    #[async_trait]
    impl OutputFixer for CountingFixer {
        async fn fix(&self, content: &str, _error_message: &str) -> Result<String, FixerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone().unwrap_or_else(|| format!("{content} still broken")))
        }
    }

    struct FailingFixer;

    #[async_trait]
    impl OutputFixer for FailingFixer {
        async fn fix(&self, _content: &str, _error_message: &str) -> Result<String, FixerError> {
            Err(FixerError("model unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn valid_json_parses_without_repair() {
        let fixer = Arc::new(CountingFixer::default());
        let parser = StructuredOutputParser::new(fixer.clone());

        let parsed: HashMap<String, u32> = parser
            .parse("<think>reasoning</think>\n{\"a\": 1}")
            .await
            .expect("valid json should parse");

        assert_eq!(parsed.get("a"), Some(&1));
        assert_eq!(fixer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn never_valid_input_stops_after_three_repairs() {
        let fixer = Arc::new(CountingFixer::default());
        let parser = StructuredOutputParser::new(fixer.clone());

        let error = parser
            .parse::<HashMap<String, u32>>("{not json")
            .await
            .expect_err("input never becomes valid");

        assert_eq!(fixer.calls.load(Ordering::SeqCst), 3);
        let StructuredOutputError::RepairsExhausted { repairs, last_content, .. } = error;
        assert_eq!(repairs, 3);
        assert!(last_content.contains("still broken"));
    }

    #[tokio::test]
    async fn fenced_fixer_reply_is_unwrapped() {
        let fixer = Arc::new(CountingFixer {
            reply: Some("<think>ok</think>```json\n{\"a\": 7}\n```".to_string()),
            ..CountingFixer::default()
        });
        let parser = StructuredOutputParser::new(fixer.clone());

        let parsed: HashMap<String, u32> = parser.parse("{a: 7").await.expect("repaired");

        assert_eq!(parsed.get("a"), Some(&7));
        assert_eq!(fixer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fixer_failures_still_count_as_attempts() {
        let parser = StructuredOutputParser::new(FailingFixer).with_max_repairs(2);

        let error = parser.parse::<Vec<String>>("{broken").await.expect_err("cannot repair");

        assert!(matches!(
            error,
            StructuredOutputError::RepairsExhausted { repairs: 2, ref last_content, .. }
                if last_content == "{broken"
        ));
    }

    #[test]
    fn answer_marker_collects_quoted_items() {
        let rewritten =
            preprocess_natural_language("[Answer] \"orders\", \"products\"  【说明】these two");
        assert_eq!(rewritten, r#"["orders","products"]"#);
    }

    #[test]
    fn tables_prefix_splits_on_mixed_separators() {
        assert_eq!(
            preprocess_natural_language("表：ORDERS,PRODUCT_CATEGORIES  条件：status = 1"),
            r#"["ORDERS","PRODUCT_CATEGORIES"]"#
        );
        assert_eq!(preprocess_natural_language("Tables: a， b c"), r#"["a","b","c"]"#);
    }

    #[test]
    fn comma_list_strips_brackets_and_function_suffixes() {
        let rewritten = preprocess_natural_language(
            "station, order_items, [station.map_to_table('province_city')], [products]",
        );
        assert_eq!(rewritten, r#"["station","order_items","products"]"#);
    }

    #[test]
    fn single_identifier_becomes_array_and_json_passes_through() {
        assert_eq!(preprocess_natural_language(" ORDERS "), r#"["ORDERS"]"#);
        assert_eq!(preprocess_natural_language("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(preprocess_natural_language("[\"x\"]"), "[\"x\"]");
        assert_eq!(preprocess_natural_language("not a list here"), "not a list here");
    }

    #[test]
    fn malformed_object_list_salvages_table_tokens() {
        let rewritten = preprocess_natural_language(
            r#"[{"QUERY_BUILDER","select * from x","ORDERS","SELECT","agents","CUSTOMERS"}]"#,
        );
        assert_eq!(rewritten, r#"["ORDERS","CUSTOMERS"]"#);

        let lowercase = preprocess_natural_language(r#"[{"orders","by","ab","line_items"}"#);
        assert_eq!(lowercase, r#"["orders","line_items"]"#);

        let valid = r#"[{"name": "orders"}]"#;
        assert_eq!(preprocess_natural_language(valid), valid);
    }
}
