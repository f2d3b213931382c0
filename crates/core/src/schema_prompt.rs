//! Token-aware rendering of a logical schema into prompt text.
//!
//! Three strategies are supported. `none` renders everything, `smart` narrows
//! the schema to the tables and columns an execution description refers to and
//! drops descriptions, `full` additionally drops foreign keys and examples.
//! Filtering always fails open: a description that yields no entities renders
//! the complete schema.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::domain::schema::{ColumnDto, ForeignKeyRef, SchemaDto, TableDto};

const MAX_EXAMPLES: usize = 3;

const SQL_KEYWORD_STOPLIST: &[&str] = &[
    "select", "where", "and", "or", "group", "order", "having", "limit", "offset", "as", "on",
    "by", "in", "like", "between", "sum", "count", "avg", "max", "min", "distinct", "all",
];

static QUOTED_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[`'"]([A-Za-z0-9_\p{Han}]+)[`'"]"#).expect("quoted entity pattern is valid")
});

static DOTTED_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^A-Za-z0-9_])([A-Za-z0-9_]+)\.([A-Za-z0-9_]+)")
        .expect("dotted reference pattern is valid")
});

static KEYWORD_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^A-Za-z0-9_])(?:FROM|JOIN|INTO|UPDATE|TABLE)\s+([A-Za-z0-9_]+)")
        .expect("keyword target pattern is valid")
});

static HAN_TABLE_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9_\p{Han}]+?)\s*表").expect("table suffix pattern is valid")
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaCompressionOptions {
    pub remove_description: bool,
    pub remove_foreign_keys: bool,
    pub remove_examples: bool,
    pub enable_smart_filter: bool,
    pub with_column_type: bool,
    pub execution_description: Option<String>,
}

impl Default for SchemaCompressionOptions {
    fn default() -> Self {
        Self::none()
    }
}

impl SchemaCompressionOptions {
    pub fn none() -> Self {
        Self {
            remove_description: false,
            remove_foreign_keys: false,
            remove_examples: false,
            enable_smart_filter: false,
            with_column_type: true,
            execution_description: None,
        }
    }

    pub fn smart(execution_description: impl Into<String>) -> Self {
        Self {
            remove_description: true,
            enable_smart_filter: true,
            execution_description: Some(execution_description.into()),
            ..Self::none()
        }
    }

    pub fn full(execution_description: impl Into<String>) -> Self {
        Self { remove_foreign_keys: true, remove_examples: true, ..Self::smart(execution_description) }
    }

    /// Smart filtering when a step instruction exists, otherwise the full schema.
    pub fn for_instruction(instruction: Option<&str>) -> Self {
        match instruction.filter(|text| !text.trim().is_empty()) {
            Some(text) => Self::smart(text),
            None => Self::none(),
        }
    }

    pub fn with_remove_description(mut self, value: bool) -> Self {
        self.remove_description = value;
        self
    }

    pub fn with_remove_foreign_keys(mut self, value: bool) -> Self {
        self.remove_foreign_keys = value;
        self
    }

    pub fn with_remove_examples(mut self, value: bool) -> Self {
        self.remove_examples = value;
        self
    }

    pub fn with_column_type(mut self, value: bool) -> Self {
        self.with_column_type = value;
        self
    }
}

/// Collects lower-cased table and column names a free-text description refers to.
pub fn extract_referenced_entities(description: &str) -> BTreeSet<String> {
    let mut entities = BTreeSet::new();

    for captures in QUOTED_ENTITY.captures_iter(description) {
        entities.insert(captures[1].to_lowercase());
    }

    for captures in DOTTED_REFERENCE.captures_iter(description) {
        let table = captures[1].to_lowercase();
        let column = captures[2].to_lowercase();
        entities.insert(format!("{table}.{column}"));
        entities.insert(table);
    }

    for captures in KEYWORD_TARGET.captures_iter(description) {
        let name = captures[1].to_lowercase();
        if !is_sql_keyword(&name) {
            entities.insert(name);
        }
    }

    for captures in HAN_TABLE_SUFFIX.captures_iter(description) {
        entities.insert(captures[1].to_lowercase());
    }

    debug!(
        event_name = "schema.entities.extracted",
        entity_count = entities.len(),
        entities = ?entities,
        "extracted referenced entities from execution description"
    );
    entities
}

fn is_sql_keyword(word: &str) -> bool {
    SQL_KEYWORD_STOPLIST.contains(&word)
}

/// Returns a filtered copy of `schema` holding only referenced tables plus
/// their single-hop foreign-key neighbours. The input is never mutated.
pub fn filter_schema(schema: &SchemaDto, entities: &BTreeSet<String>) -> SchemaDto {
    if entities.is_empty() {
        return schema.clone();
    }

    let mut included: BTreeSet<String> = schema
        .tables
        .iter()
        .map(|table| table.name.to_lowercase())
        .filter(|name| entities.contains(name))
        .collect();

    let related = related_tables(&schema.foreign_keys, &included);
    let expanded = related.len();
    included.extend(related);

    let tables: Vec<TableDto> = schema
        .tables
        .iter()
        .filter(|table| included.contains(&table.name.to_lowercase()))
        .map(|table| filter_table_columns(table, entities))
        .collect();

    let foreign_keys: Vec<String> = schema
        .foreign_keys
        .iter()
        .filter(|relation| {
            ForeignKeyRef::parse(relation).is_some_and(|fk| {
                included.contains(&fk.left_table) && included.contains(&fk.right_table)
            })
        })
        .cloned()
        .collect();

    info!(
        event_name = "schema.filter.applied",
        tables_before = schema.tables.len(),
        tables_after = tables.len(),
        expanded_via_foreign_keys = expanded,
        foreign_keys_before = schema.foreign_keys.len(),
        foreign_keys_after = foreign_keys.len(),
        "schema filtered by referenced entities"
    );

    SchemaDto { name: schema.name.clone(), tables, foreign_keys }
}

fn related_tables(foreign_keys: &[String], base: &BTreeSet<String>) -> BTreeSet<String> {
    let mut related = BTreeSet::new();
    for fk in foreign_keys.iter().filter_map(|relation| ForeignKeyRef::parse(relation)) {
        let left = base.contains(&fk.left_table);
        let right = base.contains(&fk.right_table);
        if left && !right {
            related.insert(fk.right_table);
        } else if right && !left {
            related.insert(fk.left_table);
        }
    }
    related
}

fn filter_table_columns(table: &TableDto, entities: &BTreeSet<String>) -> TableDto {
    let table_lower = table.name.to_lowercase();
    let column_prefix = format!("{table_lower}.");
    let table_level_only = !entities.iter().any(|entity| entity.starts_with(&column_prefix));

    let mut columns: Vec<ColumnDto> = table
        .columns
        .iter()
        .filter(|column| {
            let column_lower = column.name.to_lowercase();
            table_level_only
                || table.primary_keys.contains(&column.name)
                || entities.contains(&column_lower)
                || entities.contains(&format!("{column_prefix}{column_lower}"))
        })
        .cloned()
        .collect();

    if columns.is_empty() {
        debug!(
            event_name = "schema.filter.column_fallback",
            table = %table.name,
            "no columns matched, keeping every column"
        );
        columns = table.columns.clone();
    }

    TableDto { columns, ..table.clone() }
}

/// Renders the schema prompt block, applying smart filtering first when enabled.
pub fn render_schema_prompt(schema: &SchemaDto, options: &SchemaCompressionOptions) -> String {
    let filtered;
    let mut working = schema;

    if options.enable_smart_filter {
        if let Some(description) =
            options.execution_description.as_deref().filter(|text| !text.trim().is_empty())
        {
            let entities = extract_referenced_entities(description);
            if entities.is_empty() {
                debug!(
                    event_name = "schema.filter.skipped",
                    "no entities extracted, rendering original schema"
                );
            } else {
                filtered = filter_schema(schema, &entities);
                working = &filtered;
            }
        }
    }

    let mut output = format!("【DB_ID】 {}\n", working.name);
    for table in &working.tables {
        output.push_str(&render_table(table, options));
        output.push('\n');
    }

    if !options.remove_foreign_keys && !working.foreign_keys.is_empty() {
        output.push_str("【Foreign keys】\n");
        output.push_str(&working.foreign_keys.join("\n"));
    }

    output
}

pub fn render_table(table: &TableDto, options: &SchemaCompressionOptions) -> String {
    let name = clean_quotes(&table.name);
    let description = clean_quotes(table.description.as_deref().unwrap_or_default());

    let mut output = format!("# Table: {name}");
    if !options.remove_description && !description.trim().is_empty() && description != name {
        output.push_str(", ");
        output.push_str(description);
    }
    output.push_str("\n[\n");

    let lines: Vec<String> =
        table.columns.iter().map(|column| render_column(table, column, options)).collect();
    output.push_str(&lines.join(",\n"));
    output.push_str("\n]");
    output
}

fn render_column(table: &TableDto, column: &ColumnDto, options: &SchemaCompressionOptions) -> String {
    let name = clean_quotes(&column.name);
    let description = clean_quotes(column.description.as_deref().unwrap_or_default());

    let mut line = format!("({name}");
    if options.with_column_type {
        line.push(':');
        line.push_str(&column.data_type.as_deref().unwrap_or_default().trim().to_uppercase());
    }
    if !options.remove_description && !description.trim().is_empty() && description != name {
        line.push_str(", ");
        line.push_str(description);
    }
    if table.primary_keys.contains(&column.name) {
        line.push_str(", Primary Key");
    }
    if !options.remove_examples && name != "id" {
        let examples: Vec<&str> = column
            .examples
            .iter()
            .map(String::as_str)
            .filter(|example| !example.is_empty())
            .take(MAX_EXAMPLES)
            .collect();
        if !examples.is_empty() {
            line.push_str(", Examples: [");
            line.push_str(&examples.join(","));
            line.push(']');
        }
    }
    line.push(')');
    line
}

fn clean_quotes(value: &str) -> &str {
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}
