use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDto {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

impl ColumnDto {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn with_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_examples<I, S>(mut self, examples: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.examples = examples.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDto {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
    #[serde(default)]
    pub columns: Vec<ColumnDto>,
}

impl TableDto {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_keys.push(column.into());
        self
    }

    pub fn with_column(mut self, column: ColumnDto) -> Self {
        self.columns.push(column);
        self
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_keys.iter().any(|key| key.eq_ignore_ascii_case(column))
    }
}

/// Logical schema snapshot fed to prompt compression.
///
/// Foreign keys are kept as `table.col = table.col` strings, the same form
/// the retriever hands over.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDto {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<TableDto>,
    #[serde(default)]
    pub foreign_keys: Vec<String>,
}

impl SchemaDto {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn with_table(mut self, table: TableDto) -> Self {
        self.tables.push(table);
        self
    }

    pub fn with_foreign_key(mut self, relation: impl Into<String>) -> Self {
        self.foreign_keys.push(relation.into());
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableDto> {
        self.tables.iter().find(|table| table.name.eq_ignore_ascii_case(name))
    }
}

/// A parsed `a.x = b.y` relation, lower-cased.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub left_table: String,
    pub left_column: String,
    pub right_table: String,
    pub right_column: String,
}

impl ForeignKeyRef {
    pub fn parse(relation: &str) -> Option<Self> {
        let mut sides = relation.split('=');
        let left = sides.next()?;
        let right = sides.next()?;
        if sides.next().is_some() {
            return None;
        }

        let (left_table, left_column) = split_qualified(left)?;
        let (right_table, right_column) = split_qualified(right)?;
        Some(Self { left_table, left_column, right_table, right_column })
    }
}

fn split_qualified(side: &str) -> Option<(String, String)> {
    let mut parts = side.trim().split('.');
    let table = parts.next()?.trim();
    let column = parts.next()?.trim();
    if parts.next().is_some() || table.is_empty() || column.is_empty() {
        return None;
    }
    Some((table.to_lowercase(), column.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::ForeignKeyRef;

    #[test]
    fn foreign_key_parse_lowercases_both_sides() {
        let parsed = ForeignKeyRef::parse("Orders.Product_Id = products.ID").expect("valid relation");
        assert_eq!(parsed.left_table, "orders");
        assert_eq!(parsed.left_column, "product_id");
        assert_eq!(parsed.right_table, "products");
        assert_eq!(parsed.right_column, "id");
    }

    #[test]
    fn malformed_foreign_keys_are_ignored() {
        assert!(ForeignKeyRef::parse("orders.product_id").is_none());
        assert!(ForeignKeyRef::parse("orders = products.id").is_none());
        assert!(ForeignKeyRef::parse("a.b.c = d.e").is_none());
        assert!(ForeignKeyRef::parse("a.b = c.d = e.f").is_none());
    }
}
