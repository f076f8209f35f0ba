//! Target table schemas and the row shapes that flow into loaders
//!
//! A [`Row`] is positional: value `i` belongs to `columns[i]` of the
//! [`TableSchema`] it was produced for. [`TableSchema::check_row`] is the
//! single definition of "this row fits the declared schema" shared by every
//! loader adapter.

use crate::error::{EtlError, Result};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed source record: header or field name to raw value
pub type RawRecord = serde_json::Map<String, Value>;

/// A transformed row, aligned to a [`TableSchema`]'s column order
pub type Row = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SqlType {
    #[default]
    Text,
    Integer,
    BigInt,
    Double,
    Boolean,
    Date,
    Timestamp,
    Jsonb,
}

impl SqlType {
    pub fn sql_name(self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Date => "DATE",
            SqlType::Timestamp => "TIMESTAMPTZ",
            SqlType::Jsonb => "JSONB",
        }
    }

    /// Whether a non-null value is representable in this column type
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (SqlType::Jsonb, _) => true,
            (SqlType::Text, Value::String(_)) => true,
            (SqlType::Integer, Value::Number(n)) => n
                .as_i64()
                .is_some_and(|v| i32::try_from(v).is_ok()),
            (SqlType::BigInt, Value::Number(n)) => n.as_i64().is_some(),
            (SqlType::Double, Value::Number(_)) => true,
            (SqlType::Boolean, Value::Bool(_)) => true,
            (SqlType::Date, Value::String(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
            (SqlType::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(s).is_ok(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Fixed column layout of a target table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
    /// Merge key columns, also the table's primary key
    pub primary_key: Vec<String>,
}

impl TableSchema {
    /// `schema.table`, for logs and messages
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Quoted `"schema"."table"`, for SQL
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Positions of the primary key columns
    pub fn key_indices(&self) -> Result<Vec<usize>> {
        self.primary_key
            .iter()
            .map(|key| {
                self.column_index(key).ok_or_else(|| {
                    EtlError::config(format!(
                        "merge key '{}' is not a column of {}",
                        key,
                        self.display_name()
                    ))
                })
            })
            .collect()
    }

    /// Key tuple of a row, usable as a map key
    pub fn key_of(&self, row: &Row, key_indices: &[usize]) -> String {
        Value::Array(key_indices.iter().map(|&i| row[i].clone()).collect()).to_string()
    }

    /// Reject rows with the wrong arity, a missing key, a NULL in a
    /// non-nullable column, or a value the column type cannot hold
    pub fn check_row(&self, row: &Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(EtlError::integrity(
                self.display_name(),
                format!(
                    "row has {} values but the schema declares {} columns",
                    row.len(),
                    self.columns.len()
                ),
            ));
        }

        for (column, value) in self.columns.iter().zip(row) {
            let is_key = self.primary_key.iter().any(|k| k == &column.name);
            if value.is_null() && (is_key || !column.nullable) {
                let what = if is_key { "merge key" } else { "non-nullable column" };
                return Err(EtlError::integrity(
                    self.display_name(),
                    format!("{} '{}' is missing", what, column.name),
                ));
            }
            if !column.sql_type.accepts(value) {
                return Err(EtlError::integrity(
                    self.display_name(),
                    format!(
                        "value {} does not fit column '{}' of type {}",
                        value,
                        column.name,
                        column.sql_type.sql_name()
                    ),
                ));
            }
        }

        Ok(())
    }
}

/// Double-quote an SQL identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema {
            schema: "public".into(),
            table: "pmda_approvals".into(),
            columns: vec![
                ColumnDef::new("approval_id", SqlType::Text).not_null(),
                ColumnDef::new("approval_date", SqlType::Date),
                ColumnDef::new("dose_count", SqlType::Integer),
            ],
            primary_key: vec!["approval_id".into()],
        }
    }

    #[test]
    fn test_check_row_accepts_valid_row() {
        let row = vec![json!("A-1"), json!("2020-03-15"), json!(3)];
        assert!(schema().check_row(&row).is_ok());
    }

    #[test]
    fn test_check_row_rejects_wrong_arity() {
        let err = schema().check_row(&vec![json!("A-1")]).unwrap_err();
        assert!(matches!(err, EtlError::DataIntegrity { .. }));
        assert!(err.to_string().contains("1 values"));
    }

    #[test]
    fn test_check_row_rejects_missing_key() {
        let err = schema()
            .check_row(&vec![Value::Null, json!("2020-03-15"), Value::Null])
            .unwrap_err();
        assert!(err.to_string().contains("merge key 'approval_id'"));
    }

    #[test]
    fn test_check_row_rejects_type_mismatch() {
        let bad_date = vec![json!("A-1"), json!("R2.3.15"), Value::Null];
        assert!(schema().check_row(&bad_date).is_err());

        let too_big = vec![json!("A-1"), Value::Null, json!(i64::MAX)];
        assert!(schema().check_row(&too_big).is_err());
    }

    #[test]
    fn test_key_indices_and_key_of() {
        let schema = schema();
        let keys = schema.key_indices().unwrap();
        assert_eq!(keys, vec![0]);
        let row = vec![json!("A-1"), Value::Null, Value::Null];
        assert_eq!(schema.key_of(&row, &keys), r#"["A-1"]"#);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
        assert_eq!(schema().qualified_name(), "\"public\".\"pmda_approvals\"");
    }
}
