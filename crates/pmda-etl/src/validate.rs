//! Data quality rules
//!
//! Rules are declared per dataset, compiled against the target schema when
//! the configuration loads and checked against every transformed row before
//! it is staged. Null values only ever fail `not_null`.

use crate::error::{EtlError, Result};
use crate::schema::{Row, TableSchema};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// A rule as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum RuleConfig {
    NotNull {
        column: String,
    },
    #[serde(alias = "is_unique")]
    Unique {
        column: String,
    },
    #[serde(alias = "is_in_set")]
    InSet {
        column: String,
        #[serde(alias = "allowed_values")]
        values: Vec<Value>,
    },
    #[serde(alias = "is_in_range")]
    InRange {
        column: String,
        #[serde(default, alias = "min_value")]
        min: Option<f64>,
        #[serde(default, alias = "max_value")]
        max: Option<f64>,
    },
    Matches {
        column: String,
        pattern: String,
    },
}

#[derive(Debug, Clone)]
enum Check {
    NotNull,
    Unique,
    InSet(Vec<Value>),
    InRange { min: Option<f64>, max: Option<f64> },
    Matches(Regex),
}

/// A rule bound to a column position of the target schema
#[derive(Debug, Clone)]
pub struct ValidationRule {
    column: String,
    index: usize,
    check: Check,
}

impl ValidationRule {
    pub fn compile(config: &RuleConfig, schema: &TableSchema) -> Result<Self> {
        let (column, check) = match config {
            RuleConfig::NotNull { column } => (column, Check::NotNull),
            RuleConfig::Unique { column } => (column, Check::Unique),
            RuleConfig::InSet { column, values } => {
                if values.is_empty() {
                    return Err(EtlError::config(format!(
                        "in_set rule on `{column}` has no values"
                    )));
                }
                (column, Check::InSet(values.clone()))
            }
            RuleConfig::InRange { column, min, max } => {
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo > hi {
                        return Err(EtlError::config(format!(
                            "in_range rule on `{column}` has min {lo} above max {hi}"
                        )));
                    }
                }
                (column, Check::InRange { min: *min, max: *max })
            }
            RuleConfig::Matches { column, pattern } => {
                let regex = Regex::new(pattern).map_err(|e| {
                    EtlError::config(format!("invalid pattern for `{column}`: {e}"))
                })?;
                (column, Check::Matches(regex))
            }
        };

        let index = schema.column_index(column).ok_or_else(|| {
            EtlError::config(format!(
                "validation rule refers to unknown column `{column}` of {}",
                schema.display_name()
            ))
        })?;

        Ok(Self {
            column: column.clone(),
            index,
            check,
        })
    }

    pub fn name(&self) -> &'static str {
        match self.check {
            Check::NotNull => "not_null",
            Check::Unique => "unique",
            Check::InSet(_) => "in_set",
            Check::InRange { .. } => "in_range",
            Check::Matches(_) => "matches",
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    fn violation(&self, value: &Value) -> Option<String> {
        match &self.check {
            Check::NotNull => value.is_null().then(|| "value is null".to_string()),
            _ if value.is_null() => None,
            Check::Unique => None,
            Check::InSet(values) => {
                (!values.contains(value)).then(|| format!("{value} is not an allowed value"))
            }
            Check::InRange { min, max } => {
                let number = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                match number {
                    None => Some(format!("{value} is not numeric")),
                    Some(n) if min.is_some_and(|lo| n < lo) || max.is_some_and(|hi| n > hi) => {
                        Some(format!(
                            "{n} is outside [{}, {}]",
                            min.map_or("-inf".to_string(), |v| v.to_string()),
                            max.map_or("inf".to_string(), |v| v.to_string())
                        ))
                    }
                    Some(_) => None,
                }
            }
            Check::Matches(regex) => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (!regex.is_match(&text))
                    .then(|| format!("`{text}` does not match /{}/", regex.as_str()))
            }
        }
    }
}

/// Applies a dataset's rules across one run, remembering values seen by
/// `unique` rules
pub struct RowValidator<'a> {
    rules: &'a [ValidationRule],
    seen: HashMap<usize, HashSet<String>>,
}

impl<'a> RowValidator<'a> {
    pub fn new(rules: &'a [ValidationRule]) -> Self {
        Self {
            rules,
            seen: HashMap::new(),
        }
    }

    /// Check `row`; the first broken rule is reported
    pub fn check(&mut self, row: &Row, position: u64) -> Result<()> {
        let mut unique_values = Vec::new();

        for (i, rule) in self.rules.iter().enumerate() {
            let value = row.get(rule.index).unwrap_or(&Value::Null);

            if let Some(message) = rule.violation(value) {
                return Err(EtlError::validation(
                    position,
                    rule.name(),
                    format!("column `{}`: {message}", rule.column),
                ));
            }

            if matches!(rule.check, Check::Unique) && !value.is_null() {
                let key = value.to_string();
                if self.seen.get(&i).is_some_and(|seen| seen.contains(&key)) {
                    return Err(EtlError::validation(
                        position,
                        rule.name(),
                        format!("column `{}`: {value} appears more than once", rule.column),
                    ));
                }
                unique_values.push((i, key));
            }
        }

        for (i, key) in unique_values {
            self.seen.entry(i).or_default().insert(key);
        }
        Ok(())
    }
}
