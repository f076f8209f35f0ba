//! Dataset descriptors
//!
//! A [`DatasetDescriptor`] is the resolved, immutable form of one
//! `datasets.<name>` configuration entry: everything the orchestrator needs
//! to run that dataset, checked for consistency up front.

use crate::config::{DatasetConfig, FetchSettings};
use crate::error::{EtlError, Result};
use crate::loader::MergeSpec;
use crate::parse::{build_parser, ParserKind, ParserOptions, RecordParser};
use crate::schema::TableSchema;
use crate::source::SourceTemplate;
use crate::state::{compare_watermarks, RunMode};
use crate::transform::convert::coerce;
use crate::transform::Transformer;
use crate::validate::ValidationRule;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DatasetDescriptor {
    pub name: String,
    pub source: SourceTemplate,
    pub parser: ParserKind,
    pub parser_options: ParserOptions,
    pub transformer: Transformer,
    pub target: TableSchema,
    pub merge: MergeSpec,
    /// Column whose maximum becomes the run's watermark
    pub watermark_column: Option<String>,
    /// Delta baseline used when no successful run exists
    pub default_epoch: Option<Value>,
    pub default_mode: RunMode,
    /// Spacing between requests to this dataset's origin
    pub rate_limit: Duration,
    pub cache_ttl: Duration,
    pub refresh_on_full: bool,
    pub validation: Vec<ValidationRule>,
}

impl DatasetDescriptor {
    pub fn from_config(name: &str, config: &DatasetConfig, fetch: &FetchSettings) -> Result<Self> {
        let invalid = |msg: String| EtlError::config(format!("dataset `{name}`: {msg}"));

        let source = SourceTemplate::parse(&config.extractor.url)
            .map_err(|e| invalid(e.to_string()))?;
        build_parser(config.parser, &config.parser_options).map_err(|e| invalid(e.to_string()))?;
        let transformer = Transformer::from_config(config.transformer, &config.columns)
            .map_err(|e| invalid(e.to_string()))?;

        if config.target.table.trim().is_empty() {
            return Err(invalid("target.table cannot be empty".into()));
        }
        if config.merge_keys.is_empty() {
            return Err(invalid("merge_keys cannot be empty".into()));
        }

        let mut columns = transformer.columns();
        for key in &config.merge_keys {
            let column = columns
                .iter_mut()
                .find(|c| &c.name == key)
                .ok_or_else(|| invalid(format!("merge key `{key}` is not a target column")))?;
            column.nullable = false;
        }

        let target = TableSchema {
            schema: config.target.schema.clone(),
            table: config.target.table.clone(),
            columns,
            primary_key: config.merge_keys.clone(),
        };

        if let Some(column) = &config.watermark_column {
            if target.column_index(column).is_none() {
                return Err(invalid(format!(
                    "watermark column `{column}` is not a target column"
                )));
            }
        }

        // stored in the same normalized form transformed rows carry
        let default_epoch = match &config.default_epoch {
            None => None,
            Some(epoch) => {
                let column = config.watermark_column.as_ref().ok_or_else(|| {
                    invalid("default_epoch needs a watermark_column".into())
                })?;
                let normalized = target
                    .columns
                    .iter()
                    .find(|c| &c.name == column)
                    .and_then(|c| coerce(epoch, c.sql_type).ok())
                    .filter(|v| !v.is_null() && compare_watermarks(v, v).is_some())
                    .ok_or_else(|| {
                        invalid(format!(
                            "default_epoch {epoch} is not a valid value for `{column}`"
                        ))
                    })?;
                Some(normalized)
            }
        };

        let rate_limit = match config.rate_limit {
            Some(seconds) if !seconds.is_finite() || seconds < 0.0 => {
                return Err(invalid("rate_limit must be a non-negative number".into()))
            }
            Some(seconds) => Duration::from_secs_f64(seconds),
            None => fetch.rate_limit(),
        };

        let validation = config
            .validation
            .iter()
            .map(|rule| ValidationRule::compile(rule, &target))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            source,
            parser: config.parser,
            parser_options: config.parser_options.clone(),
            transformer,
            target,
            merge: MergeSpec {
                keys: config.merge_keys.clone(),
                tie_break: config.merge_tie_break,
            },
            watermark_column: config.watermark_column.clone(),
            default_epoch,
            default_mode: config.default_mode,
            rate_limit,
            cache_ttl: config.cache_ttl.map_or(fetch.cache_ttl(), Duration::from_secs),
            refresh_on_full: config.refresh_on_full,
            validation,
        })
    }

    pub fn build_parser(&self) -> Result<Box<dyn RecordParser>> {
        build_parser(self.parser, &self.parser_options)
    }

    /// Position of the watermark column in target rows
    pub fn watermark_index(&self) -> Option<usize> {
        self.watermark_column
            .as_deref()
            .and_then(|column| self.target.column_index(column))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::loader::TieBreak;
    use serde_json::json;
    use std::cmp::Ordering;

    fn dataset(yaml: &str) -> Result<DatasetDescriptor> {
        let config: DatasetConfig = serde_yaml::from_str(yaml).unwrap();
        DatasetDescriptor::from_config("test", &config, &FetchSettings::default())
    }

    const APPROVALS: &str = r#"
extractor:
  url: "https://www.pmda.go.jp/files/{year}.csv"
parser: csv
transformer: approvals
target:
  schema: pmda
  table: pmda_approvals
merge_keys: [approval_id]
watermark_column: approval_date
default_epoch: "2000-01-01"
rate_limit: 2.5
cache_ttl: 60
"#;

    #[test]
    fn test_resolve_approvals() {
        let descriptor = dataset(APPROVALS).unwrap();

        assert_eq!(descriptor.target.display_name(), "pmda.pmda_approvals");
        assert_eq!(descriptor.target.primary_key, vec!["approval_id"]);
        assert_eq!(descriptor.merge.tie_break, TieBreak::Last);
        assert_eq!(descriptor.rate_limit, Duration::from_millis(2500));
        assert_eq!(descriptor.cache_ttl, Duration::from_secs(60));
        assert_eq!(
            descriptor.watermark_index(),
            descriptor.target.column_index("approval_date")
        );
        assert!(descriptor.build_parser().is_ok());
    }

    #[test]
    fn test_merge_keys_become_not_null() {
        let descriptor = dataset(
            r#"
extractor: {url: "https://example.org/jader.zip"}
parser: zip_csv
transformer: mapped
target: {table: jader_demo}
merge_keys: [case_id, seq]
columns:
  - {name: case_id}
  - {name: seq, type: integer}
"#,
        )
        .unwrap();

        assert!(descriptor.target.columns.iter().take(2).all(|c| !c.nullable));
        assert_eq!(descriptor.target.schema, "public");
        assert_eq!(descriptor.rate_limit, FetchSettings::default().rate_limit());
    }

    #[test]
    fn test_inconsistent_datasets_rejected() {
        let cases = [
            APPROVALS.replace("merge_keys: [approval_id]", "merge_keys: []"),
            APPROVALS.replace("merge_keys: [approval_id]", "merge_keys: [nope]"),
            APPROVALS.replace("watermark_column: approval_date", "watermark_column: nope"),
            APPROVALS.replace("\"2000-01-01\"", "\"sometime\""),
            APPROVALS.replace("{year}", "{month}"),
            APPROVALS.replace("rate_limit: 2.5", "rate_limit: -1"),
        ];
        for yaml in cases {
            let err = dataset(&yaml).unwrap_err();
            assert_eq!(err.kind(), "configuration_error", "{yaml}");
        }
    }

    #[test]
    fn test_default_epoch_is_normalized() {
        let descriptor = dataset(&APPROVALS.replace("\"2000-01-01\"", "\"2024-1-5\"")).unwrap();
        assert_eq!(descriptor.default_epoch, Some(json!("2024-01-05")));
        assert_eq!(
            compare_watermarks(&json!("2024-01-10"), descriptor.default_epoch.as_ref().unwrap()),
            Some(Ordering::Greater)
        );

        let descriptor = dataset(
            r#"
extractor: {url: "https://example.org/changes.jsonl"}
parser: jsonl
transformer: mapped
target: {table: revisions}
merge_keys: [id]
watermark_column: revised_at
default_epoch: "2024-01-01T09:00:00+09:00"
columns:
  - {name: id}
  - {name: revised_at, type: timestamp}
"#,
        )
        .unwrap();
        let epoch = descriptor.default_epoch.unwrap();
        assert_eq!(epoch, json!("2024-01-01T00:00:00.000000Z"));
        assert_eq!(
            compare_watermarks(&json!("2024-01-01T00:30:00.000000Z"), &epoch),
            Some(Ordering::Greater)
        );
    }
}
