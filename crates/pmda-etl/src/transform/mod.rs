//! Dataset transformers
//!
//! A transformer is a pure function from a parsed [`RawRecord`] to a [`Row`]
//! aligned with the dataset's target columns. Each transformer is a list of
//! column mappings followed by the same trailing lineage columns:
//! `raw_data_full` (the untouched source record) and the `_meta_*` columns.
//!
//! - `approvals`: fixed mapping of the PMDA new drug approvals list, keyed by
//!   its Japanese headers (English aliases accepted)
//! - `mapped`: mapping declared per dataset in configuration

pub mod convert;

use crate::error::{EtlError, Result};
use crate::schema::{ColumnDef, RawRecord, Row, SqlType};
use crate::state::PIPELINE_VERSION;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

pub const RAW_DATA_COLUMN: &str = "raw_data_full";
pub const META_SOURCE_URL: &str = "_meta_source_url";
pub const META_SOURCE_CONTENT_HASH: &str = "_meta_source_content_hash";
pub const META_EXTRACTION_TS: &str = "_meta_extraction_ts_utc";
pub const META_LOAD_TS: &str = "_meta_load_ts_utc";
pub const META_PIPELINE_VERSION: &str = "_meta_pipeline_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformerKind {
    Approvals,
    Mapped,
}

/// One target column and where its value comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnMapping {
    /// Target column name
    pub name: String,
    /// Source field; defaults to `name`
    #[serde(default)]
    pub source: Option<String>,
    /// Further source fields tried in order when `source` is absent
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(rename = "type", default)]
    pub sql_type: SqlType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnMapping {
    fn new(name: &str, sources: &[&str], sql_type: SqlType) -> Self {
        let (source, aliases) = match sources.split_first() {
            Some((first, rest)) => (
                Some(first.to_string()),
                rest.iter().map(|s| s.to_string()).collect(),
            ),
            None => (None, Vec::new()),
        };
        Self {
            name: name.to_string(),
            source,
            aliases,
            sql_type,
            nullable: true,
        }
    }

    fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    fn sources(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.source.as_deref().unwrap_or(&self.name))
            .chain(self.aliases.iter().map(String::as_str))
    }

    fn lookup<'r>(&self, record: &'r RawRecord) -> Option<&'r Value> {
        self.sources()
            .filter_map(|field| record.get(field))
            .find(|value| !convert::is_blank(value))
    }
}

/// PMDA new drug approvals list
fn approvals_mappings() -> Vec<ColumnMapping> {
    vec![
        ColumnMapping::new("approval_id", &["承認番号", "approval_id"], SqlType::Text).required(),
        ColumnMapping::new("application_type", &["申請区分", "application_type"], SqlType::Text),
        ColumnMapping::new("brand_name_jp", &["販売名", "brand_name"], SqlType::Text),
        ColumnMapping::new("generic_name_jp", &["一般名", "generic_name"], SqlType::Text),
        ColumnMapping::new(
            "applicant_name_jp",
            &["申請者", "申請者氏名", "applicant"],
            SqlType::Text,
        ),
        ColumnMapping::new(
            "approval_date",
            &["承認日", "承認年月日", "approval_date"],
            SqlType::Date,
        ),
        ColumnMapping::new(
            "indication",
            &["効能・効果", "効能又は効果", "indication"],
            SqlType::Text,
        ),
        ColumnMapping::new(
            "review_report_url",
            &["審査報告書", "review_report_url"],
            SqlType::Text,
        ),
    ]
}

fn lineage_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new(RAW_DATA_COLUMN, SqlType::Jsonb),
        ColumnDef::new(META_SOURCE_URL, SqlType::Text).not_null(),
        ColumnDef::new(META_SOURCE_CONTENT_HASH, SqlType::Text).not_null(),
        ColumnDef::new(META_EXTRACTION_TS, SqlType::Timestamp).not_null(),
        ColumnDef::new(META_LOAD_TS, SqlType::Timestamp).not_null(),
        ColumnDef::new(META_PIPELINE_VERSION, SqlType::Text).not_null(),
    ]
}

/// Lineage for the payload a record came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordContext {
    pub source_url: String,
    /// SHA-256 of the payload
    pub content_hash: String,
    pub extracted_at: DateTime<Utc>,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformer {
    kind: TransformerKind,
    mappings: Vec<ColumnMapping>,
}

impl Transformer {
    pub fn from_config(kind: TransformerKind, columns: &[ColumnMapping]) -> Result<Self> {
        let mappings = match kind {
            TransformerKind::Approvals => {
                if !columns.is_empty() {
                    return Err(EtlError::config(
                        "the approvals transformer has a fixed column set; remove `columns`",
                    ));
                }
                approvals_mappings()
            }
            TransformerKind::Mapped => {
                if columns.is_empty() {
                    return Err(EtlError::config(
                        "the mapped transformer needs at least one entry in `columns`",
                    ));
                }
                columns.to_vec()
            }
        };

        let reserved: HashSet<String> = lineage_columns().into_iter().map(|c| c.name).collect();
        let mut seen = HashSet::new();
        for mapping in &mappings {
            if mapping.name.trim().is_empty() {
                return Err(EtlError::config("column names cannot be empty"));
            }
            if reserved.contains(&mapping.name) {
                return Err(EtlError::config(format!(
                    "column `{}` is reserved for lineage",
                    mapping.name
                )));
            }
            if !seen.insert(mapping.name.as_str()) {
                return Err(EtlError::config(format!(
                    "column `{}` is declared twice",
                    mapping.name
                )));
            }
        }

        Ok(Self { kind, mappings })
    }

    pub fn kind(&self) -> TransformerKind {
        self.kind
    }

    /// Target columns in row order
    pub fn columns(&self) -> Vec<ColumnDef> {
        self.mappings
            .iter()
            .map(|m| ColumnDef {
                name: m.name.clone(),
                sql_type: m.sql_type,
                nullable: m.nullable,
            })
            .chain(lineage_columns())
            .collect()
    }

    /// Map one record; `position` is its 1-based place in the payload
    pub fn transform(&self, record: &RawRecord, position: u64, ctx: &RecordContext) -> Result<Row> {
        let mut row = Vec::with_capacity(self.mappings.len() + 6);

        for mapping in &self.mappings {
            let value = match mapping.lookup(record) {
                Some(raw) => convert::coerce(raw, mapping.sql_type).map_err(|msg| {
                    EtlError::transform(position, format!("column `{}`: {msg}", mapping.name))
                })?,
                None if mapping.nullable => Value::Null,
                None => {
                    return Err(EtlError::transform(
                        position,
                        format!(
                            "column `{}` is required but source field `{}` is missing or empty",
                            mapping.name,
                            mapping.sources().collect::<Vec<_>>().join("` / `")
                        ),
                    ))
                }
            };
            row.push(value);
        }

        row.push(Value::Object(record.clone()));
        row.push(Value::String(ctx.source_url.clone()));
        row.push(Value::String(ctx.content_hash.clone()));
        row.push(timestamp(ctx.extracted_at));
        row.push(timestamp(ctx.loaded_at));
        row.push(Value::String(PIPELINE_VERSION.to_string()));

        Ok(row)
    }
}

fn timestamp(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::TableSchema;
    use serde_json::json;

    fn ctx() -> RecordContext {
        RecordContext {
            source_url: "https://www.pmda.go.jp/files/approvals.csv".into(),
            content_hash: "ab".repeat(32),
            extracted_at: Utc::now(),
            loaded_at: Utc::now(),
        }
    }

    fn record(value: Value) -> RawRecord {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_approvals_maps_japanese_headers() {
        let transformer = Transformer::from_config(TransformerKind::Approvals, &[]).unwrap();
        let raw = record(json!({
            "承認番号": "30600AMX00001",
            "申請区分": "1-(1)",
            "販売名": "テスト錠10mg",
            "一般名": "テストマブ",
            "申請者": "テスト製薬株式会社",
            "承認日": "令和6年3月26日",
            "効能・効果": "高血圧症",
            "備考": "extra",
        }));

        let row = transformer.transform(&raw, 1, &ctx()).unwrap();
        let columns = transformer.columns();
        let at = |name: &str| &row[columns.iter().position(|c| c.name == name).unwrap()];

        assert_eq!(row.len(), columns.len());
        assert_eq!(at("approval_id"), &json!("30600AMX00001"));
        assert_eq!(at("approval_date"), &json!("2024-03-26"));
        assert_eq!(at("review_report_url"), &Value::Null);
        assert_eq!(at(RAW_DATA_COLUMN)["備考"], "extra");
        assert_eq!(at(META_SOURCE_CONTENT_HASH), &json!("ab".repeat(32)));
        assert_eq!(at(META_PIPELINE_VERSION), &json!(PIPELINE_VERSION));
    }

    #[test]
    fn test_rows_satisfy_their_schema() {
        let transformer = Transformer::from_config(TransformerKind::Approvals, &[]).unwrap();
        let schema = TableSchema {
            schema: "public".into(),
            table: "pmda_approvals".into(),
            columns: transformer.columns(),
            primary_key: vec!["approval_id".into()],
        };
        let raw = record(json!({"approval_id": "X-1", "approval_date": "2024/04/01"}));

        let row = transformer.transform(&raw, 1, &ctx()).unwrap();
        schema.check_row(&row).unwrap();
    }

    #[test]
    fn test_missing_required_column_is_transform_error() {
        let transformer = Transformer::from_config(TransformerKind::Approvals, &[]).unwrap();
        let raw = record(json!({"承認番号": "  ", "販売名": "x"}));

        let err = transformer.transform(&raw, 7, &ctx()).unwrap_err();
        assert!(matches!(err, EtlError::Transform { record: 7, .. }));
        assert!(err.is_record_level());
    }

    #[test]
    fn test_bad_date_is_transform_error() {
        let transformer = Transformer::from_config(TransformerKind::Approvals, &[]).unwrap();
        let raw = record(json!({"承認番号": "A", "承認日": "未定"}));
        let err = transformer.transform(&raw, 2, &ctx()).unwrap_err();
        assert!(err.to_string().contains("approval_date"));
    }

    #[test]
    fn test_mapped_columns() {
        let columns: Vec<ColumnMapping> = serde_yaml::from_str(
            r#"
- name: case_id
  source: 識別番号
  nullable: false
- name: report_count
  type: integer
- name: age_group
  source: 年齢
  aliases: [age]
"#,
        )
        .unwrap();
        let transformer = Transformer::from_config(TransformerKind::Mapped, &columns).unwrap();

        let row = transformer
            .transform(
                &record(json!({"識別番号": "AB-1", "report_count": "3", "age": "20代"})),
                1,
                &ctx(),
            )
            .unwrap();
        assert_eq!(row[0], json!("AB-1"));
        assert_eq!(row[1], json!(3));
        assert_eq!(row[2], json!("20代"));
    }

    #[test]
    fn test_config_errors() {
        let column = ColumnMapping::new("x", &[], SqlType::Text);
        assert!(Transformer::from_config(TransformerKind::Approvals, &[column.clone()]).is_err());
        assert!(Transformer::from_config(TransformerKind::Mapped, &[]).is_err());
        assert!(
            Transformer::from_config(TransformerKind::Mapped, &[column.clone(), column]).is_err()
        );
        let reserved = ColumnMapping::new(META_LOAD_TS, &[], SqlType::Text);
        assert!(Transformer::from_config(TransformerKind::Mapped, &[reserved]).is_err());
    }
}
