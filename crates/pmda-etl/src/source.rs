//! Source locator templates and run parameters
//!
//! A dataset's extractor URL is a template. `{year}` and `{drug_name}` come
//! from the operator's run parameters, `{since}` from the delta baseline.
//! Every placeholder the template names must be supplied, and parameters
//! the template has no use for are rejected rather than silently ignored.

use crate::error::{EtlError, Result};
use crate::fetch::origin_of;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operator-supplied parameters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub year: Option<i32>,
    /// Expanded in argument order, one resource per name
    pub drug_names: Vec<String>,
    /// Bypass the cache for every resource of this run
    pub force_refresh: bool,
}

impl RunParams {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placeholder {
    Year,
    DrugName,
    Since,
}

impl Placeholder {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "year" => Some(Placeholder::Year),
            "drug_name" => Some(Placeholder::DrugName),
            "since" => Some(Placeholder::Since),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(Placeholder),
}

/// A parsed extractor URL template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl SourceTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                EtlError::config(format!("unterminated placeholder in source template `{template}`"))
            })?;
            let name = &after[..close];
            let slot = Placeholder::parse(name).ok_or_else(|| {
                EtlError::config(format!(
                    "unknown placeholder `{{{name}}}` in source template `{template}`"
                ))
            })?;
            segments.push(Segment::Slot(slot));
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        let parsed = Self {
            raw: template.to_string(),
            segments,
        };

        let probe = parsed.render(Some("2000"), Some("probe"), Some("2000-01-01"));
        let url = url::Url::parse(&probe)
            .map_err(|e| EtlError::config(format!("invalid source URL `{template}`: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EtlError::config(format!(
                "source URL `{template}` must use http or https"
            )));
        }

        Ok(parsed)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn uses(&self, placeholder: Placeholder) -> bool {
        self.segments.contains(&Segment::Slot(placeholder))
    }

    /// Origin every expansion of this template is fetched from
    pub fn origin(&self) -> String {
        origin_of(&self.render(Some("2000"), Some("probe"), Some("2000-01-01")))
    }

    pub fn uses_since(&self) -> bool {
        self.uses(Placeholder::Since)
    }

    fn render(&self, year: Option<&str>, drug: Option<&str>, since: Option<&str>) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Slot(Placeholder::Year) => out.push_str(year.unwrap_or_default()),
                Segment::Slot(Placeholder::DrugName) => out.push_str(drug.unwrap_or_default()),
                Segment::Slot(Placeholder::Since) => out.push_str(since.unwrap_or_default()),
            }
        }
        out
    }

    /// Expand into the ordered list of resource URLs for one run
    pub fn expand(&self, params: &RunParams, since: Option<&Value>) -> Result<Vec<String>> {
        let year = match (self.uses(Placeholder::Year), params.year) {
            (true, Some(year)) => Some(year.to_string()),
            (true, None) => {
                return Err(EtlError::config(format!(
                    "source `{}` needs a year (--year)",
                    self.raw
                )))
            }
            (false, Some(_)) => {
                return Err(EtlError::config(format!(
                    "source `{}` does not take a year",
                    self.raw
                )))
            }
            (false, None) => None,
        };

        let since = match (self.uses(Placeholder::Since), since) {
            (true, Some(value)) => Some(urlencoding::encode(&watermark_text(value)).into_owned()),
            (true, None) => {
                return Err(EtlError::config(format!(
                    "source `{}` needs a delta baseline for {{since}}",
                    self.raw
                )))
            }
            (false, _) => None,
        };

        if self.uses(Placeholder::DrugName) {
            if params.drug_names.is_empty() {
                return Err(EtlError::config(format!(
                    "source `{}` needs at least one drug name (--drug-name)",
                    self.raw
                )));
            }
            return Ok(params
                .drug_names
                .iter()
                .map(|name| {
                    let encoded = urlencoding::encode(name);
                    self.render(year.as_deref(), Some(&encoded), since.as_deref())
                })
                .collect());
        }

        if !params.drug_names.is_empty() {
            return Err(EtlError::config(format!(
                "source `{}` does not take drug names",
                self.raw
            )));
        }

        Ok(vec![self.render(year.as_deref(), None, since.as_deref())])
    }
}

fn watermark_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_template() {
        let template = SourceTemplate::parse("https://www.pmda.go.jp/files/list.csv").unwrap();
        let urls = template.expand(&RunParams::default(), None).unwrap();
        assert_eq!(urls, vec!["https://www.pmda.go.jp/files/list.csv"]);
    }

    #[test]
    fn test_year_and_drug_names_expand_in_order() {
        let template =
            SourceTemplate::parse("https://example.org/{year}/search?q={drug_name}").unwrap();
        let params = RunParams {
            year: Some(2024),
            drug_names: vec!["ロキソニン".into(), "aspirin tabs".into()],
            force_refresh: false,
        };

        let urls = template.expand(&params, None).unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(
            urls[0],
            "https://example.org/2024/search?q=%E3%83%AD%E3%82%AD%E3%82%BD%E3%83%8B%E3%83%B3"
        );
        assert_eq!(urls[1], "https://example.org/2024/search?q=aspirin%20tabs");
    }

    #[test]
    fn test_missing_values_are_configuration_errors() {
        let template = SourceTemplate::parse("https://example.org/{year}.csv").unwrap();
        let err = template.expand(&RunParams::default(), None).unwrap_err();
        assert_eq!(err.kind(), "configuration_error");

        let template = SourceTemplate::parse("https://example.org/q={drug_name}").unwrap();
        assert!(template.expand(&RunParams::default(), None).is_err());

        let template = SourceTemplate::parse("https://example.org/changes?since={since}").unwrap();
        assert!(template.uses_since());
        assert!(template.expand(&RunParams::default(), None).is_err());
    }

    #[test]
    fn test_unused_parameters_rejected() {
        let template = SourceTemplate::parse("https://example.org/list.csv").unwrap();
        let params = RunParams {
            year: Some(2023),
            ..Default::default()
        };
        assert!(template.expand(&params, None).is_err());

        let params = RunParams {
            drug_names: vec!["x".into()],
            ..Default::default()
        };
        assert!(template.expand(&params, None).is_err());
    }

    #[test]
    fn test_since_renders_watermark() {
        let template = SourceTemplate::parse("https://example.org/changes?since={since}").unwrap();
        let urls = template
            .expand(&RunParams::default(), Some(&json!("2024-03-01T00:00:00Z")))
            .unwrap();
        assert_eq!(urls[0], "https://example.org/changes?since=2024-03-01T00%3A00%3A00Z");

        let urls = template.expand(&RunParams::default(), Some(&json!(1200))).unwrap();
        assert_eq!(urls[0], "https://example.org/changes?since=1200");
    }

    #[test]
    fn test_invalid_templates() {
        assert!(SourceTemplate::parse("https://example.org/{month}.csv").is_err());
        assert!(SourceTemplate::parse("https://example.org/{year.csv").is_err());
        assert!(SourceTemplate::parse("not a url").is_err());
        assert!(SourceTemplate::parse("ftp://example.org/x.csv").is_err());
    }

    #[test]
    fn test_origin() {
        let template = SourceTemplate::parse("https://www.pmda.go.jp:8443/{year}/list.csv").unwrap();
        assert_eq!(template.origin(), "https://www.pmda.go.jp:8443");
    }
}
