//! Format parsers
//!
//! A parser turns one fetched payload into a lazy, finite sequence of
//! [`RawRecord`]s in source order. Errors tied to a single record carry its
//! 1-based position so the orchestrator can apply the record error policy;
//! errors about the payload as a whole have no position and always abort.

pub mod archive;
pub mod delimited;
pub mod json_lines;

pub use archive::ZipCsvParser;
pub use delimited::DelimitedParser;
pub use json_lines::JsonLinesParser;

use crate::error::{EtlError, Result};
use crate::schema::RawRecord;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Lazy sequence of parsed records from one payload
pub type RecordStream = BoxStream<'static, Result<RawRecord>>;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Format hint declared per dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    Csv,
    Tsv,
    Jsonl,
    ZipCsv,
}

impl ParserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParserKind::Csv => "csv",
            ParserKind::Tsv => "tsv",
            ParserKind::Jsonl => "jsonl",
            ParserKind::ZipCsv => "zip_csv",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParserOptions {
    /// Field delimiter for `csv` and `zip_csv`; must be ASCII
    pub delimiter: Option<char>,
    /// Lines to skip before the header row (titles, notes)
    pub skip_rows: usize,
    /// For `zip_csv`: only read members whose name contains this text
    pub member: Option<String>,
}

pub trait RecordParser: Send + Sync {
    fn parse(&self, payload: Bytes) -> Result<RecordStream>;
}

/// Build the parser for a dataset's declared format
pub fn build_parser(kind: ParserKind, options: &ParserOptions) -> Result<Box<dyn RecordParser>> {
    let delimiter = match (kind, options.delimiter) {
        (_, Some(c)) if c.is_ascii() => c as u8,
        (_, Some(c)) => {
            return Err(EtlError::config(format!(
                "parser delimiter must be an ASCII character, got `{c}`"
            )))
        }
        (ParserKind::Tsv, None) => b'\t',
        (_, None) => b',',
    };

    if options.member.is_some() && kind != ParserKind::ZipCsv {
        return Err(EtlError::config(format!(
            "parser option `member` only applies to zip_csv, not {}",
            kind.as_str()
        )));
    }

    Ok(match kind {
        ParserKind::Csv | ParserKind::Tsv => {
            Box::new(DelimitedParser::new(delimiter, options.skip_rows))
        }
        ParserKind::Jsonl => Box::new(JsonLinesParser),
        ParserKind::ZipCsv => Box::new(ZipCsvParser::new(
            DelimitedParser::new(delimiter, options.skip_rows),
            options.member.clone(),
        )),
    })
}

pub(crate) fn strip_bom(payload: Bytes) -> Bytes {
    if payload.starts_with(UTF8_BOM) {
        payload.slice(UTF8_BOM.len()..)
    } else {
        payload
    }
}
