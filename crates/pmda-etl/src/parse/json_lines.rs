//! JSON Lines parsing
//!
//! One JSON object per non-blank line. A payload whose first non-blank byte
//! is `[` is read as a single array of objects instead.

use super::{strip_bom, RecordParser, RecordStream};
use crate::error::{EtlError, Result};
use crate::schema::RawRecord;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesParser;

impl RecordParser for JsonLinesParser {
    fn parse(&self, payload: Bytes) -> Result<RecordStream> {
        let payload = strip_bom(payload);

        if payload.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'[') {
            let items: Vec<Value> = serde_json::from_slice(&payload)
                .map_err(|e| EtlError::parse(None, format!("invalid JSON array: {e}")))?;
            let records = items
                .into_iter()
                .zip(1u64..)
                .map(|(item, position)| into_record(item, position));
            return Ok(stream::iter(records).boxed());
        }

        Ok(stream::iter(JsonLines {
            payload,
            offset: 0,
            position: 0,
        })
        .boxed())
    }
}

fn into_record(value: Value, position: u64) -> Result<RawRecord> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(EtlError::parse(
            Some(position),
            format!("expected a JSON object, found {}", kind_of(&other)),
        )),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

struct JsonLines {
    payload: Bytes,
    offset: usize,
    position: u64,
}

impl Iterator for JsonLines {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.offset >= self.payload.len() {
                return None;
            }
            let rest = &self.payload[self.offset..];
            let end = rest.iter().position(|b| *b == b'\n').unwrap_or(rest.len());
            let line = &rest[..end];
            self.offset += end + 1;

            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            self.position += 1;
            return Some(
                serde_json::from_slice::<Value>(line)
                    .map_err(|e| EtlError::parse(Some(self.position), e.to_string()))
                    .and_then(|value| into_record(value, self.position)),
            );
        }
    }
}
