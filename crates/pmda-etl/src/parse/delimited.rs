//! CSV / TSV parsing
//!
//! The first row (after `skip_rows`) is the header. Each following row
//! becomes a record keyed by trimmed header names; fields keep their raw
//! text. A row with the wrong number of fields or invalid UTF-8 is a
//! record-level parse error and the reader moves on to the next row.

use super::{strip_bom, RecordParser, RecordStream};
use crate::error::{EtlError, Result};
use crate::schema::RawRecord;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::io::Cursor;

#[derive(Debug, Clone, Copy)]
pub struct DelimitedParser {
    delimiter: u8,
    skip_rows: usize,
}

impl DelimitedParser {
    pub fn new(delimiter: u8, skip_rows: usize) -> Self {
        Self {
            delimiter,
            skip_rows,
        }
    }

    fn records(&self, payload: Bytes) -> Result<DelimitedRecords> {
        let payload = skip_lines(strip_bom(payload), self.skip_rows);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(false)
            .from_reader(Cursor::new(payload));

        let headers = reader
            .byte_headers()
            .map_err(|e| EtlError::parse(None, format!("cannot read header row: {e}")))?
            .iter()
            .map(|field| {
                std::str::from_utf8(field)
                    .map(|h| h.trim().to_string())
                    .map_err(|_| EtlError::parse(None, "header row is not valid UTF-8"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(DelimitedRecords {
            reader,
            headers,
            record: csv::ByteRecord::new(),
            position: 0,
            done: false,
        })
    }
}

impl RecordParser for DelimitedParser {
    fn parse(&self, payload: Bytes) -> Result<RecordStream> {
        Ok(stream::iter(self.records(payload)?).boxed())
    }
}

fn skip_lines(payload: Bytes, lines: usize) -> Bytes {
    let mut offset = 0;
    for _ in 0..lines {
        match payload[offset..].iter().position(|b| *b == b'\n') {
            Some(newline) => offset += newline + 1,
            None => return Bytes::new(),
        }
    }
    payload.slice(offset..)
}

struct DelimitedRecords {
    reader: csv::Reader<Cursor<Bytes>>,
    headers: Vec<String>,
    record: csv::ByteRecord,
    position: u64,
    done: bool,
}

impl DelimitedRecords {
    fn current(&self) -> Result<RawRecord> {
        let mut out = RawRecord::new();
        for (header, field) in self.headers.iter().zip(self.record.iter()) {
            let text = std::str::from_utf8(field).map_err(|_| {
                EtlError::parse(
                    Some(self.position),
                    format!("field `{header}` is not valid UTF-8"),
                )
            })?;
            out.insert(header.clone(), Value::String(text.to_string()));
        }
        Ok(out)
    }
}

impl Iterator for DelimitedRecords {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.read_byte_record(&mut self.record) {
            Ok(false) => {
                self.done = true;
                None
            }
            Ok(true) => {
                self.position += 1;
                Some(self.current())
            }
            Err(e) => {
                self.position += 1;
                if matches!(e.kind(), csv::ErrorKind::Io(_)) {
                    self.done = true;
                    return Some(Err(EtlError::parse(None, e.to_string())));
                }
                Some(Err(EtlError::parse(Some(self.position), e.to_string())))
            }
        }
    }
}
