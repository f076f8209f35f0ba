//! Zip archives of CSV files
//!
//! Members are read in archive order. Only `.csv` members are considered,
//! optionally narrowed to names containing a configured fragment; their
//! records are streamed one member after another.

use super::{DelimitedParser, RecordParser, RecordStream};
use crate::error::{EtlError, Result};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::io::{Cursor, Read};
use tracing::debug;

/// Upper bound on the buffer reserved up front from a member's declared size
const MAX_PREALLOC: usize = 64 << 20;

fn initial_capacity(declared: u64) -> usize {
    usize::try_from(declared).unwrap_or(usize::MAX).min(MAX_PREALLOC)
}

#[derive(Debug, Clone)]
pub struct ZipCsvParser {
    inner: DelimitedParser,
    member: Option<String>,
}

impl ZipCsvParser {
    pub fn new(inner: DelimitedParser, member: Option<String>) -> Self {
        Self {
            inner,
            member: member.map(|m| m.to_lowercase()),
        }
    }

    fn wants(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        name.ends_with(".csv")
            && self
                .member
                .as_deref()
                .is_none_or(|fragment| name.contains(fragment))
    }

    fn members(&self, payload: Bytes) -> Result<Vec<(String, Bytes)>> {
        let mut archive = zip::ZipArchive::new(Cursor::new(payload))
            .map_err(|e| EtlError::parse(None, format!("invalid zip archive: {e}")))?;

        let mut members = Vec::new();
        for index in 0..archive.len() {
            let mut file = archive
                .by_index(index)
                .map_err(|e| EtlError::parse(None, format!("cannot read zip member {index}: {e}")))?;
            if file.is_dir() || !self.wants(file.name()) {
                continue;
            }

            let name = file.name().to_string();
            let mut buf = Vec::with_capacity(initial_capacity(file.size()));
            file.read_to_end(&mut buf)
                .map_err(|e| EtlError::parse(None, format!("cannot extract `{name}`: {e}")))?;
            debug!(member = %name, bytes = buf.len(), "Extracted archive member");
            members.push((name, Bytes::from(buf)));
        }

        if members.is_empty() {
            return Err(EtlError::parse(
                None,
                match &self.member {
                    Some(fragment) => format!("archive has no CSV member matching `{fragment}`"),
                    None => "archive has no CSV members".to_string(),
                },
            ));
        }

        Ok(members)
    }
}

impl RecordParser for ZipCsvParser {
    fn parse(&self, payload: Bytes) -> Result<RecordStream> {
        let streams = self
            .members(payload)?
            .into_iter()
            .map(|(_, data)| self.inner.parse(data))
            .collect::<Result<Vec<_>>>()?;

        Ok(stream::iter(streams).flatten().boxed())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::RawRecord;
    use futures::TryStreamExt;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn archive(members: &[(&str, &str)]) -> Bytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in members {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    #[tokio::test]
    async fn test_members_streamed_in_archive_order() {
        let payload = archive(&[
            ("readme.txt", "ignore me"),
            ("demo202401.csv", "id,sex\n1,F\n2,M\n"),
            ("drug202401.csv", "id,drug\n1,aspirin\n"),
        ]);

        let parser = ZipCsvParser::new(DelimitedParser::new(b',', 0), None);
        let records: Vec<RawRecord> = parser.parse(payload).unwrap().try_collect().await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["sex"], "F");
        assert_eq!(records[2]["drug"], "aspirin");
    }

    #[tokio::test]
    async fn test_member_filter() {
        let payload = archive(&[
            ("DEMO202401.CSV", "id,sex\n1,F\n"),
            ("drug202401.csv", "id,drug\n1,aspirin\n"),
        ]);

        let parser = ZipCsvParser::new(DelimitedParser::new(b',', 0), Some("Drug".into()));
        let records: Vec<RawRecord> = parser.parse(payload).unwrap().try_collect().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["drug"], "aspirin");
    }

    #[test]
    fn test_no_matching_member() {
        let payload = archive(&[("notes.txt", "x")]);
        let parser = ZipCsvParser::new(DelimitedParser::new(b',', 0), None);
        assert!(parser.parse(payload).is_err());
    }

    #[test]
    fn test_not_a_zip() {
        let parser = ZipCsvParser::new(DelimitedParser::new(b',', 0), None);
        let err = parser.parse(Bytes::from_static(b"id,name\n")).err().unwrap();
        assert_eq!(err.kind(), "parse_error");
    }

    #[test]
    fn test_declared_size_does_not_drive_allocation() {
        assert_eq!(initial_capacity(1024), 1024);
        assert_eq!(initial_capacity(u64::MAX), MAX_PREALLOC);
    }
}
