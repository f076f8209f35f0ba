//! PostgreSQL `COPY ... FROM STDIN` text-format encoding
//!
//! One line per row, tab-separated, `\N` for NULL, with backslash escapes for
//! the characters that would otherwise end a field or a line. Each line ends
//! with the row's source ordinal, which the apply step uses to pick the
//! winning row among duplicate keys.

use crate::schema::{ColumnDef, Row, SqlType};
use serde_json::Value;

/// Append one encoded row (plus its ordinal) to `buf`
pub fn encode_row(row: &Row, columns: &[ColumnDef], ordinal: i64, buf: &mut Vec<u8>) {
    for (value, column) in row.iter().zip(columns) {
        encode_value(value, column.sql_type, buf);
        buf.push(b'\t');
    }
    buf.extend_from_slice(ordinal.to_string().as_bytes());
    buf.push(b'\n');
}

fn encode_value(value: &Value, sql_type: SqlType, buf: &mut Vec<u8>) {
    match (value, sql_type) {
        (Value::Null, _) => buf.extend_from_slice(b"\\N"),
        (other, SqlType::Jsonb) => escape_into(&other.to_string(), buf),
        (Value::String(s), _) => escape_into(s, buf),
        (Value::Bool(b), _) => buf.push(if *b { b't' } else { b'f' }),
        (Value::Number(n), _) => buf.extend_from_slice(n.to_string().as_bytes()),
        (other, _) => escape_into(&other.to_string(), buf),
    }
}

fn escape_into(text: &str, buf: &mut Vec<u8>) {
    for byte in text.bytes() {
        match byte {
            b'\\' => buf.extend_from_slice(b"\\\\"),
            b'\t' => buf.extend_from_slice(b"\\t"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            other => buf.push(other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", SqlType::Text),
            ColumnDef::new("count", SqlType::BigInt),
            ColumnDef::new("active", SqlType::Boolean),
            ColumnDef::new("raw", SqlType::Jsonb),
        ]
    }

    fn encode(row: Row) -> String {
        let mut buf = Vec::new();
        encode_row(&row, &columns(), 7, &mut buf);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_encode_plain_row() {
        let line = encode(vec![json!("A-1"), json!(42), json!(true), json!({"k": "v"})]);
        assert_eq!(line, "A-1\t42\tt\t{\"k\":\"v\"}\t7\n");
    }

    #[test]
    fn test_encode_null_and_escapes() {
        let line = encode(vec![
            json!("tab\there\nnew\\line"),
            Value::Null,
            json!(false),
            Value::Null,
        ]);
        assert_eq!(line, "tab\\there\\nnew\\\\line\t\\N\tf\t\\N\t7\n");
    }

    #[test]
    fn test_jsonb_strings_are_json_encoded() {
        let line = encode(vec![json!("x"), json!(1), json!(true), json!("承認")]);
        assert!(line.contains("\t\"承認\"\t7"));
    }
}
