//! Value coercion into target column types
//!
//! Source values are mostly text. Dates accept ISO (`2024-01-05`), slash and
//! dot forms, kanji forms (`2024年1月5日`) and Japanese era (Wareki) forms
//! such as `令和6年1月5日`, `R6.1.5` or `平成元年4月1日`. Full-width digits
//! are folded to ASCII first.

use crate::schema::SqlType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};

/// Japanese eras with the Gregorian year preceding year 1 of each.
const ERAS: &[(&str, i32)] = &[
    ("令和", 2018),
    ("平成", 1988),
    ("昭和", 1925),
    ("大正", 1911),
    ("明治", 1867),
    ("R", 2018),
    ("H", 1988),
    ("S", 1925),
    ("T", 1911),
    ("M", 1867),
];

/// No era has lasted longer (Showa ran to 64)
const MAX_ERA_YEAR: i32 = 99;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y%m%d"];

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y/%m/%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Whether a value counts as absent (null or blank text)
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Convert `value` into the JSON shape `ty` expects
pub fn coerce(value: &Value, ty: SqlType) -> Result<Value, String> {
    if is_blank(value) {
        return Ok(Value::Null);
    }

    match ty {
        SqlType::Jsonb => Ok(value.clone()),
        SqlType::Text => Ok(match value {
            Value::String(s) => Value::String(s.trim().to_string()),
            other => Value::String(other.to_string()),
        }),
        SqlType::Integer => {
            let n = to_i64(value)?;
            i32::try_from(n)
                .map(Value::from)
                .map_err(|_| format!("{n} does not fit in INTEGER"))
        }
        SqlType::BigInt => to_i64(value).map(Value::from),
        SqlType::Double => {
            let f = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => normalize_number(s).parse::<f64>().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("`{}` is not a number", display(value)))?;
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| format!("`{}` is not a finite number", display(value)))
        }
        SqlType::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" | "○" | "有" => Ok(Value::Bool(true)),
                "false" | "f" | "no" | "n" | "0" | "×" | "無" => Ok(Value::Bool(false)),
                _ => Err(format!("`{s}` is not a boolean")),
            },
            other => Err(format!("`{}` is not a boolean", display(other))),
        },
        SqlType::Date => match value {
            Value::String(s) => to_iso_date(s)
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .ok_or_else(|| format!("`{s}` is not a recognizable date")),
            other => Err(format!("`{}` is not a date", display(other))),
        },
        SqlType::Timestamp => match value {
            Value::String(s) => to_utc_timestamp(s)
                .map(|ts| Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true)))
                .ok_or_else(|| format!("`{s}` is not a recognizable timestamp")),
            other => Err(format!("`{}` is not a timestamp", display(other))),
        },
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_i64(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| format!("{n} is not an integer")),
        Value::String(s) => normalize_number(s)
            .parse::<i64>()
            .map_err(|_| format!("`{s}` is not an integer")),
        other => Err(format!("`{}` is not an integer", display(other))),
    }
}

/// Fold full-width digits and drop thousands separators
fn normalize_number(s: &str) -> String {
    fold_width(s.trim())
        .chars()
        .filter(|c| *c != ',')
        .collect()
}

fn fold_width(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
            '－' | 'ー' => '-',
            '．' => '.',
            '／' => '/',
            '，' => ',',
            'Ｒ' => 'R',
            'Ｈ' => 'H',
            'Ｓ' => 'S',
            'Ｔ' => 'T',
            'Ｍ' => 'M',
            _ => c,
        })
        .collect()
}

/// Parse a Gregorian or Wareki date
pub fn to_iso_date(input: &str) -> Option<NaiveDate> {
    let cleaned: String = fold_width(input)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    if let Some(date) = parse_gregorian(&cleaned) {
        return Some(date);
    }

    parse_wareki(&cleaned)
}

fn parse_gregorian(s: &str) -> Option<NaiveDate> {
    let kanji_free = s.replace(['年', '月'], "-").replace('日', "");

    for candidate in [s, kanji_free.as_str()] {
        for format in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(candidate, format) {
                return Some(date);
            }
        }
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.date_naive());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .map(|naive| naive.date())
}

fn parse_wareki(s: &str) -> Option<NaiveDate> {
    let (base, rest) = ERAS
        .iter()
        .find_map(|(era, base)| s.strip_prefix(era).map(|rest| (*base, rest)))?;
    let rest = rest.strip_prefix('.').unwrap_or(rest);

    let (year_part, rest) = match rest.strip_prefix('元') {
        Some(rest) => ("1", rest),
        None => {
            let digits = rest.chars().take_while(char::is_ascii_digit).count();
            rest.split_at(digits)
        }
    };
    let era_year: i32 = year_part.parse().ok()?;
    if !(1..=MAX_ERA_YEAR).contains(&era_year) {
        return None;
    }

    let normalized = rest.replace(['年', '月', '/', '-'], ".").replace('日', "");
    let mut parts = normalized.split('.').filter(|p| !p.is_empty());
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    NaiveDate::from_ymd_opt(base.checked_add(era_year)?, month, day)
}

/// Parse a timestamp; naive forms are taken as UTC
pub fn to_utc_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .map(|naive| naive.and_utc())
}
