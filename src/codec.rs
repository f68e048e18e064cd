//! Positional mapping between [`Record`]s and the textual cell values of a
//! sheet row.
//!
//! Numbers are recovered by digit extraction and missing trailing fields fall
//! back to defaults; only [`decode_complete`] rejects short input.

use chrono::NaiveDate;

use crate::error::{Result, StoreError};
use crate::model::{FieldKind, FieldValue, Record, RecordId, Schema};

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y-%-m-%-d",
    "%Y/%m/%d",
    "%d.%m.%Y",
    "%-d.%-m.%Y",
    "%-m/%-d/%Y",
    "%m/%d/%Y",
];

/// Converts a record into its cell values in schema order.
pub fn encode(record: &Record) -> Vec<String> {
    record.values.iter().map(FieldValue::to_string).collect()
}

/// Cell values for a full sheet row: identifier column first.
pub fn encode_row(id: Option<RecordId>, record: &Record) -> Vec<String> {
    let id_text = id.map(|id| id.to_string()).unwrap_or_default();
    std::iter::once(id_text).chain(encode(record)).collect()
}

/// Decodes positional `fields` against `schema`. Missing trailing fields
/// decode to the empty string or zero.
pub fn decode(fields: &[String], schema: &Schema) -> Record {
    let values = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(position, field)| {
            let raw = fields.get(position).map(String::as_str).unwrap_or_default();
            match field.kind {
                FieldKind::Integer => FieldValue::Integer(parse_integer(raw)),
                FieldKind::Date | FieldKind::Text => FieldValue::Text(raw.to_string()),
            }
        })
        .collect();
    Record::new(values)
}

/// Like [`decode`] but rejects input that does not provide every field.
pub fn decode_complete(fields: &[String], schema: &Schema) -> Result<Record> {
    if fields.len() < schema.len() {
        return Err(StoreError::Validation(format!(
            "expected {} fields, found {}",
            schema.len(),
            fields.len()
        )));
    }
    Ok(decode(fields, schema))
}

/// Best-effort integer parsing: plain parse first, then the digits and sign
/// characters alone, then zero.
pub fn parse_integer(raw: &str) -> i64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0;
    }
    if let Ok(value) = trimmed.parse::<i64>() {
        return value;
    }
    let digits: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse::<i64>().unwrap_or(0)
}

/// Parses a hand-typed date in one of the accepted layouts.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
}
