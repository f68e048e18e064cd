//! Comma-separated bulk import input.
//!
//! Each physical line is parsed on its own, so an unbalanced quote only
//! spoils the line it appears on.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use csv::ByteRecord;

use crate::error::{Result, StoreError};
use crate::model::Schema;

/// One data line of an import file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvLine {
    /// One-based line number in the source file.
    pub line: u64,
    /// The split fields, or why the line could not be split.
    pub fields: std::result::Result<Vec<String>, String>,
}

/// Reads every data line of the file at `path`. A first line naming the
/// schema's fields is treated as a header and skipped.
pub fn read_file(path: &Path, schema: &Schema) -> Result<Vec<CsvLine>> {
    let file = File::open(path).map_err(|err| StoreError::access(path, err))?;
    read_lines(BufReader::new(file), schema)
}

/// Blank lines are skipped but still counted.
pub fn read_lines<R: BufRead>(reader: R, schema: &Schema) -> Result<Vec<CsvLine>> {
    let mut lines = Vec::new();
    let mut first = true;
    for (number, raw) in (1u64..).zip(reader.split(b'\n')) {
        let raw = raw?;
        let text = String::from_utf8_lossy(&raw);
        let text = text.trim_end_matches('\r');
        if text.trim().is_empty() {
            continue;
        }

        let fields = split_line(text).map_err(|err| err.to_string());
        let is_first = std::mem::take(&mut first);
        if is_first && fields.as_ref().is_ok_and(|fields| schema.matches_field_names(fields)) {
            continue;
        }
        lines.push(CsvLine {
            line: number,
            fields,
        });
    }
    Ok(lines)
}

/// Splits a single comma-separated line, honouring quoted fields and
/// doubled-quote escapes. A quote that is never closed is a validation error.
pub fn split_line(line: &str) -> Result<Vec<String>> {
    if line.matches('"').count() % 2 != 0 {
        return Err(StoreError::Validation(format!(
            "unterminated quoted field in `{line}`"
        )));
    }

    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());

    let mut record = ByteRecord::new();
    if !csv_reader.read_byte_record(&mut record)? {
        return Ok(Vec::new());
    }
    Ok(decode_record(&record))
}

fn decode_record(record: &ByteRecord) -> Vec<String> {
    record
        .iter()
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, FieldKind};

    fn date_qty() -> Schema {
        Schema::new(vec![
            Field::new("Date", FieldKind::Date),
            Field::new("Qty", FieldKind::Integer),
        ])
    }

    #[test]
    fn quoted_fields_keep_commas_and_quotes() {
        assert_eq!(split_line(r#"a,"b,c","d""e""#).unwrap(), vec!["a", "b,c", "d\"e"]);
    }

    #[test]
    fn header_line_is_skipped_case_insensitively() {
        let input = "date,QTY\n2024-01-01,3\n\n2024-01-02,4\n";
        let lines = read_lines(input.as_bytes(), &date_qty()).unwrap();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line, 2);
        assert_eq!(lines[0].fields, Ok(vec!["2024-01-01".to_string(), "3".to_string()]));
        assert_eq!(lines[1].line, 4);
    }

    #[test]
    fn data_on_the_first_line_is_kept() {
        let lines = read_lines("2024-01-01,3\n".as_bytes(), &date_qty()).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, 1);
    }

    #[test]
    fn unbalanced_quote_spoils_only_its_own_line() {
        let input = "Date,Qty\n2024-01-01,1\n2024-01-02,\"2\n2024-01-03,3\n2024-01-04,4\n";
        let lines = read_lines(input.as_bytes(), &date_qty()).unwrap();

        let numbers: Vec<u64> = lines.iter().map(|line| line.line).collect();
        assert_eq!(numbers, [2, 3, 4, 5]);
        assert!(lines[1].fields.is_err());
        assert_eq!(lines[2].fields, Ok(vec!["2024-01-03".to_string(), "3".to_string()]));
        assert_eq!(lines[3].fields, Ok(vec!["2024-01-04".to_string(), "4".to_string()]));
    }

    #[test]
    fn crlf_line_endings_are_stripped() {
        let lines = read_lines("2024-01-01,\"a,b\"\r\n".as_bytes(), &date_qty()).unwrap();
        assert_eq!(lines[0].fields, Ok(vec!["2024-01-01".to_string(), "a,b".to_string()]));
    }
}
