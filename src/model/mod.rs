use serde::{Deserialize, Serialize};

/// Name of the leading identifier column in every sheet.
pub const ID_COLUMN: &str = "Id";

/// Identifier assigned by the relational mirror. Identifiers are never
/// invented on the workbook side.
pub type RecordId = i64;

/// Semantic type of a schema field. It drives numeric decoding and the column
/// type chosen for the mirror table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Calendar date kept as text in the workbook and as `DATE` in the mirror.
    Date,
    /// Free text.
    Text,
    /// Whole number.
    Integer,
}

/// A single named column of a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered field layout shared by the header row, the record codec and the
/// mirror table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// The production-entry layout used by the shop-floor data file.
    pub fn production_entry() -> Self {
        use FieldKind::{Date, Integer, Text};

        Self::new(vec![
            Field::new("Date", Date),
            Field::new("Shift", Text),
            Field::new("CodeReference", Text),
            Field::new("MachineNumber", Text),
            Field::new("Area", Text),
            Field::new("AutoAdjustment", Text),
            Field::new("TopTec", Text),
            Field::new("FinalTester", Text),
            Field::new("Packaging", Text),
            Field::new("QuantityInput", Integer),
            Field::new("QuantityGood", Integer),
            Field::new("QuantityBad", Integer),
            Field::new("Reject", Integer),
        ])
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    /// Header row values: the identifier column followed by the field names.
    pub fn header_row(&self) -> Vec<String> {
        std::iter::once(ID_COLUMN.to_string())
            .chain(self.names().map(str::to_string))
            .collect()
    }

    /// Returns `true` when `values` starts with the identifier column followed
    /// by every field name in order. Trailing extra columns are tolerated.
    pub fn matches_header(&self, values: &[String]) -> bool {
        values.len() > self.len()
            && self
                .names()
                .zip(values.iter().skip(1))
                .all(|(expected, actual)| expected == actual)
    }

    /// Case-insensitive variant used for the optional header line of CSV
    /// imports, which carries no identifier column.
    pub fn matches_field_names(&self, values: &[String]) -> bool {
        values.len() >= self.len()
            && self
                .names()
                .zip(values)
                .all(|(expected, actual)| expected.eq_ignore_ascii_case(actual.trim()))
    }
}

/// A typed field value inside a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Text(text) => f.write_str(text),
            FieldValue::Integer(value) => write!(f, "{value}"),
        }
    }
}

/// One real-world transaction: values positional to a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub values: Vec<FieldValue>,
}

impl Record {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, position: usize) -> Option<&FieldValue> {
        self.values.get(position)
    }
}

/// A sheet row as read back from the workbook: its stable 1-based index and
/// the resolved text of every cell, left to right.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRow {
    pub index: u32,
    pub values: Vec<String>,
}

impl SheetRow {
    /// Text of the identifier column, empty when the row was never mirrored.
    pub fn id_text(&self) -> &str {
        self.values.first().map(String::as_str).unwrap_or_default()
    }

    /// Parsed identifier, `None` for empty or non-numeric identifier cells.
    pub fn record_id(&self) -> Option<RecordId> {
        self.id_text()
            .trim()
            .parse::<RecordId>()
            .ok()
            .filter(|id| *id > 0)
    }

    /// Values after the identifier column.
    pub fn fields(&self) -> &[String] {
        self.values.get(1..).unwrap_or_default()
    }
}
