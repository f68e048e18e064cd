//! Worksheet part model: the `<sheetData>` grid plus the `<dimension>` that
//! carries the row high-water mark. Everything else in the part is copied
//! through untouched when the sheet is written back.

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::error::{Result, StoreError};
use crate::io::address::{MAX_COLUMNS, MAX_ROWS, column_name, parse_reference, to_reference};
use crate::io::package::attribute;
use crate::io::shared_strings::{SPREADSHEET_NS, SharedStringTable};

const RELATIONSHIPS_NS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

/// Elements that must follow `<dimension>` inside `<worksheet>`.
const AFTER_DIMENSION: &[&[u8]] = &[b"sheetViews", b"sheetFormatPr", b"cols", b"sheetData"];

/// What a cell holds, as stored in the part.
#[derive(Debug, Clone, PartialEq)]
pub enum CellContent {
    /// Index into the shared string pool.
    Shared(usize),
    Number(String),
    Boolean(bool),
    /// Inline or formula-result text.
    Text(String),
    Error(String),
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Zero-based column.
    pub column: u32,
    pub style: Option<String>,
    pub content: CellContent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// One-based row index.
    pub index: u32,
    /// Row attributes other than `r` and `spans`, preserved on rewrite.
    pub attributes: Vec<(String, String)>,
    pub cells: Vec<Cell>,
}

impl Row {
    fn from_values(index: u32, values: &[String], pool: &mut SharedStringTable) -> Result<Self> {
        if values.len() > MAX_COLUMNS as usize {
            return Err(StoreError::Validation(format!(
                "{} values do not fit in {MAX_COLUMNS} columns",
                values.len()
            )));
        }
        let cells = (0u32..)
            .zip(values)
            .map(|(column, value)| Cell {
                column,
                style: None,
                content: CellContent::Shared(pool.insert_or_find(value)),
            })
            .collect();
        Ok(Self {
            index,
            attributes: Vec::new(),
            cells,
        })
    }

    /// Resolved text of every cell, placed by column; gaps read as empty.
    pub fn values(&self, pool: &SharedStringTable) -> Result<Vec<String>> {
        let width = self
            .cells
            .iter()
            .map(|cell| cell.column as usize + 1)
            .max()
            .unwrap_or(0);
        let mut values = vec![String::new(); width];
        for cell in &self.cells {
            values[cell.column as usize] = match &cell.content {
                CellContent::Shared(index) => pool
                    .get(*index)
                    .ok_or_else(|| {
                        StoreError::Format(format!(
                            "cell {} references missing shared string {index}",
                            to_reference(cell.column, self.index)
                        ))
                    })?
                    .to_string(),
                CellContent::Number(text) | CellContent::Text(text) | CellContent::Error(text) => {
                    text.clone()
                }
                CellContent::Boolean(flag) => if *flag { "TRUE" } else { "FALSE" }.to_string(),
                CellContent::Empty => String::new(),
            };
        }
        Ok(values)
    }
}

/// A parsed worksheet part.
#[derive(Debug, Clone)]
pub struct Worksheet {
    source: Vec<u8>,
    rows: Vec<Row>,
    high_water: u32,
}

impl Worksheet {
    /// Part content for a brand new, empty sheet.
    pub fn empty_part() -> Result<Vec<u8>> {
        let mut writer = Writer::new(Vec::new());
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;
        let mut root = BytesStart::new("worksheet");
        root.push_attribute(("xmlns", SPREADSHEET_NS));
        root.push_attribute(("xmlns:r", RELATIONSHIPS_NS));
        writer.write_event(Event::Start(root))?;
        let mut dimension = BytesStart::new("dimension");
        dimension.push_attribute(("ref", "A1"));
        writer.write_event(Event::Empty(dimension))?;
        writer.write_event(Event::Empty(BytesStart::new("sheetData")))?;
        writer.write_event(Event::End(BytesEnd::new("worksheet")))?;
        Ok(writer.into_inner())
    }

    pub fn parse(xml: &[u8]) -> Result<Self> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(false);

        let mut buf = Vec::new();
        let mut rows = Vec::new();
        let mut high_water = 0;
        let mut saw_worksheet = false;

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) if e.local_name().as_ref() == b"worksheet" => saw_worksheet = true,
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"dimension" => {
                    if let Some(reference) = attribute(&e, b"ref")? {
                        high_water = dimension_last_row(&reference)?;
                    }
                }
                Event::Start(e) if e.local_name().as_ref() == b"sheetData" => {
                    rows = parse_sheet_data(&mut reader)?;
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !saw_worksheet {
            return Err(StoreError::Format("worksheet part has no <worksheet> root".into()));
        }

        rows.sort_by_key(|row| row.index);
        if let Some(pair) = rows.windows(2).find(|pair| pair[0].index == pair[1].index) {
            return Err(StoreError::Format(format!(
                "row {} appears more than once",
                pair[0].index
            )));
        }

        Ok(Self {
            source: xml.to_vec(),
            rows,
            high_water,
        })
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, index: u32) -> Option<&Row> {
        self.rows.iter().find(|row| row.index == index)
    }

    /// Highest row index ever written to this sheet.
    pub fn high_water(&self) -> u32 {
        let last = self.rows.last().map(|row| row.index).unwrap_or(0);
        self.high_water.max(last)
    }

    /// Index the next appended row receives; deleted indices are not reused.
    pub fn next_row_index(&self) -> Result<u32> {
        self.high_water()
            .checked_add(1)
            .filter(|index| *index <= MAX_ROWS)
            .ok_or_else(|| StoreError::Validation(format!("sheet already uses all {MAX_ROWS} rows")))
    }

    pub fn append_row(&mut self, values: &[String], pool: &mut SharedStringTable) -> Result<u32> {
        let index = self.next_row_index()?;
        self.rows.push(Row::from_values(index, values, pool)?);
        self.high_water = index;
        Ok(index)
    }

    /// Replaces every cell of row `index`; `false` when the row is absent.
    /// Row attributes and the style of each column that already had a cell
    /// are kept.
    pub fn replace_row(
        &mut self,
        index: u32,
        values: &[String],
        pool: &mut SharedStringTable,
    ) -> Result<bool> {
        let Some(row) = self.rows.iter_mut().find(|row| row.index == index) else {
            return Ok(false);
        };
        let mut cells = Row::from_values(index, values, pool)?.cells;
        for cell in &mut cells {
            cell.style = row
                .cells
                .iter()
                .find(|old| old.column == cell.column)
                .and_then(|old| old.style.clone());
        }
        row.cells = cells;
        Ok(true)
    }

    /// Removes row `index` without renumbering the rows after it.
    pub fn remove_row(&mut self, index: u32) -> bool {
        let high_water = self.high_water();
        let before = self.rows.len();
        self.rows.retain(|row| row.index != index);
        self.high_water = high_water;
        self.rows.len() != before
    }

    /// Puts `values` at row 1. When row 1 is occupied every row moves down by
    /// one first, which fails if the last row is already at the bottom of the
    /// grid.
    pub fn insert_first_row(&mut self, values: &[String], pool: &mut SharedStringTable) -> Result<()> {
        let first = Row::from_values(1, values, pool)?;
        if self.row(1).is_some() {
            let high_water = self.next_row_index()?;
            for row in &mut self.rows {
                row.index += 1;
            }
            self.high_water = high_water;
        }
        self.rows.insert(0, first);
        self.high_water = self.high_water.max(1);
        Ok(())
    }

    /// Drops every row except row 1 and resets the high-water mark to it.
    pub fn clear_below_first_row(&mut self) {
        self.rows.retain(|row| row.index == 1);
        self.high_water = self.rows.len() as u32;
    }

    /// Serialises the sheet, copying every part of the original XML except
    /// `<dimension>` and `<sheetData>`.
    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut reader = Reader::from_reader(self.source.as_slice());
        reader.config_mut().trim_text(false);
        let mut writer = Writer::new(Vec::with_capacity(self.source.len() + self.rows.len() * 96));

        let mut buf = Vec::new();
        let mut dimension_written = false;
        let mut sheet_data_written = false;

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Empty(e) if e.local_name().as_ref() == b"dimension" => {
                    self.write_dimension(&mut writer)?;
                    dimension_written = true;
                }
                Event::Start(e) if e.local_name().as_ref() == b"dimension" => {
                    reader.read_to_end_into(e.name(), &mut Vec::new())?;
                    self.write_dimension(&mut writer)?;
                    dimension_written = true;
                }
                Event::Start(e) if e.local_name().as_ref() == b"sheetData" => {
                    if !dimension_written {
                        self.write_dimension(&mut writer)?;
                        dimension_written = true;
                    }
                    reader.read_to_end_into(e.name(), &mut Vec::new())?;
                    self.write_sheet_data(&mut writer)?;
                    sheet_data_written = true;
                }
                Event::Empty(e) if e.local_name().as_ref() == b"sheetData" => {
                    if !dimension_written {
                        self.write_dimension(&mut writer)?;
                        dimension_written = true;
                    }
                    self.write_sheet_data(&mut writer)?;
                    sheet_data_written = true;
                }
                Event::Start(e) if AFTER_DIMENSION.contains(&e.local_name().as_ref()) => {
                    if !dimension_written {
                        self.write_dimension(&mut writer)?;
                        dimension_written = true;
                    }
                    writer.write_event(Event::Start(e.into_owned()))?;
                }
                Event::Empty(e) if AFTER_DIMENSION.contains(&e.local_name().as_ref()) => {
                    if !dimension_written {
                        self.write_dimension(&mut writer)?;
                        dimension_written = true;
                    }
                    writer.write_event(Event::Empty(e.into_owned()))?;
                }
                Event::End(e) if e.local_name().as_ref() == b"worksheet" => {
                    if !sheet_data_written {
                        self.write_sheet_data(&mut writer)?;
                        sheet_data_written = true;
                    }
                    writer.write_event(Event::End(e.into_owned()))?;
                }
                Event::Eof => break,
                event => writer.write_event(event.into_owned())?,
            }
            buf.clear();
        }

        Ok(writer.into_inner())
    }

    fn write_dimension(&self, writer: &mut Writer<Vec<u8>>) -> Result<()> {
        let last_column = self
            .rows
            .iter()
            .flat_map(|row| row.cells.iter().map(|cell| cell.column))
            .max()
            .unwrap_or(0);
        let reference = match self.high_water() {
            0 => "A1".to_string(),
            last_row => format!("A1:{}{last_row}", column_name(last_column)),
        };
        let mut dimension = BytesStart::new("dimension");
        dimension.push_attribute(("ref", reference.as_str()));
        writer.write_event(Event::Empty(dimension))?;
        Ok(())
    }

    fn write_sheet_data(&self, writer: &mut Writer<Vec<u8>>) -> Result<()> {
        if self.rows.is_empty() {
            writer.write_event(Event::Empty(BytesStart::new("sheetData")))?;
            return Ok(());
        }

        writer.write_event(Event::Start(BytesStart::new("sheetData")))?;
        for row in &self.rows {
            let index = row.index.to_string();
            let mut start = BytesStart::new("row");
            start.push_attribute(("r", index.as_str()));
            for (key, value) in &row.attributes {
                start.push_attribute((key.as_str(), value.as_str()));
            }
            if row.cells.is_empty() {
                writer.write_event(Event::Empty(start))?;
                continue;
            }
            writer.write_event(Event::Start(start))?;
            for cell in &row.cells {
                write_cell(writer, row.index, cell)?;
            }
            writer.write_event(Event::End(BytesEnd::new("row")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("sheetData")))?;
        Ok(())
    }
}

fn write_cell(writer: &mut Writer<Vec<u8>>, row: u32, cell: &Cell) -> Result<()> {
    let reference = to_reference(cell.column, row);
    let mut start = BytesStart::new("c");
    start.push_attribute(("r", reference.as_str()));
    if let Some(style) = &cell.style {
        start.push_attribute(("s", style.as_str()));
    }

    let (cell_type, value) = match &cell.content {
        CellContent::Shared(index) => (Some("s"), index.to_string()),
        CellContent::Number(number) => (None, number.clone()),
        CellContent::Boolean(flag) => (Some("b"), if *flag { "1" } else { "0" }.to_string()),
        CellContent::Error(code) => (Some("e"), code.clone()),
        CellContent::Text(text) => {
            start.push_attribute(("t", "inlineStr"));
            writer.write_event(Event::Start(start))?;
            writer.write_event(Event::Start(BytesStart::new("is")))?;
            let mut t = BytesStart::new("t");
            t.push_attribute(("xml:space", "preserve"));
            writer.write_event(Event::Start(t))?;
            writer.write_event(Event::Text(BytesText::new(text)))?;
            writer.write_event(Event::End(BytesEnd::new("t")))?;
            writer.write_event(Event::End(BytesEnd::new("is")))?;
            writer.write_event(Event::End(BytesEnd::new("c")))?;
            return Ok(());
        }
        CellContent::Empty => {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }
    };

    if let Some(cell_type) = cell_type {
        start.push_attribute(("t", cell_type));
    }
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Start(BytesStart::new("v")))?;
    writer.write_event(Event::Text(BytesText::new(&value)))?;
    writer.write_event(Event::End(BytesEnd::new("v")))?;
    writer.write_event(Event::End(BytesEnd::new("c")))?;
    Ok(())
}

/// Last row of a `<dimension>` range. A single-cell reference is what an
/// empty sheet carries, so it marks nothing.
fn dimension_last_row(reference: &str) -> Result<u32> {
    let Some((_, last)) = reference.split_once(':') else {
        return Ok(0);
    };
    parse_reference(&last.replace('$', ""))
        .map(|(_, row)| row)
        .ok_or_else(|| StoreError::Format(format!("invalid dimension '{reference}'")))
}

fn parse_sheet_data(reader: &mut Reader<&[u8]>) -> Result<Vec<Row>> {
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut previous = 0u32;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"row" => {
                let mut row = row_header(&e, previous)?;
                row.cells = parse_row_cells(reader, row.index)?;
                previous = row.index;
                rows.push(row);
            }
            Event::Empty(e) if e.local_name().as_ref() == b"row" => {
                let row = row_header(&e, previous)?;
                previous = row.index;
                rows.push(row);
            }
            Event::End(e) if e.local_name().as_ref() == b"sheetData" => break,
            Event::Eof => {
                return Err(StoreError::Format("unexpected end of worksheet in <sheetData>".into()));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(rows)
}

fn row_header(element: &BytesStart<'_>, previous: u32) -> Result<Row> {
    let mut index = None;
    let mut attributes = Vec::new();
    for attr in element.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        match key.as_str() {
            "r" => {
                index = Some(
                    value
                        .parse::<u32>()
                        .ok()
                        .filter(|row| (1..=MAX_ROWS).contains(row))
                        .ok_or_else(|| StoreError::Format(format!("invalid row index '{value}'")))?,
                );
            }
            "spans" => {}
            _ => attributes.push((key, value)),
        }
    }
    let index = match index {
        Some(index) => index,
        None => previous
            .checked_add(1)
            .filter(|row| *row <= MAX_ROWS)
            .ok_or_else(|| StoreError::Format(format!("row after {previous} is outside the grid")))?,
    };
    Ok(Row {
        index,
        attributes,
        cells: Vec::new(),
    })
}

fn parse_row_cells(reader: &mut Reader<&[u8]>, row_index: u32) -> Result<Vec<Cell>> {
    let mut buf = Vec::new();
    let mut cells: Vec<Cell> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"c" => {
                let (column, cell_type, style) = cell_header(&e, row_index, cells.last())?;
                let (value, inline) = read_cell_body(reader)?;
                cells.push(Cell {
                    column,
                    style,
                    content: cell_content(cell_type.as_deref(), value, inline)?,
                });
            }
            Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                let (column, _, style) = cell_header(&e, row_index, cells.last())?;
                cells.push(Cell {
                    column,
                    style,
                    content: CellContent::Empty,
                });
            }
            Event::End(e) if e.local_name().as_ref() == b"row" => break,
            Event::Eof => {
                return Err(StoreError::Format("unexpected end of worksheet in <row>".into()));
            }
            _ => {}
        }
        buf.clear();
    }

    cells.sort_by_key(|cell| cell.column);
    cells.dedup_by_key(|cell| cell.column);
    Ok(cells)
}

fn cell_header(
    element: &BytesStart<'_>,
    row_index: u32,
    previous: Option<&Cell>,
) -> Result<(u32, Option<String>, Option<String>)> {
    let next_column = previous.map(|cell| cell.column + 1).unwrap_or(0);
    let mut column = next_column;
    let mut cell_type = None;
    let mut style = None;

    for attr in element.attributes() {
        let attr = attr?;
        match attr.key.local_name().as_ref() {
            b"r" => {
                let reference = attr.unescape_value()?;
                let (parsed_column, parsed_row) = parse_reference(&reference).ok_or_else(|| {
                    StoreError::Format(format!("invalid cell reference '{reference}'"))
                })?;
                if parsed_row != row_index {
                    return Err(StoreError::Format(format!(
                        "cell {reference} is stored in row {row_index}"
                    )));
                }
                column = parsed_column;
            }
            b"t" => cell_type = Some(attr.unescape_value()?.into_owned()),
            b"s" => style = Some(attr.unescape_value()?.into_owned()),
            _ => {}
        }
    }

    if column >= MAX_COLUMNS {
        return Err(StoreError::Format(format!(
            "cell in row {row_index} is outside the grid"
        )));
    }
    Ok((column, cell_type, style))
}

/// Returns the `<v>` text and the inline `<is>` text of a cell, skipping
/// formulas.
fn read_cell_body(reader: &mut Reader<&[u8]>) -> Result<(Option<String>, Option<String>)> {
    let mut buf = Vec::new();
    let mut value: Option<String> = None;
    let mut inline: Option<String> = None;
    let mut in_value = false;
    let mut in_inline_text = false;
    let mut in_inline = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"v" => {
                    in_value = true;
                    value.get_or_insert_with(String::new);
                }
                b"is" => {
                    in_inline = true;
                    inline.get_or_insert_with(String::new);
                }
                b"t" if in_inline => in_inline_text = true,
                b"rPh" | b"f" => {
                    reader.read_to_end_into(e.name(), &mut Vec::new())?;
                }
                _ => {}
            },
            Event::Text(t) => {
                let text = t.unescape()?;
                if in_value {
                    value.get_or_insert_with(String::new).push_str(&text);
                } else if in_inline_text {
                    inline.get_or_insert_with(String::new).push_str(&text);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"t" => in_inline_text = false,
                b"is" => in_inline = false,
                b"c" => break,
                _ => {}
            },
            Event::Eof => {
                return Err(StoreError::Format("unexpected end of worksheet in <c>".into()));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok((value, inline))
}

fn cell_content(
    cell_type: Option<&str>,
    value: Option<String>,
    inline: Option<String>,
) -> Result<CellContent> {
    Ok(match (cell_type, value) {
        (Some("inlineStr"), _) => CellContent::Text(inline.unwrap_or_default()),
        (Some("s"), Some(value)) => {
            let index = value.trim().parse::<usize>().map_err(|_| {
                StoreError::Format(format!("invalid shared string index '{value}'"))
            })?;
            CellContent::Shared(index)
        }
        (Some("str"), Some(value)) => CellContent::Text(value),
        (Some("b"), Some(value)) => CellContent::Boolean(value.trim() == "1"),
        (Some("e"), Some(value)) => CellContent::Error(value),
        (_, Some(value)) => CellContent::Number(value),
        (_, None) => CellContent::Empty,
    })
}
