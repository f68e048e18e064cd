//! The workbook part: sheet directory, worksheet parts and the shared string
//! pool, loaded from and saved to one package file.

use std::path::{Path, PathBuf};

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::io::package::{
    self, CONTENT_TYPES_PART, CT_SHARED_STRINGS, CT_WORKSHEET, Package, REL_OFFICE_DOCUMENT,
    REL_SHARED_STRINGS, REL_WORKSHEET, ROOT_RELS_PART, Relationship, attribute,
};
use crate::io::shared_strings::{SPREADSHEET_NS, SharedStringTable};
use crate::io::worksheet::Worksheet;

const WORKBOOK_PART: &str = "xl/workbook.xml";
const RELATIONSHIPS_NS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const MAX_SHEET_NAME: usize = 31;
const FORBIDDEN_SHEET_CHARS: &[char] = &['[', ']', ':', '*', '?', '/', '\\'];

/// One `<sheet>` entry of the workbook part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetEntry {
    pub name: String,
    pub sheet_id: u32,
    pub rel_id: String,
    /// Package part holding the worksheet XML.
    pub part: String,
}

/// An opened workbook package. Changes stay in memory until [`save`].
///
/// [`save`]: Workbook::save
#[derive(Debug)]
pub struct Workbook {
    path: PathBuf,
    package: Package,
    workbook_part: String,
    sheets: Vec<SheetEntry>,
    shared_strings: SharedStringTable,
    shared_strings_part: Option<String>,
}

impl Workbook {
    /// An empty workbook with no sheets, to be saved at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let mut package = Package::new();
        package.set_part(CONTENT_TYPES_PART, package::initial_content_types(WORKBOOK_PART)?);
        package.set_part(
            ROOT_RELS_PART,
            package::write_relationships(&[Relationship {
                id: "rId1".into(),
                rel_type: REL_OFFICE_DOCUMENT.into(),
                target: WORKBOOK_PART.into(),
            }])?,
        );
        package.set_part(WORKBOOK_PART, empty_workbook_part()?);
        package.set_part(
            &package::rels_part_for(WORKBOOK_PART),
            package::write_relationships(&[])?,
        );

        Ok(Self {
            path: path.to_path_buf(),
            package,
            workbook_part: WORKBOOK_PART.to_string(),
            sheets: Vec::new(),
            shared_strings: SharedStringTable::new(),
            shared_strings_part: None,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let package = Package::open(path)?;
        let workbook_part = package.workbook_part_name()?;
        let relationships = package.relationships(&workbook_part)?;
        let sheets = read_sheet_entries(package.require_part(&workbook_part)?)?
            .into_iter()
            .map(|(name, sheet_id, rel_id)| {
                let relationship = relationships
                    .iter()
                    .find(|rel| rel.id == rel_id && rel.rel_type == REL_WORKSHEET)
                    .ok_or_else(|| {
                        StoreError::Format(format!("sheet '{name}' has no worksheet relationship"))
                    })?;
                Ok(SheetEntry {
                    part: package::resolve_target(&workbook_part, &relationship.target),
                    name,
                    sheet_id,
                    rel_id,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let shared_strings_part = relationships
            .iter()
            .find(|rel| rel.rel_type == REL_SHARED_STRINGS)
            .map(|rel| package::resolve_target(&workbook_part, &rel.target));
        let shared_strings = match shared_strings_part
            .as_deref()
            .and_then(|part| package.part(part))
        {
            Some(xml) => SharedStringTable::parse(xml)?,
            None => SharedStringTable::new(),
        };

        Ok(Self {
            path: path.to_path_buf(),
            package,
            workbook_part,
            sheets,
            shared_strings,
            shared_strings_part,
        })
    }

    /// Opens the package at `path`, or starts a new one when no file exists.
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sheets(&self) -> &[SheetEntry] {
        &self.sheets
    }

    /// Case-insensitive sheet lookup.
    pub fn find_sheet(&self, name: &str) -> Option<&SheetEntry> {
        let wanted = name.to_lowercase();
        self.sheets
            .iter()
            .find(|sheet| sheet.name.to_lowercase() == wanted)
    }

    /// Appends an empty sheet called `name`.
    pub fn add_sheet(&mut self, name: &str) -> Result<&SheetEntry> {
        validate_sheet_name(name)?;
        if self.find_sheet(name).is_some() {
            return Err(StoreError::Validation(format!("sheet '{name}' already exists")));
        }

        let sheet_id = self.sheets.iter().map(|sheet| sheet.sheet_id).max().unwrap_or(0) + 1;
        let directory = self
            .workbook_part
            .rsplit_once('/')
            .map(|(directory, _)| format!("{directory}/"))
            .unwrap_or_default();
        let part = (1..)
            .map(|n| format!("{directory}worksheets/sheet{n}.xml"))
            .find(|candidate| !self.package.has_part(candidate))
            .unwrap_or_default();

        self.package.set_part(&part, Worksheet::empty_part()?);
        self.package.register_content_type(&part, CT_WORKSHEET)?;
        let rel_id = self.package.add_relationship(
            &self.workbook_part,
            REL_WORKSHEET,
            &package::relative_target(&self.workbook_part, &part),
        )?;

        let workbook_xml = append_sheet_entry(
            self.package.require_part(&self.workbook_part)?,
            name,
            sheet_id,
            &rel_id,
        )?;
        let workbook_part = self.workbook_part.clone();
        self.package.set_part(&workbook_part, workbook_xml);

        debug!(sheet = name, part = %part, "added worksheet");
        self.sheets.push(SheetEntry {
            name: name.to_string(),
            sheet_id,
            rel_id,
            part,
        });
        Ok(&self.sheets[self.sheets.len() - 1])
    }

    /// Parses the worksheet called `name`.
    pub fn worksheet(&self, name: &str) -> Result<Worksheet> {
        let sheet = self
            .find_sheet(name)
            .ok_or_else(|| StoreError::NotFound(format!("sheet '{name}'")))?;
        Worksheet::parse(self.package.require_part(&sheet.part)?)
    }

    /// Stores `worksheet` as the content of sheet `name`.
    pub fn put_worksheet(&mut self, name: &str, worksheet: &Worksheet) -> Result<()> {
        let part = self
            .find_sheet(name)
            .map(|sheet| sheet.part.clone())
            .ok_or_else(|| StoreError::NotFound(format!("sheet '{name}'")))?;
        self.package.set_part(&part, worksheet.to_xml()?);
        Ok(())
    }

    pub fn shared_strings(&self) -> &SharedStringTable {
        &self.shared_strings
    }

    pub fn shared_strings_mut(&mut self) -> &mut SharedStringTable {
        &mut self.shared_strings
    }

    /// Writes the shared string pool (when it grew) and the whole package.
    pub fn save(&mut self) -> Result<()> {
        if self.shared_strings.is_dirty() {
            let part = match &self.shared_strings_part {
                Some(part) => part.clone(),
                None => self.attach_shared_strings_part()?,
            };
            self.package.set_part(&part, self.shared_strings.to_xml()?);
            self.shared_strings.mark_saved();
        }
        self.package.save(&self.path)
    }

    fn attach_shared_strings_part(&mut self) -> Result<String> {
        let part = match self.workbook_part.rsplit_once('/') {
            Some((directory, _)) => format!("{directory}/sharedStrings.xml"),
            None => "sharedStrings.xml".to_string(),
        };
        self.package.register_content_type(&part, CT_SHARED_STRINGS)?;
        self.package.add_relationship(
            &self.workbook_part,
            REL_SHARED_STRINGS,
            &package::relative_target(&self.workbook_part, &part),
        )?;
        self.shared_strings_part = Some(part.clone());
        Ok(part)
    }
}

fn validate_sheet_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation("sheet name is empty".into()));
    }
    if name.chars().count() > MAX_SHEET_NAME {
        return Err(StoreError::Validation(format!(
            "sheet name '{name}' is longer than {MAX_SHEET_NAME} characters"
        )));
    }
    if name.contains(FORBIDDEN_SHEET_CHARS) || name.starts_with('\'') || name.ends_with('\'') {
        return Err(StoreError::Validation(format!(
            "sheet name '{name}' contains a forbidden character"
        )));
    }
    Ok(())
}

fn empty_workbook_part() -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;
    let mut root = BytesStart::new("workbook");
    root.push_attribute(("xmlns", SPREADSHEET_NS));
    root.push_attribute(("xmlns:r", RELATIONSHIPS_NS));
    writer.write_event(Event::Start(root))?;
    writer.write_event(Event::Empty(BytesStart::new("sheets")))?;
    writer.write_event(Event::End(BytesEnd::new("workbook")))?;
    Ok(writer.into_inner())
}

/// `(name, sheetId, r:id)` for every `<sheet>` in document order.
fn read_sheet_entries(xml: &[u8]) -> Result<Vec<(String, u32, String)>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut entries = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                let name = attribute(&e, b"name")?
                    .ok_or_else(|| StoreError::Format("<sheet> without name".into()))?;
                let sheet_id = attribute(&e, b"sheetId")?
                    .and_then(|id| id.parse::<u32>().ok())
                    .ok_or_else(|| StoreError::Format(format!("sheet '{name}' has no sheetId")))?;
                let rel_id = attribute(&e, b"id")?
                    .ok_or_else(|| StoreError::Format(format!("sheet '{name}' has no r:id")))?;
                entries.push((name, sheet_id, rel_id));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(entries)
}

/// Copies the workbook part, adding one `<sheet>` at the end of `<sheets>`.
fn append_sheet_entry(xml: &[u8], name: &str, sheet_id: u32, rel_id: &str) -> Result<Vec<u8>> {
    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + 96));
    let mut buf = Vec::new();
    let mut inserted = false;

    let sheet_id = sheet_id.to_string();
    let entry = || {
        let mut sheet = BytesStart::new("sheet");
        sheet.push_attribute(("name", name));
        sheet.push_attribute(("sheetId", sheet_id.as_str()));
        sheet.push_attribute(("r:id", rel_id));
        sheet
    };

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Empty(e) if e.local_name().as_ref() == b"sheets" => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                writer.write_event(Event::Start(e.into_owned()))?;
                writer.write_event(Event::Empty(entry()))?;
                writer.write_event(Event::End(BytesEnd::new(tag)))?;
                inserted = true;
            }
            Event::End(e) if e.local_name().as_ref() == b"sheets" => {
                writer.write_event(Event::Empty(entry()))?;
                writer.write_event(Event::End(e.into_owned()))?;
                inserted = true;
            }
            Event::Eof => break,
            event => writer.write_event(event.into_owned())?,
        }
        buf.clear();
    }

    if !inserted {
        return Err(StoreError::Format("workbook part has no <sheets> element".into()));
    }
    Ok(writer.into_inner())
}
