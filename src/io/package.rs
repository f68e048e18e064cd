//! Zip container and Open Packaging Conventions plumbing: parts, content
//! types and relationships.

use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::Path;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;

use crate::error::{Result, StoreError};

pub const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
pub const ROOT_RELS_PART: &str = "_rels/.rels";

const RELS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
const CONTENT_TYPES_NS: &str = "http://schemas.openxmlformats.org/package/2006/content-types";

pub const REL_OFFICE_DOCUMENT: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument";
pub const REL_WORKSHEET: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet";
pub const REL_SHARED_STRINGS: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings";

pub const CT_WORKBOOK: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml";
pub const CT_WORKSHEET: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml";
pub const CT_SHARED_STRINGS: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sharedStrings+xml";
const CT_RELATIONSHIPS: &str = "application/vnd.openxmlformats-package.relationships+xml";

/// In-memory copy of every part of a package, in archive order.
#[derive(Debug, Clone, Default)]
pub struct Package {
    parts: Vec<(String, Vec<u8>)>,
}

impl Package {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every part of the package stored at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| StoreError::access(path, err))?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut archive = zip::ZipArchive::new(reader)?;
        let mut parts = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            parts.push((entry.name().to_string(), bytes));
        }
        if parts.iter().all(|(name, _)| name != CONTENT_TYPES_PART) {
            return Err(StoreError::Format(format!("missing {CONTENT_TYPES_PART}")));
        }
        Ok(Self { parts })
    }

    /// Writes the package next to `path` and atomically replaces the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let temp = NamedTempFile::new_in(directory).map_err(|err| StoreError::access(path, err))?;

        {
            let mut zip = zip::ZipWriter::new(temp.as_file());
            let options =
                SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
            for (name, bytes) in &self.parts {
                zip.start_file(name.as_str(), options)?;
                zip.write_all(bytes)?;
            }
            zip.finish()?;
        }

        temp.as_file()
            .sync_all()
            .map_err(|err| StoreError::access(path, err))?;
        temp.persist(path)
            .map_err(|err| StoreError::access(path, err.error))?;
        Ok(())
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts
            .iter()
            .find(|(part, _)| part == name)
            .map(|(_, bytes)| bytes.as_slice())
    }

    pub fn require_part(&self, name: &str) -> Result<&[u8]> {
        self.part(name)
            .ok_or_else(|| StoreError::Format(format!("missing part {name}")))
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.part(name).is_some()
    }

    /// Inserts or replaces a part, keeping the position of replaced parts.
    pub fn set_part(&mut self, name: &str, bytes: Vec<u8>) {
        match self.parts.iter_mut().find(|(part, _)| part == name) {
            Some((_, existing)) => *existing = bytes,
            None => self.parts.push((name.to_string(), bytes)),
        }
    }

    /// Adds an `<Override>` content type for `part_name` unless one exists.
    pub fn register_content_type(&mut self, part_name: &str, content_type: &str) -> Result<()> {
        let source = self.require_part(CONTENT_TYPES_PART)?;
        let absolute = format!("/{part_name}");

        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(false);
        let mut writer = Writer::new(Vec::with_capacity(source.len() + 160));
        let mut buf = Vec::new();
        let mut present = false;

        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Empty(e) if e.local_name().as_ref() == b"Override" => {
                    if attribute(&e, b"PartName")?.as_deref() == Some(absolute.as_str()) {
                        present = true;
                    }
                    writer.write_event(Event::Empty(e.into_owned()))?;
                }
                Event::End(e) if e.local_name().as_ref() == b"Types" => {
                    if !present {
                        let mut entry = BytesStart::new("Override");
                        entry.push_attribute(("PartName", absolute.as_str()));
                        entry.push_attribute(("ContentType", content_type));
                        writer.write_event(Event::Empty(entry))?;
                    }
                    writer.write_event(Event::End(e.into_owned()))?;
                }
                Event::Eof => break,
                event => writer.write_event(event.into_owned())?,
            }
            buf.clear();
        }

        if !present {
            self.set_part(CONTENT_TYPES_PART, writer.into_inner());
        }
        Ok(())
    }

    /// Relationships declared by `source_part` (empty when it has none).
    pub fn relationships(&self, source_part: &str) -> Result<Vec<Relationship>> {
        match self.part(&rels_part_for(source_part)) {
            Some(xml) => parse_relationships(xml),
            None => Ok(Vec::new()),
        }
    }

    /// Appends a relationship to `source_part` and returns its new id.
    pub fn add_relationship(
        &mut self,
        source_part: &str,
        rel_type: &str,
        target: &str,
    ) -> Result<String> {
        let mut relationships = self.relationships(source_part)?;
        let next = relationships
            .iter()
            .filter_map(|rel| rel.id.strip_prefix("rId")?.parse::<u32>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let id = format!("rId{next}");
        relationships.push(Relationship {
            id: id.clone(),
            rel_type: rel_type.to_string(),
            target: target.to_string(),
        });
        self.set_part(
            &rels_part_for(source_part),
            write_relationships(&relationships)?,
        );
        Ok(id)
    }

    /// Package-absolute name of the main workbook part.
    pub fn workbook_part_name(&self) -> Result<String> {
        let relationships = parse_relationships(self.require_part(ROOT_RELS_PART)?)?;
        relationships
            .iter()
            .find(|rel| rel.rel_type == REL_OFFICE_DOCUMENT)
            .map(|rel| resolve_target("", &rel.target))
            .ok_or_else(|| StoreError::Format("package has no officeDocument relationship".into()))
    }
}

/// One `<Relationship>` entry of a `.rels` part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub target: String,
}

/// `xl/workbook.xml` → `xl/_rels/workbook.xml.rels`.
pub fn rels_part_for(source_part: &str) -> String {
    match source_part.rsplit_once('/') {
        Some((directory, file)) => format!("{directory}/_rels/{file}.rels"),
        None if source_part.is_empty() => ROOT_RELS_PART.to_string(),
        None => format!("_rels/{source_part}.rels"),
    }
}

/// Resolves a relationship target against the part that declares it.
pub fn resolve_target(source_part: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }

    let mut segments: Vec<&str> = match source_part.rsplit_once('/') {
        Some((directory, _)) => directory.split('/').collect(),
        None => Vec::new(),
    };
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Path of `target_part` relative to the directory of `source_part`, used when
/// writing new relationships. Both parts must share that directory prefix.
pub fn relative_target(source_part: &str, target_part: &str) -> String {
    match source_part.rsplit_once('/') {
        Some((directory, _)) => target_part
            .strip_prefix(&format!("{directory}/"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("/{target_part}")),
        None => target_part.to_string(),
    }
}

pub fn parse_relationships(xml: &[u8]) -> Result<Vec<Relationship>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut relationships = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                let id = attribute(&e, b"Id")?.unwrap_or_default();
                let rel_type = attribute(&e, b"Type")?.unwrap_or_default();
                let target = attribute(&e, b"Target")?.unwrap_or_default();
                relationships.push(Relationship {
                    id,
                    rel_type,
                    target,
                });
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(relationships)
}

pub fn write_relationships(relationships: &[Relationship]) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;
    let mut root = BytesStart::new("Relationships");
    root.push_attribute(("xmlns", RELS_NS));
    writer.write_event(Event::Start(root))?;
    for relationship in relationships {
        let mut entry = BytesStart::new("Relationship");
        entry.push_attribute(("Id", relationship.id.as_str()));
        entry.push_attribute(("Type", relationship.rel_type.as_str()));
        entry.push_attribute(("Target", relationship.target.as_str()));
        writer.write_event(Event::Empty(entry))?;
    }
    writer.write_event(Event::End(BytesEnd::new("Relationships")))?;
    Ok(writer.into_inner())
}

/// `[Content_Types].xml` for a fresh package with one workbook part.
pub fn initial_content_types(workbook_part: &str) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;
    let mut root = BytesStart::new("Types");
    root.push_attribute(("xmlns", CONTENT_TYPES_NS));
    writer.write_event(Event::Start(root))?;

    let mut rels = BytesStart::new("Default");
    rels.push_attribute(("Extension", "rels"));
    rels.push_attribute(("ContentType", CT_RELATIONSHIPS));
    writer.write_event(Event::Empty(rels))?;

    let mut xml = BytesStart::new("Default");
    xml.push_attribute(("Extension", "xml"));
    xml.push_attribute(("ContentType", "application/xml"));
    writer.write_event(Event::Empty(xml))?;

    let absolute = format!("/{workbook_part}");
    let mut workbook = BytesStart::new("Override");
    workbook.push_attribute(("PartName", absolute.as_str()));
    workbook.push_attribute(("ContentType", CT_WORKBOOK));
    writer.write_event(Event::Empty(workbook))?;

    writer.write_event(Event::End(BytesEnd::new("Types")))?;
    Ok(writer.into_inner())
}

/// Unescaped value of the attribute whose local name is `name`.
pub(crate) fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_resolve_relative_to_the_source_directory() {
        assert_eq!(resolve_target("", "xl/workbook.xml"), "xl/workbook.xml");
        assert_eq!(
            resolve_target("xl/workbook.xml", "worksheets/sheet1.xml"),
            "xl/worksheets/sheet1.xml"
        );
        assert_eq!(
            resolve_target("xl/workbook.xml", "/xl/worksheets/sheet2.xml"),
            "xl/worksheets/sheet2.xml"
        );
        assert_eq!(
            resolve_target("xl/worksheets/sheet1.xml", "../sharedStrings.xml"),
            "xl/sharedStrings.xml"
        );
    }

    #[test]
    fn rels_part_names() {
        assert_eq!(rels_part_for(""), "_rels/.rels");
        assert_eq!(rels_part_for("xl/workbook.xml"), "xl/_rels/workbook.xml.rels");
    }

    #[test]
    fn relative_targets_for_new_parts() {
        assert_eq!(
            relative_target("xl/workbook.xml", "xl/worksheets/sheet3.xml"),
            "worksheets/sheet3.xml"
        );
        assert_eq!(relative_target("", "xl/workbook.xml"), "xl/workbook.xml");
    }

    #[test]
    fn relationship_ids_increase() {
        let mut package = Package::new();
        let first = package
            .add_relationship("xl/workbook.xml", REL_WORKSHEET, "worksheets/sheet1.xml")
            .unwrap();
        let second = package
            .add_relationship("xl/workbook.xml", REL_SHARED_STRINGS, "sharedStrings.xml")
            .unwrap();

        assert_eq!((first.as_str(), second.as_str()), ("rId1", "rId2"));
        let relationships = package.relationships("xl/workbook.xml").unwrap();
        assert_eq!(relationships.len(), 2);
        assert_eq!(relationships[1].target, "sharedStrings.xml");
    }

    #[test]
    fn content_type_overrides_are_added_once() {
        let mut package = Package::new();
        package.set_part(
            CONTENT_TYPES_PART,
            initial_content_types("xl/workbook.xml").unwrap(),
        );
        package
            .register_content_type("xl/worksheets/sheet1.xml", CT_WORKSHEET)
            .unwrap();
        package
            .register_content_type("xl/worksheets/sheet1.xml", CT_WORKSHEET)
            .unwrap();

        let xml = String::from_utf8(package.part(CONTENT_TYPES_PART).unwrap().to_vec()).unwrap();
        assert_eq!(xml.matches("/xl/worksheets/sheet1.xml").count(), 1);
        assert_eq!(xml.matches("/xl/workbook.xml").count(), 1);
    }
}
