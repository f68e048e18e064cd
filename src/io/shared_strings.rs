use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::{Result, StoreError};

pub(crate) const SPREADSHEET_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";

/// Append-only pool of distinct cell strings.
///
/// Indices are stable for the lifetime of the workbook: nothing is ever
/// removed or renumbered. When a loaded pool already contains duplicates the
/// first occurrence wins lookups, matching an in-order scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedStringTable {
    items: Vec<String>,
    lookup: HashMap<String, usize>,
    dirty: bool,
}

impl SharedStringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a pool from already persisted items.
    pub fn from_items(items: Vec<String>) -> Self {
        let mut lookup = HashMap::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            lookup.entry(item.clone()).or_insert(index);
        }
        Self {
            items,
            lookup,
            dirty: false,
        }
    }

    /// Returns the index of `text`, appending it first when absent.
    pub fn insert_or_find(&mut self, text: &str) -> usize {
        if let Some(index) = self.lookup.get(text) {
            return *index;
        }
        let index = self.items.len();
        self.items.push(text.to_string());
        self.lookup.insert(text.to_string(), index);
        self.dirty = true;
        index
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.items.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// `true` once an insertion happened since the pool was loaded.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_saved(&mut self) {
        self.dirty = false;
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn parse(xml: &[u8]) -> Result<Self> {
        let mut reader = Reader::from_reader(xml);
        reader.config_mut().trim_text(false);

        let mut buf = Vec::new();
        let mut items = Vec::new();
        loop {
            match reader.read_event_into(&mut buf)? {
                Event::Start(e) if e.local_name().as_ref() == b"si" => {
                    items.push(read_item(&mut reader)?);
                }
                Event::Empty(e) if e.local_name().as_ref() == b"si" => items.push(String::new()),
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(Self::from_items(items))
    }

    pub fn to_xml(&self) -> Result<Vec<u8>> {
        let mut writer = Writer::new(Vec::with_capacity(64 + self.items.len() * 32));
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;

        let unique = self.items.len().to_string();
        let mut sst = BytesStart::new("sst");
        sst.push_attribute(("xmlns", SPREADSHEET_NS));
        sst.push_attribute(("uniqueCount", unique.as_str()));
        writer.write_event(Event::Start(sst))?;

        for item in &self.items {
            writer.write_event(Event::Start(BytesStart::new("si")))?;
            let mut t = BytesStart::new("t");
            if item.starts_with(char::is_whitespace) || item.ends_with(char::is_whitespace) {
                t.push_attribute(("xml:space", "preserve"));
            }
            writer.write_event(Event::Start(t))?;
            writer.write_event(Event::Text(BytesText::new(item)))?;
            writer.write_event(Event::End(BytesEnd::new("t")))?;
            writer.write_event(Event::End(BytesEnd::new("si")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("sst")))?;
        Ok(writer.into_inner())
    }
}

/// Visible text of one `<si>`: the direct `<t>` or the concatenated `<r><t>`
/// runs. Phonetic (`<rPh>`) subtrees are skipped.
fn read_item(reader: &mut Reader<&[u8]>) -> Result<String> {
    let mut buf = Vec::new();
    let mut text = String::new();
    let mut depth_in_t = 0usize;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => depth_in_t += 1,
            Event::End(e) if e.local_name().as_ref() == b"t" => {
                depth_in_t = depth_in_t.saturating_sub(1);
            }
            Event::Start(e) if e.local_name().as_ref() == b"rPh" => {
                reader.read_to_end_into(e.name(), &mut Vec::new())?;
            }
            Event::Text(t) if depth_in_t > 0 => text.push_str(&t.unescape()?),
            Event::CData(t) if depth_in_t > 0 => {
                text.push_str(&String::from_utf8_lossy(&t.into_inner()));
            }
            Event::End(e) if e.local_name().as_ref() == b"si" => break,
            Event::Eof => {
                return Err(StoreError::Format(
                    "unexpected end of sharedStrings.xml inside <si>".into(),
                ));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut pool = SharedStringTable::new();
        let first = pool.insert_or_find("Shift A");
        let len = pool.len();
        let second = pool.insert_or_find("Shift A");

        assert_eq!(first, second);
        assert_eq!(pool.len(), len);
        assert_eq!(pool.insert_or_find("Shift B"), first + 1);
    }

    #[test]
    fn reads_plain_and_rich_items() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="3" uniqueCount="3">
  <si><t>Id</t></si>
  <si><r><rPr><b/></rPr><t>Bold</t></r><r><t xml:space="preserve"> tail</t></r></si>
  <si><t>Base</t><rPh sb="0" eb="4"><t>PHO</t></rPh></si>
  <si/>
</sst>"#;

        let pool = SharedStringTable::parse(xml).unwrap();
        assert_eq!(pool.items(), ["Id", "Bold tail", "Base", ""]);
        assert!(!pool.is_dirty());
    }

    #[test]
    fn first_duplicate_wins_after_reload() {
        let mut pool = SharedStringTable::from_items(vec!["x".into(), "y".into(), "x".into()]);
        assert_eq!(pool.insert_or_find("x"), 0);
        assert!(!pool.is_dirty());
    }

    #[test]
    fn serialised_pool_reloads_identically() {
        let mut pool = SharedStringTable::new();
        for text in ["a & b", "<tag>", " padded ", "\"quoted\""] {
            pool.insert_or_find(text);
        }
        let reloaded = SharedStringTable::parse(&pool.to_xml().unwrap()).unwrap();
        assert_eq!(reloaded.items(), pool.items());
    }
}
