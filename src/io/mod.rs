//! Workbook file access: the zip package, its XML parts and the row store
//! built on top of them, plus CSV input.

pub mod address;
pub mod csv_import;
pub mod package;
pub mod shared_strings;
pub mod store;
pub mod workbook;
pub mod worksheet;
